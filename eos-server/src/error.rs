//! Server-specific error types (§4.9's "tagged error results" design
//! note, §7's error policy table).
//!
//! Internal helpers return `thiserror` enums and propagate with `?`,
//! same as the teacher's `ServerError` (`hls-vod-server/src/error.rs`);
//! only the HTTP boundary converts them into the spec's explicit
//! `{Ok(bytes+content-type+cache-policy) | Err(kind, message)}` result
//! shape, here realized as a JSON body plus status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed client URL (§7): respond 400, never create a session.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("core error: {0}")]
    Core(#[from] eos_core::CoreError),

    /// Origin fetch failure (§7): respond 400 with a short text body.
    #[error("origin fetch failed: {0}")]
    OriginFetch(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("fragment not found: {0}")]
    FragmentNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl ServerError {
    fn kind(&self) -> &'static str {
        match self {
            ServerError::MalformedRequest(_) => "malformed_request",
            ServerError::Core(_) => "core_error",
            ServerError::OriginFetch(_) => "origin_fetch",
            ServerError::SessionNotFound(_) => "session_not_found",
            ServerError::FragmentNotFound(_) => "fragment_not_found",
            ServerError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServerError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Core(_) => StatusCode::BAD_REQUEST,
            ServerError::OriginFetch(_) => StatusCode::BAD_REQUEST,
            ServerError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::FragmentNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody { kind: self.kind(), message: self.to_string() };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_request_maps_to_400() {
        let e = ServerError::MalformedRequest("bad path".into());
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
        assert_eq!(e.kind(), "malformed_request");
    }

    #[test]
    fn session_not_found_maps_to_404() {
        let e = ServerError::SessionNotFound("abc".into());
        assert_eq!(e.status(), StatusCode::NOT_FOUND);
    }
}
