//! Request router (C9, §4.9, §6): parses the service's own URL scheme,
//! resolves/creates a session through the [`SessionManager`] and routes
//! to the matching [`Session`] handler, honoring an optional `Range`
//! header on binary responses.
//!
//! Grounded on the teacher's wildcard dispatch
//! (`src/http/routes.rs`'s single `any("/{*path}", handle_dynamic_request)`
//! route): the service's path grammar has variable depth depending on
//! request subtype, so — like the teacher — one wildcard route owns the
//! whole `/eos/v1/` subtree and a dedicated parser picks the subtype
//! apart, rather than declaring one axum route per subtype.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use eos_core::types::{Mode, Protocol, SessionKey, Streaming};
use eos_core::url;

use crate::error::{Result, ServerError};
use crate::session::{HttpPayload, SubtitleFragmentKind};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::RANGE, header::CONTENT_TYPE, header::ORIGIN])
        .expose_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/eos/v1/health", get(health))
        .route("/eos/v1/stats", get(stats))
        .route("/eos/v1/{*path}", any(dispatch))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": if state.dispatch.is_alive() { "ok" } else { "shutting_down" },
        "sessions": state.sessions.session_count(),
        "workers": state.dispatch.worker_count(),
    });
    Json(body)
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

#[derive(Debug, Deserialize)]
struct VariantQuery {
    #[serde(default)]
    languages: String,
    #[serde(default)]
    default: Option<String>,
}

/// Every subtype of §6's URL scheme, decoded from the wildcard path tail.
enum RouteKind {
    VariantManifest { ext: ManifestExt },
    LiveChild { rendition_fp: String },
    SubtitleManifest { dst_lang: String, reference_fp: String },
    HlsSubtitleFragment { dst_lang: String, reference_fp: String, fragment_fp: String },
    DashSubtitleFragment { dst_lang: String, kind: SubtitleFragmentKind },
}

#[derive(Clone, Copy)]
enum ManifestExt {
    M3u8,
    Mpd,
}

/// Parses `{protocol}/{streaming}/{mode}/{src_lang}/{origin_b64url}/{...}`
/// (§4.9) into a [`SessionKey`] plus the request subtype.
fn parse_path(path: &str) -> Result<(SessionKey, RouteKind)> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 6 {
        return Err(ServerError::MalformedRequest(format!("path too short: /eos/v1/{path}")));
    }

    let protocol = match segments[0] {
        "hls" => Protocol::Hls,
        "dash" => Protocol::Dash,
        other => return Err(ServerError::MalformedRequest(format!("unknown protocol {other}"))),
    };
    let streaming = match segments[1] {
        "vod" => Streaming::Vod,
        "live" => Streaming::Live,
        other => return Err(ServerError::MalformedRequest(format!("unknown streaming kind {other}"))),
    };
    let mode = match segments[2] {
        "translate" => Mode::Translate,
        "transcribe" => Mode::Transcribe,
        "ocr" => Mode::Ocr,
        other => return Err(ServerError::MalformedRequest(format!("unknown mode {other}"))),
    };
    let src_lang = segments[3].to_string();
    let origin_url = url::defingerprint(segments[4])
        .ok_or_else(|| ServerError::MalformedRequest("malformed origin fingerprint".into()))?;
    let key = SessionKey::new(origin_url, protocol, streaming, mode, src_lang);

    let tail = &segments[5..];
    let kind = match tail {
        ["eos_manifest.m3u8"] => RouteKind::VariantManifest { ext: ManifestExt::M3u8 },
        ["eos_manifest.mpd"] => RouteKind::VariantManifest { ext: ManifestExt::Mpd },
        ["eos_live", rendition_fp, "index.m3u8"] => RouteKind::LiveChild { rendition_fp: rendition_fp.to_string() },
        ["eos_manifest", dst_lang, reference_fp, "index.m3u8"] => {
            RouteKind::SubtitleManifest { dst_lang: dst_lang.to_string(), reference_fp: reference_fp.to_string() }
        }
        ["eos_manifest", dst_lang, reference_fp, "eos_hls_fragment", fragment_fp] => RouteKind::HlsSubtitleFragment {
            dst_lang: dst_lang.to_string(),
            reference_fp: reference_fp.to_string(),
            fragment_fp: fragment_fp.to_string(),
        },
        ["eos_dash_fragment", dst_lang, "Init"] => {
            RouteKind::DashSubtitleFragment { dst_lang: dst_lang.to_string(), kind: SubtitleFragmentKind::DashInit }
        }
        ["eos_dash_fragment", dst_lang, timestamp] => {
            let timestamp = u64::from_str(timestamp)
                .map_err(|_| ServerError::MalformedRequest(format!("malformed DASH timestamp {timestamp}")))?;
            RouteKind::DashSubtitleFragment { dst_lang: dst_lang.to_string(), kind: SubtitleFragmentKind::DashMedia { timestamp } }
        }
        _ => return Err(ServerError::MalformedRequest(format!("unrecognized request shape: {tail:?}"))),
    };

    Ok((key, kind))
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(query): Query<VariantQuery>,
    headers: HeaderMap,
) -> Response {
    match handle(&state, &path, &query, &headers).await {
        Ok(payload) => payload_to_response(payload, &headers),
        Err(e) => e.into_response(),
    }
}

async fn handle(state: &AppState, path: &str, query: &VariantQuery, _headers: &HeaderMap) -> Result<HttpPayload> {
    let (key, kind) = parse_path(path)?;

    match kind {
        RouteKind::VariantManifest { .. } => {
            let languages: std::collections::BTreeSet<String> =
                query.languages.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
            let default_language = query.default.clone().or_else(|| languages.iter().next().cloned()).unwrap_or_default();
            let session = state.sessions.resolve_for_variant(&key, &languages, &default_language);
            session.variant_manifest(&state.session_deps(), &default_language).await
        }
        RouteKind::LiveChild { rendition_fp } => {
            let session = state
                .sessions
                .resolve_for_live_child(&key)
                .ok_or_else(|| ServerError::SessionNotFound("no session for this key yet — request the variant manifest first".into()))?;
            session.live_child_manifest(&rendition_fp).await
        }
        RouteKind::SubtitleManifest { dst_lang, reference_fp } => {
            let session = state
                .sessions
                .resolve_for_dst_lang(&key, &dst_lang)
                .ok_or_else(|| ServerError::SessionNotFound("no session for this key/language yet — request the variant manifest first".into()))?;
            session.subtitle_manifest(&dst_lang, &reference_fp).await
        }
        RouteKind::HlsSubtitleFragment { dst_lang, fragment_fp, .. } => {
            let session = state
                .sessions
                .resolve_for_dst_lang(&key, &dst_lang)
                .ok_or_else(|| ServerError::SessionNotFound("no session for this key/language yet — request the variant manifest first".into()))?;
            session
                .subtitle_fragment(&state.session_deps(), &dst_lang, SubtitleFragmentKind::Hls { fragment_fp })
                .await
        }
        RouteKind::DashSubtitleFragment { dst_lang, kind } => {
            let session = state
                .sessions
                .resolve_for_dst_lang(&key, &dst_lang)
                .ok_or_else(|| ServerError::SessionNotFound("no session for this key/language yet — request the variant manifest first".into()))?;
            session.subtitle_fragment(&state.session_deps(), &dst_lang, kind).await
        }
    }
}

/// Render a [`HttpPayload`] into an axum [`Response`], honoring an
/// optional `Range` header (§6: "`Range` is honoured on binary
/// responses") with a single-range `bytes=start-end` slice.
fn payload_to_response(payload: HttpPayload, headers: &HeaderMap) -> Response {
    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(payload.content_type));
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(payload.cache_control));
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        if let Some((start, end)) = parse_byte_range(range, payload.bytes.len()) {
            let slice = payload.bytes.slice(start..end + 1);
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {start}-{end}/{}", payload.bytes.len())).unwrap(),
            );
            return (StatusCode::PARTIAL_CONTENT, response_headers, slice).into_response();
        }
    }

    (StatusCode::OK, response_headers, payload.bytes).into_response()
}

/// Parses a single-range `Range: bytes=start-end` header value. Returns
/// `None` for anything this service doesn't support (multi-range,
/// suffix-only ranges beyond the body, malformed syntax) so the caller
/// falls back to a full 200 response.
fn parse_byte_range(value: &str, body_len: usize) -> Option<(usize, usize)> {
    if body_len == 0 {
        return None;
    }
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_s, end_s) = spec.split_once('-')?;
    let last = body_len - 1;
    let (start, end) = if start_s.is_empty() {
        let suffix_len: usize = end_s.parse().ok()?;
        (body_len.saturating_sub(suffix_len), last)
    } else {
        let start: usize = start_s.parse().ok()?;
        let end: usize = if end_s.is_empty() { last } else { end_s.parse().ok()? };
        (start, end.min(last))
    };
    if start > end || start > last {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_variant_manifest_path() {
        let origin_fp = url::fingerprint("https://origin.example.com/live/master.m3u8");
        let path = format!("hls/live/transcribe/en/{origin_fp}/eos_manifest.m3u8");
        let (key, kind) = parse_path(&path).unwrap();
        assert_eq!(key.protocol, Protocol::Hls);
        assert_eq!(key.streaming, Streaming::Live);
        assert_eq!(key.mode, Mode::Transcribe);
        assert!(matches!(kind, RouteKind::VariantManifest { ext: ManifestExt::M3u8 }));
    }

    #[test]
    fn parses_dash_subtitle_fragment_path() {
        let origin_fp = url::fingerprint("https://origin.example.com/live/manifest.mpd");
        let path = format!("dash/live/transcribe/en/{origin_fp}/eos_dash_fragment/de-DE/40000000");
        let (_, kind) = parse_path(&path).unwrap();
        match kind {
            RouteKind::DashSubtitleFragment { dst_lang, kind: SubtitleFragmentKind::DashMedia { timestamp } } => {
                assert_eq!(dst_lang, "de-DE");
                assert_eq!(timestamp, 40_000_000);
            }
            _ => panic!("expected DASH subtitle fragment"),
        }
    }

    #[test]
    fn rejects_malformed_origin_fingerprint() {
        let path = "hls/live/transcribe/en/not-base64!!/eos_manifest.m3u8";
        assert!(parse_path(path).is_err());
    }

    #[test]
    fn byte_range_parses_inclusive_bounds() {
        assert_eq!(parse_byte_range("bytes=0-3", 10), Some((0, 3)));
        assert_eq!(parse_byte_range("bytes=5-", 10), Some((5, 9)));
        assert_eq!(parse_byte_range("bytes=-3", 10), Some((7, 9)));
        assert_eq!(parse_byte_range("bytes=0-100", 10), Some((0, 9)));
        assert_eq!(parse_byte_range("bytes=1-2,4-5", 10), None);
    }
}
