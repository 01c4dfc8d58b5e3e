//! Request wrapper (C11, §4.11): HTTP GET with retries, fixed timeouts,
//! a fixed User-Agent, and an optional "last-response memoisation" mode
//! used by the transcription pipeline's AES-128 key fetches (the same
//! key URI is requested once per segment but only changes on key
//! rotation). Records outcomes into the injectable [`Stats`] singleton.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::stats::Stats;

const CONNECT_READ_TIMEOUT: Duration = Duration::from_millis(3050);
const DEFAULT_RETRIES: u32 = 3;
const USER_AGENT: &str = concat!("eos-streaming-proxy/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("http status {0}")]
    Status(u16),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timeout")]
    Timeout,
}

impl RequestError {
    /// Error-kind label used as the stats failure bucket (§4.11).
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::Status(_) => "http_status",
            RequestError::Connection(_) => "connection",
            RequestError::Timeout => "timeout",
        }
    }
}

pub struct RequestClient {
    http: reqwest::Client,
    stats: Arc<Stats>,
    retries: u32,
    last_response: Mutex<Option<(String, Bytes)>>,
}

impl RequestClient {
    pub fn new(stats: Arc<Stats>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_READ_TIMEOUT)
            .timeout(CONNECT_READ_TIMEOUT)
            .build()
            .expect("reqwest client builder with static config never fails");
        Self { http, stats, retries: DEFAULT_RETRIES, last_response: Mutex::new(None) }
    }

    /// Plain GET, retried up to `retries` times, recording latency/failure
    /// into the stats singleton under `(session_id, request_name)`.
    pub async fn get(&self, session_id: &str, request_name: &str, url: &str) -> Result<Bytes, RequestError> {
        let mut last_err = None;
        for attempt in 0..self.retries {
            let start = Instant::now();
            match self.try_get(url).await {
                Ok(body) => {
                    self.stats.record_success(session_id, request_name, start.elapsed());
                    return Ok(body);
                }
                Err(e) => {
                    self.stats.record_failure(session_id, request_name, e.kind());
                    last_err = Some(e);
                    if attempt + 1 < self.retries {
                        tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
                    }
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    /// GET with last-response memoisation: if the previous call through
    /// this client requested the same URL, return its cached body
    /// without making a new request (§4.11, used for AES-128 key fetches
    /// via a memoised client instance per §4.8 step 2).
    pub async fn get_memoized(&self, session_id: &str, request_name: &str, url: &str) -> Result<Bytes, RequestError> {
        if let Some((cached_url, cached_body)) = self.last_response.lock().clone() {
            if cached_url == url {
                return Ok(cached_body);
            }
        }
        let body = self.get(session_id, request_name, url).await?;
        *self.last_response.lock() = Some((url.to_string(), body.clone()));
        Ok(body)
    }

    async fn try_get(&self, url: &str) -> Result<Bytes, RequestError> {
        let resp = self.http.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                RequestError::Timeout
            } else {
                RequestError::Connection(e.to_string())
            }
        })?;
        if !resp.status().is_success() {
            return Err(RequestError::Status(resp.status().as_u16()));
        }
        resp.bytes().await.map_err(|e| RequestError::Connection(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_labels_match_stats_buckets() {
        assert_eq!(RequestError::Status(404).kind(), "http_status");
        assert_eq!(RequestError::Timeout.kind(), "timeout");
        assert_eq!(RequestError::Connection("x".into()).kind(), "connection");
    }

    #[tokio::test]
    async fn memoized_get_returns_cached_body_without_refetch() {
        let client = RequestClient::new(Arc::new(Stats::new()));
        // Seed the memoisation cache directly, the way a first real
        // fetch would populate it, so the test has no network dependency.
        *client.last_response.lock() = Some(("https://origin/key".to_string(), Bytes::from_static(b"the-key")));
        let body = client.get_memoized("s1", "key_fetch", "https://origin/key").await.unwrap();
        assert_eq!(body, Bytes::from_static(b"the-key"));
    }
}
