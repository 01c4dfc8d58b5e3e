//! Process-wide application state (§9 "Singletons"): the session
//! manager, work-dispatch pool, request-stats singleton and the
//! collaborator handles request handlers borrow through
//! [`SessionDeps`]. Constructed once in `main` and threaded through
//! axum's `State` extractor, the same shape as the teacher's
//! `AppState` (`hls-vod-server/src/state.rs`).

use std::sync::Arc;

use crate::collaborators::{GoogleRecognizer, GoogleTranslator};
use crate::config::Config;
use crate::dispatch::Dispatch;
use crate::pipeline::{SpeechRecognizer, Transcoder, Translator};
use crate::request_client::RequestClient;
use crate::session::session::SessionDeps;
use crate::session::SessionManager;
use crate::stats::Stats;

pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: SessionManager,
    pub dispatch: Arc<Dispatch>,
    pub stats: Arc<Stats>,
    request_client: Arc<RequestClient>,
    key_client: Arc<RequestClient>,
    transcoder: Arc<Transcoder>,
    recognizer: Arc<dyn SpeechRecognizer>,
    translator: Arc<dyn Translator>,
}

/// A recognizer/translator that always fails (§7 "recognizer error"
/// policy: treated as end-of-stream, not a crash) — wired in when no
/// `[GOOGLE_API] API_KEY` is configured, so a transcribe-mode session
/// degrades to "no subtitles produced" instead of the process refusing
/// to start.
struct UnconfiguredRecognizer;

#[async_trait::async_trait]
impl SpeechRecognizer for UnconfiguredRecognizer {
    async fn open_stream(&self, _sample_rate_hz: u32) -> crate::error::Result<Box<dyn crate::pipeline::RecognizerStream>> {
        Err(crate::error::ServerError::Internal(
            "speech-to-text collaborator not configured ([GOOGLE_API] API_KEY missing)".into(),
        ))
    }
}

struct UnconfiguredTranslator;

#[async_trait::async_trait]
impl Translator for UnconfiguredTranslator {
    async fn translate_words(&self, words: &[String], _src_lang: &str, _dst_lang: &str) -> crate::error::Result<Vec<String>> {
        // §7 "Translation failure" policy: preserve the source-language text.
        Ok(words.to_vec())
    }
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let stats = Arc::new(Stats::new());
        let request_client = Arc::new(RequestClient::new(stats.clone()));
        let key_client = Arc::new(RequestClient::new(stats.clone()));
        let transcoder = Arc::new(Transcoder::new(
            config.app.ffmpeg_path.clone(),
            config.app.sox_path.clone(),
            config.app.tmp_files_path.clone(),
        ));

        let recognizer: Arc<dyn SpeechRecognizer> = match &config.google_api.api_key {
            Some(key) => Arc::new(GoogleRecognizer::new(key.clone())),
            None => Arc::new(UnconfiguredRecognizer),
        };
        let translator: Arc<dyn Translator> = match &config.google_api.api_key {
            Some(key) => Arc::new(GoogleTranslator::new(key.clone())),
            None => Arc::new(UnconfiguredTranslator),
        };

        Self {
            dispatch: Dispatch::start(config.app.number_of_threads),
            sessions: SessionManager::new(),
            stats,
            request_client,
            key_client,
            transcoder,
            recognizer,
            translator,
            config,
        }
    }

    /// Collaborator bundle a session's request handlers need for this
    /// call (§4.7 module docs: passed per-call rather than stored).
    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            request_client: self.request_client.clone(),
            key_client: self.key_client.clone(),
            transcoder: self.transcoder.clone(),
            recognizer: self.recognizer.clone(),
            translator: self.translator.clone(),
            dispatch: self.dispatch.clone(),
            config: self.config.clone(),
        }
    }

    /// Teardown order per §9's "Singletons" design note: HTTP stops
    /// accepting first (the caller drops the listener before calling
    /// this), then the work-dispatch pool — which owns every session's
    /// live pollers and pipeline ingestion tasks — is drained last.
    pub async fn shutdown(&self) {
        self.dispatch.shutdown().await;
    }

    /// Background sweep entry point for the idle-session reaper
    /// (SPEC_FULL.md §C, resolving spec.md §9 Open Question 2).
    pub fn sweep_idle_sessions(&self) -> usize {
        self.sessions.sweep_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_with_no_google_api_key_configured() {
        let state = AppState::new(Config::default());
        assert_eq!(state.sessions.session_count(), 0);
    }

    #[tokio::test]
    async fn unconfigured_translator_passes_words_through() {
        let translator = UnconfiguredTranslator;
        let words = vec!["hola".to_string(), "mundo".to_string()];
        let out = translator.translate_words(&words, "es", "en").await.unwrap();
        assert_eq!(out, words);
    }
}
