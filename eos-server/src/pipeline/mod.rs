//! Transcription pipeline (C8, §4.8): audio ingestion, a streaming
//! recognizer driver, word→sentence aggregation, translation fan-out,
//! and a per-language subtitle buffer with live eviction.
//!
//! The speech recognizer and the translation API are external
//! collaborators (spec.md §1) — modeled here as traits rather than
//! concrete cloud SDK bindings, per §9's polymorphism design note and
//! the teacher's own preference for capability traits at component
//! seams (`hls_vod_lib::transcode`'s `Transcoder` trait is the closest
//! precedent in this codebase).

pub mod aggregator;
pub mod audio;
pub mod pipeline;
pub mod recognizer;
pub mod transcoder;
pub mod translate;

use crate::error::ServerError;

/// One word observed from a speech recognizer, time-shifted to the
/// pipeline's absolute timeline (stream start-time + `initial_time_offset`).
#[derive(Debug, Clone)]
pub struct RecognizedWord {
    pub text: String,
    pub start_secs: f64,
    pub end_secs: f64,
    pub is_final: bool,
}

/// One open streaming recognition session: a lazy, finite,
/// non-restartable sequence of word results with explicit close (§9
/// "coroutine/generator patterns").
#[async_trait::async_trait]
pub trait RecognizerStream: Send {
    async fn feed(&mut self, pcm: &[u8]) -> Result<(), ServerError>;
    /// Pop the next available result, or `None` if none is ready yet
    /// without blocking further than the collaborator's own buffering.
    async fn next_result(&mut self) -> Option<RecognizedWord>;
    async fn close(self: Box<Self>);
}

/// Opens streaming recognizer sessions at a fixed PCM sample rate.
#[async_trait::async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn open_stream(&self, sample_rate_hz: u32) -> Result<Box<dyn RecognizerStream>, ServerError>;
}

/// Batch text translation (§4.8 "Translation fan-out").
#[async_trait::async_trait]
pub trait Translator: Send + Sync {
    async fn translate_words(&self, words: &[String], src_lang: &str, dst_lang: &str) -> Result<Vec<String>, ServerError>;
}

pub use aggregator::{AggregatedSentence, Cue, SentenceAggregator};
pub use pipeline::{PcmFragment, PipelineMode, TranscribePipeline};
pub use recognizer::{RecognizerDriver, STREAMING_LIMIT};
pub use transcoder::Transcoder;
