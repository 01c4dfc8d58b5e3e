//! Transcription pipeline orchestration (§4.8): audio ingestion loop,
//! recognizer driver, sentence aggregator and translation fan-out wired
//! together behind a per-session handle, plus the per-language subtitle
//! buffer with live eviction and the pause/resume/close state machine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::audio::{chunk_pcm, PaceMode, Pacer};
use super::transcoder::{self, Transcoder};
use super::{AggregatedSentence, RecognizedWord, RecognizerDriver, SentenceAggregator, SpeechRecognizer, Translator};
use crate::error::ServerError;
use crate::request_client::RequestClient;
use eos_core::types::{Fragment, Protocol, SubtitleEntry};

/// Oldest entries are evicted once accumulated duration for a language
/// exceeds this, for live streams only (§4.8 "Per-language buffer and eviction").
const LIVE_BUFFER_CAP_SECS: f64 = 140.0;

/// Recognizer streams in this system are always fed 16kHz mono PCM
/// (§4.8 step 5 default).
pub const RECOGNIZER_SAMPLE_RATE_HZ: u32 = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Vod,
    Live,
}

/// One fragment's worth of already-decoded PCM, ready for the recognizer.
pub struct PcmFragment {
    pub pcm: Vec<u8>,
    /// Offset of `pcm`'s first sample on the pipeline's absolute timeline.
    pub start_time: f64,
}

struct LanguageBuffer {
    entries: Vec<SubtitleEntry>,
}

impl LanguageBuffer {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn push(&mut self, entry: SubtitleEntry, mode: PipelineMode) {
        self.entries.push(entry);
        if mode == PipelineMode::Live {
            self.evict_if_over_cap();
        }
    }

    fn evict_if_over_cap(&mut self) {
        loop {
            let span = match (self.entries.first(), self.entries.last()) {
                (Some(first), Some(last)) => last.end_sec - first.start_sec,
                _ => return,
            };
            if span <= LIVE_BUFFER_CAP_SECS || self.entries.len() <= 1 {
                return;
            }
            self.entries.remove(0);
        }
    }

    fn overlapping(&self, start: f64, end: f64) -> Vec<SubtitleEntry> {
        self.entries.iter().filter(|e| e.overlaps(start, end)).cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Opening,
    Running,
    Paused,
    Closed,
}

struct Inner {
    state: RunState,
    pause_pending: bool,
    resume_pending: bool,
    initial_time_offset: Option<f64>,
    buffers: BTreeMap<String, LanguageBuffer>,
}

/// Orchestrates one session's transcription: ingests PCM fragments,
/// drives the recognizer, aggregates words into sentences, fans each
/// sentence out to every destination language, and buffers the result
/// per language for subtitle-fragment rendering (§4.7's transcribe path).
pub struct TranscribePipeline {
    mode: PipelineMode,
    src_lang: String,
    dst_langs: Vec<String>,
    sample_rate_hz: u32,
    recognizer: Arc<dyn SpeechRecognizer>,
    translator: Arc<dyn Translator>,
    inner: Mutex<Inner>,
    ready: Notify,
    feed_tx: Mutex<Option<mpsc::Sender<PcmFragment>>>,
}

impl TranscribePipeline {
    pub fn new(
        mode: PipelineMode,
        src_lang: impl Into<String>,
        dst_langs: Vec<String>,
        sample_rate_hz: u32,
        recognizer: Arc<dyn SpeechRecognizer>,
        translator: Arc<dyn Translator>,
    ) -> Arc<Self> {
        let mut buffers = BTreeMap::new();
        for lang in &dst_langs {
            buffers.insert(lang.clone(), LanguageBuffer::new());
        }
        Arc::new(Self {
            mode,
            src_lang: src_lang.into(),
            dst_langs,
            sample_rate_hz,
            recognizer,
            translator,
            inner: Mutex::new(Inner {
                state: RunState::Opening,
                pause_pending: false,
                resume_pending: false,
                initial_time_offset: None,
                buffers,
            }),
            ready: Notify::new(),
            feed_tx: Mutex::new(None),
        })
    }

    /// Start ingestion, spawning the driver task that owns the
    /// recognizer stream and the aggregator. Returns the sender fragments
    /// are pushed through from the caller's audio-ingestion loop (§4.8
    /// step 1-7).
    pub fn start(self: &Arc<Self>) -> mpsc::Sender<PcmFragment> {
        let (tx, rx) = mpsc::channel::<PcmFragment>(8);
        *self.feed_tx.lock() = Some(tx.clone());
        let this = Arc::clone(self);
        tokio::spawn(this.run(rx));
        tx
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<PcmFragment>) {
        {
            let mut inner = self.inner.lock();
            inner.state = RunState::Running;
            if inner.pause_pending {
                inner.pause_pending = false;
                inner.state = RunState::Paused;
            }
        }
        self.ready.notify_waiters();

        let mut driver = RecognizerDriver::new(Arc::clone(&self.recognizer), self.sample_rate_hz);
        let mut aggregator = SentenceAggregator::new();
        let mut pacer = Pacer::new(self.sample_rate_hz, pace_mode(self.mode));

        while let Some(fragment) = rx.recv().await {
            if self.is_closed() {
                break;
            }
            self.wait_while_paused().await;
            if self.is_closed() {
                break;
            }

            {
                let mut inner = self.inner.lock();
                if inner.initial_time_offset.is_none() {
                    inner.initial_time_offset = Some(fragment.start_time);
                }
            }
            let offset = self.inner.lock().initial_time_offset.unwrap_or(0.0);

            for chunk in chunk_pcm(&fragment.pcm, self.sample_rate_hz) {
                pacer.pace(chunk.len()).await;
                match driver.feed(&chunk).await {
                    Ok(words) => {
                        for mut word in words {
                            word.start_secs += offset;
                            word.end_secs += offset;
                            if let Some(sentence) = aggregator.push(word) {
                                self.dispatch_sentence(sentence).await;
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "pipeline recognizer feed failed"),
                }
            }
        }

        if let Some(sentence) = aggregator.flush() {
            self.dispatch_sentence(sentence).await;
        }
        driver.close().await;
        self.inner.lock().state = RunState::Closed;
    }

    async fn dispatch_sentence(&self, sentence: AggregatedSentence) {
        for dst_lang in &self.dst_langs {
            let translated = super::translate::translate_sentence(self.translator.as_ref(), &sentence, &self.src_lang, dst_lang).await;
            for cue in super::aggregator::layout_cues(&translated) {
                let mut inner = self.inner.lock();
                if let Some(buf) = inner.buffers.get_mut(dst_lang) {
                    buf.push(
                        SubtitleEntry { start_sec: cue.start_secs, end_sec: cue.end_secs, text: cue.text },
                        self.mode,
                    );
                }
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().state == RunState::Closed
    }

    async fn wait_while_paused(&self) {
        loop {
            if self.inner.lock().state != RunState::Paused {
                return;
            }
            self.ready.notified().await;
        }
    }

    /// Close the audio generator (dropping the feed sender ends the
    /// ingestion loop) and mark paused; idempotent, and queued if the
    /// pipeline is still opening (§4.8 "Pause / resume / close").
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            RunState::Opening => inner.pause_pending = true,
            RunState::Running => {
                inner.state = RunState::Paused;
                inner.resume_pending = false;
            }
            RunState::Paused | RunState::Closed => {}
        }
    }

    /// Resume a paused pipeline; idempotent, and queued if still opening.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            RunState::Opening => inner.resume_pending = true,
            RunState::Paused => inner.state = RunState::Running,
            RunState::Running | RunState::Closed => {}
        }
        drop(inner);
        self.ready.notify_waiters();
    }

    /// Stop ingestion permanently; idempotent.
    pub fn close(&self) {
        self.inner.lock().state = RunState::Closed;
        self.feed_tx.lock().take();
        self.ready.notify_waiters();
    }

    pub fn feed_tx(&self) -> Option<mpsc::Sender<PcmFragment>> {
        self.feed_tx.lock().clone()
    }

    /// Overlapping cues for `dst_lang` in `[start, end)`, for subtitle-
    /// fragment rendering (§4.7 "subtitle fragment", transcribe mode).
    pub fn query(&self, dst_lang: &str, start: f64, end: f64) -> Vec<SubtitleEntry> {
        self.inner.lock().buffers.get(dst_lang).map(|b| b.overlapping(start, end)).unwrap_or_default()
    }
}

fn pace_mode(mode: PipelineMode) -> PaceMode {
    match mode {
        PipelineMode::Vod => PaceMode::Vod,
        PipelineMode::Live => PaceMode::Live,
    }
}

/// Placeholder recognizer error grace period used by callers deciding
/// whether to retry a fragment download before giving up (§7 "Origin
/// fetch failure").
pub const FRAGMENT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopStream;
    #[async_trait]
    impl super::super::RecognizerStream for NoopStream {
        async fn feed(&mut self, _pcm: &[u8]) -> Result<(), ServerError> {
            Ok(())
        }
        async fn next_result(&mut self) -> Option<RecognizedWord> {
            None
        }
        async fn close(self: Box<Self>) {}
    }

    struct NoopRecognizer;
    #[async_trait]
    impl SpeechRecognizer for NoopRecognizer {
        async fn open_stream(&self, _sample_rate_hz: u32) -> Result<Box<dyn super::super::RecognizerStream>, ServerError> {
            Ok(Box::new(NoopStream))
        }
    }

    struct EchoTranslator;
    #[async_trait]
    impl Translator for EchoTranslator {
        async fn translate_words(&self, words: &[String], _src: &str, _dst: &str) -> Result<Vec<String>, ServerError> {
            Ok(words.to_vec())
        }
    }

    #[tokio::test]
    async fn pause_resume_cycle_is_idempotent() {
        let pipeline = TranscribePipeline::new(
            PipelineMode::Vod,
            "en",
            vec!["de-DE".into()],
            16000,
            Arc::new(NoopRecognizer),
            Arc::new(EchoTranslator),
        );
        let _tx = pipeline.start();
        tokio::task::yield_now().await;
        pipeline.pause();
        pipeline.pause();
        pipeline.resume();
        pipeline.resume();
        pipeline.close();
        pipeline.close();
        assert!(pipeline.is_closed());
    }

    #[test]
    fn language_buffer_evicts_oldest_once_live_cap_exceeded() {
        let mut buf = LanguageBuffer::new();
        for i in 0..20 {
            let start = i as f64 * 10.0;
            buf.push(SubtitleEntry { start_sec: start, end_sec: start + 10.0, text: i.to_string() }, PipelineMode::Live);
        }
        let span = buf.entries.last().unwrap().end_sec - buf.entries.first().unwrap().start_sec;
        assert!(span <= LIVE_BUFFER_CAP_SECS);
    }

    #[test]
    fn vod_buffer_never_evicts() {
        let mut buf = LanguageBuffer::new();
        for i in 0..40 {
            let start = i as f64 * 10.0;
            buf.push(SubtitleEntry { start_sec: start, end_sec: start + 10.0, text: i.to_string() }, PipelineMode::Vod);
        }
        assert_eq!(buf.entries.len(), 40);
    }
}
