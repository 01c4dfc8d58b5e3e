//! Streaming recognizer driver (§4.8 "Streaming recognizer driver").
//!
//! A recognizer stream lasts at most [`STREAMING_LIMIT`]; the driver
//! keeps a rolling buffer of PCM fed since the last finalized result and,
//! on restart, replays it into the fresh stream so no audio crosses the
//! boundary unheard (invariant 6, §8).

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{RecognizedWord, RecognizerStream, SpeechRecognizer};
use crate::error::ServerError;

pub const STREAMING_LIMIT: Duration = Duration::from_secs(180);

pub struct RecognizerDriver {
    recognizer: Arc<dyn SpeechRecognizer>,
    sample_rate_hz: u32,
    stream: Option<Box<dyn RecognizerStream>>,
    stream_opened_at: Instant,
    /// PCM bytes fed since the last finalized result, with `buffer_start_secs`
    /// the time-offset (relative to the current stream) of byte 0.
    rolling_buffer: Vec<u8>,
    buffer_start_secs: f64,
    consecutive_failures_without_final: u32,
}

impl RecognizerDriver {
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>, sample_rate_hz: u32) -> Self {
        Self {
            recognizer,
            sample_rate_hz,
            stream: None,
            stream_opened_at: Instant::now(),
            rolling_buffer: Vec::new(),
            buffer_start_secs: 0.0,
            consecutive_failures_without_final: 0,
        }
    }

    async fn ensure_open(&mut self) -> Result<(), ServerError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut stream = self.recognizer.open_stream(self.sample_rate_hz).await?;
        if !self.rolling_buffer.is_empty() {
            stream.feed(&self.rolling_buffer).await?;
        }
        self.stream = Some(stream);
        self.stream_opened_at = Instant::now();
        Ok(())
    }

    /// Feed one PCM chunk, returning any finalized words produced. On
    /// recognizer error the current stream is treated as ended and a
    /// fresh one is opened with the rolling buffer replayed (§7
    /// "Recognizer error"); two consecutive failures without any
    /// finalized result are logged but not fatal.
    pub async fn feed(&mut self, pcm: &[u8]) -> Result<Vec<RecognizedWord>, ServerError> {
        self.ensure_open().await?;
        self.rolling_buffer.extend_from_slice(pcm);

        let feed_result = {
            let stream = self.stream.as_mut().expect("ensure_open just populated it");
            stream.feed(pcm).await
        };
        if let Err(e) = feed_result {
            tracing::warn!(error = %e, "recognizer feed failed, restarting stream");
            self.restart().await?;
            return Ok(Vec::new());
        }

        let mut finals = Vec::new();
        loop {
            let next = {
                let stream = self.stream.as_mut().expect("stream open");
                stream.next_result().await
            };
            let Some(word) = next else { break };
            if word.is_final {
                self.trim_rolling_buffer(word.end_secs);
                self.consecutive_failures_without_final = 0;
                finals.push(word);
            }
            // Partial results are observed for accuracy stats elsewhere,
            // never emitted here.
        }

        if finals.is_empty() {
            self.consecutive_failures_without_final += 1;
            if self.consecutive_failures_without_final >= 2 {
                tracing::warn!("two consecutive recognizer passes without a finalized result");
            }
        }

        if self.stream_opened_at.elapsed() >= STREAMING_LIMIT {
            self.restart().await?;
        }

        Ok(finals)
    }

    /// Drop bytes of `rolling_buffer` that precede `final_result_end_time`
    /// (relative to the current stream), advancing `buffer_start_secs`.
    fn trim_rolling_buffer(&mut self, final_result_end_secs: f64) {
        let bytes_per_sec = self.sample_rate_hz as f64 * 2.0;
        let consumed_secs = (final_result_end_secs - self.buffer_start_secs).max(0.0);
        let consumed_bytes = (consumed_secs * bytes_per_sec) as usize;
        if consumed_bytes > 0 {
            let drain = consumed_bytes.min(self.rolling_buffer.len());
            self.rolling_buffer.drain(0..drain);
            self.buffer_start_secs = final_result_end_secs;
        }
    }

    async fn restart(&mut self) -> Result<(), ServerError> {
        if let Some(stream) = self.stream.take() {
            stream.close().await;
        }
        self.ensure_open().await
    }

    pub async fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeStream {
        fed_bytes: Arc<Mutex<Vec<u8>>>,
        pending: Vec<RecognizedWord>,
    }

    #[async_trait]
    impl RecognizerStream for FakeStream {
        async fn feed(&mut self, pcm: &[u8]) -> Result<(), ServerError> {
            self.fed_bytes.lock().unwrap().extend_from_slice(pcm);
            Ok(())
        }
        async fn next_result(&mut self) -> Option<RecognizedWord> {
            self.pending.pop()
        }
        async fn close(self: Box<Self>) {}
    }

    struct FakeRecognizer {
        fed_bytes: Arc<Mutex<Vec<u8>>>,
        words_per_open: Mutex<Vec<Vec<RecognizedWord>>>,
    }

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn open_stream(&self, _sample_rate_hz: u32) -> Result<Box<dyn RecognizerStream>, ServerError> {
            let words = self.words_per_open.lock().unwrap().pop().unwrap_or_default();
            Ok(Box::new(FakeStream { fed_bytes: self.fed_bytes.clone(), pending: words }))
        }
    }

    fn word(text: &str, start: f64, end: f64) -> RecognizedWord {
        RecognizedWord { text: text.to_string(), start_secs: start, end_secs: end, is_final: true }
    }

    #[tokio::test]
    async fn finalized_words_are_returned_and_trim_the_rolling_buffer() {
        let fed_bytes = Arc::new(Mutex::new(Vec::new()));
        let recognizer = Arc::new(FakeRecognizer {
            fed_bytes: fed_bytes.clone(),
            words_per_open: Mutex::new(vec![vec![word("hi", 0.0, 0.4)]]),
        });
        let mut driver = RecognizerDriver::new(recognizer, 16000);
        let pcm = vec![0u8; 16000]; // 0.5s at 16kHz/16-bit mono
        let finals = driver.feed(&pcm).await.unwrap();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].text, "hi");
        // 0.4s worth of bytes trimmed from a 0.5s buffer leaves 0.1s = 3200 bytes.
        assert_eq!(driver.rolling_buffer.len(), 3200);
    }

    #[tokio::test]
    async fn restart_replays_rolling_buffer_into_new_stream() {
        let fed_bytes = Arc::new(Mutex::new(Vec::new()));
        let recognizer = Arc::new(FakeRecognizer { fed_bytes: fed_bytes.clone(), words_per_open: Mutex::new(vec![]) });
        let mut driver = RecognizerDriver::new(recognizer, 16000);
        let pcm = vec![1u8; 100];
        driver.feed(&pcm).await.unwrap();
        driver.restart().await.unwrap();
        // The replay on restart feeds the still-unconsumed rolling buffer
        // again, so the fake stream should have seen it at least twice.
        assert!(fed_bytes.lock().unwrap().len() >= pcm.len() * 2);
    }
}
