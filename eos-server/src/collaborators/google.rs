//! REST bindings for Google Cloud Translation v2 and Speech-to-Text v1,
//! authenticated with a plain API key (`[GOOGLE_API].API_KEY`) rather
//! than a signed service-account token — the simplest binding that
//! still fulfills the `SpeechRecognizer`/`Translator` contracts.
//!
//! Speech-to-Text's `speech:recognize` endpoint is synchronous, not
//! streaming; `GoogleRecognizerStream::feed` issues one call per chunk
//! and surfaces its single result as "final", which is enough to drive
//! the aggregator even though it forgoes the real streaming API's
//! partial results.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::pipeline::{RecognizedWord, RecognizerStream, SpeechRecognizer, Translator};

const TRANSLATE_ENDPOINT: &str = "https://translation.googleapis.com/language/translate/v2";
const RECOGNIZE_ENDPOINT: &str = "https://speech.googleapis.com/v1/speech:recognize";

pub struct GoogleTranslator {
    http: reqwest::Client,
    api_key: String,
}

impl GoogleTranslator {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), api_key: api_key.into() }
    }
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'static str,
}

#[derive(Deserialize)]
struct TranslateResponse {
    data: TranslateData,
}

#[derive(Deserialize)]
struct TranslateData {
    translations: Vec<TranslateEntry>,
}

#[derive(Deserialize)]
struct TranslateEntry {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

#[async_trait]
impl Translator for GoogleTranslator {
    async fn translate_words(&self, words: &[String], src_lang: &str, dst_lang: &str) -> Result<Vec<String>, ServerError> {
        let sentence = words.join(" ");
        let resp = self
            .http
            .post(TRANSLATE_ENDPOINT)
            .query(&[("key", self.api_key.as_str())])
            .json(&TranslateRequest { q: &sentence, source: src_lang, target: dst_lang, format: "text" })
            .send()
            .await
            .map_err(|e| ServerError::Internal(format!("translate request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ServerError::Internal(format!("translate API status {}", resp.status())));
        }
        let parsed: TranslateResponse = resp
            .json()
            .await
            .map_err(|e| ServerError::Internal(format!("translate response decode: {e}")))?;
        let translated = parsed
            .data
            .translations
            .into_iter()
            .next()
            .map(|t| t.translated_text)
            .unwrap_or_default();
        Ok(translated.split_whitespace().map(str::to_string).collect())
    }
}

pub struct GoogleRecognizer {
    http: reqwest::Client,
    api_key: String,
}

impl GoogleRecognizer {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), api_key: api_key.into() }
    }
}

#[async_trait]
impl SpeechRecognizer for GoogleRecognizer {
    async fn open_stream(&self, sample_rate_hz: u32) -> Result<Box<dyn RecognizerStream>, ServerError> {
        Ok(Box::new(GoogleRecognizerStream {
            http: self.http.clone(),
            api_key: self.api_key.clone(),
            sample_rate_hz,
            elapsed_secs: 0.0,
            pending: Arc::new(Mutex::new(Vec::new())),
        }))
    }
}

struct GoogleRecognizerStream {
    http: reqwest::Client,
    api_key: String,
    sample_rate_hz: u32,
    elapsed_secs: f64,
    pending: Arc<Mutex<Vec<RecognizedWord>>>,
}

#[derive(Serialize)]
struct RecognizeConfig {
    encoding: &'static str,
    #[serde(rename = "sampleRateHertz")]
    sample_rate_hertz: u32,
    #[serde(rename = "languageCode")]
    language_code: &'static str,
    #[serde(rename = "enableWordTimeOffsets")]
    enable_word_time_offsets: bool,
}

#[derive(Serialize)]
struct RecognizeAudio {
    content: String,
}

#[derive(Serialize)]
struct RecognizeRequest {
    config: RecognizeConfig,
    audio: RecognizeAudio,
}

#[derive(Deserialize, Default)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<RecognizeResult>,
}

#[derive(Deserialize)]
struct RecognizeResult {
    alternatives: Vec<RecognizeAlternative>,
}

#[derive(Deserialize)]
struct RecognizeAlternative {
    #[serde(default)]
    words: Vec<RecognizeWordInfo>,
}

#[derive(Deserialize)]
struct RecognizeWordInfo {
    word: String,
    #[serde(rename = "startTime", default)]
    start_time: Option<String>,
    #[serde(rename = "endTime", default)]
    end_time: Option<String>,
}

/// Parses the `"1.200s"` duration strings the Speech-to-Text API returns.
fn parse_offset_secs(s: &str) -> f64 {
    s.trim_end_matches('s').parse().unwrap_or(0.0)
}

#[async_trait]
impl RecognizerStream for GoogleRecognizerStream {
    async fn feed(&mut self, pcm: &[u8]) -> Result<(), ServerError> {
        let chunk_secs = pcm.len() as f64 / (self.sample_rate_hz as f64 * 2.0);
        let base = self.elapsed_secs;

        let req = RecognizeRequest {
            config: RecognizeConfig {
                encoding: "LINEAR16",
                sample_rate_hertz: self.sample_rate_hz,
                language_code: "en-US",
                enable_word_time_offsets: true,
            },
            audio: RecognizeAudio { content: STANDARD.encode(pcm) },
        };
        let resp = self
            .http
            .post(RECOGNIZE_ENDPOINT)
            .query(&[("key", self.api_key.as_str())])
            .json(&req)
            .send()
            .await
            .map_err(|e| ServerError::Internal(format!("recognize request failed: {e}")))?;
        if !resp.status().is_success() {
            self.elapsed_secs += chunk_secs;
            return Err(ServerError::Internal(format!("recognize API status {}", resp.status())));
        }
        let parsed: RecognizeResponse = resp.json().await.unwrap_or_default();

        let mut words = Vec::new();
        for result in parsed.results {
            let Some(alt) = result.alternatives.into_iter().next() else { continue };
            for w in alt.words {
                let start = w.start_time.as_deref().map(parse_offset_secs).unwrap_or(0.0);
                let end = w.end_time.as_deref().map(parse_offset_secs).unwrap_or(start);
                words.push(RecognizedWord { text: w.word, start_secs: base + start, end_secs: base + end, is_final: true });
            }
        }
        self.elapsed_secs += chunk_secs;
        self.pending.lock().extend(words);
        Ok(())
    }

    async fn next_result(&mut self) -> Option<RecognizedWord> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            None
        } else {
            Some(pending.remove(0))
        }
    }

    async fn close(self: Box<Self>) {}
}
