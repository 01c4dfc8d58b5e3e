//! Translation fan-out (§4.8 "Translation fan-out"): a finalized
//! sentence's text is sent to the translation collaborator as a single
//! batch per destination language; the returned word list is
//! time-proportionally redistributed across the original words' timing
//! slots before line-breaking.

use super::{AggregatedSentence, RecognizedWord, Translator};
#[cfg(test)]
use crate::error::ServerError;

/// Translate `sentence` into `dst_lang` and re-time the translated words
/// by allocating each original word a share of the output words
/// proportional to its character-count share of the whole sentence.
///
/// A translation failure preserves the source-language sentence
/// unchanged (§7 "Translation failure").
pub async fn translate_sentence(
    translator: &dyn Translator,
    sentence: &AggregatedSentence,
    src_lang: &str,
    dst_lang: &str,
) -> AggregatedSentence {
    if src_lang.eq_ignore_ascii_case(dst_lang) {
        return sentence.clone();
    }
    let source_words: Vec<String> = sentence.words.iter().map(|w| w.text.clone()).collect();
    match translator.translate_words(&source_words, src_lang, dst_lang).await {
        Ok(translated) if !translated.is_empty() => {
            let words = redistribute(&sentence.words, &translated);
            let text = words.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" ");
            AggregatedSentence { words, start_secs: sentence.start_secs, end_secs: sentence.end_secs, text }
        }
        _ => sentence.clone(),
    }
}

/// Allocate `translated_words` to `original_words`' timing slots
/// proportionally to each original word's character-count share, so the
/// timed output has the same total span as the input sentence
/// regardless of how many words the translation produced.
fn redistribute(original_words: &[RecognizedWord], translated_words: &[String]) -> Vec<RecognizedWord> {
    let total_chars: usize = original_words.iter().map(|w| w.text.chars().count()).sum::<usize>().max(1);
    let n = translated_words.len();
    let mut out = Vec::with_capacity(n);
    let mut assigned_chars = 0usize;
    let mut word_cursor = 0usize;

    for (i, original) in original_words.iter().enumerate() {
        assigned_chars += original.text.chars().count();
        let target_cursor = if i + 1 == original_words.len() {
            n
        } else {
            ((assigned_chars as f64 / total_chars as f64) * n as f64).round() as usize
        };
        let take = target_cursor.saturating_sub(word_cursor).min(n - word_cursor);
        for _ in 0..take {
            out.push(RecognizedWord {
                text: translated_words[word_cursor].clone(),
                start_secs: original.start_secs,
                end_secs: original.end_secs,
                is_final: true,
            });
            word_cursor += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn word(text: &str, start: f64, end: f64) -> RecognizedWord {
        RecognizedWord { text: text.to_string(), start_secs: start, end_secs: end, is_final: true }
    }

    struct EchoTranslator;
    #[async_trait]
    impl Translator for EchoTranslator {
        async fn translate_words(&self, words: &[String], _src: &str, _dst: &str) -> Result<Vec<String>, ServerError> {
            Ok(words.iter().map(|w| format!("[{w}]")).collect())
        }
    }

    struct FailingTranslator;
    #[async_trait]
    impl Translator for FailingTranslator {
        async fn translate_words(&self, _words: &[String], _src: &str, _dst: &str) -> Result<Vec<String>, ServerError> {
            Err(ServerError::Internal("translation API down".into()))
        }
    }

    fn sample_sentence() -> AggregatedSentence {
        let words = vec![word("hello", 0.0, 0.5), word("world", 0.5, 1.2)];
        AggregatedSentence { start_secs: 0.0, end_secs: 1.2, text: "hello world".into(), words }
    }

    #[tokio::test]
    async fn same_language_translation_is_a_no_op_on_timing() {
        let sentence = sample_sentence();
        let out = translate_sentence(&EchoTranslator, &sentence, "en", "en").await;
        assert_eq!(out.start_secs, sentence.start_secs);
        assert_eq!(out.end_secs, sentence.end_secs);
        assert_eq!(out.text, sentence.text);
    }

    #[tokio::test]
    async fn redistributes_translated_words_across_original_span() {
        let sentence = sample_sentence();
        let out = translate_sentence(&EchoTranslator, &sentence, "en", "de-DE").await;
        assert_eq!(out.words.len(), 2);
        assert_eq!(out.words[0].start_secs, 0.0);
        assert_eq!(out.words[1].end_secs, 1.2);
        assert_eq!(out.text, "[hello] [world]");
    }

    #[tokio::test]
    async fn translation_failure_preserves_source_text() {
        let sentence = sample_sentence();
        let out = translate_sentence(&FailingTranslator, &sentence, "en", "de-DE").await;
        assert_eq!(out.text, "hello world");
    }
}
