//! Shared data model (spec §3): protocol-agnostic fragments, manifests
//! and subtitle entries used by the HLS engine, the DASH engine, the
//! live delay buffer and the subtitle codec.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Origin streaming protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Hls,
    Dash,
}

/// Whether the origin content is on-demand or a live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Streaming {
    Vod,
    Live,
}

/// Subtitle-generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Translate,
    Transcribe,
    Ocr,
}

/// AES-128 key delivery for encrypted HLS TS segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encryption {
    pub method: String,
    pub key_uri: String,
    pub iv: Option<String>,
}

/// A single media segment, protocol-agnostic.
///
/// HLS identifies fragments by a monotonically increasing sequence
/// number; DASH identifies them by a `(timestamp, timescale)` pair from
/// the `SegmentTimeline`. Exactly one of `sequence`/`timestamp` is set
/// depending on the owning buffer's protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub url: String,
    pub duration_secs: f64,
    pub start_time: f64,
    pub sequence: Option<u64>,
    pub timestamp: Option<u64>,
    pub timescale: Option<u32>,
    pub sampling_rate: Option<u32>,
    pub first_read: bool,
    pub discontinuity: bool,
    pub encryption: Option<Encryption>,
}

impl Fragment {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration_secs
    }

    /// Monotonic ordering key: sequence for HLS, timestamp for DASH.
    /// Panics if neither is set — every Fragment constructed by C2/C3/C4
    /// sets the one appropriate to its protocol.
    pub fn order_key(&self) -> u64 {
        self.sequence
            .or(self.timestamp)
            .expect("fragment missing both sequence and timestamp")
    }
}

/// A parsed (and possibly rewritten) manifest: a playlist or MPD,
/// reduced to the attributes this system cares about.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub url: String,
    pub attributes: HashMap<String, String>,
    pub fragments: Vec<Fragment>,
    /// Set when the manifest's EOS/ENDLIST marker was synthesized by us
    /// rather than read from the origin (e.g. a delayed-live view that
    /// truncates the origin's actual tail).
    pub eos_synthesized: bool,
}

/// A timed subtitle line, keyed by destination language in the
/// transcription pipeline's per-language buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleEntry {
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
}

impl SubtitleEntry {
    /// Closed-open overlap test used when rendering a fragment window
    /// (§4.5, invariant 5): `start < frag_end && end > frag_start`.
    pub fn overlaps(&self, frag_start: f64, frag_end: f64) -> bool {
        self.start_sec < frag_end && self.end_sec > frag_start
    }
}

/// Identifies a logical session (spec §3's `SessionKey`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub origin_url: String,
    pub protocol: Protocol,
    pub streaming: Streaming,
    pub mode: Mode,
    pub src_lang: String,
}

impl SessionKey {
    pub fn new(
        origin_url: impl Into<String>,
        protocol: Protocol,
        streaming: Streaming,
        mode: Mode,
        src_lang: impl Into<String>,
    ) -> Self {
        Self {
            origin_url: origin_url.into(),
            protocol,
            streaming,
            mode,
            src_lang: src_lang.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_rule_matches_invariant_5() {
        let cues = [
            SubtitleEntry { start_sec: 0.0, end_sec: 2.0, text: "A".into() },
            SubtitleEntry { start_sec: 2.0, end_sec: 4.0, text: "B".into() },
            SubtitleEntry { start_sec: 3.5, end_sec: 6.0, text: "C".into() },
        ];
        let in_window: Vec<&str> = cues
            .iter()
            .filter(|c| c.overlaps(2.0, 4.0))
            .map(|c| c.text.as_str())
            .collect();
        assert_eq!(in_window, vec!["B", "C"]);
    }

    #[test]
    fn fragment_order_key_prefers_sequence() {
        let f = Fragment {
            url: "x".into(),
            duration_secs: 4.0,
            start_time: 0.0,
            sequence: Some(5),
            timestamp: Some(999),
            timescale: None,
            sampling_rate: None,
            first_read: false,
            discontinuity: false,
            encryption: None,
        };
        assert_eq!(f.order_key(), 5);
    }
}
