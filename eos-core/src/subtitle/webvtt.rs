//! WebVTT rendering for HLS subtitle fragments (§4.5).

use crate::error::{CoreError, Result};
use crate::types::SubtitleEntry;

fn format_vtt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let secs = total_secs % 60;
    let total_mins = total_secs / 60;
    let mins = total_mins % 60;
    let hours = total_mins / 60;
    format!("{hours:02}:{mins:02}:{secs:02}.{ms:03}")
}

/// Render one WebVTT fragment: header, optional `X-TIMESTAMP-MAP` (live
/// alignment), then one cue per entry overlapping `[frag_start, frag_end)`
/// under the closed-open overlap rule (§4.5, invariant 5).
pub fn build_webvtt(cues: &[SubtitleEntry], frag_start: f64, frag_end: f64, timestamp_map: Option<(u64, f64)>) -> String {
    let mut out = String::from("WEBVTT\n");
    if let Some((first_pts, local_secs)) = timestamp_map {
        out.push_str(&format!(
            "X-TIMESTAMP-MAP=MPEGTS:{first_pts},LOCAL:{}\n",
            format_vtt_time(local_secs)
        ));
    }
    out.push('\n');

    for cue in cues {
        if !cue.overlaps(frag_start, frag_end) {
            continue;
        }
        out.push_str(&format!("{} --> {}\n", format_vtt_time(cue.start_sec), format_vtt_time(cue.end_sec)));
        out.push_str(&cue.text);
        out.push_str("\n\n");
    }
    out
}

fn parse_vtt_time(s: &str) -> Result<f64> {
    let s = s.trim();
    let (hms, ms) = s.split_once('.').ok_or_else(|| CoreError::WebVtt(format!("malformed timestamp: {s}")))?;
    let parts: Vec<&str> = hms.split(':').collect();
    let (hours, mins, secs) = match parts.as_slice() {
        [h, m, s] => (
            h.parse::<f64>().map_err(|_| CoreError::WebVtt(format!("bad hours: {s}")))?,
            m.parse::<f64>().map_err(|_| CoreError::WebVtt(format!("bad minutes: {s}")))?,
            s.parse::<f64>().map_err(|_| CoreError::WebVtt(format!("bad seconds: {s}")))?,
        ),
        [m, s] => (
            0.0,
            m.parse::<f64>().map_err(|_| CoreError::WebVtt(format!("bad minutes: {s}")))?,
            s.parse::<f64>().map_err(|_| CoreError::WebVtt(format!("bad seconds: {s}")))?,
        ),
        _ => return Err(CoreError::WebVtt(format!("malformed timestamp: {s}"))),
    };
    let millis: f64 = ms.parse().map_err(|_| CoreError::WebVtt(format!("bad milliseconds: {s}")))?;
    Ok(hours * 3600.0 + mins * 60.0 + secs + millis / 1000.0)
}

/// Parse a WebVTT document's cues back out, tolerating an optional
/// leading cue identifier line and an optional `X-TIMESTAMP-MAP` header
/// (ignored — alignment is resolved by the caller against the
/// requesting fragment's own window). Used by translate-mode subtitle
/// fragment handling to read an origin-supplied source-language track.
pub fn parse_webvtt(body: &str) -> Result<Vec<SubtitleEntry>> {
    let mut out = Vec::new();
    let mut lines = body.lines().peekable();

    // Skip the WEBVTT header and any header-block metadata up to the
    // first blank line.
    if let Some(first) = lines.peek() {
        if first.trim_start().starts_with("WEBVTT") {
            lines.next();
            for line in lines.by_ref() {
                if line.trim().is_empty() {
                    break;
                }
            }
        }
    }

    while let Some(line) = lines.next() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let cue_line = if line.contains("-->") {
            line.to_string()
        } else if let Some(next) = lines.next() {
            // `line` was a cue identifier; the timing line follows.
            next.trim().to_string()
        } else {
            continue;
        };
        let Some((start_str, end_str)) = cue_line.split_once("-->") else {
            continue;
        };
        let end_str = end_str.split_whitespace().next().unwrap_or(end_str);
        let start_sec = parse_vtt_time(start_str)?;
        let end_sec = parse_vtt_time(end_str)?;

        let mut text_lines = Vec::new();
        for text_line in lines.by_ref() {
            if text_line.trim().is_empty() {
                break;
            }
            text_lines.push(text_line.to_string());
        }
        out.push(SubtitleEntry { start_sec, end_sec, text: text_lines.join("\n") });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cue(start: f64, end: f64, text: &str) -> SubtitleEntry {
        SubtitleEntry { start_sec: start, end_sec: end, text: text.to_string() }
    }

    #[test]
    fn scenario_4_subtitle_overlap_rendering() {
        let cues = vec![cue(0.0, 2.0, "A"), cue(2.0, 4.0, "B"), cue(3.5, 6.0, "C")];
        let out = build_webvtt(&cues, 2.0, 4.0, None);
        assert!(out.contains("B"));
        assert!(out.contains("C"));
        assert!(!out.contains('A'), "cue A ends exactly at frag_start and must be excluded");
    }

    #[test]
    fn header_always_present_timestamp_map_optional() {
        let out_plain = build_webvtt(&[], 0.0, 4.0, None);
        assert!(out_plain.starts_with("WEBVTT\n"));
        assert!(!out_plain.contains("X-TIMESTAMP-MAP"));

        let out_live = build_webvtt(&[], 0.0, 4.0, Some((900_000, 0.0)));
        assert!(out_live.contains("X-TIMESTAMP-MAP=MPEGTS:900000,LOCAL:00:00:00.000"));
    }

    #[test]
    fn parse_recovers_cues_built_by_build_webvtt() {
        let cues = vec![cue(0.0, 2.0, "A"), cue(2.0, 4.0, "B\nsecond line")];
        let rendered = build_webvtt(&cues, 0.0, 4.0, None);
        let parsed = parse_webvtt(&rendered).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].text, "A");
        assert_eq!(parsed[1].text, "B\nsecond line");
        assert!((parsed[1].start_sec - 2.0).abs() < 1e-6);
    }

    #[test]
    fn parse_tolerates_leading_cue_identifiers() {
        let body = "WEBVTT\n\n1\n00:00:01.000 --> 00:00:02.000\nhello\n\n";
        let parsed = parse_webvtt(body).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].text, "hello");
    }
}
