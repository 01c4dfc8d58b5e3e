//! TTML subtitle body (§4.5): the payload carried inside DASH subtitle
//! fMP4 `mdat` boxes.

use crate::error::{CoreError, Result};
use crate::types::SubtitleEntry;

const STYLE_ID: &str = "s0";
const REGION_ID: &str = "r0";

fn format_ttml_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let secs = total_secs % 60;
    let total_mins = total_secs / 60;
    let mins = total_mins % 60;
    let hours = total_mins / 60;
    format!("{hours:02}:{mins:02}:{secs:02}.{ms:03}")
}

fn escape_cue_text(text: &str) -> String {
    text.replace('<', "").replace('>', "").replace('\n', "<br/>")
}

/// Build a complete TTML document for one media segment's worth of
/// cues (§4.5 body layout: two namespaces, one style `s0`, one region
/// `r0`, `<p>` elements per cue).
pub fn build_ttml(cues: &[SubtitleEntry]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<tt xmlns=\"http://www.w3.org/ns/ttml\" xmlns:tts=\"http://www.w3.org/ns/ttml#styling\">\n");
    out.push_str("  <head>\n");
    out.push_str("    <styling>\n");
    out.push_str(&format!(
        "      <style xml:id=\"{STYLE_ID}\" tts:color=\"white\" tts:opacity=\"0.80\" tts:fontFamily=\"proportionalSansSerif\" tts:backgroundColor=\"rgba(192,192,192,255)\" tts:textAlign=\"center\"/>\n"
    ));
    out.push_str("    </styling>\n");
    out.push_str("    <layout>\n");
    out.push_str(&format!(
        "      <region xml:id=\"{REGION_ID}\" tts:origin=\"2.84% 84%\" tts:extent=\"94.32% 16%\"/>\n"
    ));
    out.push_str("    </layout>\n");
    out.push_str("  </head>\n");
    out.push_str("  <body>\n    <div>\n");
    for cue in cues {
        let begin = format_ttml_time(cue.start_sec);
        let end = format_ttml_time(cue.end_sec);
        let text = escape_cue_text(&cue.text);
        out.push_str(&format!(
            "      <p region=\"{REGION_ID}\" style=\"{STYLE_ID}\" begin=\"{begin}\" end=\"{end}\">{text}</p>\n"
        ));
    }
    out.push_str("    </div>\n  </body>\n</tt>\n");
    out
}

/// Extract `(begin, end, text)` for every `<p>` element of a TTML body
/// produced by [`build_ttml`] or an origin-supplied equivalent.
pub fn parse_ttml(body: &str) -> Result<Vec<SubtitleEntry>> {
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(p_start) = rest.find("<p ") {
        let tag_end = rest[p_start..]
            .find('>')
            .ok_or_else(|| CoreError::Ttml("unterminated <p> tag".into()))?
            + p_start;
        let tag = &rest[p_start..=tag_end];
        let begin = extract_attr(tag, "begin").ok_or_else(|| CoreError::Ttml("missing begin".into()))?;
        let end = extract_attr(tag, "end").ok_or_else(|| CoreError::Ttml("missing end".into()))?;

        let content_start = tag_end + 1;
        let close = rest[content_start..]
            .find("</p>")
            .ok_or_else(|| CoreError::Ttml("unterminated <p> content".into()))?
            + content_start;
        let raw_text = &rest[content_start..close];
        let text = raw_text.replace("<br/>", "\n").replace("<br />", "\n");

        out.push(SubtitleEntry {
            start_sec: parse_ttml_time(&begin)?,
            end_sec: parse_ttml_time(&end)?,
            text,
        });
        rest = &rest[close + "</p>".len()..];
    }
    Ok(out)
}

fn extract_attr(tag: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=\"");
    let start = tag.find(&needle)? + needle.len();
    let end = tag[start..].find('"')? + start;
    Some(tag[start..end].to_string())
}

fn parse_ttml_time(s: &str) -> Result<f64> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err(CoreError::Ttml(format!("malformed timestamp: {s}")));
    }
    let hours: f64 = parts[0].parse().map_err(|_| CoreError::Ttml(format!("bad hours: {s}")))?;
    let mins: f64 = parts[1].parse().map_err(|_| CoreError::Ttml(format!("bad minutes: {s}")))?;
    let secs: f64 = parts[2].parse().map_err(|_| CoreError::Ttml(format!("bad seconds: {s}")))?;
    Ok(hours * 3600.0 + mins * 60.0 + secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_single_style_and_region() {
        let cues = vec![SubtitleEntry { start_sec: 1.0, end_sec: 2.5, text: "hello".into() }];
        let xml = build_ttml(&cues);
        assert!(xml.contains("xml:id=\"s0\""));
        assert!(xml.contains("xml:id=\"r0\""));
        assert!(xml.contains("begin=\"00:00:01.000\""));
        assert!(xml.contains("end=\"00:00:02.500\""));
    }

    #[test]
    fn strips_angle_brackets_and_substitutes_newlines() {
        let cues = vec![SubtitleEntry { start_sec: 0.0, end_sec: 1.0, text: "a <b>\nc".into() }];
        let xml = build_ttml(&cues);
        assert!(xml.contains(">ab<br/>c</p>"));
    }

    #[test]
    fn parse_is_inverse_of_build_for_timings_and_text() {
        let cues = vec![
            SubtitleEntry { start_sec: 0.0, end_sec: 2.0, text: "first line".into() },
            SubtitleEntry { start_sec: 2.0, end_sec: 4.25, text: "second\nline".into() },
        ];
        let xml = build_ttml(&cues);
        let parsed = parse_ttml(&xml).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].text, "second\nline");
        assert!((parsed[1].end_sec - 4.25).abs() < 1e-6);
    }
}
