//! DASH manifest engine (C3, §4.3).

pub mod mpd;
pub mod rewrite;

pub use mpd::{parse_iso8601_duration, substitute_template, AdaptationSet, ContentComponent, MpdDocument, Period, Representation, SegmentTemplate, SegmentTimeline, TimelineEntry};
pub use rewrite::{
    build_subtitle_adaptation_set_xml, live_attributes, materialize_fragments, rebuild_mpd, LiveAttributes, SubtitleAdaptationSetOpts,
    SUBTITLE_SEGMENT_SECS, SUBTITLE_TIMESCALE,
};

use crate::delay_buffer::DelayBuffer;
use crate::error::Result;
use crate::types::Fragment;

/// Re-emit a delayed MPD: slice the AdaptationSet's `DelayBuffer` and
/// collapse consecutive equal-duration fragments back into `r` repeat
/// runs (§4.4 — DASH collapses repeat runs, unlike HLS which expands
/// them verbatim).
pub fn live_timeline_xml(buffer: &DelayBuffer, timescale: u32) -> Result<String> {
    let view = buffer.view()?;
    Ok(collapse_to_segment_timeline_xml(&view.fragments, timescale))
}

fn collapse_to_segment_timeline_xml(fragments: &[Fragment], timescale: u32) -> String {
    let mut xml = String::from("<SegmentTimeline>\n");
    let mut i = 0;
    while i < fragments.len() {
        let start = fragments[i].timestamp.unwrap_or(0);
        let duration = (fragments[i].duration_secs * timescale as f64).round() as u64;
        let mut run = 0i64;
        let mut j = i + 1;
        while j < fragments.len() {
            let d = (fragments[j].duration_secs * timescale as f64).round() as u64;
            if d != duration {
                break;
            }
            run += 1;
            j += 1;
        }
        if run > 0 {
            xml.push_str(&format!("  <S t=\"{start}\" d=\"{duration}\" r=\"{run}\"/>\n"));
        } else {
            xml.push_str(&format!("  <S t=\"{start}\" d=\"{duration}\"/>\n"));
        }
        i = j;
    }
    xml.push_str("</SegmentTimeline>\n");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(t: u64, dur: f64) -> Fragment {
        Fragment {
            url: format!("seg{t}.m4s"),
            duration_secs: dur,
            start_time: t as f64,
            sequence: None,
            timestamp: Some(t),
            timescale: Some(10_000_000),
            sampling_rate: None,
            first_read: false,
            discontinuity: false,
            encryption: None,
        }
    }

    #[test]
    fn collapses_equal_duration_runs_with_repeat_count() {
        let fragments = vec![frag(0, 4.0), frag(4, 4.0), frag(8, 4.0), frag(12, 2.0)];
        let xml = collapse_to_segment_timeline_xml(&fragments, 1);
        assert!(xml.contains("r=\"2\""));
        assert!(xml.contains("<S t=\"12\" d=\"2\"/>"));
    }

    #[test]
    fn live_timeline_reflects_buffer_view() {
        let buffer = DelayBuffer::new(8.0);
        for i in 0..10u64 {
            buffer
                .poll_update(vec![Fragment { timestamp: Some(i * 4), ..frag(i * 4, 4.0) }], 16.0)
                .unwrap();
        }
        let xml = live_timeline_xml(&buffer, 1).unwrap();
        assert!(xml.contains("<SegmentTimeline>"));
    }
}
