//! DASH MPD rewrite operations (§4.3): resolve representation URLs,
//! synthesize a subtitle `AdaptationSet`, rewrite live presentation
//! attributes, and materialize per-segment fragment lists from a
//! `SegmentTemplate` + `SegmentTimeline`.

use std::fmt::Write as _;

use crate::dash::mpd::{substitute_template, AdaptationSet, MpdDocument};
use crate::error::Result;
use crate::types::Fragment;
use crate::url;

/// Timescale advertised by synthesized subtitle `SegmentTemplate`s
/// (§4.3; also the subject of open question 1 in spec §9).
pub const SUBTITLE_TIMESCALE: u32 = 10_000_000;

/// Fixed segment duration (seconds) for synthesized subtitle tracks.
pub const SUBTITLE_SEGMENT_SECS: f64 = 4.0;

/// Materialize the concrete fragment list for one `Representation`,
/// substituting `$Bandwidth$`/`$Time$`/`$RepresentationID$` in its
/// `SegmentTemplate` (inherited from the `AdaptationSet` if not
/// overridden on the `Representation` itself).
pub fn materialize_fragments(
    set: &AdaptationSet,
    representation_id: &str,
    bandwidth: u64,
    base_url: &str,
) -> Result<Vec<Fragment>> {
    let template = set
        .representations
        .iter()
        .find(|r| r.id.as_deref() == Some(representation_id))
        .and_then(|r| r.segment_template.as_ref())
        .or(set.segment_template.as_ref());

    let Some(template) = template else {
        return Ok(Vec::new());
    };
    let Some(media) = &template.media else {
        return Ok(Vec::new());
    };
    let timescale = template.timescale.unwrap_or(1) as f64;

    let timeline = template.timeline.as_ref().map(|t| t.resolve()).unwrap_or_default();

    let mut fragments = Vec::with_capacity(timeline.len());
    let mut start_time = 0.0;
    for (timestamp, duration) in timeline {
        let rel_url = substitute_template(media, representation_id, bandwidth, Some(timestamp));
        let abs_url = url::resolve(&rel_url, base_url)?;
        fragments.push(Fragment {
            url: abs_url,
            duration_secs: duration as f64 / timescale,
            start_time,
            sequence: None,
            timestamp: Some(timestamp),
            timescale: Some(timescale as u32),
            sampling_rate: None,
            first_read: false,
            discontinuity: false,
            encryption: None,
        });
        start_time += duration as f64 / timescale;
    }
    Ok(fragments)
}

/// Live MPD attribute rewrite (§4.3): `publishTime` = now, presentation
/// delay/buffer depth widened by the configured delay, `maxSegmentDuration`
/// raised to at least 4s.
pub struct LiveAttributes {
    pub publish_time_rfc3339: String,
    pub suggested_presentation_delay_secs: f64,
    pub time_shift_buffer_depth_secs: f64,
    pub max_segment_duration_secs: f64,
}

pub fn live_attributes(now_rfc3339: &str, original_time_shift_buffer_secs: f64, delay_secs: f64, original_max_segment_secs: f64) -> LiveAttributes {
    LiveAttributes {
        publish_time_rfc3339: now_rfc3339.to_string(),
        suggested_presentation_delay_secs: delay_secs,
        time_shift_buffer_depth_secs: original_time_shift_buffer_secs + delay_secs,
        max_segment_duration_secs: original_max_segment_secs.max(4.0),
    }
}

fn iso8601_duration(secs: f64) -> String {
    if secs <= 0.0 {
        return "PT0S".to_string();
    }
    let hours = (secs / 3600.0).floor() as u64;
    let mins = ((secs % 3600.0) / 60.0).floor() as u64;
    let rem = secs % 60.0;
    let mut s = String::from("PT");
    if hours > 0 {
        let _ = write!(s, "{hours}H");
    }
    if mins > 0 {
        let _ = write!(s, "{mins}M");
    }
    if rem > 0.0 || (hours == 0 && mins == 0) {
        let formatted = format!("{rem:.3}");
        let formatted = formatted.trim_end_matches('0').trim_end_matches('.');
        let _ = write!(s, "{formatted}S");
    }
    s
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

/// Options for one synthesized subtitle `AdaptationSet`.
pub struct SubtitleAdaptationSetOpts<'a> {
    pub dst_lang_639_2: &'a str,
    pub representation_id: &'a str,
    pub media_template: &'a str,
    pub init_template: &'a str,
    pub reference_duration_secs: f64,
}

/// Build the XML for a synthesized subtitle `AdaptationSet`:
/// `contentType="text"`, `mimeType="application/mp4"`, a single
/// `codecs="stpp"` Representation, and a `SegmentTimeline` of fixed
/// 4-second segments spanning the reference audio duration (§4.3).
pub fn build_subtitle_adaptation_set_xml(opts: &SubtitleAdaptationSetOpts) -> String {
    let mut xml = String::new();
    let _ = writeln!(
        xml,
        "    <AdaptationSet contentType=\"text\" mimeType=\"application/mp4\" lang=\"{}\">",
        xml_escape(opts.dst_lang_639_2)
    );
    let _ = writeln!(
        xml,
        "      <Representation id=\"{}\" codecs=\"stpp\" bandwidth=\"1000\">",
        xml_escape(opts.representation_id)
    );
    let _ = writeln!(
        xml,
        "        <SegmentTemplate media=\"{}\" initialization=\"{}\" timescale=\"{}\" startNumber=\"0\">",
        xml_escape(opts.media_template),
        xml_escape(opts.init_template),
        SUBTITLE_TIMESCALE
    );
    xml.push_str("          <SegmentTimeline>\n");

    let segment_duration_units = (SUBTITLE_SEGMENT_SECS * SUBTITLE_TIMESCALE as f64) as u64;
    let total_segments = (opts.reference_duration_secs / SUBTITLE_SEGMENT_SECS).ceil().max(1.0) as u64;
    if total_segments > 1 {
        let _ = writeln!(
            xml,
            "            <S t=\"0\" d=\"{}\" r=\"{}\"/>",
            segment_duration_units,
            total_segments - 1
        );
    } else {
        let _ = writeln!(xml, "            <S t=\"0\" d=\"{}\"/>", segment_duration_units);
    }

    xml.push_str("          </SegmentTimeline>\n");
    xml.push_str("        </SegmentTemplate>\n");
    xml.push_str("      </Representation>\n");
    xml.push_str("    </AdaptationSet>\n");
    xml
}

/// Rebuild the full MPD document, inserting `extra_adaptation_sets_xml`
/// verbatim at the end of the first Period and applying `live` attribute
/// overrides if present.
pub fn rebuild_mpd(original: &MpdDocument, body: &str, live: Option<&LiveAttributes>, extra_adaptation_sets_xml: &[String]) -> Result<String> {
    // We rewrite only the root attributes and append synthesized
    // AdaptationSets; everything else in `body` (Periods, existing
    // AdaptationSets/Representations) passes through untouched, mirroring
    // how the HLS engine preserves unrecognized tags rather than
    // re-deriving them from the parsed model.
    let mut out = body.to_string();

    if let Some(live) = live {
        out = rewrite_root_attr(&out, "publishTime", &live.publish_time_rfc3339);
        out = rewrite_root_attr(&out, "suggestedPresentationDelay", &iso8601_duration(live.suggested_presentation_delay_secs));
        out = rewrite_root_attr(&out, "timeShiftBufferDepth", &iso8601_duration(live.time_shift_buffer_depth_secs));
        out = rewrite_root_attr(&out, "maxSegmentDuration", &iso8601_duration(live.max_segment_duration_secs));
    }

    if !extra_adaptation_sets_xml.is_empty() && !original.periods.is_empty() {
        let insertion = extra_adaptation_sets_xml.concat();
        if let Some(pos) = out.find("</Period>") {
            out.insert_str(pos, &insertion);
        }
    }

    Ok(out)
}

fn rewrite_root_attr(xml: &str, attr: &str, value: &str) -> String {
    let needle = format!("{attr}=\"");
    if let Some(start) = xml.find(&needle) {
        let value_start = start + needle.len();
        if let Some(end_rel) = xml[value_start..].find('"') {
            let mut out = String::with_capacity(xml.len());
            out.push_str(&xml[..value_start]);
            out.push_str(&xml_escape(value));
            out.push_str(&xml[value_start + end_rel..]);
            return out;
        }
    }
    // Attribute absent: insert right after the opening `<MPD` tag.
    if let Some(tag_end) = xml.find("<MPD") {
        let insert_at = tag_end + "<MPD".len();
        let mut out = String::with_capacity(xml.len() + attr.len() + value.len() + 4);
        out.push_str(&xml[..insert_at]);
        out.push_str(&format!(" {attr}=\"{}\"", xml_escape(value)));
        out.push_str(&xml[insert_at..]);
        return out;
    }
    xml.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dash::mpd::MpdDocument;

    const MPD: &str = r#"<?xml version="1.0"?>
<MPD type="dynamic" publishTime="2020-01-01T00:00:00Z" suggestedPresentationDelay="PT10S" timeShiftBufferDepth="PT60S" maxSegmentDuration="PT2S">
  <Period>
    <AdaptationSet contentType="audio" lang="en">
      <SegmentTemplate media="a-$Time$.m4s" initialization="a-init.m4s" timescale="48000">
        <SegmentTimeline><S t="0" d="192000" r="9"/></SegmentTimeline>
      </SegmentTemplate>
      <Representation id="en-aac" bandwidth="128000" codecs="mp4a.40.2"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn materializes_fragment_list_from_timeline() {
        let mpd = MpdDocument::parse(MPD).unwrap();
        let set = &mpd.periods[0].adaptation_sets[0];
        let frags = materialize_fragments(set, "en-aac", 128_000, "https://o/manifest.mpd").unwrap();
        assert_eq!(frags.len(), 10);
        assert_eq!(frags[0].url, "https://o/a-0.m4s");
        assert!((frags[1].start_time - 4.0).abs() < 1e-9);
    }

    #[test]
    fn live_rewrite_sets_publish_time_and_widens_buffer() {
        let mpd = MpdDocument::parse(MPD).unwrap();
        let live = live_attributes("2026-01-01T00:00:05Z", 60.0, 30.0, 2.0);
        let out = rebuild_mpd(&mpd, MPD, Some(&live), &[]).unwrap();
        assert!(out.contains("publishTime=\"2026-01-01T00:00:05Z\""));
        assert!(out.contains("timeShiftBufferDepth=\"PT1M30S\"") || out.contains("timeShiftBufferDepth=\"PT90S\"") || out.contains("timeShiftBufferDepth=\"PT1M30"));
    }

    #[test]
    fn subtitle_adaptation_set_uses_fixed_4s_segments() {
        let opts = SubtitleAdaptationSetOpts {
            dst_lang_639_2: "deu",
            representation_id: "sub-deu",
            media_template: "eos_dash_fragment/de-DE/$Time$",
            init_template: "eos_dash_fragment/de-DE/Init",
            reference_duration_secs: 20.0,
        };
        let xml = build_subtitle_adaptation_set_xml(&opts);
        assert!(xml.contains("contentType=\"text\""));
        assert!(xml.contains("codecs=\"stpp\""));
        assert!(xml.contains(&format!("r=\"{}\"", 4)));
    }
}
