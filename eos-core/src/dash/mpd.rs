//! DASH MPD parsing (§4.3).
//!
//! Structured `serde` + `quick-xml` deserialization of the subset of
//! MPEG-DASH used by this system: `SegmentTemplate` + `SegmentTimeline`
//! addressing with `$Bandwidth$`/`$Time$`/`$RepresentationID$`
//! substitution, optional `BaseURL`.

use serde::Deserialize;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "MPD")]
pub struct MpdDocument {
    #[serde(rename = "@type", default)]
    pub r#type: String,
    #[serde(rename = "@publishTime", default)]
    pub publish_time: Option<String>,
    #[serde(rename = "@availabilityStartTime", default)]
    pub availability_start_time: Option<String>,
    #[serde(rename = "@suggestedPresentationDelay", default)]
    pub suggested_presentation_delay: Option<String>,
    #[serde(rename = "@timeShiftBufferDepth", default)]
    pub time_shift_buffer_depth: Option<String>,
    #[serde(rename = "@maxSegmentDuration", default)]
    pub max_segment_duration: Option<String>,
    #[serde(rename = "@mediaPresentationDuration", default)]
    pub media_presentation_duration: Option<String>,
    #[serde(rename = "@minBufferTime", default)]
    pub min_buffer_time: Option<String>,
    #[serde(rename = "BaseURL", default)]
    pub base_url: Option<String>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Period {
    #[serde(rename = "@id", default)]
    pub id: Option<String>,
    #[serde(rename = "@start", default)]
    pub start: Option<String>,
    #[serde(rename = "AdaptationSet", default)]
    pub adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdaptationSet {
    #[serde(rename = "@id", default)]
    pub id: Option<String>,
    #[serde(rename = "@contentType", default)]
    pub content_type: Option<String>,
    #[serde(rename = "@mimeType", default)]
    pub mime_type: Option<String>,
    #[serde(rename = "@lang", default)]
    pub lang: Option<String>,
    #[serde(rename = "ContentComponent", default)]
    pub content_component: Vec<ContentComponent>,
    #[serde(rename = "SegmentTemplate", default)]
    pub segment_template: Option<SegmentTemplate>,
    #[serde(rename = "Representation", default)]
    pub representations: Vec<Representation>,
}

impl AdaptationSet {
    /// Resolve content type, falling back to `ContentComponent` when the
    /// `contentType` attribute itself is absent (§4.3).
    pub fn resolved_content_type(&self) -> Option<String> {
        self.content_type.clone().or_else(|| {
            self.content_component
                .first()
                .and_then(|c| c.content_type.clone())
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ContentComponent {
    #[serde(rename = "@contentType", default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Representation {
    #[serde(rename = "@id", default)]
    pub id: Option<String>,
    #[serde(rename = "@codecs", default)]
    pub codecs: Option<String>,
    #[serde(rename = "@bandwidth", default)]
    pub bandwidth: Option<u64>,
    #[serde(rename = "SegmentTemplate", default)]
    pub segment_template: Option<SegmentTemplate>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SegmentTemplate {
    #[serde(rename = "@media", default)]
    pub media: Option<String>,
    #[serde(rename = "@initialization", default)]
    pub initialization: Option<String>,
    #[serde(rename = "@timescale", default)]
    pub timescale: Option<u32>,
    #[serde(rename = "@startNumber", default)]
    pub start_number: Option<u64>,
    #[serde(rename = "SegmentTimeline", default)]
    pub timeline: Option<SegmentTimeline>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub entries: Vec<TimelineEntry>,
}

/// One `<S t="" d="" r="">` entry. `t` is absent on all but the first
/// entry in well-formed MPDs where timestamps are implicit; we always
/// resolve explicit timestamps on parse (see [`SegmentTimeline::resolve`]).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TimelineEntry {
    #[serde(rename = "@t", default)]
    pub t: Option<u64>,
    #[serde(rename = "@d", default)]
    pub d: u64,
    #[serde(rename = "@r", default)]
    pub r: Option<i64>,
}

impl SegmentTimeline {
    /// Expand `r` (repeat count) runs into individual `(timestamp,
    /// duration)` pairs, resolving any implicit `t` by accumulation.
    pub fn resolve(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut cursor = 0u64;
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(t) = entry.t {
                cursor = t;
            } else if i == 0 {
                cursor = 0;
            }
            let repeats = entry.r.unwrap_or(0).max(0) as u64;
            for _ in 0..=repeats {
                out.push((cursor, entry.d));
                cursor += entry.d;
            }
        }
        out
    }

    /// Sum of all segment durations in timescale units.
    pub fn total_duration(&self) -> u64 {
        self.resolve().iter().map(|(_, d)| *d).sum()
    }
}

impl MpdDocument {
    pub fn parse(body: &str) -> Result<Self> {
        quick_xml::de::from_str(body).map_err(|e| CoreError::MalformedManifest(format!("MPD: {e}")))
    }
}

/// Parse an ISO 8601 duration (`PT1H2M3.5S`) into seconds. Only the
/// hour/minute/second fields are meaningful for the media durations this
/// system deals with; a missing or malformed value yields `None`.
pub fn parse_iso8601_duration(s: &str) -> Option<f64> {
    let rest = s.strip_prefix("PT")?;
    let mut seconds = 0.0;
    let mut number = String::new();
    for c in rest.chars() {
        match c {
            '0'..='9' | '.' => number.push(c),
            'H' => {
                seconds += number.parse::<f64>().ok()? * 3600.0;
                number.clear();
            }
            'M' => {
                seconds += number.parse::<f64>().ok()? * 60.0;
                number.clear();
            }
            'S' => {
                seconds += number.parse::<f64>().ok()?;
                number.clear();
            }
            _ => return None,
        }
    }
    Some(seconds)
}

/// Substitute `$Bandwidth$`, `$Time$`, `$RepresentationID$` tokens in a
/// `SegmentTemplate`'s `media`/`initialization` pattern.
pub fn substitute_template(template: &str, representation_id: &str, bandwidth: u64, time: Option<u64>) -> String {
    let mut out = template
        .replace("$RepresentationID$", representation_id)
        .replace("$Bandwidth$", &bandwidth.to_string());
    if let Some(t) = time {
        out = out.replace("$Time$", &t.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPD: &str = r#"<?xml version="1.0"?>
<MPD type="dynamic" publishTime="2026-01-01T00:00:00Z" suggestedPresentationDelay="PT30S">
  <Period>
    <AdaptationSet contentType="audio" lang="en">
      <SegmentTemplate media="audio-$RepresentationID$-$Time$.m4s" initialization="audio-$RepresentationID$-init.m4s" timescale="48000">
        <SegmentTimeline>
          <S t="0" d="192000" r="2"/>
          <S d="96000"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="en-aac" bandwidth="128000" codecs="mp4a.40.2"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn parses_segment_timeline_with_repeat() {
        let mpd = MpdDocument::parse(MPD).unwrap();
        let set = &mpd.periods[0].adaptation_sets[0];
        assert_eq!(set.resolved_content_type().as_deref(), Some("audio"));
        let timeline = set.segment_template.as_ref().unwrap().timeline.as_ref().unwrap();
        let resolved = timeline.resolve();
        assert_eq!(resolved, vec![(0, 192000), (192000, 192000), (384000, 192000), (576000, 96000)]);
    }

    #[test]
    fn substitutes_all_tokens() {
        let out = substitute_template("v/$RepresentationID$/$Bandwidth$/$Time$.m4s", "720p", 3_000_000, Some(48000));
        assert_eq!(out, "v/720p/3000000/48000.m4s");
    }

    #[test]
    fn content_type_falls_back_to_content_component() {
        let xml = r#"<AdaptationSet><ContentComponent contentType="video"/></AdaptationSet>"#;
        let set: AdaptationSet = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(set.resolved_content_type().as_deref(), Some("video"));
    }

    #[test]
    fn parses_hours_minutes_seconds() {
        assert_eq!(parse_iso8601_duration("PT1H2M3.5S"), Some(3723.5));
        assert_eq!(parse_iso8601_duration("PT30S"), Some(30.0));
        assert_eq!(parse_iso8601_duration("not-a-duration"), None);
    }
}
