//! HLS playlist parsing and serialization (§4.2).
//!
//! Parses RFC 8216 variant (master) and media playlists into an ordered,
//! attribute-preserving representation, and serializes a variant
//! playlist back out in the order the spec mandates.

use std::collections::HashMap;

use crate::error::{CoreError, Result};
use crate::types::{Encryption, Fragment};

/// A single `KEY=VALUE` pair from an `#EXT-X-*` attribute list, keeping
/// track of whether the value was quoted so re-serialization is exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub key: String,
    pub value: String,
    pub quoted: bool,
}

pub type AttrList = Vec<Attr>;

pub(crate) fn attr_get<'a>(attrs: &'a AttrList, key: &str) -> Option<&'a str> {
    attrs.iter().find(|a| a.key.eq_ignore_ascii_case(key)).map(|a| a.value.as_str())
}

pub(crate) fn attr_set(attrs: &mut AttrList, key: &str, value: impl Into<String>, quoted: bool) {
    let value = value.into();
    if let Some(a) = attrs.iter_mut().find(|a| a.key.eq_ignore_ascii_case(key)) {
        a.value = value;
        a.quoted = quoted;
    } else {
        attrs.push(Attr { key: key.to_string(), value, quoted });
    }
}

fn serialize_attrs(attrs: &AttrList) -> String {
    // TYPE first, everything else preserved in insertion order.
    let mut ordered: Vec<&Attr> = Vec::with_capacity(attrs.len());
    if let Some(type_attr) = attrs.iter().find(|a| a.key.eq_ignore_ascii_case("TYPE")) {
        ordered.push(type_attr);
    }
    for a in attrs {
        if !a.key.eq_ignore_ascii_case("TYPE") {
            ordered.push(a);
        }
    }
    ordered
        .iter()
        .map(|a| {
            if a.quoted {
                format!("{}=\"{}\"", a.key, a.value)
            } else {
                format!("{}={}", a.key, a.value)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a comma-separated `KEY=VALUE,...` attribute list, respecting
/// quoted values that may themselves contain commas.
pub fn parse_attrs(s: &str) -> AttrList {
    let mut attrs = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        // skip leading comma/space
        while i < bytes.len() && (bytes[i] == b',' || bytes[i] == b' ') {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' {
            i += 1;
        }
        let key = s[key_start..i].trim().to_string();
        if i >= bytes.len() {
            break;
        }
        i += 1; // skip '='
        if i < bytes.len() && bytes[i] == b'"' {
            i += 1;
            let val_start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            let value = s[val_start..i].to_string();
            i += 1; // skip closing quote
            attrs.push(Attr { key, value, quoted: true });
        } else {
            let val_start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            let value = s[val_start..i].trim().to_string();
            attrs.push(Attr { key, value, quoted: false });
        }
    }
    attrs
}

/// An `#EXT-X-MEDIA` rendition (AUDIO/VIDEO/SUBTITLES/CLOSED-CAPTIONS).
#[derive(Debug, Clone)]
pub struct MediaTag {
    pub attrs: AttrList,
}

impl MediaTag {
    pub fn type_(&self) -> &str {
        attr_get(&self.attrs, "TYPE").unwrap_or("")
    }
    pub fn group_id(&self) -> &str {
        attr_get(&self.attrs, "GROUP-ID").unwrap_or("")
    }
    pub fn language(&self) -> Option<&str> {
        attr_get(&self.attrs, "LANGUAGE")
    }
    pub fn uri(&self) -> Option<&str> {
        attr_get(&self.attrs, "URI")
    }
}

/// An `#EXT-X-STREAM-INF` entry and its URI line.
#[derive(Debug, Clone)]
pub struct StreamInf {
    pub attrs: AttrList,
    pub uri: String,
}

impl StreamInf {
    pub fn bandwidth(&self) -> u64 {
        attr_get(&self.attrs, "BANDWIDTH")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
    pub fn codecs(&self) -> Option<&str> {
        attr_get(&self.attrs, "CODECS")
    }
}

/// A parsed variant (master) playlist.
#[derive(Debug, Clone, Default)]
pub struct VariantPlaylist {
    pub source_url: String,
    /// Raw preserved tag lines (`#EXT-X-START:...`, `#EXT-X-INDEPENDENT-SEGMENTS`).
    pub preserved_tags: Vec<String>,
    pub media: Vec<MediaTag>,
    pub stream_infs: Vec<StreamInf>,
}

impl VariantPlaylist {
    pub fn parse(body: &str, source_url: &str) -> Result<Self> {
        let mut playlist = VariantPlaylist {
            source_url: source_url.to_string(),
            ..Default::default()
        };
        let lines: Vec<&str> = body.lines().collect();
        let mut i = 0;
        let mut saw_extm3u = false;
        while i < lines.len() {
            let line = lines[i].trim();
            if line.is_empty() {
                i += 1;
                continue;
            }
            if line == "#EXTM3U" {
                saw_extm3u = true;
                i += 1;
            } else if line.starts_with("#EXT-X-VERSION") {
                i += 1;
            } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA:") {
                playlist.media.push(MediaTag { attrs: parse_attrs(rest) });
                i += 1;
            } else if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
                let attrs = parse_attrs(rest);
                i += 1;
                // advance to the next non-comment, non-blank line: the URI.
                while i < lines.len() && (lines[i].trim().is_empty() || lines[i].trim().starts_with('#')) {
                    i += 1;
                }
                let uri = lines.get(i).map(|s| s.trim().to_string()).ok_or_else(|| {
                    CoreError::MalformedManifest("STREAM-INF without following URI".into())
                })?;
                playlist.stream_infs.push(StreamInf { attrs, uri });
                i += 1;
            } else if line.starts_with("#EXT-X-START") || line.starts_with("#EXT-X-INDEPENDENT-SEGMENTS") {
                playlist.preserved_tags.push(line.to_string());
                i += 1;
            } else {
                // Unrecognized tag/comment: ignored (not round-tripped).
                i += 1;
            }
        }
        if !saw_extm3u {
            return Err(CoreError::MalformedManifest("missing #EXTM3U".into()));
        }
        Ok(playlist)
    }

    /// Serialize per the order mandated by §4.2: `#EXTM3U`, version,
    /// preserved tags, MEDIA lines (subtitles before audio), then each
    /// STREAM-INF followed by its URI.
    pub fn build(&self) -> String {
        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:5\n");
        for tag in &self.preserved_tags {
            out.push_str(tag);
            out.push('\n');
        }
        // Pass-through MEDIA entries that aren't audio/subtitles keep
        // their relative order but come after the START/INDEPENDENT tags.
        let subtitles = self.media.iter().filter(|m| m.type_().eq_ignore_ascii_case("SUBTITLES"));
        let audio = self.media.iter().filter(|m| m.type_().eq_ignore_ascii_case("AUDIO"));
        let other = self
            .media
            .iter()
            .filter(|m| !m.type_().eq_ignore_ascii_case("SUBTITLES") && !m.type_().eq_ignore_ascii_case("AUDIO"));
        for m in other {
            out.push_str("#EXT-X-MEDIA:");
            out.push_str(&serialize_attrs(&m.attrs));
            out.push('\n');
        }
        for m in subtitles {
            out.push_str("#EXT-X-MEDIA:");
            out.push_str(&serialize_attrs(&m.attrs));
            out.push('\n');
        }
        for m in audio {
            out.push_str("#EXT-X-MEDIA:");
            out.push_str(&serialize_attrs(&m.attrs));
            out.push('\n');
        }
        for si in &self.stream_infs {
            out.push_str("#EXT-X-STREAM-INF:");
            out.push_str(&serialize_attrs(&si.attrs));
            out.push('\n');
            out.push_str(&si.uri);
            out.push('\n');
        }
        out
    }
}

/// A parsed media (rendition) playlist: the per-variant list of
/// segments plus the tags a clone operation needs to preserve.
#[derive(Debug, Clone, Default)]
pub struct MediaPlaylist {
    pub source_url: String,
    pub target_duration: u32,
    pub media_sequence: u64,
    pub version: u32,
    pub fragments: Vec<Fragment>,
    pub endlist: bool,
}

impl MediaPlaylist {
    pub fn parse(body: &str, source_url: &str) -> Result<Self> {
        let mut pl = MediaPlaylist {
            source_url: source_url.to_string(),
            target_duration: 6,
            version: 3,
            ..Default::default()
        };
        let mut pending_duration: Option<f64> = None;
        let mut pending_discontinuity = false;
        let mut pending_key: Option<Encryption> = None;
        let mut seq = 0u64;
        let mut cumulative_start = 0.0;

        for raw in body.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(v) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                pl.target_duration = v.parse().unwrap_or(6);
            } else if let Some(v) = line.strip_prefix("#EXT-X-VERSION:") {
                pl.version = v.parse().unwrap_or(3);
            } else if let Some(v) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
                pl.media_sequence = v.parse().unwrap_or(0);
                seq = pl.media_sequence;
            } else if let Some(v) = line.strip_prefix("#EXTINF:") {
                let dur_str = v.split(',').next().unwrap_or("0");
                pending_duration = Some(dur_str.trim().parse().unwrap_or(0.0));
            } else if line == "#EXT-X-DISCONTINUITY" {
                pending_discontinuity = true;
            } else if let Some(v) = line.strip_prefix("#EXT-X-KEY:") {
                let attrs = parse_attrs(v);
                let method = attr_get(&attrs, "METHOD").unwrap_or("NONE").to_string();
                if method != "NONE" {
                    pending_key = Some(Encryption {
                        method,
                        key_uri: attr_get(&attrs, "URI").unwrap_or("").to_string(),
                        iv: attr_get(&attrs, "IV").map(|s| s.to_string()),
                    });
                } else {
                    pending_key = None;
                }
            } else if line == "#EXT-X-ENDLIST" {
                pl.endlist = true;
            } else if line.starts_with('#') {
                // ignore other tags (BYTERANGE, PROGRAM-DATE-TIME, etc. not modeled)
            } else {
                // segment URI
                let duration = pending_duration.take().unwrap_or(0.0);
                pl.fragments.push(Fragment {
                    url: line.to_string(),
                    duration_secs: duration,
                    start_time: cumulative_start,
                    sequence: Some(seq),
                    timestamp: None,
                    timescale: None,
                    sampling_rate: None,
                    first_read: false,
                    discontinuity: pending_discontinuity,
                    encryption: pending_key.clone(),
                });
                cumulative_start += duration;
                seq += 1;
                pending_discontinuity = false;
            }
        }
        Ok(pl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n#EXT-X-VERSION:4\n#EXT-X-INDEPENDENT-SEGMENTS\n#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",LANGUAGE=\"en\",NAME=\"English\",AUTOSELECT=YES,DEFAULT=YES,URI=\"audio/en/index.m3u8\"\n#EXT-X-STREAM-INF:BANDWIDTH=1200000,CODECS=\"avc1.4d401f,mp4a.40.2\",AUDIO=\"aud\"\nvideo/low/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=3000000,CODECS=\"avc1.640028,mp4a.40.2\",AUDIO=\"aud\"\nvideo/high/index.m3u8\n";

    #[test]
    fn parses_media_and_stream_inf() {
        let pl = VariantPlaylist::parse(MASTER, "https://o/master.m3u8").unwrap();
        assert_eq!(pl.media.len(), 1);
        assert_eq!(pl.stream_infs.len(), 2);
        assert_eq!(pl.media[0].group_id(), "aud");
        assert_eq!(pl.stream_infs[1].bandwidth(), 3_000_000);
    }

    #[test]
    fn serialization_order_is_subtitles_then_audio_then_stream_inf() {
        let mut pl = VariantPlaylist::parse(MASTER, "https://o/master.m3u8").unwrap();
        pl.media.insert(
            0,
            MediaTag {
                attrs: parse_attrs(
                    "TYPE=SUBTITLES,GROUP-ID=\"subs\",LANGUAGE=\"de-DE\",NAME=\"German\",URI=\"subs/de/index.m3u8\"",
                ),
            },
        );
        let out = pl.build();
        let subs_pos = out.find("TYPE=SUBTITLES").unwrap();
        let audio_pos = out.find("TYPE=AUDIO").unwrap();
        let stream_inf_pos = out.find("#EXT-X-STREAM-INF").unwrap();
        assert!(subs_pos < audio_pos);
        assert!(audio_pos < stream_inf_pos);
        assert!(out.starts_with("#EXTM3U\n#EXT-X-VERSION:5\n"));
    }

    #[test]
    fn quoted_values_preserved_verbatim() {
        let pl = VariantPlaylist::parse(MASTER, "https://o/master.m3u8").unwrap();
        let out = pl.build();
        assert!(out.contains("CODECS=\"avc1.4d401f,mp4a.40.2\""));
    }

    const MEDIA: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:10\n#EXTINF:4.0,\nseg10.ts\n#EXT-X-DISCONTINUITY\n#EXTINF:4.0,\nseg11.ts\n#EXT-X-ENDLIST\n";

    #[test]
    fn media_playlist_tracks_sequence_and_discontinuity() {
        let pl = MediaPlaylist::parse(MEDIA, "https://o/video/index.m3u8").unwrap();
        assert_eq!(pl.fragments.len(), 2);
        assert_eq!(pl.fragments[0].sequence, Some(10));
        assert_eq!(pl.fragments[1].sequence, Some(11));
        assert!(pl.fragments[1].discontinuity);
        assert!(pl.endlist);
        assert_eq!(pl.fragments[1].start_time, 4.0);
    }
}
