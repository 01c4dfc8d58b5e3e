//! HLS rewrite operations (§4.2): reference rendition selection, adding
//! synthesized subtitle renditions to a variant playlist, and cloning a
//! reference media playlist into a rewritten subtitle playlist.

use crate::error::{CoreError, Result};
use crate::hls::playlist::{attr_get, attr_set, Attr, MediaPlaylist, MediaTag, VariantPlaylist};
use crate::types::Fragment;
use crate::url;

/// GROUP-ID every synthesized subtitle rendition and every rewritten
/// `STREAM-INF` is anchored to (invariant 3 of spec §8).
pub const SUBTITLES_GROUP_ID: &str = "WebVTT";

/// Options for adding one destination-language subtitle rendition.
pub struct AddSubtitleOpts<'a> {
    pub dst_lang: &'a str,
    pub name: &'a str,
    pub is_default: bool,
    pub manifest_prefix: &'a str,
    pub reference_fingerprint: &'a str,
}

/// Select the reference rendition to align subtitle timing against:
/// prefer an audio rendition whose LANGUAGE matches `src_lang`; else the
/// lowest-bandwidth video rendition advertising an AAC codec; else the
/// lowest-bandwidth video rendition overall.
///
/// Returns the fingerprint-able absolute URI of the chosen rendition.
pub fn select_reference_rendition<'a>(playlist: &'a VariantPlaylist, src_lang: &str) -> Result<&'a str> {
    if let Some(audio) = playlist.media.iter().find(|m| {
        m.type_().eq_ignore_ascii_case("AUDIO") && m.language().map(|l| l.eq_ignore_ascii_case(src_lang)).unwrap_or(false)
    }) {
        return audio.uri().ok_or_else(|| CoreError::RenditionNotFound("audio rendition missing URI".into()));
    }

    let mut videos: Vec<&crate::hls::playlist::StreamInf> = playlist.stream_infs.iter().collect();
    if videos.is_empty() {
        return Err(CoreError::RenditionNotFound("no video renditions to align against".into()));
    }
    videos.sort_by_key(|si| si.bandwidth());

    if let Some(aac) = videos.iter().find(|si| si.codecs().map(|c| c.contains("mp4a")).unwrap_or(false)) {
        return Ok(&aac.uri);
    }
    Ok(&videos[0].uri)
}

/// Add (or extend) the synthesized `SUBTITLES` group and point every
/// video rendition at it, per §4.2.
pub fn add_subtitle_track(playlist: &mut VariantPlaylist, opts: &AddSubtitleOpts) -> Result<()> {
    let uri = format!(
        "{}/{}/{}/index.m3u8",
        opts.manifest_prefix.trim_end_matches('/'),
        opts.dst_lang,
        opts.reference_fingerprint
    );

    let attrs = vec![
        Attr { key: "TYPE".into(), value: "SUBTITLES".into(), quoted: false },
        Attr { key: "GROUP-ID".into(), value: SUBTITLES_GROUP_ID.into(), quoted: true },
        Attr { key: "LANGUAGE".into(), value: opts.dst_lang.into(), quoted: true },
        Attr { key: "NAME".into(), value: opts.name.into(), quoted: true },
        Attr { key: "AUTOSELECT".into(), value: if opts.is_default { "YES" } else { "NO" }.into(), quoted: false },
        Attr { key: "FORCED".into(), value: "NO".into(), quoted: false },
        Attr { key: "DEFAULT".into(), value: if opts.is_default { "YES" } else { "NO" }.into(), quoted: false },
        Attr { key: "URI".into(), value: uri, quoted: true },
    ];
    playlist.media.push(MediaTag { attrs });

    for si in playlist.stream_infs.iter_mut() {
        attr_set(&mut si.attrs, "SUBTITLES", SUBTITLES_GROUP_ID, true);
    }

    Ok(())
}

/// Resolve every rendition URI (MEDIA and STREAM-INF) to an absolute
/// form against `base_url`, and — for live sessions — rewrite them to a
/// service-owned path that proxies through the live delay buffer.
pub fn make_absolute(playlist: &mut VariantPlaylist, base_url: &str, live_prefix: Option<&str>) -> Result<()> {
    for m in playlist.media.iter_mut() {
        if let Some(uri) = m.uri().map(|s| s.to_string()) {
            let abs = url::resolve(&uri, base_url)?;
            let rewritten = match live_prefix {
                Some(prefix) => format!("{}/{}/index.m3u8", prefix.trim_end_matches('/'), url::fingerprint(&abs)),
                None => abs,
            };
            attr_set(&mut m.attrs, "URI", rewritten, true);
        }
    }
    for si in playlist.stream_infs.iter_mut() {
        let abs = url::resolve(&si.uri, base_url)?;
        si.uri = match live_prefix {
            Some(prefix) => format!("{}/{}/index.m3u8", prefix.trim_end_matches('/'), url::fingerprint(&abs)),
            None => abs,
        };
    }
    Ok(())
}

/// Clone a reference media playlist into a rewritten subtitle media
/// playlist: preserve all tags, but rewrite each segment URI to the
/// service's own fragment path and record a parallel `Fragment` list so
/// the session layer can map a requested subtitle fragment back onto a
/// time window.
pub fn clone_subtitle_manifest(reference: &MediaPlaylist, fragment_prefix: &str) -> (MediaPlaylist, Vec<Fragment>) {
    let mut cloned = reference.clone();
    let mut fingerprints = Vec::with_capacity(reference.fragments.len());

    for frag in cloned.fragments.iter_mut() {
        let fp = url::fingerprint(&frag.url);
        fingerprints.push(fp.clone());
        frag.url = format!("{}/{}", fragment_prefix.trim_end_matches('/'), fp);
    }

    (cloned, reference.fragments.clone())
}

/// Serialize a cloned subtitle media playlist back to M3U8 text.
pub fn build_media_playlist(playlist: &MediaPlaylist) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str(&format!("#EXT-X-VERSION:{}\n", playlist.version.max(3)));
    out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", playlist.target_duration));
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", playlist.media_sequence));
    let mut last_key: Option<&crate::types::Encryption> = None;
    for frag in &playlist.fragments {
        if frag.discontinuity {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        if frag.encryption.as_ref() != last_key {
            if let Some(enc) = &frag.encryption {
                out.push_str(&format!(
                    "#EXT-X-KEY:METHOD={},URI=\"{}\"",
                    enc.method, enc.key_uri
                ));
                if let Some(iv) = &enc.iv {
                    out.push_str(&format!(",IV={}", iv));
                }
                out.push('\n');
            } else {
                out.push_str("#EXT-X-KEY:METHOD=NONE\n");
            }
            last_key = frag.encryption.as_ref();
        }
        out.push_str(&format!("#EXTINF:{:.3},\n", frag.duration_secs));
        out.push_str(&frag.url);
        out.push('\n');
    }
    if playlist.endlist {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::playlist::VariantPlaylist;

    const MASTER: &str = "#EXTM3U\n#EXT-X-VERSION:4\n#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",LANGUAGE=\"en\",NAME=\"English\",AUTOSELECT=YES,DEFAULT=YES,URI=\"audio/en/index.m3u8\"\n#EXT-X-STREAM-INF:BANDWIDTH=1200000,CODECS=\"avc1.4d401f,mp4a.40.2\",AUDIO=\"aud\"\nvideo/low/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=3000000,CODECS=\"avc1.640028,mp4a.40.2\",AUDIO=\"aud\"\nvideo/high/index.m3u8\n";

    #[test]
    fn scenario_1_hls_variant_rewrite() {
        let mut pl = VariantPlaylist::parse(MASTER, "https://o/master.m3u8").unwrap();
        let reference = select_reference_rendition(&pl, "en").unwrap().to_string();
        let fp = url::fingerprint(&url::resolve(&reference, "https://o/master.m3u8").unwrap());

        add_subtitle_track(&mut pl, &AddSubtitleOpts {
            dst_lang: "de-DE",
            name: "German",
            is_default: true,
            manifest_prefix: "eos_manifest",
            reference_fingerprint: &fp,
        }).unwrap();
        add_subtitle_track(&mut pl, &AddSubtitleOpts {
            dst_lang: "es-ES",
            name: "Spanish",
            is_default: false,
            manifest_prefix: "eos_manifest",
            reference_fingerprint: &fp,
        }).unwrap();

        let out = pl.build();
        assert_eq!(out.matches("#EXT-X-MEDIA").count(), 3);
        assert!(out.contains("LANGUAGE=\"de-DE\""));
        assert!(out.contains("DEFAULT=YES,AUTOSELECT=YES") || out.contains("AUTOSELECT=YES,FORCED=NO,DEFAULT=YES"));
        assert!(out.contains("LANGUAGE=\"es-ES\""));
        assert_eq!(out.matches("SUBTITLES=\"WebVTT\"").count(), 2);
    }

    #[test]
    fn reference_prefers_matching_audio_language() {
        let pl = VariantPlaylist::parse(MASTER, "https://o/master.m3u8").unwrap();
        let reference = select_reference_rendition(&pl, "en").unwrap();
        assert_eq!(reference, "audio/en/index.m3u8");
    }

    #[test]
    fn reference_falls_back_to_lowest_bandwidth_video() {
        let pl = VariantPlaylist::parse(MASTER, "https://o/master.m3u8").unwrap();
        let reference = select_reference_rendition(&pl, "fr").unwrap();
        assert_eq!(reference, "video/low/index.m3u8");
    }

    #[test]
    fn invariant_3_group_id_matches_across_all_video_renditions() {
        let mut pl = VariantPlaylist::parse(MASTER, "https://o/master.m3u8").unwrap();
        add_subtitle_track(&mut pl, &AddSubtitleOpts {
            dst_lang: "de-DE",
            name: "German",
            is_default: true,
            manifest_prefix: "eos_manifest",
            reference_fingerprint: "abc",
        }).unwrap();

        let sub_group = pl.media.iter().find(|m| m.type_() == "SUBTITLES").unwrap().group_id().to_string();
        for si in &pl.stream_infs {
            assert_eq!(attr_get(&si.attrs, "SUBTITLES"), Some(sub_group.as_str()));
        }
    }
}
