//! HLS manifest engine (C2, §4.2).

pub mod playlist;
pub mod rewrite;

pub use playlist::{Attr, AttrList, MediaPlaylist, MediaTag, StreamInf, VariantPlaylist};
pub use rewrite::{add_subtitle_track, build_media_playlist, clone_subtitle_manifest, make_absolute, select_reference_rendition, AddSubtitleOpts, SUBTITLES_GROUP_ID};

use crate::delay_buffer::DelayBuffer;
use crate::error::Result;
use crate::types::Fragment;

/// Re-emit a delayed media playlist: slice the buffer's view and
/// serialize it with `#EXT-X-MEDIA-SEQUENCE` set to the first returned
/// segment's sequence number (§4.4).
pub fn live_media_playlist(buffer: &DelayBuffer, target_duration: u32) -> Result<String> {
    let view = buffer.view()?;
    let mut playlist = MediaPlaylist {
        source_url: String::new(),
        target_duration,
        media_sequence: view.first_order_key.unwrap_or(0),
        version: 6,
        fragments: view.fragments,
        endlist: false,
    };
    // HLS live re-emission expands repeat runs verbatim (no `r=` style
    // collapsing, unlike DASH) — fragments already carry individual durations.
    playlist.target_duration = playlist
        .fragments
        .iter()
        .map(|f: &Fragment| f.duration_secs.ceil() as u32)
        .max()
        .unwrap_or(target_duration)
        .max(target_duration);
    Ok(build_media_playlist(&playlist))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_playlist_sets_media_sequence_from_view() {
        let buffer = DelayBuffer::new(8.0);
        for i in 0..10u64 {
            buffer
                .poll_update(
                    vec![crate::types::Fragment {
                        url: format!("seg{i}.ts"),
                        duration_secs: 4.0,
                        start_time: i as f64 * 4.0,
                        sequence: Some(i),
                        timestamp: None,
                        timescale: None,
                        sampling_rate: None,
                        first_read: false,
                        discontinuity: false,
                        encryption: None,
                    }],
                    16.0,
                )
                .unwrap();
        }
        let out = live_media_playlist(&buffer, 4).unwrap();
        assert!(out.contains("#EXT-X-MEDIA-SEQUENCE:"));
        assert!(out.contains("#EXTM3U"));
    }
}
