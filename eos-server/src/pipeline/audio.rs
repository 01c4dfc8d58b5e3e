//! Audio extraction and pacing (§4.8 steps 4–6).
//!
//! ADTS header synthesis wraps raw AAC samples extracted from a DASH
//! `mdat` (the HLS path shells out to an external audio extractor
//! instead — no header synthesis needed there). Pacing paces PCM chunk
//! delivery to the recognizer: 0.6x real-time for VOD, real-time
//! (target-time accumulator against wall clock since pipeline start)
//! for live.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::ServerError;

const PCM_CHUNK_SECS: f64 = 0.5;
const VOD_PACE_FACTOR: f64 = 0.6;

/// AAC-LC, 2-channel, no CRC.
const ADTS_PROFILE_AAC_LC: u8 = 1;

pub fn sampling_frequency_index(rate_hz: u32) -> u8 {
    match rate_hz {
        96000 => 0,
        88200 => 1,
        64000 => 2,
        48000 => 3,
        44100 => 4,
        32000 => 5,
        24000 => 6,
        22050 => 7,
        16000 => 8,
        12000 => 9,
        11025 => 10,
        8000 => 11,
        7350 => 12,
        _ => 4, // 44100 Hz fallback: ADTS has no "unknown" slot.
    }
}

/// Build a 7-byte ADTS header (no CRC) for one AAC-LC raw frame of
/// `aac_frame_len` bytes.
pub fn build_adts_header(aac_frame_len: usize, sampling_frequency_index: u8, channel_config: u8) -> [u8; 7] {
    let frame_length = (aac_frame_len + 7) as u16;
    let mut header = [0u8; 7];
    header[0] = 0xFF;
    header[1] = 0xF1; // syncword tail, MPEG-4, layer 0, protection_absent=1
    header[2] = (ADTS_PROFILE_AAC_LC << 6) | ((sampling_frequency_index & 0x0F) << 2) | ((channel_config >> 2) & 0x01);
    header[3] = ((channel_config & 0x03) << 6) | ((frame_length >> 11) as u8 & 0x03);
    header[4] = ((frame_length >> 3) & 0xFF) as u8;
    header[5] = (((frame_length & 0x07) as u8) << 5) | 0x1F;
    header[6] = 0xFC;
    header
}

/// Prepend an ADTS header to each raw AAC sample extracted from `mdat`,
/// in sample order (§4.8 step 4, DASH path).
pub fn wrap_samples_with_adts(samples: &[Vec<u8>], sample_rate_hz: u32, channel_config: u8) -> Bytes {
    let sfi = sampling_frequency_index(sample_rate_hz);
    let mut out = Vec::new();
    for sample in samples {
        out.extend_from_slice(&build_adts_header(sample.len(), sfi, channel_config));
        out.extend_from_slice(sample);
    }
    Bytes::from(out)
}

/// Cut signed 16-bit little-endian mono PCM into ~500ms chunks (§4.8 step 6).
pub fn chunk_pcm(pcm: &[u8], sample_rate_hz: u32) -> Vec<Bytes> {
    let bytes_per_sample = 2usize;
    let chunk_bytes = ((sample_rate_hz as f64 * PCM_CHUNK_SECS) as usize * bytes_per_sample).max(bytes_per_sample);
    pcm.chunks(chunk_bytes).map(Bytes::copy_from_slice).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceMode {
    Vod,
    Live,
}

/// Paces PCM chunk delivery against a target-time accumulator: VOD
/// targets 0.6x real-time, live targets real-time since the pipeline's
/// first fed chunk (§4.8 step 6).
pub struct Pacer {
    bytes_per_sec: f64,
    mode: PaceMode,
    started_at: Instant,
    fed_secs: f64,
}

impl Pacer {
    pub fn new(sample_rate_hz: u32, mode: PaceMode) -> Self {
        Self { bytes_per_sec: sample_rate_hz as f64 * 2.0, mode, started_at: Instant::now(), fed_secs: 0.0 }
    }

    /// Account for one chunk and sleep until wall-clock catches up with
    /// the pacing target, if it hasn't already.
    pub async fn pace(&mut self, chunk_len_bytes: usize) {
        self.fed_secs += chunk_len_bytes as f64 / self.bytes_per_sec;
        let target_wall_secs = match self.mode {
            PaceMode::Vod => self.fed_secs / VOD_PACE_FACTOR,
            PaceMode::Live => self.fed_secs,
        };
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if target_wall_secs > elapsed {
            tokio::time::sleep(Duration::from_secs_f64(target_wall_secs - elapsed)).await;
        }
    }
}

struct Mp4Box<'a> {
    fourcc: [u8; 4],
    body: &'a [u8],
}

fn parse_boxes(mut data: &[u8]) -> Vec<Mp4Box<'_>> {
    let mut out = Vec::new();
    while data.len() >= 8 {
        let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if size < 8 || size > data.len() {
            break;
        }
        let fourcc = [data[4], data[5], data[6], data[7]];
        out.push(Mp4Box { fourcc, body: &data[8..size] });
        data = &data[size..];
    }
    out
}

fn find_box<'a, 'b>(boxes: &'b [Mp4Box<'a>], fourcc: &[u8; 4]) -> Option<&'a [u8]> {
    boxes.iter().find(|b| &b.fourcc == fourcc).map(|b| b.body)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

/// Extract raw AAC sample payloads, in order, from one fragmented-MP4
/// media segment: read `tfhd`'s default sample size and `trun`'s
/// per-sample sizes (when present) to slice `mdat` (§4.8 step 4, DASH
/// path).
pub fn extract_aac_samples_from_fmp4(data: &[u8]) -> Result<Vec<Vec<u8>>, ServerError> {
    let top = parse_boxes(data);
    let moof = find_box(&top, b"moof").ok_or_else(|| ServerError::Internal("fmp4 audio: missing moof".into()))?;
    let mdat = find_box(&top, b"mdat").ok_or_else(|| ServerError::Internal("fmp4 audio: missing mdat".into()))?;

    let moof_children = parse_boxes(moof);
    let traf = find_box(&moof_children, b"traf").ok_or_else(|| ServerError::Internal("fmp4 audio: missing traf".into()))?;
    let traf_children = parse_boxes(traf);
    let tfhd = find_box(&traf_children, b"tfhd").ok_or_else(|| ServerError::Internal("fmp4 audio: missing tfhd".into()))?;
    let trun = find_box(&traf_children, b"trun").ok_or_else(|| ServerError::Internal("fmp4 audio: missing trun".into()))?;

    let default_sample_size = parse_tfhd_default_sample_size(tfhd);
    let (sample_count, sizes) = parse_trun_sample_sizes(trun, default_sample_size)?;

    let mut samples = Vec::with_capacity(sample_count);
    let mut cursor = 0usize;
    for size in sizes {
        let size = size as usize;
        if cursor + size > mdat.len() {
            return Err(ServerError::Internal("fmp4 audio: trun sizes overrun mdat".into()));
        }
        samples.push(mdat[cursor..cursor + size].to_vec());
        cursor += size;
    }
    Ok(samples)
}

fn parse_tfhd_default_sample_size(tfhd: &[u8]) -> Option<u32> {
    if tfhd.len() < 8 {
        return None;
    }
    let flags = u32::from_be_bytes([0, tfhd[1], tfhd[2], tfhd[3]]);
    let mut offset = 8usize; // version+flags(4) + track_id(4)
    if flags & 0x000001 != 0 {
        offset += 8; // base_data_offset
    }
    if flags & 0x000002 != 0 {
        offset += 4; // sample_description_index
    }
    if flags & 0x000008 != 0 {
        offset += 4; // default_sample_duration
    }
    if flags & 0x000010 != 0 {
        if offset + 4 > tfhd.len() {
            return None;
        }
        return Some(read_u32(tfhd, offset));
    }
    None
}

fn parse_trun_sample_sizes(trun: &[u8], default_sample_size: Option<u32>) -> Result<(usize, Vec<u32>), ServerError> {
    if trun.len() < 8 {
        return Err(ServerError::Internal("fmp4 audio: truncated trun".into()));
    }
    let flags = u32::from_be_bytes([0, trun[1], trun[2], trun[3]]);
    let sample_count = read_u32(trun, 4) as usize;
    let mut offset = 8usize;
    if flags & 0x000001 != 0 {
        offset += 4; // data_offset
    }
    if flags & 0x000004 != 0 {
        offset += 4; // first_sample_flags
    }

    let size_present = flags & 0x000200 != 0;
    if !size_present {
        let size = default_sample_size.ok_or_else(|| ServerError::Internal("fmp4 audio: no sample size source".into()))?;
        return Ok((sample_count, vec![size; sample_count]));
    }

    let per_sample_fields = [flags & 0x100 != 0, true, flags & 0x400 != 0, flags & 0x800 != 0];
    let mut sizes = Vec::with_capacity(sample_count);
    for _ in 0..sample_count {
        for (field_idx, present) in per_sample_fields.iter().enumerate() {
            if !present {
                continue;
            }
            if offset + 4 > trun.len() {
                return Err(ServerError::Internal("fmp4 audio: truncated trun sample entry".into()));
            }
            if field_idx == 1 {
                sizes.push(read_u32(trun, offset));
            }
            offset += 4;
        }
    }
    Ok((sample_count, sizes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adts_header_encodes_frame_length_across_three_bytes() {
        let header = build_adts_header(100, sampling_frequency_index(44100), 2);
        let frame_length = (((header[3] & 0x03) as u16) << 11) | ((header[4] as u16) << 3) | ((header[5] >> 5) as u16);
        assert_eq!(frame_length as usize, 100 + 7);
        assert_eq!(header[0], 0xFF);
    }

    #[test]
    fn sampling_frequency_index_matches_known_table() {
        assert_eq!(sampling_frequency_index(48000), 3);
        assert_eq!(sampling_frequency_index(16000), 8);
    }

    #[test]
    fn chunk_pcm_splits_into_half_second_chunks() {
        let pcm = vec![0u8; 16000 * 2]; // 1s of 16kHz mono 16-bit PCM
        let chunks = chunk_pcm(&pcm, 16000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 16000);
    }

    #[tokio::test]
    async fn vod_pacer_targets_slower_than_real_time() {
        let mut pacer = Pacer::new(16000, PaceMode::Vod);
        // One 10ms chunk shouldn't need any sleep under either mode.
        pacer.pace(320).await;
        assert!(pacer.fed_secs > 0.0);
    }
}
