//! Subtitle fMP4 codec (C5, §4.5): builds and parses the narrow box
//! tree carrying TTML subtitle payloads — not a general-purpose ISO-BMFF
//! library, just the specific init/media segment shapes this system
//! needs.
//!
//! Box layout:
//! - init: `ftyp` + `moov` (`mvhd`, one `trak` with `stpp` sample entry, `mvex`)
//! - media: `moof` (`mfhd`, one `traf` with `tfhd`/`tfdt`/`trun`) + `mdat`

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result};

pub const SUBTITLE_TIMESCALE: u32 = 10_000_000;
/// 4 seconds in [`SUBTITLE_TIMESCALE`] units (DESIGN.md open question 1:
/// media segments use the same timescale the init segment advertises,
/// not a separate 1000-unit clock).
pub const SEGMENT_DURATION_UNITS: u32 = 4 * SUBTITLE_TIMESCALE;
const LANGUAGE_LITERAL: &str = "deu";

fn write_box(buf: &mut BytesMut, fourcc: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let size_pos = buf.len();
    buf.put_u32(0); // placeholder
    buf.put_slice(fourcc);
    body(buf);
    let size = (buf.len() - size_pos) as u32;
    buf[size_pos..size_pos + 4].copy_from_slice(&size.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Pack a language code the way `mdhd` stores it: 3 chars, 5 bits each,
/// offset by 0x60, high bit zero.
fn pack_language(lang3: &str) -> u16 {
    let bytes = lang3.as_bytes();
    let mut packed: u16 = 0;
    for i in 0..3 {
        let c = if i < bytes.len() { (bytes[i] as u16).saturating_sub(0x60) & 0x1f } else { 0 };
        packed = (packed << 5) | c;
    }
    packed
}

/// Build a complete initialization segment: `ftyp` + `moov` describing
/// one subtitle track, no samples (§4.5).
pub fn build_init_segment() -> Bytes {
    let mut buf = BytesMut::new();

    write_box(&mut buf, b"ftyp", |b| {
        b.put_slice(b"iso6");
        b.put_u32(0);
        b.put_slice(b"iso6");
        b.put_slice(b"dash");
    });

    write_box(&mut buf, b"moov", |moov| {
        write_box(moov, b"mvhd", |b| {
            b.put_u8(0); // version
            b.put_slice(&[0, 0, 0]); // flags
            b.put_u32(0); // creation_time
            b.put_u32(0); // modification_time
            b.put_u32(SUBTITLE_TIMESCALE);
            b.put_u32(0); // duration
            b.put_u32(0x0001_0000); // rate 1.0
            b.put_u16(0x0100); // volume 1.0
            b.put_u16(0); // reserved
            b.put_u64(0); // reserved
            // unity matrix
            for v in [0x0001_0000i32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                b.put_i32(v);
            }
            b.put_bytes(0, 24); // pre_defined
            b.put_u32(2); // next_track_id
        });

        write_box(moov, b"trak", |trak| {
            write_box(trak, b"tkhd", |b| {
                b.put_u8(0);
                b.put_slice(&[0, 0, 7]); // enabled | in_movie | in_preview
                b.put_u32(0);
                b.put_u32(0);
                b.put_u32(1); // track_id
                b.put_u32(0); // reserved
                b.put_u32(0); // duration
                b.put_u64(0); // reserved
                b.put_u16(0); // layer
                b.put_u16(0); // alternate_group
                b.put_u16(0); // volume
                b.put_u16(0); // reserved
                for v in [0x0001_0000i32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                    b.put_i32(v);
                }
                b.put_u32(0); // width
                b.put_u32(0); // height
            });

            write_box(trak, b"mdia", |mdia| {
                write_box(mdia, b"mdhd", |b| {
                    b.put_u8(0);
                    b.put_slice(&[0, 0, 0]);
                    b.put_u32(0);
                    b.put_u32(0);
                    b.put_u32(SUBTITLE_TIMESCALE);
                    b.put_u32(0);
                    b.put_u16(pack_language(LANGUAGE_LITERAL));
                    b.put_u16(0);
                });
                write_box(mdia, b"hdlr", |b| {
                    b.put_u8(0);
                    b.put_slice(&[0, 0, 0]);
                    b.put_u32(0); // pre_defined
                    b.put_slice(b"subt");
                    b.put_bytes(0, 12); // reserved
                    put_cstr(b, "");
                });
                write_box(mdia, b"minf", |minf| {
                    write_box(minf, b"sthd", |b| {
                        b.put_u8(0);
                        b.put_slice(&[0, 0, 0]);
                    });
                    write_box(minf, b"dinf", |dinf| {
                        write_box(dinf, b"dref", |b| {
                            b.put_u8(0);
                            b.put_slice(&[0, 0, 0]);
                            b.put_u32(1);
                            write_box(b, b"url ", |u| {
                                u.put_u8(0);
                                u.put_slice(&[0, 0, 1]); // self-contained
                            });
                        });
                    });
                    write_box(minf, b"stbl", |stbl| {
                        write_box(stbl, b"stsd", |b| {
                            b.put_u8(0);
                            b.put_slice(&[0, 0, 0]);
                            b.put_u32(1); // entry_count
                            write_box(b, b"stpp", |stpp| {
                                stpp.put_bytes(0, 6); // reserved
                                stpp.put_u16(1); // data_reference_index
                                put_cstr(stpp, ""); // namespace
                                put_cstr(stpp, ""); // schema_location
                                put_cstr(stpp, ""); // auxiliary_mime_types
                            });
                        });
                        write_box(stbl, b"stts", |b| {
                            b.put_u8(0);
                            b.put_slice(&[0, 0, 0]);
                            b.put_u32(0);
                        });
                        write_box(stbl, b"stsc", |b| {
                            b.put_u8(0);
                            b.put_slice(&[0, 0, 0]);
                            b.put_u32(0);
                        });
                        write_box(stbl, b"stsz", |b| {
                            b.put_u8(0);
                            b.put_slice(&[0, 0, 0]);
                            b.put_u32(0);
                            b.put_u32(0);
                        });
                        write_box(stbl, b"stco", |b| {
                            b.put_u8(0);
                            b.put_slice(&[0, 0, 0]);
                            b.put_u32(0);
                        });
                    });
                });
            });
        });

        write_box(moov, b"mvex", |mvex| {
            write_box(mvex, b"trex", |b| {
                b.put_u8(0);
                b.put_slice(&[0, 0, 0]);
                b.put_u32(1); // track_id
                b.put_u32(1); // default_sample_description_index
                b.put_u32(0); // default_sample_duration
                b.put_u32(0); // default_sample_size
                b.put_u32(0); // default_sample_flags
            });
        });
    });

    buf.freeze()
}

/// `tfhd` flags used by media segments (§4.5): default-base-is-moof,
/// sample-description-index-present, default-sample-duration-present,
/// default-sample-size-present.
const TFHD_FLAGS: u32 = 0x02_0000 | 0x00_0002 | 0x00_0008 | 0x00_0010;
/// `trun` flags: data-offset-present, sample-size-present.
const TRUN_FLAGS: u32 = 0x00_0001 | 0x00_0200;

/// Build one media segment carrying `ttml` as its sole sample (§4.5).
/// `sequence_number` is the `mfhd` fragment counter; `base_decode_time`
/// is `tfdt`'s baseMediaDecodeTime in the init segment's timescale.
pub fn build_media_segment(sequence_number: u32, base_decode_time: u64, ttml: &str) -> Bytes {
    let ttml_bytes = ttml.as_bytes();
    let mut buf = BytesMut::new();

    let moof_start = buf.len();
    write_box(&mut buf, b"moof", |moof| {
        write_box(moof, b"mfhd", |b| {
            b.put_u8(0);
            b.put_slice(&[0, 0, 0]);
            b.put_u32(sequence_number);
        });
        write_box(moof, b"traf", |traf| {
            write_box(traf, b"tfhd", |b| {
                b.put_u8(0);
                b.put_slice(&TFHD_FLAGS.to_be_bytes()[1..]);
                b.put_u32(1); // track_id
                b.put_u32(1); // sample_description_index
                b.put_u32(SEGMENT_DURATION_UNITS); // default_sample_duration
                b.put_u32(ttml_bytes.len() as u32); // default_sample_size
            });
            write_box(traf, b"tfdt", |b| {
                b.put_u8(1); // version 1: 64-bit baseMediaDecodeTime
                b.put_slice(&[0, 0, 0]);
                b.put_u64(base_decode_time);
            });
            // data_offset is filled in below once the moof's total size is known.
            write_box(traf, b"trun", |b| {
                b.put_u8(0);
                b.put_slice(&TRUN_FLAGS.to_be_bytes()[1..]);
                b.put_u32(1); // sample_count
                b.put_i32(0); // data_offset placeholder
                b.put_u32(ttml_bytes.len() as u32); // sample_size
            });
        });
    });
    let moof_len = buf.len() - moof_start;

    // data_offset in trun is relative to the start of the moof box and
    // must point past it, to the first byte of mdat's payload.
    let data_offset = (moof_len + 8) as i32;
    let trun_data_offset_pos = find_trun_data_offset_pos(&buf[moof_start..]).expect("trun just written");
    buf[moof_start + trun_data_offset_pos..moof_start + trun_data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());

    write_box(&mut buf, b"mdat", |b| {
        b.put_slice(ttml_bytes);
    });

    buf.freeze()
}

/// Locate the byte offset (within a `moof` box) of the `trun` box's
/// `data_offset` field, by walking the fixed box layout we just wrote.
fn find_trun_data_offset_pos(moof: &[u8]) -> Option<usize> {
    let trun_pos = find_subslice(moof, b"trun")?;
    // box header(8) + version/flags(4) + sample_count(4) = 16 bytes in.
    Some(trun_pos + 4 + 4 + 4)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Result of parsing a media segment (§4.5): enough metadata to
/// reconstruct an updated segment byte-identically apart from the
/// TTML payload and its size fields.
#[derive(Debug, Clone)]
pub struct ParsedMediaSegment {
    pub sequence_number: u32,
    pub base_decode_time: u64,
    pub default_sample_size: u32,
    pub ttml: String,
}

struct BoxHeader {
    fourcc: [u8; 4],
    body: Bytes,
}

fn read_boxes(mut data: Bytes) -> Result<Vec<BoxHeader>> {
    let mut out = Vec::new();
    while data.remaining() >= 8 {
        let size = data.get_u32() as usize;
        if size < 8 || size - 4 > data.remaining() + 4 {
            return Err(CoreError::Fmp4("box size out of range".into()));
        }
        let mut fourcc = [0u8; 4];
        fourcc.copy_from_slice(&data[..4]);
        data.advance(4);
        let body_len = size - 8;
        if data.remaining() < body_len {
            return Err(CoreError::Fmp4("truncated box".into()));
        }
        let body = data.split_to(body_len);
        out.push(BoxHeader { fourcc, body });
    }
    Ok(out)
}

fn find_box<'a>(boxes: &'a [BoxHeader], fourcc: &[u8; 4]) -> Option<&'a BoxHeader> {
    boxes.iter().find(|b| &b.fourcc == fourcc)
}

/// Parse a media segment produced by [`build_media_segment`] (or a
/// byte-compatible origin segment): walk top-level boxes, then `moof`'s
/// `traf` children, and read the `mdat` payload as UTF-8 TTML (§4.5).
pub fn parse_media_segment(data: &[u8]) -> Result<ParsedMediaSegment> {
    let top = read_boxes(Bytes::copy_from_slice(data))?;
    let moof = find_box(&top, b"moof").ok_or_else(|| CoreError::Fmp4("missing moof".into()))?;
    let mdat = find_box(&top, b"mdat").ok_or_else(|| CoreError::Fmp4("missing mdat".into()))?;

    let moof_children = read_boxes(moof.body.clone())?;
    let mfhd = find_box(&moof_children, b"mfhd").ok_or_else(|| CoreError::Fmp4("missing mfhd".into()))?;
    let traf = find_box(&moof_children, b"traf").ok_or_else(|| CoreError::Fmp4("missing traf".into()))?;

    let mut mfhd_body = mfhd.body.clone();
    mfhd_body.advance(4); // version+flags
    let sequence_number = mfhd_body.get_u32();

    let traf_children = read_boxes(traf.body.clone())?;
    let tfhd = find_box(&traf_children, b"tfhd").ok_or_else(|| CoreError::Fmp4("missing tfhd".into()))?;
    let tfdt = find_box(&traf_children, b"tfdt").ok_or_else(|| CoreError::Fmp4("missing tfdt".into()))?;

    let mut tfhd_body = tfhd.body.clone();
    tfhd_body.advance(4); // version+flags
    tfhd_body.advance(4); // track_id
    tfhd_body.advance(4); // sample_description_index
    tfhd_body.advance(4); // default_sample_duration
    let default_sample_size = tfhd_body.get_u32();

    let mut tfdt_body = tfdt.body.clone();
    let version = tfdt_body[0];
    tfdt_body.advance(4);
    let base_decode_time = if version == 1 { tfdt_body.get_u64() } else { tfdt_body.get_u32() as u64 };

    let ttml = String::from_utf8(mdat.body.to_vec()).map_err(|e| CoreError::Fmp4(format!("mdat not UTF-8: {e}")))?;

    Ok(ParsedMediaSegment { sequence_number, base_decode_time, default_sample_size, ttml })
}

/// Replace a media segment's TTML payload in place: re-derives
/// `tfhd.default_sample_size` and `trun.sample_size` from the new
/// payload's length, keeping `mfhd.sequence_number` and
/// `tfdt.baseMediaDecodeTime` unchanged (§4.5).
pub fn update_ttml(original: &[u8], new_ttml: &str) -> Result<Bytes> {
    let parsed = parse_media_segment(original)?;
    Ok(build_media_segment(parsed.sequence_number, parsed.base_decode_time, new_ttml))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_segment_carries_ftyp_and_moov() {
        let init = build_init_segment();
        assert!(find_subslice(&init, b"ftyp").is_some());
        assert!(find_subslice(&init, b"moov").is_some());
        assert!(find_subslice(&init, b"stpp").is_some());
    }

    #[test]
    fn scenario_5_webvtt_fmp4_round_trip() {
        let ttml_body = "<tt><body>T</body></tt>";
        let segment = build_media_segment(1, 0, ttml_body);
        let parsed = parse_media_segment(&segment).unwrap();
        assert_eq!(parsed.ttml, ttml_body);
        assert_eq!(parsed.default_sample_size as usize, ttml_body.len());
    }

    #[test]
    fn parse_then_build_is_byte_stable() {
        let segment = build_media_segment(7, 28_000_000, "hello world");
        let parsed = parse_media_segment(&segment).unwrap();
        let rebuilt = build_media_segment(parsed.sequence_number, parsed.base_decode_time, &parsed.ttml);
        assert_eq!(segment.as_ref(), rebuilt.as_ref());
    }

    #[test]
    fn update_ttml_rewrites_size_fields_and_preserves_timing() {
        let original = build_media_segment(3, 12_000_000, "short");
        let updated = update_ttml(&original, "a much longer subtitle line").unwrap();
        let parsed = parse_media_segment(&updated).unwrap();
        assert_eq!(parsed.ttml, "a much longer subtitle line");
        assert_eq!(parsed.default_sample_size as usize, "a much longer subtitle line".len());
        assert_eq!(parsed.sequence_number, 3);
        assert_eq!(parsed.base_decode_time, 12_000_000);
    }
}
