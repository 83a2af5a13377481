// SPDX-License-Identifier: GPL-3.0-only

//! Synthetic encoder output
//!
//! Video access units carry a small header so consumers and tests can check
//! ordering and integrity:
//!
//! ```text
//! 00 00 00 01 | nal | seq (u64 LE) | length (u32 LE) | filler ...
//! ```
//!
//! Stills are JPEG-shaped: SOI, an APP1 segment with the EXIF tags as text,
//! a scan of filler bytes and EOI.

/// Annex-B start code
const START_CODE: [u8; 4] = [0, 0, 0, 1];
const NAL_IDR: u8 = 0x65;
const NAL_SLICE: u8 = 0x41;
const NAL_SPS: u8 = 0x67;

/// Bytes before the filler in every video access unit
pub const FRAME_HEADER_LEN: usize = START_CODE.len() + 1 + 8 + 4;

/// Header of a synthetic video access unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedFrame {
    pub seq: u64,
    /// Total length the encoder wrote, header included
    pub length: usize,
    pub keyframe: bool,
}

impl SimulatedFrame {
    /// Parse the header of a frame payload
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_LEN || data[..4] != START_CODE {
            return None;
        }
        let keyframe = match data[4] {
            NAL_IDR => true,
            NAL_SLICE => false,
            _ => return None,
        };
        let seq = u64::from_le_bytes(data[5..13].try_into().ok()?);
        let length = u32::from_le_bytes(data[13..17].try_into().ok()?) as usize;
        Some(Self {
            seq,
            length,
            keyframe,
        })
    }
}

/// Build one access unit of `size` bytes (at least the header)
pub fn video_frame(seq: u64, keyframe: bool, size: usize) -> Vec<u8> {
    let size = size.max(FRAME_HEADER_LEN);
    let mut data = Vec::with_capacity(size);
    data.extend_from_slice(&START_CODE);
    data.push(if keyframe { NAL_IDR } else { NAL_SLICE });
    data.extend_from_slice(&seq.to_le_bytes());
    data.extend_from_slice(&(size as u32).to_le_bytes());
    let fill = seq as u8;
    data.extend((0..size - FRAME_HEADER_LEN).map(|i| fill ^ (i as u8)));
    data
}

/// Codec config (SPS/PPS) emitted once at the start of a stream
pub fn codec_config(width: u32, height: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(16);
    data.extend_from_slice(&START_CODE);
    data.push(NAL_SPS);
    data.extend_from_slice(&width.to_be_bytes());
    data.extend_from_slice(&height.to_be_bytes());
    data
}

/// Size of one access unit for the given rate settings
///
/// Keyframes are three times the average, everything is clamped to
/// `[FRAME_HEADER_LEN, capacity]`.
pub fn frame_size(bitrate: u32, fps: f64, keyframe: bool, capacity: usize) -> usize {
    let average = if fps > 0.0 {
        (bitrate as f64 / 8.0 / fps) as usize
    } else {
        FRAME_HEADER_LEN
    };
    let size = if keyframe { average * 3 } else { average };
    size.clamp(FRAME_HEADER_LEN, capacity.max(FRAME_HEADER_LEN))
}

/// Build a JPEG-shaped image carrying `exif_tags` in its APP1 segment
pub fn jpeg_image(exif_tags: &[String], body_len: usize) -> Vec<u8> {
    let mut exif = b"Exif\0\0".to_vec();
    exif.extend_from_slice(exif_tags.join("\n").as_bytes());
    exif.truncate(u16::MAX as usize - 2);

    let mut data = Vec::with_capacity(body_len + exif.len() + 16);
    data.extend_from_slice(&[0xFF, 0xD8]);
    data.extend_from_slice(&[0xFF, 0xE1]);
    data.extend_from_slice(&((exif.len() + 2) as u16).to_be_bytes());
    data.extend_from_slice(&exif);
    // Start of scan, then entropy-coded filler that never contains 0xFF
    data.extend_from_slice(&[0xFF, 0xDA]);
    data.extend((0..body_len).map(|i| ((i * 31) % 255) as u8));
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}
