// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! IVF container reading and writing, and key frame detection for the codecs it carries.

use anyhow::anyhow;
use anyhow::Context;
use bitreader::BitReader;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use bytes::Buf;
use enumn::N;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IvfError {
    #[error("invalid IVF signature {0:?}")]
    BadMagic([u8; 4]),
    #[error("IVF header truncated to {0} bytes")]
    Truncated(usize),
    #[error("unsupported IVF header size {0}")]
    BadHeaderSize(u16),
    #[error("invalid IVF time base {framerate}/{timescale}")]
    BadTimeBase { framerate: u32, timescale: u32 },
}

/// IVF file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvfFileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub header_size: u16,
    pub codec: [u8; 4],
    pub width: u16,
    pub height: u16,
    /// Time base denominator: timestamps are in units of `timescale / framerate` seconds.
    pub framerate: u32,
    pub timescale: u32,
    pub frame_count: u32,
    pub unused: u32,
}

impl Default for IvfFileHeader {
    fn default() -> Self {
        Self {
            magic: Self::MAGIC,
            version: 0,
            header_size: Self::SIZE as u16,
            codec: Self::CODEC_VP9,
            width: 320,
            height: 240,
            framerate: 1,
            timescale: 1000,
            frame_count: 1,
            unused: Default::default(),
        }
    }
}

impl IvfFileHeader {
    pub const SIZE: usize = 32;
    pub const MAGIC: [u8; 4] = *b"DKIF";
    pub const CODEC_VP8: [u8; 4] = *b"VP80";
    pub const CODEC_VP9: [u8; 4] = *b"VP90";
    pub const CODEC_AV1: [u8; 4] = *b"AV01";

    /// Header of a stream whose timestamps count frames at `framerate` frames per second.
    pub fn new(codec: [u8; 4], width: u16, height: u16, framerate: u32, frame_count: u32) -> Self {
        let default = Self::default();

        Self {
            codec,
            width,
            height,
            framerate: framerate * default.timescale,
            frame_count,
            ..default
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, IvfError> {
        if data.len() < Self::SIZE {
            return Err(IvfError::Truncated(data.len()));
        }

        let mut buf = data;
        let fourcc = |buf: &mut &[u8]| {
            let mut v = [0u8; 4];
            buf.copy_to_slice(&mut v);
            v
        };

        let magic = fourcc(&mut buf);
        if magic != Self::MAGIC {
            return Err(IvfError::BadMagic(magic));
        }
        let version = buf.get_u16_le();
        let header_size = buf.get_u16_le();
        if (header_size as usize) < Self::SIZE || header_size as usize > data.len() {
            return Err(IvfError::BadHeaderSize(header_size));
        }
        let codec = fourcc(&mut buf);

        let header = Self {
            magic,
            version,
            header_size,
            codec,
            width: buf.get_u16_le(),
            height: buf.get_u16_le(),
            framerate: buf.get_u32_le(),
            timescale: buf.get_u32_le(),
            frame_count: buf.get_u32_le(),
            unused: buf.get_u32_le(),
        };

        if header.framerate == 0 || header.timescale == 0 {
            return Err(IvfError::BadTimeBase {
                framerate: header.framerate,
                timescale: header.timescale,
            });
        }

        Ok(header)
    }

    /// Converts a frame timestamp into microseconds.
    pub fn timestamp_to_us(&self, timestamp: u64) -> i64 {
        (timestamp as u128 * 1_000_000 * self.timescale as u128 / self.framerate as u128) as i64
    }

    /// Writes header into writer
    pub fn write_into(&self, writer: &mut impl std::io::Write) -> std::io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.header_size.to_le_bytes())?;
        writer.write_all(&self.codec)?;
        writer.write_all(&self.width.to_le_bytes())?;
        writer.write_all(&self.height.to_le_bytes())?;
        writer.write_all(&self.framerate.to_le_bytes())?;
        writer.write_all(&self.timescale.to_le_bytes())?;
        writer.write_all(&self.frame_count.to_le_bytes())?;
        writer.write_all(&self.unused.to_le_bytes())?;

        Ok(())
    }
}

/// IVF frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfFrameHeader {
    pub frame_size: u32,
    pub timestamp: u64,
}

impl IvfFrameHeader {
    pub const SIZE: usize = 12;

    pub fn write_into(&self, writer: &mut impl std::io::Write) -> std::io::Result<()> {
        writer.write_all(&self.frame_size.to_le_bytes())?;
        writer.write_all(&self.timestamp.to_le_bytes())?;
        Ok(())
    }
}

/// A frame of an IVF stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfFrame<'a> {
    /// Timestamp in units of the time base of the file header.
    pub timestamp: u64,
    pub data: &'a [u8],
}

/// Iterator over IVF packets. Iteration stops at the first truncated frame.
pub struct IvfIterator<'a> {
    remaining: &'a [u8],
}

impl<'a> IvfIterator<'a> {
    /// Iterates the frames following a header of `header_size` bytes.
    pub fn with_header_size(data: &'a [u8], header_size: usize) -> Self {
        Self {
            remaining: &data[header_size.min(data.len())..],
        }
    }

    pub fn new(data: &'a [u8]) -> Self {
        Self::with_header_size(data, IvfFileHeader::SIZE)
    }
}

impl<'a> Iterator for IvfIterator<'a> {
    type Item = IvfFrame<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        // Make sure we have a header.
        if self.remaining.remaining() < IvfFrameHeader::SIZE {
            return None;
        }

        let len = self.remaining.get_u32_le() as usize;
        let timestamp = self.remaining.get_u64_le();

        if self.remaining.len() < len {
            self.remaining = &[];
            return None;
        }

        let (data, rest) = self.remaining.split_at(len);
        self.remaining = rest;

        Some(IvfFrame { timestamp, data })
    }
}

/// Writes `frames` as an IVF stream, updating the frame count of `header`.
pub fn write_ivf<'a>(
    header: &IvfFileHeader,
    frames: impl IntoIterator<Item = IvfFrame<'a>>,
) -> anyhow::Result<Vec<u8>> {
    let mut body = vec![];
    let mut frame_count = 0u32;
    for frame in frames {
        let frame_size = u32::try_from(frame.data.len()).context("frame too large for IVF")?;
        IvfFrameHeader {
            frame_size,
            timestamp: frame.timestamp,
        }
        .write_into(&mut body)?;
        body.extend_from_slice(frame.data);
        frame_count += 1;
    }

    let header = IvfFileHeader {
        frame_count,
        ..header.clone()
    };
    let mut out = Vec::with_capacity(IvfFileHeader::SIZE + body.len());
    header.write_into(&mut out)?;
    out.extend_from_slice(&body);

    Ok(out)
}

const VP8_START_CODE: u32 = 0x2a019d;
const VP9_FRAME_MARKER: u32 = 0x02;
const VP9_SYNC_CODE: u32 = 0x498342;

#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vp9Profile {
    Profile0 = 0,
    Profile1 = 1,
    Profile2 = 2,
    Profile3 = 3,
}

#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vp9FrameType {
    KeyFrame = 0,
    NonKeyFrame = 1,
}

/// Whether `frame` starts with the header of a VP8 key frame.
pub fn vp8_is_key_frame(frame: &[u8]) -> anyhow::Result<bool> {
    if frame.len() < 3 {
        return Err(anyhow!("VP8 frame of {} bytes has no frame tag", frame.len()));
    }

    let frame_tag = LittleEndian::read_u24(frame);
    if frame_tag & 0x1 != 0 {
        return Ok(false);
    }

    let start_code = frame
        .get(3..6)
        .map(LittleEndian::read_u24)
        .ok_or_else(|| anyhow!("VP8 key frame truncated before its start code"))?;
    if start_code != VP8_START_CODE {
        return Err(anyhow!("invalid VP8 start code {:#x}", start_code));
    }

    Ok(true)
}

/// Whether `frame` starts with the uncompressed header of a VP9 key frame. Frames of a superframe
/// are judged by the first one.
pub fn vp9_is_key_frame(frame: &[u8]) -> anyhow::Result<bool> {
    let mut r = BitReader::new(frame);

    let marker = r.read_u32(2)?;
    if marker != VP9_FRAME_MARKER {
        return Err(anyhow!("expected VP9 frame marker, found {:?}", marker));
    }

    let low = r.read_u8(1)?;
    let high = r.read_u8(1)?;
    let profile = Vp9Profile::n((high << 1) | low)
        .with_context(|| format!("invalid VP9 profile {}", (high << 1) | low))?;
    if profile == Vp9Profile::Profile3 {
        // Reserved bit.
        let _ = r.read_bool()?;
    }

    if r.read_bool()? {
        // show_existing_frame
        return Ok(false);
    }

    let frame_type =
        Vp9FrameType::n(r.read_u8(1)?).ok_or_else(|| anyhow!("invalid VP9 frame type"))?;
    if frame_type != Vp9FrameType::KeyFrame {
        return Ok(false);
    }

    // show_frame, error_resilient_mode
    r.skip(2)?;
    let sync_code = r.read_u32(24)?;
    if sync_code != VP9_SYNC_CODE {
        return Err(anyhow!("invalid VP9 sync code {:#x}", sync_code));
    }

    Ok(true)
}

/// Whether `frame` is a key frame of the stream identified by the IVF `fourcc`. `None` if the key
/// frames of that codec cannot be detected.
pub fn is_key_frame(fourcc: [u8; 4], frame: &[u8]) -> Option<bool> {
    let result = match &fourcc {
        b"VP80" => vp8_is_key_frame(frame),
        b"VP90" => vp9_is_key_frame(frame),
        _ => return None,
    };

    match result {
        Ok(key) => Some(key),
        Err(e) => {
            log::warn!("unable to parse frame header: {:#}", e);
            Some(false)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Smallest VP9 profile 0 key frame header prefix: marker, profile, show_existing_frame,
    /// frame_type, show_frame, error_resilient_mode and the sync code.
    pub(crate) const VP9_KEY_FRAME: [u8; 4] = [0x82, 0x49, 0x83, 0x42];
    /// VP9 profile 0 inter frame.
    pub(crate) const VP9_INTER_FRAME: [u8; 2] = [0x86, 0x00];
    pub(crate) const VP8_KEY_FRAME: [u8; 10] =
        [0x50, 0x42, 0x00, 0x9d, 0x01, 0x2a, 0xb0, 0x00, 0x90, 0x00];
    pub(crate) const VP8_INTER_FRAME: [u8; 3] = [0x31, 0x04, 0x00];

    #[test]
    fn test_ivf_file_header() {
        let mut hdr = IvfFileHeader {
            version: 0,
            codec: IvfFileHeader::CODEC_VP9,
            width: 256,
            height: 256,
            framerate: 30_000,
            timescale: 1_000,
            frame_count: 1,

            ..Default::default()
        };

        let mut buf = Vec::new();
        hdr.write_into(&mut buf).unwrap();

        const EXPECTED: [u8; 32] = [
            0x44, 0x4b, 0x49, 0x46, 0x00, 0x00, 0x20, 0x00, 0x56, 0x50, 0x39, 0x30, 0x00, 0x01,
            0x00, 0x01, 0x30, 0x75, 0x00, 0x00, 0xe8, 0x03, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
        ];

        assert_eq!(&buf, &EXPECTED);
        assert_eq!(IvfFileHeader::parse(&buf), Ok(hdr.clone()));

        hdr.magic = *b"RIFF";
        buf.clear();
        hdr.write_into(&mut buf).unwrap();
        assert_eq!(IvfFileHeader::parse(&buf), Err(IvfError::BadMagic(*b"RIFF")));
        assert_eq!(IvfFileHeader::parse(&buf[..20]), Err(IvfError::Truncated(20)));
    }

    #[test]
    fn test_ivf_frame_header() {
        let hdr = IvfFrameHeader {
            frame_size: 199249,
            timestamp: 0,
        };

        let mut buf = Vec::new();
        hdr.write_into(&mut buf).unwrap();

        const EXPECTED: [u8; 12] = [
            0x51, 0x0a, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];

        assert_eq!(&buf, &EXPECTED);
    }

    #[test]
    fn test_ivf_iterator() {
        let header = IvfFileHeader::new(IvfFileHeader::CODEC_VP8, 176, 144, 30, 0);
        let frames = [
            IvfFrame {
                timestamp: 0,
                data: &[1, 2, 3],
            },
            IvfFrame {
                timestamp: 1,
                data: &[],
            },
            IvfFrame {
                timestamp: 2,
                data: &[4],
            },
        ];
        let stream = write_ivf(&header, frames).unwrap();

        let parsed = IvfFileHeader::parse(&stream).unwrap();
        assert_eq!(parsed.frame_count, 3);
        assert_eq!(parsed.timestamp_to_us(2), 66_666);
        assert_eq!(IvfIterator::new(&stream).collect::<Vec<_>>(), frames);

        // A truncated trailing frame is dropped.
        let truncated = &stream[..stream.len() - 1];
        assert_eq!(IvfIterator::new(truncated).count(), 2);
    }

    #[test]
    fn test_key_frame_detection() {
        assert!(vp9_is_key_frame(&VP9_KEY_FRAME).unwrap());
        assert!(!vp9_is_key_frame(&VP9_INTER_FRAME).unwrap());
        assert!(vp9_is_key_frame(&[0x00, 0x00]).is_err());

        assert!(vp8_is_key_frame(&VP8_KEY_FRAME).unwrap());
        assert!(!vp8_is_key_frame(&VP8_INTER_FRAME).unwrap());
        assert!(vp8_is_key_frame(&[0x00, 0x00, 0x00, 0x11, 0x22, 0x33]).is_err());

        assert_eq!(is_key_frame(*b"VP90", &VP9_KEY_FRAME), Some(true));
        assert_eq!(is_key_frame(*b"VP80", &[0x00]), Some(false));
        assert_eq!(is_key_frame(*b"AV01", &VP9_KEY_FRAME), None);
    }
}
