// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sources of access units fed to decoders.

use anyhow::anyhow;
use bitflags::bitflags;

use crate::bitstream_utils::is_key_frame;
use crate::bitstream_utils::IvfFileHeader;
use crate::bitstream_utils::IvfIterator;
use crate::media_format::media_type_for_ivf_fourcc;
use crate::media_format::MediaFormat;

bitflags! {
    /// Flags of a sample, with the values used by platform extractors.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SampleFlags: u32 {
        const SYNC = 1;
        const ENCRYPTED = 2;
        const PARTIAL_FRAME = 4;
    }
}

/// Where [`SampleSource::seek_to`] lands relative to the requested time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SeekMode {
    /// Last sync sample at or before the requested time.
    PreviousSync,
    /// First sync sample at or after the requested time.
    NextSync,
    /// Sync sample closest to the requested time.
    ClosestSync,
}

/// A demuxer exposing the samples of one selected track.
pub trait SampleSource {
    fn track_count(&self) -> usize;

    fn track_format(&self, track: usize) -> anyhow::Result<MediaFormat>;

    fn select_track(&mut self, track: usize) -> anyhow::Result<()>;

    /// Copies the current sample into `buf` and returns its size.
    fn read_sample_data(&self, buf: &mut [u8]) -> anyhow::Result<usize>;

    /// Size of the current sample, `None` once all the samples were consumed.
    fn sample_size(&self) -> Option<usize>;

    /// Timestamp of the current sample in microseconds.
    fn sample_time(&self) -> Option<i64>;

    fn sample_flags(&self) -> SampleFlags;

    /// Moves to the next sample. Returns `false` if there is none.
    fn advance(&mut self) -> bool;

    fn seek_to(&mut self, time_us: i64, mode: SeekMode);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub data: Vec<u8>,
    pub pts: i64,
    pub flags: SampleFlags,
}

impl Sample {
    pub fn new(data: Vec<u8>, pts: i64, flags: SampleFlags) -> Self {
        Self { data, pts, flags }
    }
}

#[derive(Clone, Debug)]
struct Track {
    format: MediaFormat,
    samples: Vec<Sample>,
}

/// Extractor over samples held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryExtractor {
    tracks: Vec<Track>,
    selected: Option<usize>,
    position: usize,
}

impl MemoryExtractor {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a track and returns its index.
    pub fn add_track(&mut self, format: MediaFormat, samples: Vec<Sample>) -> usize {
        self.tracks.push(Track { format, samples });
        self.tracks.len() - 1
    }

    fn samples(&self) -> &[Sample] {
        self.selected
            .and_then(|t| self.tracks.get(t))
            .map(|t| t.samples.as_slice())
            .unwrap_or_default()
    }

    fn current(&self) -> Option<&Sample> {
        self.samples().get(self.position)
    }
}

impl SampleSource for MemoryExtractor {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, track: usize) -> anyhow::Result<MediaFormat> {
        self.tracks
            .get(track)
            .map(|t| t.format.clone())
            .ok_or_else(|| anyhow!("no track {}", track))
    }

    fn select_track(&mut self, track: usize) -> anyhow::Result<()> {
        if track >= self.tracks.len() {
            return Err(anyhow!("no track {}", track));
        }
        self.selected = Some(track);
        self.position = 0;
        Ok(())
    }

    fn read_sample_data(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let sample = self.current().ok_or_else(|| anyhow!("no sample to read"))?;
        let capacity = buf.len();
        let dst = buf.get_mut(..sample.data.len()).ok_or_else(|| {
            anyhow!(
                "sample of {} bytes does not fit in a {} bytes buffer",
                sample.data.len(),
                capacity
            )
        })?;
        dst.copy_from_slice(&sample.data);
        Ok(sample.data.len())
    }

    fn sample_size(&self) -> Option<usize> {
        self.current().map(|s| s.data.len())
    }

    fn sample_time(&self) -> Option<i64> {
        self.current().map(|s| s.pts)
    }

    fn sample_flags(&self) -> SampleFlags {
        self.current().map(|s| s.flags).unwrap_or_default()
    }

    fn advance(&mut self) -> bool {
        if self.position < self.samples().len() {
            self.position += 1;
        }
        self.position < self.samples().len()
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) {
        let syncs = self
            .samples()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.flags.contains(SampleFlags::SYNC))
            .map(|(i, s)| (i, s.pts))
            .collect::<Vec<_>>();

        let previous = syncs.iter().rev().find(|(_, pts)| *pts <= time_us).copied();
        let next = syncs.iter().find(|(_, pts)| *pts >= time_us).copied();

        let target = match mode {
            SeekMode::PreviousSync => previous.or(syncs.first().copied()),
            SeekMode::NextSync => next,
            SeekMode::ClosestSync => match (previous, next) {
                (Some(p), Some(n)) if n.1 - time_us < time_us - p.1 => Some(n),
                (Some(p), _) => Some(p),
                (None, n) => n,
            },
        };

        self.position = target.map(|(i, _)| i).unwrap_or(self.samples().len());
        log::debug!("seek to {} us ({:?}) landed on sample {}", time_us, mode, self.position);
    }
}

/// Extractor over the single video track of an IVF stream.
pub struct IvfExtractor {
    inner: MemoryExtractor,
}

impl IvfExtractor {
    pub fn new(data: &[u8]) -> anyhow::Result<Self> {
        let header = IvfFileHeader::parse(data)?;
        let media_type = media_type_for_ivf_fourcc(header.codec).ok_or_else(|| {
            anyhow!(
                "unsupported IVF codec {}",
                String::from_utf8_lossy(&header.codec)
            )
        })?;

        let samples = IvfIterator::with_header_size(data, header.header_size as usize)
            .enumerate()
            .map(|(i, frame)| {
                let key = is_key_frame(header.codec, frame.data).unwrap_or(i == 0);
                let flags = if key {
                    SampleFlags::SYNC
                } else {
                    SampleFlags::empty()
                };
                Sample::new(
                    frame.data.to_vec(),
                    header.timestamp_to_us(frame.timestamp),
                    flags,
                )
            })
            .collect::<Vec<_>>();

        log::debug!(
            "IVF stream {} {}x{} with {} frames",
            media_type,
            header.width,
            header.height,
            samples.len()
        );

        let format = MediaFormat::new_video(media_type, header.width as i32, header.height as i32);
        let mut inner = MemoryExtractor::new();
        inner.add_track(format, samples);

        Ok(Self { inner })
    }
}

impl SampleSource for IvfExtractor {
    fn track_count(&self) -> usize {
        self.inner.track_count()
    }

    fn track_format(&self, track: usize) -> anyhow::Result<MediaFormat> {
        self.inner.track_format(track)
    }

    fn select_track(&mut self, track: usize) -> anyhow::Result<()> {
        self.inner.select_track(track)
    }

    fn read_sample_data(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        self.inner.read_sample_data(buf)
    }

    fn sample_size(&self) -> Option<usize> {
        self.inner.sample_size()
    }

    fn sample_time(&self) -> Option<i64> {
        self.inner.sample_time()
    }

    fn sample_flags(&self) -> SampleFlags {
        self.inner.sample_flags()
    }

    fn advance(&mut self) -> bool {
        self.inner.advance()
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) {
        self.inner.seek_to(time_us, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::tests::VP9_INTER_FRAME;
    use crate::bitstream_utils::tests::VP9_KEY_FRAME;
    use crate::bitstream_utils::write_ivf;
    use crate::bitstream_utils::IvfFrame;
    use crate::media_format::MIMETYPE_VIDEO_VP9;

    fn extractor() -> MemoryExtractor {
        let samples = (0..6)
            .map(|i| {
                let flags = if i % 3 == 0 {
                    SampleFlags::SYNC
                } else {
                    SampleFlags::empty()
                };
                Sample::new(vec![i as u8; i + 1], i as i64 * 1000, flags)
            })
            .collect();

        let mut extractor = MemoryExtractor::new();
        extractor.add_track(MediaFormat::new_video(MIMETYPE_VIDEO_VP9, 64, 64), samples);
        extractor.select_track(0).unwrap();
        extractor
    }

    #[test]
    fn iterate_samples() {
        let mut extractor = extractor();
        let mut buf = [0u8; 16];

        let mut sizes = vec![];
        loop {
            let size = extractor.read_sample_data(&mut buf).unwrap();
            assert_eq!(Some(size), extractor.sample_size());
            sizes.push(size);
            if !extractor.advance() {
                break;
            }
        }

        assert_eq!(sizes, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(extractor.sample_size(), None);
        assert_eq!(extractor.sample_time(), None);
        assert!(extractor.read_sample_data(&mut buf).is_err());
        assert!(!extractor.advance());
    }

    #[test]
    fn sample_larger_than_buffer() {
        let mut extractor = extractor();
        extractor.seek_to(5000, SeekMode::PreviousSync);
        assert_eq!(extractor.sample_time(), Some(3000));
        extractor.advance();
        extractor.advance();
        let err = extractor.read_sample_data(&mut [0u8; 4]).unwrap_err();
        assert!(
            err.to_string().contains("does not fit in a 4 bytes buffer"),
            "{}",
            err
        );
    }

    #[test]
    fn seek_modes() {
        let mut extractor = extractor();

        extractor.seek_to(2000, SeekMode::PreviousSync);
        assert_eq!(extractor.sample_time(), Some(0));
        extractor.seek_to(2000, SeekMode::NextSync);
        assert_eq!(extractor.sample_time(), Some(3000));
        extractor.seek_to(2000, SeekMode::ClosestSync);
        assert_eq!(extractor.sample_time(), Some(3000));
        extractor.seek_to(1000, SeekMode::ClosestSync);
        assert_eq!(extractor.sample_time(), Some(0));
        extractor.seek_to(9000, SeekMode::NextSync);
        assert_eq!(extractor.sample_size(), None);
        extractor.seek_to(-5, SeekMode::PreviousSync);
        assert_eq!(extractor.sample_time(), Some(0));
        assert_eq!(extractor.sample_flags(), SampleFlags::SYNC);
    }

    #[test]
    fn ivf_extractor() {
        let header = IvfFileHeader::new(IvfFileHeader::CODEC_VP9, 64, 48, 30, 0);
        let frames = [
            IvfFrame {
                timestamp: 0,
                data: &VP9_KEY_FRAME,
            },
            IvfFrame {
                timestamp: 1,
                data: &VP9_INTER_FRAME,
            },
        ];
        let stream = write_ivf(&header, frames).unwrap();

        let mut extractor = IvfExtractor::new(&stream).unwrap();
        assert_eq!(extractor.track_count(), 1);
        let format = extractor.track_format(0).unwrap();
        assert_eq!(format.media_type(), Some(MIMETYPE_VIDEO_VP9));
        assert_eq!(format.width(), Some(64));
        assert_eq!(format.height(), Some(48));

        extractor.select_track(0).unwrap();
        assert_eq!(extractor.sample_flags(), SampleFlags::SYNC);
        assert!(extractor.advance());
        assert_eq!(extractor.sample_time(), Some(33_333));
        assert_eq!(extractor.sample_flags(), SampleFlags::empty());
        assert!(!extractor.advance());

        let mut bad = stream.clone();
        bad[8..12].copy_from_slice(b"XXXX");
        assert!(IvfExtractor::new(&bad).is_err());
    }
}
