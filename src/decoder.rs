// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder side of the harness.
//!
//! [`DecoderHandler`] feeds the access units of one demuxed track to a decoder and fingerprints
//! what comes out: the metadata of every output buffer, the decoded audio, or the decoded images
//! both through their plane description and as a flat strided buffer.

pub mod multi_access_unit;

use anyhow::anyhow;
use byteorder::BigEndian;
use byteorder::ByteOrder;

use crate::codec::Codec;
use crate::extractor::SampleFlags;
use crate::extractor::SampleSource;
use crate::extractor::SeekMode;
use crate::harness::CodecSession;
use crate::harness::EosMode;
use crate::harness::HarnessConfig;
use crate::harness::HarnessError;
use crate::harness::Result;
use crate::harness::ScheduleMode;
use crate::harness::StreamHandler;
use crate::harness::TestMode;
use crate::media_format::is_format_similar;
use crate::media_format::media_kind;
use crate::media_format::MediaFormat;
use crate::media_format::MediaKind;
use crate::media_format::COLOR_FORMAT_YUV420_FLEXIBLE;
use crate::media_format::COLOR_FORMAT_YUV_P010;
use crate::media_format::KEY_COLOR_FORMAT;
use crate::media_format::KEY_HEIGHT;
use crate::media_format::KEY_STRIDE;
use crate::media_format::KEY_WIDTH;
use crate::output_manager::OutputManager;
use crate::BufferFlags;
use crate::BufferInfo;

/// Serializes the parts of `info` that must not depend on how the decoder was driven: the size
/// (audio only), the flags without end of stream, and the timestamp. Big endian, like the
/// platform serializes them.
pub fn flatten_buffer_info(info: &BufferInfo, is_audio: bool) -> Vec<u8> {
    let mut flat = [0u8; 16];
    let mut len = 0;

    if is_audio {
        BigEndian::write_i32(&mut flat[0..4], info.size as i32);
        len += 4;
    }
    BigEndian::write_u32(
        &mut flat[len..len + 4],
        info.flags.difference(BufferFlags::END_OF_STREAM).bits(),
    );
    BigEndian::write_i64(&mut flat[len + 4..len + 12], info.presentation_time_us);
    len += 12;

    flat[..len].to_vec()
}

/// Maps the flags of a demuxed sample to the flags of the input buffer carrying it.
pub(crate) fn buffer_flags(sample_flags: SampleFlags) -> BufferFlags {
    let mut flags = BufferFlags::empty();
    if sample_flags.contains(SampleFlags::SYNC) {
        flags |= BufferFlags::KEY_FRAME;
    }
    if sample_flags.contains(SampleFlags::PARTIAL_FRAME) {
        flags |= BufferFlags::PARTIAL_FRAME;
    }
    flags
}

fn dimension(format: &MediaFormat, key: &str) -> Option<usize> {
    format
        .integer(key)
        .filter(|v| *v > 0)
        .map(|v| v as usize)
}

pub struct DecoderHandler<S: SampleSource> {
    source: S,
    kind: MediaKind,
    format: MediaFormat,
    is_interlaced: bool,
    csd: Vec<Vec<u8>>,
}

impl<S: SampleSource> DecoderHandler<S> {
    /// Selects the first track of `source` carrying `media_type` (case insensitive).
    /// `stream_name` is the name of the test stream, which tells whether it is interlaced or
    /// high bit depth.
    pub fn set_up_source(mut source: S, media_type: &str, stream_name: &str) -> Result<Self> {
        let kind = media_kind(media_type).ok_or_else(|| {
            HarnessError::NotApplicable(format!(
                "{} is neither an audio nor a video media type",
                media_type
            ))
        })?;

        for track in 0..source.track_count() {
            let mut format = source.track_format(track)?;
            let matches = format
                .media_type()
                .is_some_and(|t| t.eq_ignore_ascii_case(media_type));
            if !matches {
                continue;
            }

            source.select_track(track)?;
            if kind == MediaKind::Video {
                let color_format = if stream_name.contains("10bit") {
                    COLOR_FORMAT_YUV_P010
                } else {
                    COLOR_FORMAT_YUV420_FLEXIBLE
                };
                format.set_integer(KEY_COLOR_FORMAT, color_format);
            }
            let csd = format.csd_buffers();
            log::debug!(
                "{}: selected track {} with format {}",
                stream_name,
                track,
                format
            );

            return Ok(Self {
                source,
                kind,
                format,
                is_interlaced: stream_name.contains("_interlaced_"),
                csd,
            });
        }

        Err(HarnessError::NotApplicable(format!(
            "no track with media type {} found in {}",
            media_type, stream_name
        )))
    }

    /// Format of the selected track.
    pub fn format(&self) -> &MediaFormat {
        &self.format
    }

    pub fn is_audio(&self) -> bool {
        self.kind == MediaKind::Audio
    }

    pub fn is_interlaced(&self) -> bool {
        self.is_interlaced
    }

    pub fn csd_buffers(&self) -> &[Vec<u8>] {
        &self.csd
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn seek_to(&mut self, time_us: i64, mode: SeekMode) {
        self.source.seek_to(time_us, mode);
    }

    /// Queues the codec specific data of the track, one input slot per buffer, flagged as codec
    /// config with a zero timestamp.
    pub fn queue_codec_config<C: Codec>(&mut self, session: &mut CodecSession<C>) -> Result<()> {
        for csd in &self.csd {
            let index = session.next_input_slot()?;
            let buf = session.codec.input_buffer(index)?;
            let capacity = buf.len();
            buf.get_mut(..csd.len())
                .ok_or_else(|| {
                    anyhow!(
                        "codec config of {} bytes exceeds the {} bytes input slot",
                        csd.len(),
                        capacity
                    )
                })?
                .copy_from_slice(csd);
            session.codec.queue_input_buffer(
                index,
                BufferInfo::new(0, csd.len(), 0, BufferFlags::CODEC_CONFIG),
            )?;
            log::debug!("queued csd: slot {} size {}", index, csd.len());
        }

        Ok(())
    }

    fn checksum_video<C: Codec>(
        session: &mut CodecSession<C>,
        index: usize,
        info: &BufferInfo,
    ) -> Result<()> {
        let format = session.codec.output_format()?;
        let Some(image) = session.codec.output_image(index)? else {
            return Err(session.mismatch("CPU read of the output image is not available"));
        };
        session.output.checksum_image(&image)?;
        let bytes_per_sample = image.format().bytes_per_sample();

        let (Some(width), Some(height), Some(stride)) = (
            dimension(&format, KEY_WIDTH),
            dimension(&format, KEY_HEIGHT),
            dimension(&format, KEY_STRIDE),
        ) else {
            return Err(session.mismatch(&format!(
                "output format {} does not describe the plane geometry",
                format
            )));
        };

        let buf = session.codec.output_buffer(index)?;
        let plane = buf
            .get(info.offset..)
            .ok_or_else(|| anyhow!("offset {} is outside of the output slot", info.offset))?;
        session
            .output
            .checksum_strided(plane, width, height, stride, bytes_per_sample)?;

        Ok(())
    }
}

impl<C: Codec, S: SampleSource> StreamHandler<C> for DecoderHandler<S> {
    fn enqueue_input(&mut self, session: &mut CodecSession<C>, index: usize) -> Result<()> {
        let Some(size) = self.source.sample_size() else {
            return session.enqueue_eos(index);
        };

        let buf = session.codec.input_buffer(index)?;
        let read = self.source.read_sample_data(buf)?;
        if read != size {
            return Err(HarnessError::Other(anyhow!(
                "read {} bytes of a {} bytes sample",
                read,
                size
            )));
        }

        let pts = self.source.sample_time().unwrap_or(0);
        let mut flags = buffer_flags(self.source.sample_flags());
        if !self.source.advance() && session.state.signal_eos_with_last_frame {
            flags |= BufferFlags::END_OF_STREAM;
            session.state.saw_input_eos = true;
        }

        log::trace!(
            "input: slot {} size {} pts {} flags {:?}",
            index,
            size,
            pts,
            flags
        );
        let info = BufferInfo::new(0, size, pts, flags);
        session.codec.queue_input_buffer(index, info)?;

        if info.is_payload() {
            session.output.save_in_pts(pts);
            session.state.input_count += 1;
        }

        Ok(())
    }

    fn dequeue_output(
        &mut self,
        session: &mut CodecSession<C>,
        index: usize,
        info: BufferInfo,
    ) -> Result<()> {
        if info.size > 0 {
            session
                .output
                .checksum(&flatten_buffer_info(&info, self.is_audio()));
            if self.is_audio() {
                let buf = session.codec.output_buffer(index)?;
                session.output.accumulate(buf, &info)?;
            } else {
                Self::checksum_video(session, index, &info)?;
            }
        }

        if info.is_eos() {
            session.state.saw_output_eos = true;
            log::debug!("saw output end of stream");
        }
        log::trace!(
            "output: slot {} size {} pts {} flags {:?}",
            index,
            info.size,
            info.presentation_time_us,
            info.flags
        );

        if info.size > 0 && !info.is_codec_config() {
            session.output.save_out_pts(info.presentation_time_us);
            session.state.output_count += 1;
        }
        session.codec.release_output_buffer(index)?;

        Ok(())
    }

    fn validate(&mut self, session: &mut CodecSession<C>) -> Result<()> {
        if session.has_output_format_changed() {
            let output_format = session.output_format();
            if !is_format_similar(Some(&self.format), output_format.as_ref()) {
                return Err(session.mismatch(&format!(
                    "output format {} does not match input format {}",
                    output_format.map(|f| f.to_string()).unwrap_or_default(),
                    self.format
                )));
            }
        }

        let prev_output_pts = session.state.prev_output_pts;
        if !session.output.is_pts_strictly_increasing(prev_output_pts) {
            return Err(session.mismatch("output timestamps are not strictly increasing"));
        }

        // Deinterlacing may legitimately change the number of frames and their timestamps.
        if !self.is_audio()
            && !self.is_interlaced
            && !session.output.is_out_pts_list_identical_to_inp_pts_list(false)
        {
            return Err(session.mismatch("input pts list and output pts list are not identical"));
        }

        Ok(())
    }
}

/// Decodes the track carrying `media_type` from `time_us` onwards in synchronous mode, with the
/// end of stream signalled with the last access unit and the output mirrored into memory.
/// Returns the fingerprint of the run, to be used as the reference of other runs.
pub fn decode_to_memory<C: Codec, S: SampleSource>(
    codec: C,
    source: S,
    media_type: &str,
    stream_name: &str,
    time_us: i64,
    seek_mode: SeekMode,
    frame_limit: usize,
) -> Result<OutputManager> {
    let mut handler = DecoderHandler::set_up_source(source, media_type, stream_name)?;
    let mut session = CodecSession::new(
        codec,
        HarnessConfig {
            save_to_memory: true,
            ..Default::default()
        },
    );
    session.set_test_config("decode_to_memory", stream_name);

    let format = handler.format().clone();
    let mode = TestMode::new(ScheduleMode::Synchronous, EosMode::WithLastFrame);
    session.configure_codec(&format, mode, false)?;
    session.start()?;
    handler.seek_to(time_us, seek_mode);
    session.do_work(&mut handler, frame_limit)?;
    session.queue_eos(&mut handler)?;
    session.wait_for_all_outputs(&mut handler)?;
    session.stop()?;

    Ok(std::mem::take(&mut session.output))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::loopback::Faults;
    use crate::backend::loopback::LoopbackCodec;
    use crate::backend::loopback::LoopbackOptions;
    use crate::extractor::MemoryExtractor;
    use crate::extractor::Sample;
    use crate::media_format::MIMETYPE_AUDIO_AAC;
    use crate::media_format::MIMETYPE_VIDEO_VP9;

    pub(crate) const FRAME_DURATION_US: i64 = 33_333;

    pub(crate) fn video_source(frames: usize) -> MemoryExtractor {
        let samples = (0..frames)
            .map(|i| {
                let flags = if i % 10 == 0 {
                    SampleFlags::SYNC
                } else {
                    SampleFlags::empty()
                };
                Sample::new(vec![i as u8; 16 + i], i as i64 * FRAME_DURATION_US, flags)
            })
            .collect();

        let mut extractor = MemoryExtractor::new();
        extractor.add_track(MediaFormat::new_audio(MIMETYPE_AUDIO_AAC, 48000, 2), vec![]);
        extractor.add_track(MediaFormat::new_video(MIMETYPE_VIDEO_VP9, 40, 22), samples);
        extractor
    }

    /// 1024 samples per unit of 16-bit stereo at 48 kHz.
    pub(crate) fn audio_source(units: usize) -> MemoryExtractor {
        let samples = (0..units)
            .map(|i| {
                let data = (0..4096).map(|b| (b * 7 + i) as u8).collect();
                Sample::new(data, i as i64 * 21_333, SampleFlags::SYNC)
            })
            .collect();

        let mut format = MediaFormat::new_audio(MIMETYPE_AUDIO_AAC, 48000, 2);
        format.set_bytes("csd-0", vec![0x11, 0x90]);
        let mut extractor = MemoryExtractor::new();
        extractor.add_track(format, samples);
        extractor
    }

    fn loopback(options: LoopbackOptions) -> LoopbackCodec {
        LoopbackCodec::new("loopback.decoder", options)
    }

    fn run_pass<S: SampleSource>(
        session: &mut CodecSession<LoopbackCodec>,
        handler: &mut DecoderHandler<S>,
        mode: TestMode,
    ) -> Result<()> {
        let format = handler.format().clone();
        session.output.reset();
        session.reconfigure_codec(&format, mode, false)?;
        session.start()?;
        handler.seek_to(0, SeekMode::ClosestSync);
        session.do_work(handler, usize::MAX)?;
        session.queue_eos(handler)?;
        session.wait_for_all_outputs(handler)
    }

    #[test]
    fn flatten_layout() {
        let info = BufferInfo::new(
            3,
            0x0102,
            0x0a0b,
            BufferFlags::KEY_FRAME | BufferFlags::END_OF_STREAM,
        );
        assert_eq!(
            flatten_buffer_info(&info, true),
            vec![0, 0, 1, 2, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0x0a, 0x0b]
        );
        assert_eq!(flatten_buffer_info(&info, false).len(), 12);
    }

    #[test]
    fn sample_flags_mapping() {
        assert_eq!(buffer_flags(SampleFlags::SYNC), BufferFlags::KEY_FRAME);
        assert_eq!(
            buffer_flags(SampleFlags::SYNC.union(SampleFlags::PARTIAL_FRAME)),
            BufferFlags::KEY_FRAME | BufferFlags::PARTIAL_FRAME
        );
        assert_eq!(buffer_flags(SampleFlags::ENCRYPTED), BufferFlags::empty());
    }

    #[test]
    fn track_selection() {
        let handler =
            DecoderHandler::set_up_source(video_source(2), "VIDEO/X-VND.ON2.VP9", "clip_10bit.ivf")
                .unwrap();
        assert_eq!(handler.format().width(), Some(40));
        assert_eq!(
            handler.format().integer(KEY_COLOR_FORMAT),
            Some(COLOR_FORMAT_YUV_P010)
        );
        assert!(!handler.is_audio());
        assert!(!handler.is_interlaced());

        assert!(matches!(
            DecoderHandler::set_up_source(video_source(2), MIMETYPE_VIDEO_VP9, "a_interlaced_b"),
            Ok(h) if h.is_interlaced()
        ));
        assert!(matches!(
            DecoderHandler::set_up_source(video_source(2), "video/avc", "clip"),
            Err(HarnessError::NotApplicable(_))
        ));
        assert!(matches!(
            DecoderHandler::set_up_source(video_source(2), "text/vtt", "clip"),
            Err(HarnessError::NotApplicable(_))
        ));
    }

    #[test]
    fn audio_decode_to_memory() {
        let output = decode_to_memory(
            loopback(Default::default()),
            audio_source(5),
            MIMETYPE_AUDIO_AAC,
            "audio.aac",
            0,
            SeekMode::ClosestSync,
            usize::MAX,
        )
        .unwrap();

        // The loopback component passes audio through.
        let mut expected = audio_source(5);
        expected.select_track(0).unwrap();
        let mut bytes = vec![];
        loop {
            let mut buf = vec![0; expected.sample_size().unwrap()];
            expected.read_sample_data(&mut buf).unwrap();
            bytes.extend_from_slice(&buf);
            if !expected.advance() {
                break;
            }
        }
        assert_eq!(output.memory(), bytes.as_slice());
        assert_eq!(output.out_pts_list().len(), 5);
        assert_eq!(output.inp_pts_list(), output.out_pts_list());
    }

    #[test]
    fn frame_limit_stops_feeding() {
        let output = decode_to_memory(
            loopback(Default::default()),
            video_source(12),
            MIMETYPE_VIDEO_VP9,
            "video.ivf",
            0,
            SeekMode::ClosestSync,
            4,
        )
        .unwrap();
        assert_eq!(output.out_pts_list().len(), 4);
        assert_ne!(output.checksum_image_value(), OutputManager::new().checksum_image_value());
    }

    #[test]
    fn modes_produce_identical_output() {
        let reference = decode_to_memory(
            loopback(Default::default()),
            video_source(12),
            MIMETYPE_VIDEO_VP9,
            "video.ivf",
            0,
            SeekMode::ClosestSync,
            usize::MAX,
        )
        .unwrap();

        let mut handler =
            DecoderHandler::set_up_source(video_source(12), MIMETYPE_VIDEO_VP9, "video.ivf")
                .unwrap();
        let mut session = CodecSession::new(
            loopback(LoopbackOptions {
                reorder_depth: 2,
                semi_planar: true,
                ..Default::default()
            }),
            Default::default(),
        );

        for mode in TestMode::ALL {
            run_pass(&mut session, &mut handler, mode).unwrap();
            assert!(
                reference.equals(&mut session.output),
                "{}: {}",
                mode,
                session.diagnostics()
            );
        }
    }

    #[test]
    fn codec_config_is_not_counted() {
        let mut handler =
            DecoderHandler::set_up_source(audio_source(3), MIMETYPE_AUDIO_AAC, "audio.aac")
                .unwrap();
        assert_eq!(handler.csd_buffers().len(), 1);

        let mut session = CodecSession::new(loopback(Default::default()), Default::default());
        for mode in [TestMode::ALL[0], TestMode::ALL[3]] {
            let mut format = handler.format().clone();
            format.remove_key("csd-0");
            session.output.reset();
            session.reconfigure_codec(&format, mode, false).unwrap();
            session.start().unwrap();
            handler.queue_codec_config(&mut session).unwrap();
            handler.seek_to(0, SeekMode::ClosestSync);
            session.do_work(&mut handler, usize::MAX).unwrap();
            session.queue_eos(&mut handler).unwrap();
            session.wait_for_all_outputs(&mut handler).unwrap();
            assert_eq!(session.state.input_count, 3);
            assert_eq!(session.state.output_count, 3);
            assert_eq!(session.output.out_pts_list(), &[0, 21_333, 42_666]);
        }
    }

    #[test]
    fn dropped_frame_is_reported() {
        let mut handler =
            DecoderHandler::set_up_source(video_source(6), MIMETYPE_VIDEO_VP9, "video.ivf")
                .unwrap();
        let faults = Faults {
            drop_pts: Some(2 * FRAME_DURATION_US),
            ..Default::default()
        };
        let mut session = CodecSession::new(
            loopback(LoopbackOptions {
                faults,
                ..Default::default()
            }),
            Default::default(),
        );

        let err = run_pass(&mut session, &mut handler, TestMode::ALL[1]).unwrap_err();
        let HarnessError::Mismatch(message) = err else {
            panic!("expected a mismatch, got {:?}", err);
        };
        assert!(message.contains("not identical"));
        assert!(message.contains("dropped by the component: [66666 us]"));

        // Timestamps of interlaced content are not compared.
        let mut handler =
            DecoderHandler::set_up_source(video_source(6), MIMETYPE_VIDEO_VP9, "x_interlaced_y")
                .unwrap();
        run_pass(&mut session, &mut handler, TestMode::ALL[1]).unwrap();
    }

    #[test]
    fn duplicated_frame_is_not_increasing() {
        let mut handler =
            DecoderHandler::set_up_source(audio_source(4), MIMETYPE_AUDIO_AAC, "audio.aac")
                .unwrap();
        let faults = Faults {
            duplicate_pts: Some(21_333),
            ..Default::default()
        };
        let mut session = CodecSession::new(
            loopback(LoopbackOptions {
                faults,
                ..Default::default()
            }),
            Default::default(),
        );

        for mode in TestMode::ALL {
            let err = run_pass(&mut session, &mut handler, mode).unwrap_err();
            assert!(
                matches!(&err, HarnessError::Mismatch(m) if m.contains("strictly increasing")),
                "{}: {:?}",
                mode,
                err
            );
        }
    }
}
