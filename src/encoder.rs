// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoder side of the harness.
//!
//! [`EncoderHandler`] feeds raw material, PCM audio or planar YUV 4:2:0 frames, to an encoder
//! and records the compressed units it produces.

use anyhow::anyhow;
use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::codec::Codec;
use crate::harness::CodecSession;
use crate::harness::EosMode;
use crate::harness::HarnessConfig;
use crate::harness::HarnessError;
use crate::harness::Result;
use crate::harness::ScheduleMode;
use crate::harness::StreamHandler;
use crate::harness::TestMode;
use crate::media_format::MediaFormat;
use crate::media_format::COLOR_FORMAT_YUV420_FLEXIBLE;
use crate::media_format::COLOR_FORMAT_YUV_P010;
use crate::media_format::KEY_BIT_RATE;
use crate::media_format::KEY_CHANNEL_COUNT;
use crate::media_format::KEY_COLOR_FORMAT;
use crate::media_format::KEY_FRAME_RATE;
use crate::media_format::KEY_HEIGHT;
use crate::media_format::KEY_I_FRAME_INTERVAL;
use crate::media_format::KEY_MAX_B_FRAMES;
use crate::media_format::KEY_MIME;
use crate::media_format::KEY_PCM_ENCODING;
use crate::media_format::KEY_SAMPLE_RATE;
use crate::media_format::KEY_WIDTH;
use crate::output_manager::OutputManager;
use crate::output_manager::PcmEncoding;
use crate::BufferFlags;
use crate::BufferInfo;
use crate::Resolution;

/// Parameters specific to the kind of stream being encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamParams {
    Audio {
        sample_rate: u32,
        channel_count: u32,
        encoding: PcmEncoding,
    },
    Video {
        resolution: Resolution,
        /// Frames per second.
        frame_rate: u32,
        max_b_frames: u32,
        /// Seconds between key frames.
        key_frame_interval: f32,
        /// 8 or 10. 10-bit samples are stored in 16 bits.
        bit_depth: u32,
    },
}

/// Configuration of an encoding session.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub media_type: String,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    pub params: StreamParams,
}

impl EncoderConfig {
    pub fn audio(media_type: &str, bitrate: u32, sample_rate: u32, channel_count: u32) -> Self {
        Self {
            media_type: media_type.to_string(),
            bitrate,
            params: StreamParams::Audio {
                sample_rate,
                channel_count,
                encoding: PcmEncoding::Pcm16Bit,
            },
        }
    }

    /// 8-bit video at 30 frames per second with one key frame per second and no B-frames.
    pub fn video(media_type: &str, bitrate: u32, width: u32, height: u32) -> Self {
        Self {
            media_type: media_type.to_string(),
            bitrate,
            params: StreamParams::Video {
                resolution: Resolution::from((width, height)),
                frame_rate: 30,
                max_b_frames: 0,
                key_frame_interval: 1.0,
                bit_depth: 8,
            },
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.params, StreamParams::Audio { .. })
    }

    /// Size of one sample of raw input.
    pub fn bytes_per_sample(&self) -> usize {
        match &self.params {
            StreamParams::Audio { encoding, .. } => encoding.bytes_per_sample(),
            StreamParams::Video { bit_depth, .. } if *bit_depth > 8 => 2,
            StreamParams::Video { .. } => 1,
        }
    }

    pub fn max_b_frames(&self) -> u32 {
        match &self.params {
            StreamParams::Audio { .. } => 0,
            StreamParams::Video { max_b_frames, .. } => *max_b_frames,
        }
    }

    /// Format to configure the encoder with.
    pub fn format(&self) -> MediaFormat {
        let mut format = MediaFormat::new();
        format.set_string(KEY_MIME, &self.media_type);
        format.set_integer(KEY_BIT_RATE, self.bitrate as i32);

        match &self.params {
            StreamParams::Audio {
                sample_rate,
                channel_count,
                encoding,
            } => {
                format.set_integer(KEY_SAMPLE_RATE, *sample_rate as i32);
                format.set_integer(KEY_CHANNEL_COUNT, *channel_count as i32);
                format.set_integer(KEY_PCM_ENCODING, *encoding as i32);
            }
            StreamParams::Video {
                resolution,
                frame_rate,
                max_b_frames,
                key_frame_interval,
                bit_depth,
            } => {
                format.set_integer(KEY_WIDTH, resolution.width as i32);
                format.set_integer(KEY_HEIGHT, resolution.height as i32);
                format.set_integer(KEY_FRAME_RATE, *frame_rate as i32);
                format.set_float(KEY_I_FRAME_INTERVAL, *key_frame_interval);
                format.set_integer(KEY_MAX_B_FRAMES, *max_b_frames as i32);
                let color_format = if *bit_depth > 8 {
                    COLOR_FORMAT_YUV_P010
                } else {
                    COLOR_FORMAT_YUV420_FLEXIBLE
                };
                format.set_integer(KEY_COLOR_FORMAT, color_format);
            }
        }

        format
    }
}

pub struct EncoderHandler {
    config: EncoderConfig,
    input: Vec<u8>,
    /// Position of the next byte of `input` to feed.
    read_offset: usize,
    /// Bytes fed since the start of the pass or the last flush.
    bytes_submitted: usize,
    /// Timestamp of the first unit fed since the start of the pass or the last flush.
    offset_pts: i64,
    /// Number of units to feed when wrapping around `input`, if enabled.
    loop_back_limit: Option<usize>,
    info_list: Vec<BufferInfo>,
}

impl EncoderHandler {
    /// Creates a handler feeding `input`, raw material matching `config`.
    pub fn new(config: EncoderConfig, input: Vec<u8>) -> Result<Self> {
        if input.is_empty() {
            return Err(HarnessError::NotApplicable("empty raw input".into()));
        }
        match &config.params {
            StreamParams::Audio {
                sample_rate,
                channel_count,
                ..
            } if *sample_rate == 0 || *channel_count == 0 => {
                return Err(HarnessError::Other(anyhow!("invalid audio config {:?}", config)));
            }
            StreamParams::Video {
                resolution,
                frame_rate,
                ..
            } if resolution.get_area() == 0 || *frame_rate == 0 => {
                return Err(HarnessError::Other(anyhow!("invalid video config {:?}", config)));
            }
            _ => (),
        }

        Ok(Self {
            config,
            input,
            read_offset: 0,
            bytes_submitted: 0,
            offset_pts: 0,
            loop_back_limit: None,
            info_list: Vec::new(),
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Descriptions of the units mirrored into memory, with offsets into the mirror.
    pub fn info_list(&self) -> &[BufferInfo] {
        &self.info_list
    }

    /// Wraps around the input until `limit` units were fed, the last one flagged end of stream
    /// when it is signalled with the last frame.
    pub fn set_loop_back(&mut self, limit: Option<usize>) {
        self.loop_back_limit = limit;
    }

    /// Rewinds the input for a new pass.
    pub fn reset(&mut self) {
        self.read_offset = 0;
        self.bytes_submitted = 0;
        self.offset_pts = 0;
        self.info_list.clear();
    }

    /// Size of one raw video frame.
    fn frame_size(&self) -> usize {
        match &self.config.params {
            StreamParams::Video { resolution, .. } => {
                self.config.bytes_per_sample() * resolution.get_area() * 3 / 2
            }
            StreamParams::Audio { .. } => 0,
        }
    }

    /// Duration of `bytes` of raw audio, or of `frames` raw video frames, in microseconds.
    fn duration_us(&self, bytes: usize, frames: usize) -> i64 {
        match &self.config.params {
            StreamParams::Audio {
                sample_rate,
                channel_count,
                ..
            } => {
                let bytes_per_second = self.config.bytes_per_sample()
                    * *channel_count as usize
                    * *sample_rate as usize;
                (bytes as i64 * 1_000_000) / bytes_per_second as i64
            }
            StreamParams::Video { frame_rate, .. } => {
                (frames as i64 * 1_000_000) / *frame_rate as i64
            }
        }
    }

    /// Flushes the component and moves the timestamps of the units fed afterwards past those
    /// fed before, leaving a gap. In callback mode the session must be started again.
    pub fn flush<C: Codec>(&mut self, session: &mut CodecSession<C>) -> Result<()> {
        let input_count = session.state.input_count;
        session.flush_codec()?;

        self.offset_pts += if self.config.is_audio() {
            self.duration_us(self.bytes_submitted + 1024, 0)
        } else {
            self.duration_us(0, input_count + 5)
        };
        session.state.prev_output_pts = self.offset_pts - 1;
        self.bytes_submitted = 0;
        log::debug!("input timestamps restart at {} us", self.offset_pts);

        Ok(())
    }
}

impl<C: Codec> StreamHandler<C> for EncoderHandler {
    fn enqueue_input(&mut self, session: &mut CodecSession<C>, index: usize) -> Result<()> {
        if self.loop_back_limit.is_some() && self.read_offset >= self.input.len() {
            self.read_offset = 0;
        }
        if self.read_offset >= self.input.len() {
            return session.enqueue_eos(index);
        }

        let input_count = session.state.input_count;
        let buf = session.codec.input_buffer(index)?;
        let (size, pts) = match &self.config.params {
            StreamParams::Audio { channel_count, .. } => {
                let pts = self.offset_pts + self.duration_us(self.bytes_submitted, 0);
                let frame = self.config.bytes_per_sample() * *channel_count as usize;
                let size = buf.len().min(self.input.len() - self.read_offset);
                if size % frame != 0 {
                    return Err(HarnessError::Other(anyhow!(
                        "{} bytes of input are not a whole number of {} bytes audio frames",
                        size,
                        frame
                    )));
                }
                buf[..size].copy_from_slice(&self.input[self.read_offset..self.read_offset + size]);
                (size, pts)
            }
            StreamParams::Video { .. } => {
                let pts = self.offset_pts + self.duration_us(0, input_count);
                let size = self.frame_size();
                let frame = self
                    .input
                    .get(self.read_offset..self.read_offset + size)
                    .ok_or_else(|| anyhow!("received partial frame to encode"))?;
                let capacity = buf.len();
                buf.get_mut(..size)
                    .ok_or_else(|| {
                        anyhow!(
                            "frame of {} bytes exceeds the {} bytes input slot",
                            size,
                            capacity
                        )
                    })?
                    .copy_from_slice(frame);
                (size, pts)
            }
        };

        let mut flags = BufferFlags::empty();
        if session.state.signal_eos_with_last_frame {
            let is_last = match self.loop_back_limit {
                Some(limit) => input_count + 1 >= limit,
                None => self.read_offset + size >= self.input.len(),
            };
            if is_last {
                flags |= BufferFlags::END_OF_STREAM;
                session.state.saw_input_eos = true;
            }
        }
        self.read_offset += size;
        self.bytes_submitted += size;

        log::trace!(
            "input: slot {} size {} pts {} flags {:?}",
            index,
            size,
            pts,
            flags
        );
        session
            .codec
            .queue_input_buffer(index, BufferInfo::new(0, size, pts, flags))?;
        session.output.save_in_pts(pts);
        session.state.input_count += 1;

        Ok(())
    }

    fn dequeue_output(
        &mut self,
        session: &mut CodecSession<C>,
        index: usize,
        info: BufferInfo,
    ) -> Result<()> {
        log::trace!(
            "output: slot {} size {} pts {} flags {:?}",
            index,
            info.size,
            info.presentation_time_us,
            info.flags
        );
        if info.is_eos() {
            session.state.saw_output_eos = true;
        }

        if info.size > 0 {
            if session.output.mirror() {
                self.info_list.push(BufferInfo::new(
                    session.output.out_stream_size(),
                    info.size,
                    info.presentation_time_us,
                    info.flags,
                ));
                let buf = session.codec.output_buffer(index)?;
                session.output.save_to_memory(buf, &info)?;
            }
            if !info.is_codec_config() {
                session.output.save_out_pts(info.presentation_time_us);
                session.state.output_count += 1;
            }
        }
        session.codec.release_output_buffer(index)?;

        Ok(())
    }

    fn validate(&mut self, session: &mut CodecSession<C>) -> Result<()> {
        let max_b_frames = self.config.max_b_frames();
        let prev_output_pts = session.state.prev_output_pts;

        if (self.config.is_audio() || max_b_frames == 0)
            && !session.output.is_pts_strictly_increasing(prev_output_pts)
        {
            return Err(session.mismatch("output timestamps are not strictly increasing"));
        }

        if !self.config.is_audio()
            && !session
                .output
                .is_out_pts_list_identical_to_inp_pts_list(max_b_frames != 0)
        {
            return Err(session.mismatch("input pts list and output pts list are not identical"));
        }

        Ok(())
    }
}

/// Encodes `input` in synchronous mode with the end of stream signalled with the last frame and
/// the output mirrored into memory. Returns the fingerprint of the run and the description of
/// every unit in the mirror.
pub fn encode_to_memory<C: Codec>(
    codec: C,
    config: &EncoderConfig,
    input: Vec<u8>,
    frame_limit: usize,
) -> Result<(OutputManager, Vec<BufferInfo>)> {
    let mut handler = EncoderHandler::new(config.clone(), input)?;
    let mut session = CodecSession::new(
        codec,
        HarnessConfig {
            save_to_memory: true,
            ..Default::default()
        },
    );
    session.set_test_config("encode_to_memory", &config.media_type);

    let mode = TestMode::new(ScheduleMode::Synchronous, EosMode::WithLastFrame);
    session.configure_codec(&config.format(), mode, true)?;
    session.start()?;
    session.do_work(&mut handler, frame_limit)?;
    session.queue_eos(&mut handler)?;
    session.wait_for_all_outputs(&mut handler)?;
    session.stop()?;

    Ok((
        std::mem::take(&mut session.output),
        std::mem::take(&mut handler.info_list),
    ))
}

/// Generates `duration_ms` of interleaved 16-bit little endian PCM, one sine tone per channel.
pub fn generate_pcm(sample_rate: u32, channel_count: u32, duration_ms: u32) -> Vec<u8> {
    let frames = (sample_rate as usize * duration_ms as usize) / 1000;
    let samples = (0..frames)
        .flat_map(|n| {
            (0..channel_count).map(move |c| {
                let freq = 440.0 * (c + 1) as f64;
                let t = n as f64 / sample_rate as f64;
                (f64::sin(2.0 * std::f64::consts::PI * freq * t) * 0.5 * i16::MAX as f64) as i16
            })
        })
        .collect::<Vec<_>>();

    let mut pcm = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(&samples, &mut pcm);
    pcm
}

/// Picture with a dot moving along a Lissajous curve over a gradient. `t` is the phase in
/// radians and `set_pix` receives normalized Y, U, V values.
fn gen_test_frame<F>(frame_width: usize, frame_height: usize, t: f32, mut set_pix: F)
where
    F: FnMut(usize, usize, [f32; 3]),
{
    let width = frame_width as f32;
    let height = frame_height as f32;
    let (sin, cos) = f32::sin_cos(t);
    let (sin2, cos2) = (sin.powi(2), cos.powi(2));

    let dot_col = height * (1.1 + 2.0 * sin * cos) / 2.2;
    let dot_row = width * (1.1 + sin) / 2.2;
    let dot_size2 = (width.min(height) * 0.05).powi(2);

    for frame_row in 0..frame_height {
        for frame_col in 0..frame_width {
            let row = frame_row as f32;
            let col = frame_col as f32;

            let dist = (dot_col - col).powi(2) + (dot_row - row).powi(2);
            let y = if dist < dot_size2 {
                0.0
            } else {
                (row + col) / (width + height)
            };
            let (u, v) = if dist < dot_size2 {
                (0.5, 0.5)
            } else {
                ((row / width) * sin2, (col / height) * cos2)
            };

            set_pix(frame_col, frame_row, [y, u, v]);
        }
    }
}

/// Generates `frames` planar YUV 4:2:0 frames of even dimensions. 10-bit samples are stored
/// in the low bits of 16-bit little endian words.
pub fn generate_yuv_frames(width: usize, height: usize, frames: usize, bit_depth: u32) -> Vec<u8> {
    let bps = if bit_depth > 8 { 2 } else { 1 };
    let max_value = ((1u32 << bit_depth) - 1) as f32;
    let luma_size = width * height * bps;
    let chroma_size = luma_size / 4;
    let frame_size = luma_size + 2 * chroma_size;

    let mut raw = vec![0u8; frame_size * frames];
    for (i, frame) in raw.chunks_exact_mut(frame_size).enumerate() {
        let t = 2.0 * std::f32::consts::PI * i as f32 / frames as f32;
        gen_test_frame(width, height, t, |col, row, yuv| {
            let value = |c: f32| (c * max_value).clamp(0.0, max_value) as u16;
            let mut put = |pos: usize, c: f32| {
                if bps == 2 {
                    LittleEndian::write_u16(&mut frame[pos..pos + 2], value(c));
                } else {
                    frame[pos] = value(c) as u8;
                }
            };

            put((row * width + col) * bps, yuv[0]);
            // Subsample with upper left pixel
            if col % 2 == 0 && row % 2 == 0 {
                let chroma_pos = ((row / 2) * (width / 2) + col / 2) * bps;
                put(luma_size + chroma_pos, yuv[1]);
                put(luma_size + chroma_size + chroma_pos, yuv[2]);
            }
        });
    }

    raw
}

#[cfg(test)]
mod tests {
    use byteorder::BigEndian;

    use super::*;
    use crate::backend::loopback::LoopbackCodec;
    use crate::backend::loopback::LoopbackOptions;
    use crate::media_format::MIMETYPE_AUDIO_AAC;
    use crate::media_format::MIMETYPE_VIDEO_VP9;

    fn loopback_encoder(input_capacity: usize) -> LoopbackCodec {
        LoopbackCodec::new(
            "loopback.encoder",
            LoopbackOptions {
                input_capacity,
                ..Default::default()
            },
        )
    }

    fn video_config(max_b_frames: u32) -> EncoderConfig {
        let mut config = EncoderConfig::video(MIMETYPE_VIDEO_VP9, 512_000, 32, 16);
        if let StreamParams::Video {
            max_b_frames: b, ..
        } = &mut config.params
        {
            *b = max_b_frames;
        }
        config
    }

    fn run_pass(
        session: &mut CodecSession<LoopbackCodec>,
        handler: &mut EncoderHandler,
        mode: TestMode,
    ) -> Result<()> {
        let format = handler.config().format();
        handler.reset();
        session.output.reset();
        session.reconfigure_codec(&format, mode, true)?;
        session.start()?;
        session.do_work(handler, usize::MAX)?;
        session.queue_eos(handler)?;
        session.wait_for_all_outputs(handler)
    }

    #[test]
    fn formats() {
        let format = EncoderConfig::audio(MIMETYPE_AUDIO_AAC, 64_000, 48000, 2).format();
        assert_eq!(format.media_type(), Some(MIMETYPE_AUDIO_AAC));
        assert_eq!(format.integer(KEY_SAMPLE_RATE), Some(48000));
        assert_eq!(format.integer(KEY_PCM_ENCODING), Some(PcmEncoding::Pcm16Bit as i32));

        let config = video_config(2);
        let format = config.format();
        assert_eq!(format.integer(KEY_WIDTH), Some(32));
        assert_eq!(format.integer(KEY_FRAME_RATE), Some(30));
        assert_eq!(format.integer(KEY_MAX_B_FRAMES), Some(2));
        assert_eq!(format.float(KEY_I_FRAME_INTERVAL), Some(1.0));
        assert_eq!(
            format.integer(KEY_COLOR_FORMAT),
            Some(COLOR_FORMAT_YUV420_FLEXIBLE)
        );
        assert_eq!(config.bytes_per_sample(), 1);
    }

    #[test]
    fn generated_material_sizes() {
        assert_eq!(generate_pcm(8000, 2, 100).len(), 800 * 2 * 2);
        assert_eq!(generate_yuv_frames(32, 16, 3, 8).len(), 32 * 16 * 3 / 2 * 3);

        let p010 = generate_yuv_frames(4, 4, 1, 10);
        assert_eq!(p010.len(), 4 * 4 * 3);
        assert!(p010
            .chunks_exact(2)
            .all(|s| LittleEndian::read_u16(s) <= 0x3ff));
    }

    #[test]
    fn audio_encode_to_memory() {
        let config = EncoderConfig::audio(MIMETYPE_AUDIO_AAC, 64_000, 48000, 2);
        let pcm = generate_pcm(48000, 2, 100);
        let (output, infos) = encode_to_memory(loopback_encoder(4096), &config, pcm, usize::MAX)
            .unwrap();

        // Codec config, then one unit per 4096 bytes of input.
        assert_eq!(infos.len(), 6);
        assert!(infos[0].is_codec_config());
        assert_eq!(
            output.inp_pts_list(),
            &[0, 21_333, 42_666, 64_000, 85_333]
        );
        for info in &infos[1..] {
            let unit = &output.memory()[info.offset..info.offset + info.size];
            assert_eq!(BigEndian::read_i64(&unit[8..16]), info.presentation_time_us);
        }
        let last = infos[5];
        assert_eq!(last.offset + last.size, output.out_stream_size());
    }

    #[test]
    fn audio_input_must_be_whole_frames() {
        let config = EncoderConfig::audio(MIMETYPE_AUDIO_AAC, 64_000, 8000, 2);
        let mut pcm = generate_pcm(8000, 2, 10);
        pcm.push(0);
        assert!(matches!(
            encode_to_memory(loopback_encoder(4096), &config, pcm, usize::MAX),
            Err(HarnessError::Other(_))
        ));
    }

    #[test]
    fn partial_video_frame_is_an_error() {
        let config = video_config(0);
        let mut raw = generate_yuv_frames(32, 16, 2, 8);
        raw.truncate(raw.len() - 10);
        assert!(matches!(
            encode_to_memory(loopback_encoder(0), &config, raw, usize::MAX),
            Err(HarnessError::Other(_))
        ));
    }

    #[test]
    fn b_frames_across_modes() {
        let config = video_config(2);
        let raw = generate_yuv_frames(32, 16, 12, 8);
        let (reference, infos) =
            encode_to_memory(loopback_encoder(0), &config, raw.clone(), usize::MAX).unwrap();

        // Validation sorts the output list, the info list keeps the delivery order.
        let delivered = infos
            .iter()
            .filter(|info| info.is_payload())
            .map(|info| info.presentation_time_us)
            .collect::<Vec<_>>();
        assert_eq!(delivered.len(), 12);
        assert!(delivered.windows(2).any(|w| w[0] > w[1]), "{:?}", delivered);
        let mut sorted = delivered.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, reference.inp_pts_list());

        let mut handler = EncoderHandler::new(config, raw).unwrap();
        let mut session = CodecSession::new(
            loopback_encoder(0),
            HarnessConfig {
                save_to_memory: true,
                ..Default::default()
            },
        );
        for mode in TestMode::ALL {
            run_pass(&mut session, &mut handler, mode).unwrap();
            assert!(
                reference.equals(&mut session.output),
                "{}: {}",
                mode,
                session.diagnostics()
            );
            assert!(reference.equals_byte_output(&mut session.output));
        }
    }

    #[test]
    fn loop_back_feeds_up_to_the_limit() {
        let config = video_config(0);
        let mut handler = EncoderHandler::new(config, generate_yuv_frames(32, 16, 3, 8)).unwrap();
        handler.set_loop_back(Some(7));
        let mut session = CodecSession::new(loopback_encoder(0), Default::default());

        let format = handler.config().format();
        let mode = TestMode::new(ScheduleMode::Synchronous, EosMode::WithLastFrame);
        session.configure_codec(&format, mode, true).unwrap();
        session.start().unwrap();
        session.do_work(&mut handler, 7).unwrap();
        session.queue_eos(&mut handler).unwrap();
        session.wait_for_all_outputs(&mut handler).unwrap();

        assert_eq!(session.state.input_count, 7);
        assert_eq!(session.output.out_pts_list().last(), Some(&(6 * 1_000_000 / 30)));
    }

    #[test]
    fn timestamps_continue_after_flush() {
        let config = video_config(0);
        let raw = generate_yuv_frames(32, 16, 10, 8);
        let mut handler = EncoderHandler::new(config, raw).unwrap();
        let mut session = CodecSession::new(loopback_encoder(0), Default::default());

        for mode in TestMode::ALL {
            let format = handler.config().format();
            handler.reset();
            session.output.reset();
            session.reconfigure_codec(&format, mode, true).unwrap();
            session.start().unwrap();
            session.do_work(&mut handler, 4).unwrap();

            handler.flush(&mut session).unwrap();
            assert_eq!(session.state.prev_output_pts, 9 * 1_000_000 / 30 - 1);
            if mode.is_async() {
                session.start().unwrap();
            }
            session.output.reset();
            session.do_work(&mut handler, usize::MAX).unwrap();
            session.queue_eos(&mut handler).unwrap();
            session.wait_for_all_outputs(&mut handler).unwrap();

            assert_eq!(session.output.inp_pts_list().len(), 6);
            assert_eq!(
                session.output.inp_pts_list().first(),
                Some(&(9 * 1_000_000 / 30))
            );
        }
    }
}
