// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Batched decoding of audio access units.
//!
//! Components supporting multiple frames accept several access units packed into one input slot
//! and return several decoded units per output slot. Their output must be byte identical to the
//! one of a regular pass.

use anyhow::anyhow;

use crate::codec::Codec;
use crate::decoder::buffer_flags;
use crate::decoder::decode_to_memory;
use crate::decoder::DecoderHandler;
use crate::extractor::SampleSource;
use crate::extractor::SeekMode;
use crate::harness::CodecSession;
use crate::harness::DriveState;
use crate::harness::EosMode;
use crate::harness::HarnessConfig;
use crate::harness::HarnessError;
use crate::harness::Result;
use crate::harness::ScheduleMode;
use crate::harness::StreamHandler;
use crate::harness::TestMode;
use crate::media_format::MediaFormat;
use crate::media_format::KEY_BUFFER_BATCH_MAX_OUTPUT_SIZE;
use crate::media_format::KEY_BUFFER_BATCH_THRESHOLD_OUTPUT_SIZE;
use crate::media_format::KEY_CHANNEL_COUNT;
use crate::media_format::KEY_MAX_INPUT_SIZE;
use crate::media_format::KEY_PCM_ENCODING;
use crate::media_format::KEY_SAMPLE_RATE;
use crate::media_format::MIMETYPE_AUDIO_FLAC;
use crate::media_format::MIMETYPE_AUDIO_RAW;
use crate::output_manager::OutputManager;
use crate::output_manager::PcmEncoding;
use crate::BufferFlags;
use crate::BufferInfo;

/// Maximum batch duration and batch threshold duration, in milliseconds, of the configurations
/// exercised by [`verify_multiple_access_units`].
pub const OUT_SIZE_IN_MS: [(usize, usize); 5] =
    [(1000, 250), (1000, 100), (500, 20), (100, 100), (40, 100)];

/// Expected ratio between the compressed and decoded sizes of `media_type`.
pub fn compression_ratio(media_type: &str) -> f64 {
    match media_type {
        MIMETYPE_AUDIO_FLAC => 0.7,
        "audio/g711-mlaw" | "audio/g711-alaw" | "audio/gsm" => 0.5,
        MIMETYPE_AUDIO_RAW => 1.0,
        _ => 0.1,
    }
}

/// Size of the largest access unit of the selected track. The source is left at its start.
pub fn max_sample_size<S: SampleSource>(source: &mut S) -> usize {
    let mut max = 0;
    source.seek_to(0, SeekMode::PreviousSync);
    while let Some(size) = source.sample_size() {
        max = max.max(size);
        if !source.advance() {
            break;
        }
    }
    source.seek_to(0, SeekMode::PreviousSync);

    max
}

/// Returns `format` with the input and batch sizes for batches of at most `max_output_ms` of
/// decoded audio, delivered once `threshold_ms` are available.
pub fn batching_format(
    format: &MediaFormat,
    max_sample_size: usize,
    max_output_ms: usize,
    threshold_ms: usize,
) -> anyhow::Result<MediaFormat> {
    let media_type = format
        .media_type()
        .ok_or_else(|| anyhow!("format {} has no media type", format))?;
    let positive = |key: &str| match format.integer(key) {
        Some(value) if value > 0 => Ok(value as usize),
        _ => Err(anyhow!("format {} has no valid {}", format, key)),
    };
    let sample_rate = positive(KEY_SAMPLE_RATE)?;
    let channel_count = positive(KEY_CHANNEL_COUNT)?;
    let encoding = format
        .integer(KEY_PCM_ENCODING)
        .map(|e| PcmEncoding::n(e).ok_or_else(|| anyhow!("unknown pcm encoding {}", e)))
        .transpose()?
        .unwrap_or(PcmEncoding::Pcm16Bit);

    let bytes_per_ms = encoding.bytes_per_sample() * sample_rate * channel_count;
    let max_output_size = max_output_ms * bytes_per_ms / 1000;
    let threshold_output_size = threshold_ms * bytes_per_ms / 1000;
    let max_input_size =
        max_sample_size.max((max_output_size as f64 * compression_ratio(media_type)) as usize);

    let mut format = format.clone();
    format.set_integer(KEY_MAX_INPUT_SIZE, max_input_size as i32);
    format.set_integer(KEY_BUFFER_BATCH_MAX_OUTPUT_SIZE, max_output_size as i32);
    format.set_integer(
        KEY_BUFFER_BATCH_THRESHOLD_OUTPUT_SIZE,
        threshold_output_size as i32,
    );

    Ok(format)
}

/// Packs the consecutive access units of `source` spanning at most `max_input_limit_ms` into
/// `buf`. Returns their descriptions and whether end of stream was flagged on the last one.
fn pack_access_units<S: SampleSource>(
    source: &mut S,
    buf: &mut [u8],
    max_input_limit_ms: i64,
    eos_with_last_frame: bool,
) -> anyhow::Result<(Vec<BufferInfo>, bool)> {
    let mut infos = Vec::new();
    let mut offset = 0;
    let base_pts = source.sample_time().unwrap_or(0);

    while let Some(size) = source.sample_size() {
        if size == 0 {
            break;
        }
        let pts = source.sample_time().unwrap_or(0);
        let delta = pts - base_pts;
        if delta < 0 {
            return Err(anyhow!(
                "access unit at {} us precedes the first unit of the batch at {} us",
                pts,
                base_pts
            ));
        }
        if delta / 1000 > max_input_limit_ms {
            break;
        }
        if offset + size > buf.len() {
            if offset == 0 {
                return Err(anyhow!(
                    "access unit size {} exceeds capacity of the buffer {}",
                    size,
                    buf.len()
                ));
            }
            break;
        }

        source.read_sample_data(&mut buf[offset..])?;
        let mut flags = buffer_flags(source.sample_flags());
        if !source.advance() && eos_with_last_frame {
            flags |= BufferFlags::END_OF_STREAM;
            infos.push(BufferInfo::new(offset, size, pts, flags));
            return Ok((infos, true));
        }
        infos.push(BufferInfo::new(offset, size, pts, flags));
        offset += size;
    }

    Ok((infos, false))
}

pub struct MultiAccessUnitHandler<S: SampleSource> {
    decoder: DecoderHandler<S>,
    max_input_limit_ms: i64,
    max_output_size: usize,
}

impl<S: SampleSource> MultiAccessUnitHandler<S> {
    pub fn new(decoder: DecoderHandler<S>) -> Self {
        Self {
            decoder,
            max_input_limit_ms: 0,
            max_output_size: 0,
        }
    }

    pub fn decoder(&self) -> &DecoderHandler<S> {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut DecoderHandler<S> {
        &mut self.decoder
    }

    /// Starts a new pass feeding batches of at most `limit_ms` of input.
    pub fn set_max_input_limit_ms(&mut self, limit_ms: i64) {
        self.max_input_limit_ms = limit_ms;
        self.max_output_size = 0;
    }
}

impl<C: Codec, S: SampleSource> StreamHandler<C> for MultiAccessUnitHandler<S> {
    fn enqueue_input(&mut self, session: &mut CodecSession<C>, index: usize) -> Result<()> {
        if self.decoder.source().sample_size().is_none() {
            return session.enqueue_eos(index);
        }

        let eos_with_last_frame = session.state.signal_eos_with_last_frame;
        let buf = session.codec.input_buffer(index)?;
        let (infos, saw_eos) = pack_access_units(
            self.decoder.source_mut(),
            buf,
            self.max_input_limit_ms,
            eos_with_last_frame,
        )?;
        if saw_eos {
            session.state.saw_input_eos = true;
        }
        if infos.is_empty() {
            log::warn!("input slot {}: no access unit to queue", index);
            return Ok(());
        }

        session.codec.queue_input_buffers(index, &infos)?;
        for info in infos.iter().filter(|info| info.is_payload()) {
            session.output.save_in_pts(info.presentation_time_us);
            session.state.input_count += 1;
        }
        log::trace!("input: slot {} with {} access units", index, infos.len());

        Ok(())
    }

    fn dequeue_output(
        &mut self,
        session: &mut CodecSession<C>,
        index: usize,
        info: BufferInfo,
    ) -> Result<()> {
        self.dequeue_outputs(session, index, vec![info])
    }

    fn dequeue_outputs(
        &mut self,
        session: &mut CodecSession<C>,
        index: usize,
        infos: Vec<BufferInfo>,
    ) -> Result<()> {
        if session.state.output_count == 0 {
            let format = session.codec.output_format_for(index)?;
            match format.integer(KEY_BUFFER_BATCH_MAX_OUTPUT_SIZE) {
                Some(max) if max > 0 => self.max_output_size = max as usize,
                _ => {
                    return Err(session.mismatch(&format!(
                        "output format {} does not contain key {}",
                        format, KEY_BUFFER_BATCH_MAX_OUTPUT_SIZE
                    )))
                }
            }
        }

        let mut total_size = 0;
        let buf = session.codec.output_buffer(index)?;
        for info in &infos {
            if info.size > 0 && session.output.mirror() {
                session.output.save_to_memory(buf, info)?;
            }
            if info.is_eos() {
                session.state.saw_output_eos = true;
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
            total_size += info.size;
        }

        if total_size > self.max_output_size {
            return Err(session.mismatch(&format!(
                "sum of all info sizes {} exceeds max output size {}",
                total_size, self.max_output_size
            )));
        }
        session.codec.release_output_buffer(index)?;

        Ok(())
    }

    fn frame_limit_reached(&self, state: &DriveState, _enqueued: usize, limit: usize) -> bool {
        state.input_count >= limit
    }

    fn validate(&mut self, session: &mut CodecSession<C>) -> Result<()> {
        StreamHandler::<C>::validate(&mut self.decoder, session)
    }
}

fn mirrored_output() -> OutputManager {
    let mut output = OutputManager::new();
    output.set_mirror(true);
    output
}

/// Decodes the audio track carrying `media_type` with access units fed in batches, for every
/// configuration of [`OUT_SIZE_IN_MS`] and both end of stream modes, and checks that the decoded
/// bytes match those of a regular pass. `new_codec` and `new_source` must return fresh
/// instances of the component under test and of the stream.
pub fn verify_multiple_access_units<C, S, F, G>(
    mut new_codec: F,
    mut new_source: G,
    media_type: &str,
    stream_name: &str,
) -> Result<()>
where
    C: Codec,
    S: SampleSource,
    F: FnMut() -> C,
    G: FnMut() -> anyhow::Result<S>,
{
    let reference = decode_to_memory(
        new_codec(),
        new_source()?,
        media_type,
        stream_name,
        0,
        SeekMode::ClosestSync,
        usize::MAX,
    )?;

    let mut decoder = DecoderHandler::set_up_source(new_source()?, media_type, stream_name)?;
    if !decoder.is_audio() {
        return Err(HarnessError::NotApplicable(format!(
            "multiple access units are only exercised on audio, not {}",
            media_type
        )));
    }
    let max_sample_size = max_sample_size(decoder.source_mut());
    let mut handler = MultiAccessUnitHandler::new(decoder);

    let mut session = CodecSession::new(
        new_codec(),
        HarnessConfig {
            save_to_memory: true,
            ..Default::default()
        },
    );
    session.set_test_config("verify_multiple_access_units", stream_name);

    for (max_output_ms, threshold_ms) in OUT_SIZE_IN_MS {
        let format = batching_format(
            handler.decoder().format(),
            max_sample_size,
            max_output_ms,
            threshold_ms,
        )?;

        let mut outputs = Vec::with_capacity(2);
        for eos in [EosMode::WithLastFrame, EosMode::Separate] {
            session.output = mirrored_output();
            session.configure_codec(
                &format,
                TestMode::new(ScheduleMode::Asynchronous, eos),
                false,
            )?;
            handler.set_max_input_limit_ms(max_output_ms as i64);
            session.start()?;
            handler.decoder_mut().seek_to(0, SeekMode::ClosestSync);
            session.do_work(&mut handler, usize::MAX)?;
            session.queue_eos(&mut handler)?;
            session.wait_for_all_outputs(&mut handler)?;
            session.codec.reset()?;

            if !reference.equals_byte_output(&mut session.output) {
                return Err(session.mismatch(&format!(
                    "output of {} ms batches differs from the output of a regular pass",
                    max_output_ms
                )));
            }
            outputs.push(std::mem::take(&mut session.output));
        }

        if let [test_a, test_b] = outputs.as_mut_slice() {
            if !test_a.equals(test_b) {
                session.output = std::mem::take(test_b);
                return Err(session.mismatch(&format!(
                    "output of {} ms batches is not consistent across runs",
                    max_output_ms
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::loopback::LoopbackCodec;
    use crate::backend::loopback::LoopbackOptions;
    use crate::decoder::tests::audio_source;
    use crate::decoder::tests::video_source;
    use crate::extractor::MemoryExtractor;
    use crate::extractor::Sample;
    use crate::extractor::SampleFlags;
    use crate::media_format::MIMETYPE_AUDIO_AAC;
    use crate::media_format::MIMETYPE_VIDEO_VP9;

    fn loopback(multiple_frames: bool) -> LoopbackCodec {
        LoopbackCodec::new(
            "loopback.audio.decoder",
            LoopbackOptions {
                multiple_frames,
                ..Default::default()
            },
        )
    }

    #[test]
    fn batch_sizes() {
        let format = MediaFormat::new_audio(MIMETYPE_AUDIO_AAC, 48000, 2);
        let batched = batching_format(&format, 1000, 1000, 250).unwrap();
        assert_eq!(batched.integer(KEY_BUFFER_BATCH_MAX_OUTPUT_SIZE), Some(192_000));
        assert_eq!(batched.integer(KEY_BUFFER_BATCH_THRESHOLD_OUTPUT_SIZE), Some(48_000));
        assert_eq!(batched.integer(KEY_MAX_INPUT_SIZE), Some(19_200));

        // The largest access unit always fits.
        let batched = batching_format(&format, 30_000, 40, 100).unwrap();
        assert_eq!(batched.integer(KEY_MAX_INPUT_SIZE), Some(30_000));

        let mut format = MediaFormat::new_audio(MIMETYPE_AUDIO_RAW, 16000, 1);
        format.set_integer(KEY_PCM_ENCODING, PcmEncoding::PcmFloat as i32);
        let batched = batching_format(&format, 0, 100, 20).unwrap();
        assert_eq!(batched.integer(KEY_BUFFER_BATCH_MAX_OUTPUT_SIZE), Some(6400));
        assert_eq!(batched.integer(KEY_MAX_INPUT_SIZE), Some(6400));

        assert!(batching_format(&MediaFormat::new(), 0, 100, 20).is_err());
    }

    #[test]
    fn ratios() {
        assert_eq!(compression_ratio(MIMETYPE_AUDIO_FLAC), 0.7);
        assert_eq!(compression_ratio("audio/gsm"), 0.5);
        assert_eq!(compression_ratio(MIMETYPE_AUDIO_RAW), 1.0);
        assert_eq!(compression_ratio(MIMETYPE_AUDIO_AAC), 0.1);
    }

    #[test]
    fn largest_sample() {
        let mut source = video_source(6);
        source.select_track(1).unwrap();
        assert_eq!(max_sample_size(&mut source), 21);
        assert_eq!(source.sample_time(), Some(0));
    }

    #[test]
    fn packing_respects_limits() {
        let samples = (0..6)
            .map(|i| Sample::new(vec![i as u8; 10], i * 20_000, SampleFlags::SYNC))
            .collect();
        let mut source = MemoryExtractor::new();
        source.add_track(MediaFormat::new_audio(MIMETYPE_AUDIO_RAW, 8000, 1), samples);
        source.select_track(0).unwrap();

        let mut buf = vec![0; 25];
        let (infos, eos) = pack_access_units(&mut source, &mut buf, 100, true).unwrap();
        assert!(!eos);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[1].offset, 10);
        assert_eq!(&buf[10..20], &[1; 10]);

        let mut buf = vec![0; 100];
        let (infos, eos) = pack_access_units(&mut source, &mut buf, 30, true).unwrap();
        assert!(!eos);
        assert_eq!(
            infos.iter().map(|i| i.presentation_time_us).collect::<Vec<_>>(),
            vec![40_000, 60_000]
        );

        let (infos, eos) = pack_access_units(&mut source, &mut buf, 100, true).unwrap();
        assert!(eos);
        assert!(infos[1].is_eos());
        assert_eq!(infos[1].flags.difference(BufferFlags::END_OF_STREAM), BufferFlags::KEY_FRAME);

        source.seek_to(0, SeekMode::ClosestSync);
        let mut buf = vec![0; 5];
        assert!(pack_access_units(&mut source, &mut buf, 100, true).is_err());
    }

    #[test]
    fn batched_output_matches_regular_output() {
        verify_multiple_access_units(
            || loopback(true),
            || Ok(audio_source(40)),
            MIMETYPE_AUDIO_AAC,
            "audio.aac",
        )
        .unwrap();
    }

    #[test]
    fn missing_batch_support_is_reported() {
        let err = verify_multiple_access_units(
            || loopback(false),
            || Ok(audio_source(4)),
            MIMETYPE_AUDIO_AAC,
            "audio.aac",
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::Codec(_)), "{:?}", err);
    }

    #[test]
    fn video_is_not_applicable() {
        let err = verify_multiple_access_units(
            || loopback(true),
            || Ok(video_source(4)),
            MIMETYPE_VIDEO_VP9,
            "video.ivf",
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::NotApplicable(_)), "{:?}", err);
    }
}
