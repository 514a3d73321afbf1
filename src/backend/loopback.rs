// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-process component that derives its output from its input without any real coding.
//!
//! As a decoder it renders every access unit into a padded YUV 4:2:0 image whose content depends
//! only on the bytes of the unit, or passes audio units through. As an encoder it emits a codec
//! configuration unit followed by one small digest per input unit. Output only depends on what
//! was queued, never on how the component was driven, which makes it a reference point for the
//! harness. Faults can be injected to check that the harness notices them.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use crc32fast::Hasher;

use crate::codec::Codec;
use crate::codec::CodecCallback;
use crate::codec::CodecError;
use crate::codec::CodecResult;
use crate::codec::DequeuedOutput;
use crate::codec::ImageLayout;
use crate::codec::VideoImage;
use crate::media_format::media_kind;
use crate::media_format::MediaFormat;
use crate::media_format::MediaKind;
use crate::media_format::COLOR_FORMAT_YUV420_FLEXIBLE;
use crate::media_format::KEY_BUFFER_BATCH_MAX_OUTPUT_SIZE;
use crate::media_format::KEY_BUFFER_BATCH_THRESHOLD_OUTPUT_SIZE;
use crate::media_format::KEY_CHANNEL_COUNT;
use crate::media_format::KEY_COLOR_FORMAT;
use crate::media_format::KEY_CROP_BOTTOM;
use crate::media_format::KEY_CROP_LEFT;
use crate::media_format::KEY_CROP_RIGHT;
use crate::media_format::KEY_CROP_TOP;
use crate::media_format::KEY_FRAME_RATE;
use crate::media_format::KEY_HEIGHT;
use crate::media_format::KEY_I_FRAME_INTERVAL;
use crate::media_format::KEY_MAX_B_FRAMES;
use crate::media_format::KEY_MAX_INPUT_SIZE;
use crate::media_format::KEY_PCM_ENCODING;
use crate::media_format::KEY_SAMPLE_RATE;
use crate::media_format::KEY_SLICE_HEIGHT;
use crate::media_format::KEY_STRIDE;
use crate::media_format::KEY_WIDTH;
use crate::media_format::MIMETYPE_AUDIO_RAW;
use crate::media_format::MIMETYPE_VIDEO_RAW;
use crate::output_manager::PcmEncoding;
use crate::utils::align_up;
use crate::utils::byte_array_to_hex_string;
use crate::BufferFlags;
use crate::BufferInfo;

pub const DEFAULT_INPUT_CAPACITY: usize = 64 * 1024;
const STRIDE_ALIGNMENT: usize = 16;
const CONFIG_MAGIC: &[u8; 4] = b"LBCF";
const DIGEST_SIZE: usize = 16;

/// Misbehaviors the component can be asked to exhibit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Faults {
    /// Report an error instead of processing any access unit past the first `n`.
    pub fail_after_inputs: Option<usize>,
    /// Never emit the output carrying this timestamp.
    pub drop_pts: Option<i64>,
    /// Emit the output carrying this timestamp twice.
    pub duplicate_pts: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub input_slots: usize,
    pub output_slots: usize,
    /// Size of the input slots unless the format sets `max-input-size`.
    pub input_capacity: usize,
    /// Number of decoded frames held back before the earliest one is output.
    pub reorder_depth: usize,
    /// Output NV12 images instead of I420.
    pub semi_planar: bool,
    /// Accept batched input and batch output when the format asks for it in callback mode.
    pub multiple_frames: bool,
    pub faults: Faults,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            input_slots: 4,
            output_slots: 4,
            input_capacity: DEFAULT_INPUT_CAPACITY,
            reorder_depth: 0,
            semi_planar: false,
            multiple_frames: true,
            faults: Default::default(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum LoopbackState {
    Uninitialized,
    Configured,
    Running,
    /// Flushed in callback mode, waiting for `start` to announce input slots again.
    Flushed,
    // Note that on Error, stop() or reset() must be called before the component can be
    // configured again.
    Error,
    Released,
}

enum Message {
    InputAvailable(usize),
    OutputAvailable(usize, BufferInfo),
    OutputsAvailable(usize, Vec<BufferInfo>),
    FormatChanged(MediaFormat),
    Error(String),
    /// Acknowledged once every message sent before it has been delivered.
    Barrier(SyncSender<()>),
}

fn callback_loop(callback: Arc<dyn CodecCallback>, receiver: Receiver<Message>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::InputAvailable(index) => callback.on_input_buffer_available(index),
            Message::OutputAvailable(index, info) => {
                callback.on_output_buffer_available(index, info)
            }
            Message::OutputsAvailable(index, infos) => {
                callback.on_output_buffers_available(index, infos)
            }
            Message::FormatChanged(format) => callback.on_output_format_changed(format),
            Message::Error(description) => callback.on_error(&description),
            Message::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    log::trace!("callback thread exiting");
}

/// A unit produced by the component, not yet written into an output slot.
#[derive(Debug, Clone)]
struct Unit {
    data: Vec<u8>,
    pts: i64,
    flags: BufferFlags,
}

impl Unit {
    fn eos(pts: i64) -> Self {
        Self {
            data: vec![],
            pts,
            flags: BufferFlags::END_OF_STREAM,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum Owner {
    Component,
    /// Filled, waiting to be dequeued in polling mode.
    Ready,
    Client,
}

struct InputSlot {
    data: Vec<u8>,
    owner: Owner,
}

struct OutputSlot {
    data: Vec<u8>,
    infos: Vec<BufferInfo>,
    owner: Owner,
}

#[derive(Debug, Clone, Copy)]
struct BatchLimits {
    max_output_size: usize,
    threshold_output_size: usize,
}

/// Parameters of the configured stream.
struct StreamConfig {
    is_encoder: bool,
    is_async: bool,
    layout: Option<ImageLayout>,
    output_format: MediaFormat,
    batch: Option<BatchLimits>,
    max_b_frames: usize,
    gop_size: usize,
    config_unit: Vec<u8>,
}

pub struct LoopbackCodec {
    name: String,
    options: LoopbackOptions,
    state: LoopbackState,
    stream: Option<StreamConfig>,
    callback: Option<Arc<dyn CodecCallback>>,
    sender: Option<Sender<Message>>,
    worker_thread: Option<JoinHandle<()>>,
    inputs: Vec<InputSlot>,
    outputs: Vec<OutputSlot>,
    /// Groups of units waiting for a free output slot.
    pending: VecDeque<Vec<Unit>>,
    /// Output slots filled in polling mode, in the order they were filled.
    ready: VecDeque<usize>,
    /// Frames held back for reordering.
    held: Vec<Unit>,
    partial: Vec<u8>,
    batch: Vec<Unit>,
    format_announced: bool,
    units_received: usize,
    eos_received: usize,
    frames_coded: usize,
    config_emitted: bool,
}

impl LoopbackCodec {
    pub fn new(name: &str, options: LoopbackOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            state: LoopbackState::Uninitialized,
            stream: None,
            callback: None,
            sender: None,
            worker_thread: None,
            inputs: vec![],
            outputs: vec![],
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            held: vec![],
            partial: vec![],
            batch: vec![],
            format_announced: false,
            units_received: 0,
            eos_received: 0,
            frames_coded: 0,
            config_emitted: false,
        }
    }

    /// Number of end-of-stream inputs received since the last `configure`.
    pub fn eos_received(&self) -> usize {
        self.eos_received
    }

    fn check_state(&self, allowed: &[LoopbackState], operation: &str) -> CodecResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CodecError::InvalidState(format!(
                "{} called on {} in state {:?}",
                operation, self.name, self.state
            )))
        }
    }

    fn stream(&self) -> CodecResult<&StreamConfig> {
        self.stream
            .as_ref()
            .ok_or_else(|| CodecError::InvalidState(format!("{} is not configured", self.name)))
    }

    fn is_async(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| s.is_async)
    }

    fn check_polling(&self, operation: &str) -> CodecResult<()> {
        if self.is_async() {
            return Err(CodecError::InvalidState(format!(
                "{} is not allowed in callback mode",
                operation
            )));
        }
        self.check_state(&[LoopbackState::Running], operation)
    }

    fn post(&self, message: Message) {
        if let Some(sender) = &self.sender {
            if sender.send(message).is_err() {
                log::warn!("{}: callback thread is gone", self.name);
            }
        }
    }

    fn spawn_worker(&mut self) -> CodecResult<()> {
        let Some(callback) = self.callback.as_ref().map(Arc::clone) else {
            return Ok(());
        };
        if self.worker_thread.is_some() {
            return Ok(());
        }

        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("{}-callback", self.name))
            .spawn(move || callback_loop(callback, receiver))
            .map_err(|e| CodecError::Other(e.into()))?;
        self.sender = Some(sender);
        self.worker_thread = Some(handle);

        Ok(())
    }

    fn shutdown_worker(&mut self) {
        // Dropping the sender ends the callback loop once the queued messages are delivered.
        self.sender = None;
        if let Some(handle) = self.worker_thread.take() {
            if handle.join().is_err() {
                log::error!("{}: callback thread panicked", self.name);
            }
        }
    }

    /// Waits until every message posted so far has been delivered.
    fn barrier(&self) {
        if self.sender.is_none() {
            return;
        }
        let (done, wait) = mpsc::sync_channel(1);
        self.post(Message::Barrier(done));
        let _ = wait.recv();
    }

    /// Forgets everything in flight and returns all the slots to the component.
    fn clear_runtime(&mut self) {
        self.pending.clear();
        self.ready.clear();
        self.held.clear();
        self.partial.clear();
        self.batch.clear();
        self.frames_coded = 0;
        for slot in &mut self.inputs {
            slot.owner = Owner::Component;
        }
        for slot in &mut self.outputs {
            slot.owner = Owner::Component;
            slot.infos.clear();
        }
    }

    fn fail(&mut self, description: String) {
        log::warn!("{}: {}", self.name, description);
        self.state = LoopbackState::Error;
        self.post(Message::Error(description));
    }

    /// Announces every free input slot in callback mode.
    fn announce_inputs(&mut self) {
        if !self.is_async() || self.state != LoopbackState::Running {
            return;
        }
        for index in 0..self.inputs.len() {
            if self.inputs[index].owner == Owner::Component {
                self.inputs[index].owner = Owner::Client;
                self.post(Message::InputAvailable(index));
            }
        }
    }

    fn client_input(&mut self, index: usize) -> CodecResult<&mut InputSlot> {
        let slot = self
            .inputs
            .get_mut(index)
            .ok_or(CodecError::InvalidIndex(index))?;
        if slot.owner != Owner::Client {
            return Err(CodecError::InvalidState(format!(
                "input slot {} is not owned by the client",
                index
            )));
        }
        Ok(slot)
    }

    fn client_output(&self, index: usize) -> CodecResult<&OutputSlot> {
        let slot = self.outputs.get(index).ok_or(CodecError::InvalidIndex(index))?;
        if slot.owner != Owner::Client {
            return Err(CodecError::InvalidState(format!(
                "output slot {} is not owned by the client",
                index
            )));
        }
        Ok(slot)
    }

    fn check_range(capacity: usize, info: &BufferInfo) -> CodecResult<()> {
        match info.offset.checked_add(info.size) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(CodecError::InvalidArgument(format!(
                "range {}+{} exceeds the slot capacity {}",
                info.offset, info.size, capacity
            ))),
        }
    }

    fn process(&mut self, data: &[u8], info: BufferInfo) {
        log::trace!(
            "{}: input size {} pts {} flags {:?}",
            self.name,
            info.size,
            info.presentation_time_us,
            info.flags
        );

        if info.size > 0 && !info.is_codec_config() {
            self.units_received += 1;
            if let Some(limit) = self.options.faults.fail_after_inputs {
                if self.units_received > limit {
                    self.fail(format!("failing after {} input units", limit));
                    return;
                }
            }
        }
        if info.is_eos() {
            self.eos_received += 1;
        }

        if self.stream.as_ref().is_some_and(|s| s.is_encoder) {
            self.encode(data, info);
        } else {
            self.decode(data, info);
        }
    }

    fn decode(&mut self, data: &[u8], info: BufferInfo) {
        if info.is_codec_config() {
            log::debug!(
                "{}: codec config [{}]",
                self.name,
                byte_array_to_hex_string(data)
            );
        } else if info.size > 0 {
            if info.flags.contains(BufferFlags::PARTIAL_FRAME) {
                self.partial.extend_from_slice(data);
            } else {
                let mut frame = std::mem::take(&mut self.partial);
                frame.extend_from_slice(data);

                let layout = self.stream.as_ref().and_then(|s| s.layout.as_ref());
                let payload = match layout {
                    Some(layout) => render_image(&frame, layout, self.frames_coded as u8),
                    None => frame,
                };
                self.frames_coded += 1;
                self.held.push(Unit {
                    data: payload,
                    pts: info.presentation_time_us,
                    flags: BufferFlags::empty(),
                });

                while self.held.len() > self.options.reorder_depth {
                    if let Some(unit) = self.pop_earliest() {
                        self.emit(unit);
                    }
                }
            }
        }

        if info.is_eos() {
            while let Some(unit) = self.pop_earliest() {
                self.emit(unit);
            }
            self.emit(Unit::eos(info.presentation_time_us));
        }
    }

    fn pop_earliest(&mut self) -> Option<Unit> {
        let index = self
            .held
            .iter()
            .enumerate()
            .min_by_key(|(_, unit)| unit.pts)
            .map(|(i, _)| i)?;
        Some(self.held.remove(index))
    }

    fn encode(&mut self, data: &[u8], info: BufferInfo) {
        let Some((max_b_frames, gop_size)) =
            self.stream.as_ref().map(|s| (s.max_b_frames, s.gop_size))
        else {
            return;
        };

        if info.size > 0 && !info.is_codec_config() {
            if !self.config_emitted {
                self.config_emitted = true;
                let config_unit = self
                    .stream
                    .as_ref()
                    .map(|s| s.config_unit.clone())
                    .unwrap_or_default();
                self.emit(Unit {
                    data: config_unit,
                    pts: 0,
                    flags: BufferFlags::CODEC_CONFIG,
                });
            }

            let key_frame = self.frames_coded % gop_size == 0;
            self.frames_coded += 1;
            let unit = Unit {
                data: digest(data, info.presentation_time_us).to_vec(),
                pts: info.presentation_time_us,
                flags: if key_frame {
                    BufferFlags::KEY_FRAME
                } else {
                    BufferFlags::empty()
                },
            };

            if max_b_frames == 0 {
                self.emit(unit);
            } else if key_frame {
                self.emit_held_in_order();
                self.emit(unit);
            } else {
                // Anchor first, then the frames it is predicted from.
                self.held.push(unit);
                if self.held.len() == max_b_frames + 1 {
                    if let Some(anchor) = self.held.pop() {
                        self.emit(anchor);
                    }
                    self.emit_held_in_order();
                }
            }
        }

        if info.is_eos() {
            self.emit_held_in_order();
            self.emit(Unit::eos(info.presentation_time_us));
        }
    }

    fn emit_held_in_order(&mut self) {
        for unit in std::mem::take(&mut self.held) {
            self.emit(unit);
        }
    }

    fn emit(&mut self, unit: Unit) {
        if !unit.data.is_empty() && !unit.flags.contains(BufferFlags::CODEC_CONFIG) {
            let faults = self.options.faults;
            if faults.drop_pts == Some(unit.pts) {
                log::debug!("{}: dropping output {} us", self.name, unit.pts);
                return;
            }
            if faults.duplicate_pts == Some(unit.pts) {
                log::debug!("{}: duplicating output {} us", self.name, unit.pts);
                self.push_output(unit.clone());
            }
        }
        self.push_output(unit);
    }

    fn push_output(&mut self, unit: Unit) {
        let Some(limits) = self.stream.as_ref().and_then(|s| s.batch) else {
            self.pending.push_back(vec![unit]);
            self.deliver();
            return;
        };

        if unit.data.len() > limits.max_output_size {
            self.fail(format!(
                "output unit of {} bytes exceeds the batch size {}",
                unit.data.len(),
                limits.max_output_size
            ));
            return;
        }

        let batched = self.batch.iter().map(|u| u.data.len()).sum::<usize>();
        if batched + unit.data.len() > limits.max_output_size && !self.batch.is_empty() {
            let batch = std::mem::take(&mut self.batch);
            self.pending.push_back(batch);
        }

        let is_eos = unit.flags.contains(BufferFlags::END_OF_STREAM);
        self.batch.push(unit);
        let batched = self.batch.iter().map(|u| u.data.len()).sum::<usize>();
        if batched >= limits.threshold_output_size || is_eos {
            let batch = std::mem::take(&mut self.batch);
            self.pending.push_back(batch);
        }

        self.deliver();
    }

    /// Moves pending units into free output slots.
    fn deliver(&mut self) {
        let is_async = self.is_async();
        while self.state == LoopbackState::Running && !self.pending.is_empty() {
            let Some(index) = self.outputs.iter().position(|s| s.owner == Owner::Component)
            else {
                break;
            };
            let Some(units) = self.pending.pop_front() else {
                break;
            };

            let slot = &mut self.outputs[index];
            slot.data.clear();
            slot.infos.clear();
            for unit in units {
                let offset = slot.data.len();
                slot.data.extend_from_slice(&unit.data);
                slot.infos
                    .push(BufferInfo::new(offset, unit.data.len(), unit.pts, unit.flags));
            }

            if is_async {
                slot.owner = Owner::Client;
                let infos = slot.infos.clone();
                if !self.format_announced {
                    self.format_announced = true;
                    if let Some(stream) = &self.stream {
                        self.post(Message::FormatChanged(stream.output_format.clone()));
                    }
                }
                match infos.as_slice() {
                    [info] => self.post(Message::OutputAvailable(index, *info)),
                    _ => self.post(Message::OutputsAvailable(index, infos)),
                }
            } else {
                slot.owner = Owner::Ready;
                self.ready.push_back(index);
            }
        }
    }
}

/// Renders `frame` into an image of `layout`. The visible samples only depend on the content
/// of `frame`, the padding is filled with `padding`.
fn render_image(frame: &[u8], layout: &ImageLayout, padding: u8) -> Vec<u8> {
    let mut hasher = Hasher::new();
    hasher.update(frame);
    let seed = hasher.finalize();

    let mut data = vec![padding; layout.buffer_size()];
    for (i, plane) in layout.planes.iter().enumerate() {
        let (width, height) = if i == 0 {
            (layout.width, layout.height)
        } else {
            (layout.width.div_ceil(2), layout.height.div_ceil(2))
        };
        for y in 0..height {
            for x in 0..width {
                let pos = plane.offset + y * plane.row_stride + x * plane.pixel_stride;
                if let Some(sample) = data.get_mut(pos) {
                    let rotation = ((x * 7 + y * 3 + i) % 32) as u32;
                    *sample = (seed.rotate_left(rotation) as u8) ^ ((x + 2 * y) as u8);
                }
            }
        }
    }

    data
}

/// CRC32 and size of `data` followed by `pts`, all big endian.
fn digest(data: &[u8], pts: i64) -> [u8; DIGEST_SIZE] {
    let mut hasher = Hasher::new();
    hasher.update(data);

    let mut out = [0u8; DIGEST_SIZE];
    BigEndian::write_u32(&mut out[0..4], hasher.finalize());
    BigEndian::write_u32(&mut out[4..8], data.len() as u32);
    BigEndian::write_i64(&mut out[8..16], pts);
    out
}

fn positive(format: &MediaFormat, key: &str) -> CodecResult<usize> {
    match format.integer(key) {
        Some(value) if value > 0 => Ok(value as usize),
        _ => Err(CodecError::InvalidArgument(format!(
            "format {} has no valid {}",
            format, key
        ))),
    }
}

impl Codec for LoopbackCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, format: &MediaFormat, is_encoder: bool) -> CodecResult<()> {
        self.check_state(&[LoopbackState::Uninitialized], "configure")?;

        let media_type = format.media_type().ok_or_else(|| {
            CodecError::InvalidArgument(format!("format {} has no media type", format))
        })?;
        let kind = media_kind(media_type).ok_or_else(|| {
            CodecError::InvalidArgument(format!("unsupported media type {}", media_type))
        })?;
        let is_async = self.callback.is_some();

        let mut input_capacity = match format.integer(KEY_MAX_INPUT_SIZE) {
            Some(size) if size > 0 => size as usize,
            _ => self.options.input_capacity,
        };
        let mut layout = None;
        let mut max_b_frames = 0;
        let mut gop_size = 1;
        let mut config_unit = CONFIG_MAGIC.to_vec();
        let mut output_format;

        match kind {
            MediaKind::Video => {
                let width = positive(format, KEY_WIDTH)?;
                let height = positive(format, KEY_HEIGHT)?;
                config_unit.extend_from_slice(&(width as u32).to_be_bytes());
                config_unit.extend_from_slice(&(height as u32).to_be_bytes());

                if is_encoder {
                    input_capacity = input_capacity.max(width * height * 3 / 2);
                    max_b_frames = format.integer(KEY_MAX_B_FRAMES).unwrap_or(0).max(0) as usize;
                    let frame_rate = format.integer(KEY_FRAME_RATE).unwrap_or(30).max(1);
                    let interval = format.float(KEY_I_FRAME_INTERVAL).unwrap_or(1.0);
                    gop_size = ((frame_rate as f32 * interval) as usize).max(1);

                    output_format = MediaFormat::new_video(media_type, width as i32, height as i32);
                    output_format.set_bytes("csd-0", config_unit.clone());
                } else {
                    let stride = align_up(width, STRIDE_ALIGNMENT);
                    let image = if self.options.semi_planar {
                        ImageLayout::nv12(width, height, stride)
                    } else {
                        ImageLayout::i420(width, height, stride)
                    };

                    output_format =
                        MediaFormat::new_video(MIMETYPE_VIDEO_RAW, width as i32, height as i32);
                    output_format.set_integer(KEY_STRIDE, stride as i32);
                    output_format.set_integer(KEY_SLICE_HEIGHT, height as i32);
                    output_format.set_integer(KEY_COLOR_FORMAT, COLOR_FORMAT_YUV420_FLEXIBLE);
                    output_format.set_integer(KEY_CROP_LEFT, 0);
                    output_format.set_integer(KEY_CROP_TOP, 0);
                    output_format.set_integer(KEY_CROP_RIGHT, width as i32 - 1);
                    output_format.set_integer(KEY_CROP_BOTTOM, height as i32 - 1);
                    layout = Some(image);
                }
            }
            MediaKind::Audio => {
                let sample_rate = positive(format, KEY_SAMPLE_RATE)?;
                let channel_count = positive(format, KEY_CHANNEL_COUNT)?;
                config_unit.extend_from_slice(&(sample_rate as u32).to_be_bytes());
                config_unit.extend_from_slice(&(channel_count as u32).to_be_bytes());

                if is_encoder {
                    output_format = MediaFormat::new_audio(
                        media_type,
                        sample_rate as i32,
                        channel_count as i32,
                    );
                    output_format.set_bytes("csd-0", config_unit.clone());
                } else {
                    output_format = MediaFormat::new_audio(
                        MIMETYPE_AUDIO_RAW,
                        sample_rate as i32,
                        channel_count as i32,
                    );
                    output_format.set_integer(KEY_PCM_ENCODING, PcmEncoding::Pcm16Bit as i32);
                }
            }
        }

        let batch = match format.integer(KEY_BUFFER_BATCH_MAX_OUTPUT_SIZE) {
            Some(max) if max > 0 && is_async && self.options.multiple_frames => {
                let max_output_size = max as usize;
                let threshold_output_size =
                    match format.integer(KEY_BUFFER_BATCH_THRESHOLD_OUTPUT_SIZE) {
                        Some(threshold) if threshold > 0 => {
                            (threshold as usize).min(max_output_size)
                        }
                        _ => max_output_size,
                    };
                output_format.set_integer(KEY_BUFFER_BATCH_MAX_OUTPUT_SIZE, max);
                output_format.set_integer(
                    KEY_BUFFER_BATCH_THRESHOLD_OUTPUT_SIZE,
                    threshold_output_size as i32,
                );
                Some(BatchLimits {
                    max_output_size,
                    threshold_output_size,
                })
            }
            _ => None,
        };

        self.inputs = (0..self.options.input_slots)
            .map(|_| InputSlot {
                data: vec![0; input_capacity],
                owner: Owner::Component,
            })
            .collect();
        self.outputs = (0..self.options.output_slots)
            .map(|_| OutputSlot {
                data: vec![],
                infos: vec![],
                owner: Owner::Component,
            })
            .collect();

        log::debug!(
            "{}: configured as {} for {} ({} mode)",
            self.name,
            if is_encoder { "encoder" } else { "decoder" },
            format,
            if is_async { "callback" } else { "polling" }
        );

        self.stream = Some(StreamConfig {
            is_encoder,
            is_async,
            layout,
            output_format,
            batch,
            max_b_frames,
            gop_size,
            config_unit,
        });
        self.clear_runtime();
        self.format_announced = false;
        self.config_emitted = false;
        self.units_received = 0;
        self.eos_received = 0;
        self.state = LoopbackState::Configured;

        Ok(())
    }

    fn set_callback(&mut self, callback: Option<Arc<dyn CodecCallback>>) -> CodecResult<()> {
        self.check_state(
            &[LoopbackState::Uninitialized, LoopbackState::Configured],
            "set_callback",
        )?;
        self.callback = callback;
        Ok(())
    }

    fn start(&mut self) -> CodecResult<()> {
        self.check_state(&[LoopbackState::Configured, LoopbackState::Flushed], "start")?;
        if self.is_async() {
            self.spawn_worker()?;
        }
        self.state = LoopbackState::Running;
        self.announce_inputs();
        Ok(())
    }

    fn flush(&mut self) -> CodecResult<()> {
        self.check_state(&[LoopbackState::Running, LoopbackState::Flushed], "flush")?;
        self.clear_runtime();
        if self.is_async() {
            self.barrier();
            self.state = LoopbackState::Flushed;
        }
        log::debug!("{}: flushed", self.name);
        Ok(())
    }

    fn stop(&mut self) -> CodecResult<()> {
        self.check_state(
            &[
                LoopbackState::Configured,
                LoopbackState::Running,
                LoopbackState::Flushed,
                LoopbackState::Error,
            ],
            "stop",
        )?;
        self.shutdown_worker();
        self.clear_runtime();
        self.stream = None;
        self.state = LoopbackState::Uninitialized;
        Ok(())
    }

    fn reset(&mut self) -> CodecResult<()> {
        if self.state == LoopbackState::Released {
            return Err(CodecError::InvalidState(format!(
                "{} was released",
                self.name
            )));
        }
        self.shutdown_worker();
        self.clear_runtime();
        self.stream = None;
        self.callback = None;
        self.state = LoopbackState::Uninitialized;
        Ok(())
    }

    fn release(&mut self) {
        self.shutdown_worker();
        self.clear_runtime();
        self.stream = None;
        self.callback = None;
        self.inputs.clear();
        self.outputs.clear();
        self.state = LoopbackState::Released;
    }

    // Processing happens when input is queued, so there is never anything to wait for.
    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> CodecResult<Option<usize>> {
        self.check_polling("dequeue_input_buffer")?;
        let index = self
            .inputs
            .iter()
            .position(|slot| slot.owner == Owner::Component);
        if let Some(index) = index {
            self.inputs[index].owner = Owner::Client;
        }
        Ok(index)
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> CodecResult<DequeuedOutput> {
        self.check_polling("dequeue_output_buffer")?;
        let Some(&index) = self.ready.front() else {
            return Ok(DequeuedOutput::TryAgainLater);
        };
        if !self.format_announced {
            self.format_announced = true;
            return Ok(DequeuedOutput::FormatChanged);
        }

        self.ready.pop_front();
        let slot = &mut self.outputs[index];
        slot.owner = Owner::Client;
        let info = slot.infos.first().copied().unwrap_or_default();
        Ok(DequeuedOutput::Buffer(index, info))
    }

    fn input_buffer(&mut self, index: usize) -> CodecResult<&mut [u8]> {
        self.check_state(&[LoopbackState::Running, LoopbackState::Error], "input_buffer")?;
        Ok(self.client_input(index)?.data.as_mut_slice())
    }

    fn queue_input_buffer(&mut self, index: usize, info: BufferInfo) -> CodecResult<()> {
        self.check_state(
            &[LoopbackState::Running, LoopbackState::Error],
            "queue_input_buffer",
        )?;
        let slot = self.client_input(index)?;
        Self::check_range(slot.data.len(), &info)?;
        let data = slot.data[info.offset..info.offset + info.size].to_vec();
        slot.owner = Owner::Component;

        if self.state == LoopbackState::Error {
            log::debug!("{}: ignoring input queued after an error", self.name);
            return Ok(());
        }

        self.process(&data, info);
        self.announce_inputs();
        Ok(())
    }

    fn queue_input_buffers(&mut self, index: usize, infos: &[BufferInfo]) -> CodecResult<()> {
        self.check_state(
            &[LoopbackState::Running, LoopbackState::Error],
            "queue_input_buffers",
        )?;
        if self.stream()?.batch.is_none() {
            return Err(CodecError::InvalidState(format!(
                "{} is not configured for multiple frames",
                self.name
            )));
        }
        if infos.is_empty() {
            return Err(CodecError::InvalidArgument("empty list of buffer infos".into()));
        }

        let slot = self.client_input(index)?;
        for info in infos {
            Self::check_range(slot.data.len(), info)?;
        }
        let units = infos
            .iter()
            .map(|info| (slot.data[info.offset..info.offset + info.size].to_vec(), *info))
            .collect::<Vec<_>>();
        slot.owner = Owner::Component;

        for (data, info) in units {
            if self.state != LoopbackState::Running {
                break;
            }
            self.process(&data, info);
        }
        self.announce_inputs();
        Ok(())
    }

    fn output_buffer(&self, index: usize) -> CodecResult<&[u8]> {
        Ok(self.client_output(index)?.data.as_slice())
    }

    fn output_image(&self, index: usize) -> CodecResult<Option<VideoImage<'_>>> {
        let slot = self.client_output(index)?;
        match self.stream()?.layout.as_ref() {
            Some(layout) if !slot.data.is_empty() => Ok(Some(VideoImage::new(&slot.data, layout)?)),
            _ => Ok(None),
        }
    }

    fn release_output_buffer(&mut self, index: usize) -> CodecResult<()> {
        self.check_state(
            &[
                LoopbackState::Running,
                LoopbackState::Flushed,
                LoopbackState::Error,
            ],
            "release_output_buffer",
        )?;
        let slot = self
            .outputs
            .get_mut(index)
            .ok_or(CodecError::InvalidIndex(index))?;
        if slot.owner != Owner::Client {
            return Err(CodecError::InvalidState(format!(
                "output slot {} is not owned by the client",
                index
            )));
        }
        slot.owner = Owner::Component;
        self.deliver();
        Ok(())
    }

    fn output_format(&self) -> CodecResult<MediaFormat> {
        Ok(self.stream()?.output_format.clone())
    }

    fn output_format_for(&self, index: usize) -> CodecResult<MediaFormat> {
        self.client_output(index)?;
        self.output_format()
    }
}

impl Drop for LoopbackCodec {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}
