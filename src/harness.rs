// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drive loop running a component through one pass of a stream.
//!
//! A [`CodecSession`] owns the component and the bookkeeping of the pass, while what to feed and
//! how to check the produced buffers is supplied by a [`StreamHandler`]. The same handler can
//! be run in both scheduling modes, which is what allows fingerprints of synchronous and
//! asynchronous runs to be compared.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use thiserror::Error;

use crate::async_handler::BufferEvent;
use crate::async_handler::CodecAsyncHandler;
use crate::codec::Codec;
use crate::codec::CodecCallback;
use crate::codec::CodecError;
use crate::codec::DequeuedOutput;
use crate::media_format::MediaFormat;
use crate::output_manager::OutputManager;
use crate::BufferFlags;
use crate::BufferInfo;

/// Time a single poll of the component may block for.
pub const Q_DEQ_TIMEOUT: Duration = Duration::from_millis(5);
pub const PER_TEST_TIMEOUT_SMALL_TEST: Duration = Duration::from_secs(60);
pub const PER_TEST_TIMEOUT_LARGE_TEST: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum HarnessError {
    /// The component reported an error through its callback.
    #[error("encountered error in async mode\n{0}")]
    Async(String),
    /// The produced output does not match what was expected.
    #[error("{0}")]
    Mismatch(String),
    /// The test does not apply to the component or the material under test.
    #[error("not applicable: {0}")]
    NotApplicable(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HarnessError>;

/// How buffers are exchanged with the component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// The driver polls the component for free input and filled output slots.
    Synchronous,
    /// The component announces slots from its callback thread.
    Asynchronous,
}

impl FromStr for ScheduleMode {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sync" | "synchronous" => Ok(ScheduleMode::Synchronous),
            "async" | "asynchronous" => Ok(ScheduleMode::Asynchronous),
            _ => Err("unrecognized schedule mode. Valid values: sync, async"),
        }
    }
}

/// How the end of the input stream is signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EosMode {
    /// The last access unit carries the end-of-stream flag.
    WithLastFrame,
    /// An empty buffer flagged end-of-stream follows the last access unit.
    Separate,
}

impl FromStr for EosMode {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "last-frame" => Ok(EosMode::WithLastFrame),
            "separate" => Ok(EosMode::Separate),
            _ => Err("unrecognized eos mode. Valid values: last-frame, separate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestMode {
    pub schedule: ScheduleMode,
    pub eos: EosMode,
}

impl TestMode {
    pub const fn new(schedule: ScheduleMode, eos: EosMode) -> Self {
        Self { schedule, eos }
    }

    /// All the combinations a conformance test is expected to run through.
    pub const ALL: [TestMode; 4] = [
        TestMode::new(ScheduleMode::Asynchronous, EosMode::WithLastFrame),
        TestMode::new(ScheduleMode::Synchronous, EosMode::WithLastFrame),
        TestMode::new(ScheduleMode::Asynchronous, EosMode::Separate),
        TestMode::new(ScheduleMode::Synchronous, EosMode::Separate),
    ];

    pub fn is_async(&self) -> bool {
        self.schedule == ScheduleMode::Asynchronous
    }

    pub fn eos_with_last_frame(&self) -> bool {
        self.eos == EosMode::WithLastFrame
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} mode, eos {}",
            if self.is_async() {
                "asynchronous"
            } else {
                "synchronous"
            },
            if self.eos_with_last_frame() {
                "with last frame"
            } else {
                "with empty buffer"
            }
        )
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Time a single poll of the component may block for in synchronous mode.
    pub dequeue_timeout: Duration,
    /// Whether the produced bytes are mirrored into memory on top of being checksummed.
    pub save_to_memory: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout: Q_DEQ_TIMEOUT,
            save_to_memory: false,
        }
    }
}

/// Counters and flags of the current pass.
#[derive(Debug, Clone)]
pub struct DriveState {
    pub is_async: bool,
    pub signal_eos_with_last_frame: bool,
    pub saw_input_eos: bool,
    pub saw_output_eos: bool,
    /// Number of buffers queued, end-of-stream excluded.
    pub input_count: usize,
    /// Number of output access units received, end-of-stream excluded.
    pub output_count: usize,
    /// Timestamp the next output is expected to be greater than.
    pub prev_output_pts: i64,
    pub signalled_out_format_changed: bool,
    /// Last output format reported in synchronous mode.
    pub out_format: Option<MediaFormat>,
}

impl Default for DriveState {
    fn default() -> Self {
        Self {
            is_async: false,
            signal_eos_with_last_frame: false,
            saw_input_eos: false,
            saw_output_eos: false,
            input_count: 0,
            output_count: 0,
            prev_output_pts: i64::MIN,
            signalled_out_format_changed: false,
            out_format: None,
        }
    }
}

/// What to feed to the component and what to do with what it produces.
pub trait StreamHandler<C: Codec> {
    /// Fills and queues the free input slot `index`.
    fn enqueue_input(&mut self, session: &mut CodecSession<C>, index: usize) -> Result<()>;

    /// Consumes and releases the output slot `index`.
    fn dequeue_output(
        &mut self,
        session: &mut CodecSession<C>,
        index: usize,
        info: BufferInfo,
    ) -> Result<()>;

    /// Consumes and releases the output slot `index` holding several access units.
    fn dequeue_outputs(
        &mut self,
        session: &mut CodecSession<C>,
        index: usize,
        infos: Vec<BufferInfo>,
    ) -> Result<()> {
        let _ = (session, infos);
        Err(HarnessError::Other(anyhow!(
            "unexpected batched output in slot {}",
            index
        )))
    }

    /// Whether the pass fed enough input. `enqueued` counts the input slots filled so far.
    fn frame_limit_reached(&self, state: &DriveState, enqueued: usize, limit: usize) -> bool {
        let _ = state;
        enqueued >= limit
    }

    /// Checks run once all the outputs have been received.
    fn validate(&mut self, session: &mut CodecSession<C>) -> Result<()> {
        let _ = session;
        Ok(())
    }
}

/// A component under test along with the state of the pass it is running.
pub struct CodecSession<C: Codec> {
    pub codec: C,
    pub state: DriveState,
    pub output: OutputManager,
    async_handle: Arc<CodecAsyncHandler>,
    config: HarnessConfig,
    test_config: String,
    test_env: String,
}

impl<C: Codec> CodecSession<C> {
    pub fn new(codec: C, config: HarnessConfig) -> Self {
        let test_config = format!("test details: component {}\n", codec.name());
        let mut output = OutputManager::new();
        output.set_mirror(config.save_to_memory);

        Self {
            codec,
            state: Default::default(),
            output,
            async_handle: Arc::new(CodecAsyncHandler::new()),
            config,
            test_config,
            test_env: String::new(),
        }
    }

    /// Describes the test being run, included in every failure report.
    pub fn set_test_config(&mut self, name: &str, params: &str) {
        self.test_config = format!("test details: {} with parameters {}\n", name, params);
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn async_handler(&self) -> &Arc<CodecAsyncHandler> {
        &self.async_handle
    }

    /// Test configuration and environment, followed by the oracle error log.
    pub fn diagnostics(&self) -> String {
        format!(
            "{}{}{}",
            self.test_config,
            self.test_env,
            self.output.error_message()
        )
    }

    /// Builds a mismatch error carrying `message` and the diagnostics of the session.
    pub fn mismatch(&self, message: &str) -> HarnessError {
        HarnessError::Mismatch(format!("{}\n{}", message, self.diagnostics()))
    }

    fn async_error(&self) -> HarnessError {
        HarnessError::Async(format!(
            "{}{}{}",
            self.test_config,
            self.test_env,
            self.async_handle.error_message().unwrap_or_default()
        ))
    }

    /// Returns the session to its initial state for a new pass in `mode`.
    pub fn reset_context(&mut self, mode: TestMode) {
        self.async_handle.reset_context();
        self.state = DriveState {
            is_async: mode.is_async(),
            signal_eos_with_last_frame: mode.eos_with_last_frame(),
            ..Default::default()
        };
    }

    pub fn configure_codec(
        &mut self,
        format: &MediaFormat,
        mode: TestMode,
        is_encoder: bool,
    ) -> Result<()> {
        self.reset_context(mode);

        let callback = if mode.is_async() {
            Some(Arc::clone(&self.async_handle) as Arc<dyn CodecCallback>)
        } else {
            None
        };
        self.codec.set_callback(callback)?;
        self.codec.configure(format, is_encoder)?;

        self.test_env = format!(
            "test environment: component {}, format {}, {}\n",
            self.codec.name(),
            format,
            mode
        );
        log::debug!("{} configured in {}", self.codec.name(), mode);

        Ok(())
    }

    pub fn reconfigure_codec(
        &mut self,
        format: &MediaFormat,
        mode: TestMode,
        is_encoder: bool,
    ) -> Result<()> {
        self.codec.reset()?;
        self.configure_codec(format, mode, is_encoder)
    }

    pub fn start(&mut self) -> Result<()> {
        self.codec.start()?;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.codec.stop()?;
        Ok(())
    }

    /// Flushes the component and forgets everything about the ongoing pass except its
    /// accumulated output.
    pub fn flush_codec(&mut self) -> Result<()> {
        self.codec.flush()?;
        self.async_handle.clear_queues();
        self.state.saw_input_eos = false;
        self.state.saw_output_eos = false;
        self.state.input_count = 0;
        self.state.output_count = 0;
        self.state.prev_output_pts = i64::MIN;
        log::debug!("{} flushed", self.codec.name());

        Ok(())
    }

    /// Queues an empty end-of-stream buffer in input slot `index`, unless end of stream was
    /// already signalled.
    pub fn enqueue_eos(&mut self, index: usize) -> Result<()> {
        if !self.state.saw_input_eos {
            self.codec
                .queue_input_buffer(index, BufferInfo::new(0, 0, 0, BufferFlags::END_OF_STREAM))?;
            self.state.saw_input_eos = true;
            log::debug!("queued end of stream");
        }

        Ok(())
    }

    /// Waits for a free input slot outside of the drive loop.
    pub fn next_input_slot(&mut self) -> Result<usize> {
        if self.state.is_async {
            match self.async_handle.take_next_input_event() {
                Some(event) => Ok(event.index()),
                None => Err(self.async_error()),
            }
        } else {
            loop {
                if let Some(index) = self.codec.dequeue_input_buffer(self.config.dequeue_timeout)? {
                    return Ok(index);
                }
            }
        }
    }

    /// Current output format of the component.
    pub fn output_format(&self) -> Option<MediaFormat> {
        if self.state.is_async {
            self.async_handle.output_format()
        } else {
            self.state.out_format.clone()
        }
    }

    pub fn has_output_format_changed(&self) -> bool {
        if self.state.is_async {
            self.async_handle.has_output_format_changed()
        } else {
            self.state.signalled_out_format_changed
        }
    }

    fn dispatch<H: StreamHandler<C>>(&mut self, handler: &mut H, event: BufferEvent) -> Result<()> {
        match event {
            BufferEvent::OutputAvailable(index, info) => handler.dequeue_output(self, index, info),
            BufferEvent::OutputsAvailable(index, infos) => {
                handler.dequeue_outputs(self, index, infos)
            }
            BufferEvent::InputAvailable(index) => Err(HarnessError::Other(anyhow!(
                "input slot {} dispatched as output",
                index
            ))),
        }
    }

    /// Polls the output side once.
    fn poll_output<H: StreamHandler<C>>(&mut self, handler: &mut H) -> Result<()> {
        match self.codec.dequeue_output_buffer(self.config.dequeue_timeout)? {
            DequeuedOutput::Buffer(index, info) => handler.dequeue_output(self, index, info)?,
            DequeuedOutput::FormatChanged => {
                let format = self.codec.output_format()?;
                log::debug!("output format changed to {}", format);
                self.state.out_format = Some(format);
                self.state.signalled_out_format_changed = true;
            }
            DequeuedOutput::TryAgainLater => (),
        }

        Ok(())
    }

    /// Feeds input until end of stream is queued or `handler` reports that `frame_limit` is
    /// reached, consuming the outputs produced meanwhile.
    pub fn do_work<H: StreamHandler<C>>(
        &mut self,
        handler: &mut H,
        frame_limit: usize,
    ) -> Result<()> {
        let mut frame_count = 0;

        while !self.state.saw_input_eos
            && !handler.frame_limit_reached(&self.state, frame_count, frame_limit)
        {
            if self.state.is_async {
                match self.async_handle.take_next_event() {
                    Some(BufferEvent::InputAvailable(index)) => {
                        handler.enqueue_input(self, index)?;
                        frame_count += 1;
                    }
                    Some(event) => self.dispatch(handler, event)?,
                    None => return Err(self.async_error()),
                }
            } else {
                self.poll_output(handler)?;
                if let Some(index) = self.codec.dequeue_input_buffer(self.config.dequeue_timeout)? {
                    handler.enqueue_input(self, index)?;
                    frame_count += 1;
                }
            }
        }

        Ok(())
    }

    /// Queues end of stream once, consuming the outputs produced while waiting for a free input
    /// slot.
    pub fn queue_eos<H: StreamHandler<C>>(&mut self, handler: &mut H) -> Result<()> {
        while !self.state.saw_input_eos {
            if self.state.is_async {
                match self.async_handle.take_next_event() {
                    Some(BufferEvent::InputAvailable(index)) => self.enqueue_eos(index)?,
                    Some(event) => self.dispatch(handler, event)?,
                    None => return Err(self.async_error()),
                }
            } else {
                self.poll_output(handler)?;
                if let Some(index) = self.codec.dequeue_input_buffer(self.config.dequeue_timeout)? {
                    self.enqueue_eos(index)?;
                }
            }
        }

        Ok(())
    }

    /// Consumes outputs until the end-of-stream output, then validates the pass.
    pub fn wait_for_all_outputs<H: StreamHandler<C>>(&mut self, handler: &mut H) -> Result<()> {
        while !self.state.saw_output_eos {
            if self.state.is_async {
                match self.async_handle.take_next_output_event() {
                    Some(event) => self.dispatch(handler, event)?,
                    None => return Err(self.async_error()),
                }
            } else {
                self.poll_output(handler)?;
            }
        }

        self.validate_test_state(handler)
    }

    /// Checks the post-conditions of a complete pass.
    ///
    /// The number of outputs is not required to match the number of inputs: components are
    /// allowed to drop or merge units, which the timestamp checks of the handlers account for.
    pub fn validate_test_state<H: StreamHandler<C>>(&mut self, handler: &mut H) -> Result<()> {
        if self.async_handle.has_seen_error() {
            return Err(self.async_error());
        }

        if self.state.input_count > 0 && self.state.output_count == 0 {
            return Err(self.mismatch(&format!(
                "fed {} input frames, received no output frames",
                self.state.input_count
            )));
        }

        handler.validate(self)
    }
}

impl<C: Codec> Drop for CodecSession<C> {
    fn drop(&mut self) {
        self.codec.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_modes() {
        assert_eq!("sync".parse::<ScheduleMode>(), Ok(ScheduleMode::Synchronous));
        assert_eq!(
            "asynchronous".parse::<ScheduleMode>(),
            Ok(ScheduleMode::Asynchronous)
        );
        assert!("polling".parse::<ScheduleMode>().is_err());
        assert_eq!("last-frame".parse::<EosMode>(), Ok(EosMode::WithLastFrame));
        assert_eq!("separate".parse::<EosMode>(), Ok(EosMode::Separate));
        assert!("never".parse::<EosMode>().is_err());
    }

    #[test]
    fn all_test_modes_are_distinct() {
        for (i, a) in TestMode::ALL.iter().enumerate() {
            for b in &TestMode::ALL[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(
            TestMode::ALL[0].to_string(),
            "asynchronous mode, eos with last frame"
        );
    }

    #[test]
    fn default_state() {
        let state = DriveState::default();
        assert_eq!(state.prev_output_pts, i64::MIN);
        assert!(!state.saw_input_eos);
        assert_eq!(HarnessConfig::default().dequeue_timeout, Q_DEQ_TIMEOUT);
    }
}
