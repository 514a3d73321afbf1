// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Event queue fed by the callback thread of a component running in callback mode.
//!
//! Input and output events are kept in two separate FIFOs so the driver can favor draining
//! outputs. An error reported by the component is sticky: once it is set every blocking take
//! returns `None` until the context is reset.

use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::codec::CodecCallback;
use crate::media_format::MediaFormat;
use crate::BufferInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferEvent {
    /// Input slot `index` is free.
    InputAvailable(usize),
    /// Output slot `index` holds one access unit.
    OutputAvailable(usize, BufferInfo),
    /// Output slot `index` holds several access units.
    OutputsAvailable(usize, Vec<BufferInfo>),
}

impl BufferEvent {
    pub fn index(&self) -> usize {
        match self {
            BufferEvent::InputAvailable(index)
            | BufferEvent::OutputAvailable(index, _)
            | BufferEvent::OutputsAvailable(index, _) => *index,
        }
    }
}

#[derive(Default)]
struct QueueState {
    inputs: VecDeque<BufferEvent>,
    outputs: VecDeque<BufferEvent>,
    error: Option<String>,
    output_format: Option<MediaFormat>,
    output_format_changed: bool,
}

#[derive(Default)]
pub struct CodecAsyncHandler {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl CodecAsyncHandler {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock leaves the queues consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until `take` extracts an event or the sticky error is set.
    fn wait_for<F>(&self, mut take: F) -> Option<BufferEvent>
    where
        F: FnMut(&mut QueueState) -> Option<BufferEvent>,
    {
        let mut state = self.lock();
        loop {
            if state.error.is_some() {
                return None;
            }
            if let Some(event) = take(&mut state) {
                return Some(event);
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn post_input_available(&self, index: usize) {
        log::trace!("input slot {} available", index);
        self.lock()
            .inputs
            .push_back(BufferEvent::InputAvailable(index));
        self.cond.notify_all();
    }

    pub fn post_output_available(&self, index: usize, info: BufferInfo) {
        log::trace!("output slot {} available: {:?}", index, info);
        self.lock()
            .outputs
            .push_back(BufferEvent::OutputAvailable(index, info));
        self.cond.notify_all();
    }

    pub fn post_outputs_available(&self, index: usize, infos: Vec<BufferInfo>) {
        log::trace!("output slot {} available with {} units", index, infos.len());
        self.lock()
            .outputs
            .push_back(BufferEvent::OutputsAvailable(index, infos));
        self.cond.notify_all();
    }

    /// Sets the sticky error and wakes up every waiter.
    pub fn signal_error(&self, description: &str) {
        log::error!("codec reported an error: {}", description);
        self.lock().error = Some(description.to_string());
        self.cond.notify_all();
    }

    pub fn set_output_format(&self, format: MediaFormat) {
        log::debug!("output format changed to {}", format);
        let mut state = self.lock();
        state.output_format = Some(format);
        state.output_format_changed = true;
    }

    /// Waits for the next free input slot.
    pub fn take_next_input_event(&self) -> Option<BufferEvent> {
        self.wait_for(|state| state.inputs.pop_front())
    }

    /// Waits for the next output event.
    pub fn take_next_output_event(&self) -> Option<BufferEvent> {
        self.wait_for(|state| state.outputs.pop_front())
    }

    /// Waits for an event on either side. Pending outputs are returned before pending inputs.
    pub fn take_next_event(&self) -> Option<BufferEvent> {
        self.wait_for(|state| {
            state
                .outputs
                .pop_front()
                .or_else(|| state.inputs.pop_front())
        })
    }

    /// Drops all pending events, e.g. because the component was flushed.
    pub fn clear_queues(&self) {
        let mut state = self.lock();
        state.inputs.clear();
        state.outputs.clear();
    }

    /// Returns the queue to its initial state.
    pub fn reset_context(&self) {
        let mut state = self.lock();
        state.inputs.clear();
        state.outputs.clear();
        state.error = None;
        state.output_format = None;
        state.output_format_changed = false;
    }

    pub fn has_seen_error(&self) -> bool {
        self.lock().error.is_some()
    }

    pub fn error_message(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn has_output_format_changed(&self) -> bool {
        self.lock().output_format_changed
    }

    pub fn output_format(&self) -> Option<MediaFormat> {
        self.lock().output_format.clone()
    }

    pub fn is_input_queue_empty(&self) -> bool {
        self.lock().inputs.is_empty()
    }
}

impl CodecCallback for CodecAsyncHandler {
    fn on_input_buffer_available(&self, index: usize) {
        self.post_input_available(index);
    }

    fn on_output_buffer_available(&self, index: usize, info: BufferInfo) {
        self.post_output_available(index, info);
    }

    fn on_output_buffers_available(&self, index: usize, infos: Vec<BufferInfo>) {
        self.post_outputs_available(index, infos);
    }

    fn on_error(&self, description: &str) {
        self.signal_error(description);
    }

    fn on_output_format_changed(&self, format: MediaFormat) {
        self.set_output_format(format);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::BufferFlags;

    #[test]
    fn outputs_are_taken_first() {
        let handler = CodecAsyncHandler::new();
        let info = BufferInfo::new(0, 100, 0, BufferFlags::empty());

        handler.post_input_available(0);
        handler.post_input_available(1);
        handler.post_output_available(5, info);

        assert_eq!(
            handler.take_next_event(),
            Some(BufferEvent::OutputAvailable(5, info))
        );
        assert_eq!(handler.take_next_event(), Some(BufferEvent::InputAvailable(0)));
        assert_eq!(handler.take_next_event(), Some(BufferEvent::InputAvailable(1)));
        assert!(handler.is_input_queue_empty());
    }

    #[test]
    fn error_wakes_blocked_waiter() {
        let handler = Arc::new(CodecAsyncHandler::new());

        let waiter = {
            let handler = Arc::clone(&handler);
            thread::spawn(move || handler.take_next_event())
        };

        thread::sleep(Duration::from_millis(20));
        handler.signal_error("hardware fault");

        assert_eq!(waiter.join().unwrap(), None);
        assert!(handler.has_seen_error());
        assert_eq!(handler.error_message().as_deref(), Some("hardware fault"));

        // Sticky until reset, even if events keep coming.
        handler.post_input_available(3);
        assert_eq!(handler.take_next_input_event(), None);

        handler.reset_context();
        assert!(!handler.has_seen_error());
        handler.post_input_available(3);
        assert_eq!(
            handler.take_next_input_event(),
            Some(BufferEvent::InputAvailable(3))
        );
    }

    #[test]
    fn per_queue_fifo_across_threads() {
        let handler = Arc::new(CodecAsyncHandler::new());

        let producer = {
            let handler = Arc::clone(&handler);
            thread::spawn(move || {
                for i in 0..50 {
                    let info = BufferInfo::new(0, 1, i as i64, BufferFlags::empty());
                    handler.on_output_buffer_available(i, info);
                    handler.on_input_buffer_available(i);
                }
            })
        };

        let mut inputs = vec![];
        let mut outputs = vec![];
        while inputs.len() < 50 || outputs.len() < 50 {
            match handler.take_next_event() {
                Some(BufferEvent::InputAvailable(i)) => inputs.push(i),
                Some(BufferEvent::OutputAvailable(i, _)) => outputs.push(i),
                other => panic!("unexpected event {:?}", other),
            }
        }
        producer.join().unwrap();

        assert_eq!(inputs, (0..50).collect::<Vec<_>>());
        assert_eq!(outputs, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn reset_context_is_idempotent() {
        let handler = CodecAsyncHandler::new();
        handler.post_input_available(1);
        handler.post_outputs_available(2, vec![]);
        handler.on_output_format_changed(MediaFormat::new());
        handler.on_error("boom");

        handler.reset_context();
        handler.reset_context();

        assert!(handler.is_input_queue_empty());
        assert!(!handler.has_seen_error());
        assert!(!handler.has_output_format_changed());
        assert_eq!(handler.output_format(), None);
    }

    #[test]
    fn clear_queues_keeps_format() {
        let handler = CodecAsyncHandler::new();
        handler.on_output_format_changed(MediaFormat::new());
        handler.post_input_available(1);
        handler.clear_queues();
        assert!(handler.is_input_queue_empty());
        assert!(handler.has_output_format_changed());
    }
}
