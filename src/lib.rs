// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Conformance harness for media codec components.
//!
//! A component under test is driven through its buffer lifecycle either by polling it
//! ([`harness::ScheduleMode::Synchronous`]) or by draining the events its callback thread
//! posts into a [`async_handler::CodecAsyncHandler`]
//! ([`harness::ScheduleMode::Asynchronous`]). Everything the component produces is
//! fingerprinted by an [`output_manager::OutputManager`], and fingerprints of runs that
//! differ only in scheduling, end-of-stream signalling or batching are compared against
//! each other.

pub mod async_handler;
pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod extractor;
pub mod harness;
pub mod media_format;
pub mod output_manager;
pub mod utils;

use bitflags::bitflags;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Rectangle in pixels. `right` and `bottom` are exclusive.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: usize,
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
}

impl Rect {
    pub fn new(left: usize, top: usize, right: usize, bottom: usize) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> usize {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> usize {
        self.bottom.saturating_sub(self.top)
    }
}

bitflags! {
    /// Flags attached to a buffer exchanged with a codec component. The numeric values are the
    /// ones used by the platform codec API.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        const KEY_FRAME = 1;
        const CODEC_CONFIG = 2;
        const END_OF_STREAM = 4;
        const PARTIAL_FRAME = 8;
    }
}

/// Describes the valid region and metadata of one buffer exchanged with a codec component.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferInfo {
    /// Start of the valid data in the buffer.
    pub offset: usize,
    /// Number of valid bytes starting at `offset`.
    pub size: usize,
    /// Presentation timestamp in microseconds.
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    pub fn new(offset: usize, size: usize, presentation_time_us: i64, flags: BufferFlags) -> Self {
        Self {
            offset,
            size,
            presentation_time_us,
            flags,
        }
    }

    pub fn is_eos(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }

    pub fn is_codec_config(&self) -> bool {
        self.flags.contains(BufferFlags::CODEC_CONFIG)
    }

    /// Whether this buffer carries a displayable unit, i.e. it is neither empty, nor codec
    /// configuration data, nor a fragment of a larger unit.
    pub fn is_payload(&self) -> bool {
        self.size > 0
            && !self
                .flags
                .intersects(BufferFlags::CODEC_CONFIG | BufferFlags::PARTIAL_FRAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_flags_compose() {
        let flags = BufferFlags::KEY_FRAME | BufferFlags::END_OF_STREAM;
        assert!(flags.contains(BufferFlags::KEY_FRAME));
        assert!(flags.contains(BufferFlags::END_OF_STREAM));
        assert!(!flags.contains(BufferFlags::CODEC_CONFIG));
        assert_eq!(flags - BufferFlags::END_OF_STREAM, BufferFlags::KEY_FRAME);
        assert_eq!(flags.bits(), 5);
        assert_eq!(
            flags.iter_names().map(|(name, _)| name).collect::<Vec<_>>(),
            ["KEY_FRAME", "END_OF_STREAM"]
        );
        assert!(BufferFlags::default().is_empty());
    }

    #[test]
    fn payload_classification() {
        assert!(BufferInfo::new(0, 10, 0, BufferFlags::KEY_FRAME).is_payload());
        assert!(!BufferInfo::new(0, 0, 0, BufferFlags::END_OF_STREAM).is_payload());
        assert!(!BufferInfo::new(0, 10, 0, BufferFlags::CODEC_CONFIG).is_payload());
        assert!(!BufferInfo::new(0, 10, 0, BufferFlags::PARTIAL_FRAME).is_payload());
    }

    #[test]
    fn rect_dimensions() {
        let rect = Rect::new(2, 4, 18, 12);
        assert_eq!(rect.width(), 16);
        assert_eq!(rect.height(), 8);
    }
}
