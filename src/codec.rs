// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface of the codec components driven by the harness.
//!
//! A component owns two pools of buffers addressed by index. The client obtains free input slots,
//! fills and queues them, and receives filled output slots that it must release once it is done
//! reading them. Slots are announced either through polling ([`Codec::dequeue_input_buffer`],
//! [`Codec::dequeue_output_buffer`]) or, when a [`CodecCallback`] is registered, from the
//! component's own callback thread.

use std::sync::Arc;
use std::time::Duration;

use enumn::N;
use thiserror::Error;

use crate::media_format::MediaFormat;
use crate::BufferInfo;
use crate::Rect;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid buffer index {0}")]
    InvalidIndex(usize),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Result of polling the output side of a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DequeuedOutput {
    /// Output slot `index` holds a buffer described by the info.
    Buffer(usize, BufferInfo),
    /// The output format changed, [`Codec::output_format`] returns the new one.
    FormatChanged,
    /// Nothing became available before the timeout expired.
    TryAgainLater,
}

/// Receiver of the events of a component running in callback mode.
///
/// The methods are invoked from the component's callback thread.
pub trait CodecCallback: Send + Sync {
    fn on_input_buffer_available(&self, index: usize);
    fn on_output_buffer_available(&self, index: usize, info: BufferInfo);
    /// Several access units were written into output slot `index`.
    fn on_output_buffers_available(&self, index: usize, infos: Vec<BufferInfo>);
    fn on_error(&self, description: &str);
    fn on_output_format_changed(&self, format: MediaFormat);
}

/// Image formats a video component may expose on its output side.
#[repr(i32)]
#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// 8-bit YUV 4:2:0, planar or semi-planar.
    Yuv420_888 = 0x23,
    /// 10-bit semi-planar YUV 4:2:0, samples stored in the top bits of 16-bit words.
    YcbcrP010 = 0x36,
}

impl ImageFormat {
    /// Bits per pixel averaged over the three planes.
    pub fn bits_per_pixel(&self) -> usize {
        match self {
            ImageFormat::Yuv420_888 => 12,
            ImageFormat::YcbcrP010 => 24,
        }
    }

    /// Size in bytes of one sample of a single plane.
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_pixel() * 2 / (8 * 3)
    }
}

/// Placement of one plane in an image buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Offset of the first sample of the plane.
    pub offset: usize,
    /// Distance in bytes between the starts of two consecutive rows.
    pub row_stride: usize,
    /// Distance in bytes between two consecutive samples of a row.
    pub pixel_stride: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    pub format: ImageFormat,
    pub width: usize,
    pub height: usize,
    /// Visible part of the image.
    pub crop: Rect,
    /// Y, U and V planes.
    pub planes: [PlaneLayout; 3],
}

impl ImageLayout {
    /// I420 layout with the given luma stride and no crop.
    pub fn i420(width: usize, height: usize, stride: usize) -> Self {
        let chroma_stride = stride.div_ceil(2);
        let y_size = stride * height;
        let chroma_size = chroma_stride * height.div_ceil(2);

        Self {
            format: ImageFormat::Yuv420_888,
            width,
            height,
            crop: Rect::new(0, 0, width, height),
            planes: [
                PlaneLayout {
                    offset: 0,
                    row_stride: stride,
                    pixel_stride: 1,
                },
                PlaneLayout {
                    offset: y_size,
                    row_stride: chroma_stride,
                    pixel_stride: 1,
                },
                PlaneLayout {
                    offset: y_size + chroma_size,
                    row_stride: chroma_stride,
                    pixel_stride: 1,
                },
            ],
        }
    }

    /// NV12 layout with the given stride and no crop. U and V share the interleaved plane.
    pub fn nv12(width: usize, height: usize, stride: usize) -> Self {
        let y_size = stride * height;

        Self {
            format: ImageFormat::Yuv420_888,
            width,
            height,
            crop: Rect::new(0, 0, width, height),
            planes: [
                PlaneLayout {
                    offset: 0,
                    row_stride: stride,
                    pixel_stride: 1,
                },
                PlaneLayout {
                    offset: y_size,
                    row_stride: stride,
                    pixel_stride: 2,
                },
                PlaneLayout {
                    offset: y_size + 1,
                    row_stride: stride,
                    pixel_stride: 2,
                },
            ],
        }
    }

    /// Minimal number of bytes a buffer must hold for this layout.
    pub fn buffer_size(&self) -> usize {
        let bps = self.format.bytes_per_sample();
        self.planes
            .iter()
            .enumerate()
            .map(|(i, plane)| {
                let (w, h) = if i == 0 {
                    (self.width, self.height)
                } else {
                    (self.width.div_ceil(2), self.height.div_ceil(2))
                };
                if w == 0 || h == 0 {
                    return plane.offset;
                }
                plane.offset + (h - 1) * plane.row_stride + (w - 1) * plane.pixel_stride + bps
            })
            .max()
            .unwrap_or(0)
    }
}

/// An image held in an output slot of a video component.
#[derive(Debug, Clone, Copy)]
pub struct VideoImage<'a> {
    data: &'a [u8],
    layout: &'a ImageLayout,
}

impl<'a> VideoImage<'a> {
    /// Wraps `data`. Fails if `data` is too small for `layout`.
    pub fn new(data: &'a [u8], layout: &'a ImageLayout) -> CodecResult<Self> {
        if data.len() < layout.buffer_size() {
            return Err(CodecError::InvalidArgument(format!(
                "image buffer of {} bytes is smaller than its layout ({} bytes)",
                data.len(),
                layout.buffer_size()
            )));
        }

        Ok(Self { data, layout })
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn layout(&self) -> &'a ImageLayout {
        self.layout
    }

    pub fn format(&self) -> ImageFormat {
        self.layout.format
    }

    pub fn crop(&self) -> Rect {
        self.layout.crop
    }
}

/// A media codec component.
///
/// Methods called with an index the component did not hand out, with a buffer range outside of
/// the slot, or in the wrong state return a [`CodecError`] and leave the component usable.
pub trait Codec {
    fn name(&self) -> &str;

    /// Configures the component for the stream described by `format`. Must be called while
    /// stopped. The callback registered at that time selects callback or polling mode.
    fn configure(&mut self, format: &MediaFormat, is_encoder: bool) -> CodecResult<()>;

    /// Registers the receiver of the component events, or switches back to polling mode if
    /// `None`.
    fn set_callback(&mut self, callback: Option<Arc<dyn CodecCallback>>) -> CodecResult<()>;

    fn start(&mut self) -> CodecResult<()>;

    /// Returns all the slots to the component and discards their content. In callback mode the
    /// component waits for [`Codec::start`] before announcing input slots again.
    fn flush(&mut self) -> CodecResult<()>;

    /// Stops processing. The component must be configured again before it can be restarted.
    fn stop(&mut self) -> CodecResult<()>;

    /// Returns the component to its unconfigured state.
    fn reset(&mut self) -> CodecResult<()>;

    /// Frees all the resources of the component. Any further call fails.
    fn release(&mut self);

    /// Returns the index of a free input slot, or `None` if there was none before `timeout`.
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> CodecResult<Option<usize>>;

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> CodecResult<DequeuedOutput>;

    /// Memory of the input slot `index`, which must have been handed out to the client.
    fn input_buffer(&mut self, index: usize) -> CodecResult<&mut [u8]>;

    fn queue_input_buffer(&mut self, index: usize, info: BufferInfo) -> CodecResult<()>;

    /// Queues several access units packed into input slot `index`.
    fn queue_input_buffers(&mut self, index: usize, infos: &[BufferInfo]) -> CodecResult<()> {
        let _ = (index, infos);
        Err(CodecError::InvalidState(format!(
            "{} does not accept batched input",
            self.name()
        )))
    }

    /// Memory of the output slot `index`, which must have been handed out to the client.
    fn output_buffer(&self, index: usize) -> CodecResult<&[u8]>;

    /// Image view of the output slot `index`, if the component produces raw video.
    fn output_image(&self, index: usize) -> CodecResult<Option<VideoImage<'_>>>;

    fn release_output_buffer(&mut self, index: usize) -> CodecResult<()>;

    fn output_format(&self) -> CodecResult<MediaFormat>;

    /// Format of the content of output slot `index`.
    fn output_format_for(&self, index: usize) -> CodecResult<MediaFormat>;
}
