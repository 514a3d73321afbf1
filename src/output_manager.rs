// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fingerprint of everything a component produced during one run.
//!
//! Decoded video is too large to keep around, so only CRC32 checksums of the output images and
//! buffers are accumulated. Compressed or audio output can additionally be mirrored into memory
//! for byte level comparisons and RMS error computations. Two instances filled by runs that
//! only differ in how the component was driven are expected to compare equal.

use std::fmt::Write;

use anyhow::anyhow;
use anyhow::Context;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use crc32fast::Hasher;
use enumn::N;

use crate::codec::VideoImage;
use crate::BufferInfo;

const ERROR_LOG_HEADER: &str = "-------- oracle error details --------\n";
const INITIAL_MEMORY_SIZE: usize = 1024;
/// Number of differing bytes reported before giving up on a buffer comparison.
const MAX_REPORTED_MISMATCHES: usize = 20;

/// Encoding of PCM samples, with the values used in media formats.
#[repr(i32)]
#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmEncoding {
    Pcm16Bit = 2,
    Pcm8Bit = 3,
    PcmFloat = 4,
    Pcm24BitPacked = 21,
    Pcm32Bit = 22,
}

impl PcmEncoding {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            PcmEncoding::Pcm8Bit => 1,
            PcmEncoding::Pcm16Bit => 2,
            PcmEncoding::Pcm24BitPacked => 3,
            PcmEncoding::Pcm32Bit | PcmEncoding::PcmFloat => 4,
        }
    }
}

/// Reference samples an accumulated audio output is compared against.
#[derive(Debug, Clone, Copy)]
pub enum ReferenceSamples<'a> {
    /// Unsigned 8-bit PCM.
    U8(&'a [u8]),
    I16(&'a [i16]),
    /// 24-bit packed or 32-bit PCM.
    I32(&'a [i32]),
    F32(&'a [f32]),
}

impl ReferenceSamples<'_> {
    fn len(&self) -> usize {
        match self {
            ReferenceSamples::U8(s) => s.len(),
            ReferenceSamples::I16(s) => s.len(),
            ReferenceSamples::I32(s) => s.len(),
            ReferenceSamples::F32(s) => s.len(),
        }
    }
}

/// Compares two timestamp lists, logging which entries of each list are missing from the other.
fn are_pts_lists_identical(reference: &[i64], test: &[i64], log: &mut String) -> bool {
    let mut identical = true;

    if reference.len() != test.len() {
        identical = false;
        let _ = writeln!(log, "reference and test timestamp lists differ in size");
        let _ = writeln!(log, "reference list holds {} entries", reference.len());
        let _ = writeln!(log, "test list holds {} entries", test.len());
    }

    if identical && reference == test {
        return true;
    }

    let dropped = reference
        .iter()
        .filter(|pts| !test.contains(pts))
        .collect::<Vec<_>>();
    let spurious = test
        .iter()
        .filter(|pts| !reference.contains(pts))
        .collect::<Vec<_>>();

    let format_list = |list: &[&i64]| {
        list.iter()
            .map(|pts| format!("{} us", pts))
            .collect::<Vec<_>>()
            .join(", ")
    };

    if !dropped.is_empty() {
        let _ = writeln!(
            log,
            "timestamps present in the reference list but missing from the test list, \
             probably dropped by the component: [{}]",
            format_list(&dropped)
        );
    }
    if !spurious.is_empty() {
        let _ = writeln!(
            log,
            "timestamps present in the test list only, probably duplicated by the component: \
             [{}]",
            format_list(&spurious)
        );
    }

    false
}

#[derive(Clone)]
pub struct OutputManager {
    /// Mirror of the accumulated bytes. Only `memory[..mem_index]` is valid.
    memory: Vec<u8>,
    mem_index: usize,
    mirror: bool,
    crc_image: Hasher,
    crc_buffer: Hasher,
    inp_pts: Vec<i64>,
    out_pts: Vec<i64>,
    error_log: String,
}

impl Default for OutputManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputManager {
    pub fn new() -> Self {
        Self {
            memory: vec![0; INITIAL_MEMORY_SIZE],
            mem_index: 0,
            mirror: false,
            crc_image: Hasher::new(),
            crc_buffer: Hasher::new(),
            inp_pts: Vec::new(),
            out_pts: Vec::new(),
            error_log: String::from(ERROR_LOG_HEADER),
        }
    }

    /// Whether [`OutputManager::accumulate`] also copies the bytes into memory.
    pub fn set_mirror(&mut self, mirror: bool) {
        self.mirror = mirror;
    }

    pub fn mirror(&self) -> bool {
        self.mirror
    }

    /// Records an input timestamp. Duplicates are ignored, e.g. units that produce no frame.
    pub fn save_in_pts(&mut self, pts: i64) {
        if !self.inp_pts.contains(&pts) {
            self.inp_pts.push(pts);
        }
    }

    pub fn save_out_pts(&mut self, pts: i64) {
        self.out_pts.push(pts);
    }

    pub fn inp_pts_list(&self) -> &[i64] {
        &self.inp_pts
    }

    pub fn out_pts_list(&self) -> &[i64] {
        &self.out_pts
    }

    /// Whether every recorded output timestamp is greater than the previous one, the first one
    /// being compared against `last_pts`.
    pub fn is_pts_strictly_increasing(&mut self, mut last_pts: i64) -> bool {
        for i in 0..self.out_pts.len() {
            if last_pts < self.out_pts[i] {
                last_pts = self.out_pts[i];
                continue;
            }

            self.error_log
                .push_str("timestamps are not strictly increasing, entries around the failure:\n");
            let window = i.saturating_sub(3)..(i + 3).min(self.out_pts.len());
            for j in window {
                if j == 0 {
                    let _ = writeln!(self.error_log, "pts of frame idx -1 is {}", last_pts);
                }
                let _ = writeln!(self.error_log, "pts of frame idx {} is {}", j, self.out_pts[j]);
            }
            return false;
        }

        true
    }

    /// Whether the output timestamps are the input timestamps. The input list is sorted first, the
    /// output list only if `require_sorting` is set.
    pub fn is_out_pts_list_identical_to_inp_pts_list(&mut self, require_sorting: bool) -> bool {
        self.inp_pts.sort_unstable();
        if require_sorting {
            self.out_pts.sort_unstable();
        }

        are_pts_lists_identical(&self.inp_pts, &self.out_pts, &mut self.error_log)
    }

    /// Number of bytes mirrored so far.
    pub fn out_stream_size(&self) -> usize {
        self.mem_index
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory[..self.mem_index]
    }

    /// Adds `buf` to the buffer checksum.
    pub fn checksum(&mut self, buf: &[u8]) {
        self.crc_buffer.update(buf);
    }

    /// Adds the top-left `width` x `height` samples of a strided plane to the buffer checksum.
    pub fn checksum_strided(
        &mut self,
        buf: &[u8],
        width: usize,
        height: usize,
        stride: usize,
        bytes_per_sample: usize,
    ) -> anyhow::Result<()> {
        if width == 0 || height == 0 || stride == 0 || bytes_per_sample == 0 {
            return Err(anyhow!(
                "invalid plane geometry {}x{} stride {} bps {}",
                width,
                height,
                stride,
                bytes_per_sample
            ));
        }

        let row_bytes = width * bytes_per_sample;
        let mut plane = Vec::with_capacity(row_bytes * height);
        for row in 0..height {
            let start = row * stride;
            let line = buf.get(start..start + row_bytes).ok_or_else(|| {
                anyhow!(
                    "row {} of a {}x{} plane is outside of the {} bytes buffer",
                    row,
                    width,
                    height,
                    buf.len()
                )
            })?;
            plane.extend_from_slice(line);
        }
        self.crc_buffer.update(&plane);

        Ok(())
    }

    /// Adds the visible part of every plane of `image` to the image checksum.
    pub fn checksum_image(&mut self, image: &VideoImage) -> anyhow::Result<()> {
        let layout = image.layout();
        let bps = layout.format.bytes_per_sample();
        let crop = layout.crop;

        if crop.width() == 0 || crop.height() == 0 {
            return Err(anyhow!("empty crop rectangle {:?}", crop));
        }
        if crop.right > layout.width || crop.bottom > layout.height {
            return Err(anyhow!(
                "crop rectangle {:?} exceeds the {}x{} image",
                crop,
                layout.width,
                layout.height
            ));
        }

        let data = image.data();
        for (i, plane) in layout.planes.iter().enumerate() {
            let (width, height, left, top) = if i == 0 {
                if plane.pixel_stride != bps {
                    return Err(anyhow!(
                        "luma pixel stride {} differs from the sample size {}",
                        plane.pixel_stride,
                        bps
                    ));
                }
                (crop.width(), crop.height(), crop.left, crop.top)
            } else {
                (crop.width() / 2, crop.height() / 2, crop.left / 2, crop.top / 2)
            };

            let crop_offset = plane.offset + left * plane.pixel_stride + top * plane.row_stride;
            let mut pixels = Vec::with_capacity(width * height * bps);
            for y in 0..height {
                let line_offset = crop_offset + y * plane.row_stride;
                if plane.pixel_stride == bps {
                    let line = data
                        .get(line_offset..line_offset + width * bps)
                        .with_context(|| format!("plane {} row {} out of bounds", i, y))?;
                    pixels.extend_from_slice(line);
                } else {
                    for x in 0..width {
                        let pos = line_offset + x * plane.pixel_stride;
                        let sample = data.get(pos..pos + bps).with_context(|| {
                            format!("plane {} sample ({}, {}) out of bounds", i, x, y)
                        })?;
                        pixels.extend_from_slice(sample);
                    }
                }
            }
            self.crc_image.update(&pixels);
        }

        Ok(())
    }

    /// Appends the valid range of `buf` described by `info` to the memory mirror.
    pub fn save_to_memory(&mut self, buf: &[u8], info: &BufferInfo) -> anyhow::Result<()> {
        let data = Self::valid_range(buf, info)?;

        let end = self.mem_index + data.len();
        if end > self.memory.len() {
            self.memory.resize(end, 0);
        }
        self.memory[self.mem_index..end].copy_from_slice(data);
        self.mem_index = end;

        Ok(())
    }

    /// Adds the valid range of `buf` described by `info` to the buffer checksum, and to the memory
    /// mirror if mirroring is enabled. Empty buffers leave the state untouched.
    pub fn accumulate(&mut self, buf: &[u8], info: &BufferInfo) -> anyhow::Result<()> {
        if info.size == 0 {
            return Ok(());
        }

        let data = Self::valid_range(buf, info)?;
        self.crc_buffer.update(data);
        if self.mirror {
            self.save_to_memory(buf, info)?;
        }

        Ok(())
    }

    fn valid_range<'a>(buf: &'a [u8], info: &BufferInfo) -> anyhow::Result<&'a [u8]> {
        info.offset
            .checked_add(info.size)
            .and_then(|end| buf.get(info.offset..end))
            .ok_or_else(|| {
                anyhow!(
                    "range {}+{} is outside of the {} bytes buffer",
                    info.offset,
                    info.size,
                    buf.len()
                )
            })
    }

    /// Clears all the accumulated state. The memory mirror keeps its capacity.
    pub fn reset(&mut self) {
        self.mem_index = 0;
        self.crc_image.reset();
        self.crc_buffer.reset();
        self.inp_pts.clear();
        self.out_pts.clear();
        self.error_log.clear();
        self.error_log.push_str(ERROR_LOG_HEADER);
    }

    /// Root mean square difference between the mirrored samples and `reference`, or `f32::MAX` if
    /// the sample type or count does not match.
    pub fn rms_error(&self, reference: ReferenceSamples, encoding: PcmEncoding) -> f32 {
        let bps = encoding.bytes_per_sample();
        let count = reference.len();
        if count == 0 || self.mem_index / bps != count {
            return f32::MAX;
        }
        let data = &self.memory[..count * bps];

        let total_error_squared: f64 = match (reference, encoding) {
            (ReferenceSamples::F32(reference), PcmEncoding::PcmFloat) => {
                let mut samples = vec![0f32; count];
                LittleEndian::read_f32_into(data, &mut samples);
                samples
                    .iter()
                    .zip(reference)
                    .map(|(s, r)| ((s - r) as f64).powi(2))
                    .sum()
            }
            (ReferenceSamples::I32(reference), PcmEncoding::Pcm24BitPacked) => data
                .chunks_exact(3)
                .map(|c| LittleEndian::read_i24(c))
                .zip(reference)
                .map(|(s, r)| (s as f64 - *r as f64).powi(2))
                .sum(),
            (ReferenceSamples::I32(reference), PcmEncoding::Pcm32Bit) => {
                let mut samples = vec![0i32; count];
                LittleEndian::read_i32_into(data, &mut samples);
                samples
                    .iter()
                    .zip(reference)
                    .map(|(s, r)| (*s as f64 - *r as f64).powi(2))
                    .sum()
            }
            (ReferenceSamples::I16(reference), PcmEncoding::Pcm16Bit) => {
                let mut samples = vec![0i16; count];
                LittleEndian::read_i16_into(data, &mut samples);
                samples
                    .iter()
                    .zip(reference)
                    .map(|(s, r)| (*s as f64 - *r as f64).powi(2))
                    .sum()
            }
            (ReferenceSamples::U8(reference), PcmEncoding::Pcm8Bit) => data
                .iter()
                .zip(reference)
                .map(|(s, r)| (*s as f64 - *r as f64).powi(2))
                .sum(),
            _ => return f32::MAX,
        };

        (total_error_squared / count as f64).sqrt() as f32
    }

    pub fn checksum_image_value(&self) -> u32 {
        self.crc_image.clone().finalize()
    }

    pub fn checksum_buffer_value(&self) -> u32 {
        self.crc_buffer.clone().finalize()
    }

    pub fn error_message(&self) -> &str {
        &self.error_log
    }

    /// Compares the mirrored bytes of `self` and `test`, logging up to
    /// `MAX_REPORTED_MISMATCHES` differing offsets, or the sizes if they differ.
    fn compare_memory(&self, test: &mut OutputManager) -> bool {
        if self.mem_index != test.mem_index {
            let _ = writeln!(test.error_log, "reference and test output sizes differ");
            let _ = writeln!(test.error_log, "reference output size is {}", self.mem_index);
            let _ = writeln!(test.error_log, "test output size is {}", test.mem_index);
            return false;
        }

        let mismatches = self
            .memory()
            .iter()
            .zip(test.memory())
            .enumerate()
            .filter(|(_, (r, t))| r != t)
            .map(|(offset, (r, t))| (offset, *r, *t))
            .take(MAX_REPORTED_MISMATCHES)
            .collect::<Vec<_>>();

        if mismatches.is_empty() {
            return true;
        }

        let _ = writeln!(test.error_log, "reference and test outputs differ");
        for (offset, r, t) in &mismatches {
            let _ = writeln!(
                test.error_log,
                "at offset {} reference byte is {:x} and test byte is {:x}",
                offset, r, t
            );
        }
        if mismatches.len() == MAX_REPORTED_MISMATCHES {
            let _ = writeln!(
                test.error_log,
                "stopping after {} mismatches",
                MAX_REPORTED_MISMATCHES
            );
        }

        false
    }

    /// Compares only the mirrored output bytes. Used when the two runs fingerprinted their
    /// buffers differently, e.g. batched and unbatched delivery.
    pub fn equals_byte_output(&self, test: &mut OutputManager) -> bool {
        self.compare_memory(test)
    }

    /// Compares the checksums of `self`, the reference, with those of `test`. Timestamps are not
    /// compared since deinterlacing components may produce them differently. Diagnostics are
    /// appended to the error log of `test`.
    pub fn equals_interlaced(&self, test: &mut OutputManager) -> bool {
        let mut equal = true;

        let (ref_image, test_image) = (self.checksum_image_value(), test.checksum_image_value());
        if ref_image != test_image {
            equal = false;
            let log = &mut test.error_log;
            let _ = writeln!(log, "image checksums differ between the reference and test runs");
            let _ = writeln!(log, "reference image checksum is {}", ref_image);
            let _ = writeln!(log, "test image checksum is {}", test_image);
        }

        let (ref_buffer, test_buffer) =
            (self.checksum_buffer_value(), test.checksum_buffer_value());
        if ref_buffer != test_buffer {
            equal = false;
            let _ = writeln!(
                test.error_log,
                "buffer checksums differ between the reference and test runs"
            );
            let _ = writeln!(test.error_log, "reference buffer checksum is {}", ref_buffer);
            let _ = writeln!(test.error_log, "test buffer checksum is {}", test_buffer);

            self.compare_memory(test);
        }

        equal
    }

    /// Like [`OutputManager::equals_interlaced`], but the output timestamp sequences must also be
    /// identical.
    pub fn equals(&self, test: &mut OutputManager) -> bool {
        if !self.equals_interlaced(test) {
            return false;
        }

        are_pts_lists_identical(&self.out_pts, &test.out_pts, &mut test.error_log)
    }
}
