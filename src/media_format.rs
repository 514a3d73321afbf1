// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Media formats exchanged with codec components and the static media type tables.

use std::collections::BTreeMap;
use std::fmt;

pub const KEY_MIME: &str = "mime";
pub const KEY_WIDTH: &str = "width";
pub const KEY_HEIGHT: &str = "height";
pub const KEY_STRIDE: &str = "stride";
pub const KEY_SLICE_HEIGHT: &str = "slice-height";
pub const KEY_COLOR_FORMAT: &str = "color-format";
pub const KEY_CROP_LEFT: &str = "crop-left";
pub const KEY_CROP_RIGHT: &str = "crop-right";
pub const KEY_CROP_TOP: &str = "crop-top";
pub const KEY_CROP_BOTTOM: &str = "crop-bottom";
pub const KEY_SAMPLE_RATE: &str = "sample-rate";
pub const KEY_CHANNEL_COUNT: &str = "channel-count";
pub const KEY_PCM_ENCODING: &str = "pcm-encoding";
pub const KEY_BIT_RATE: &str = "bitrate";
pub const KEY_FRAME_RATE: &str = "frame-rate";
pub const KEY_I_FRAME_INTERVAL: &str = "i-frame-interval";
pub const KEY_MAX_B_FRAMES: &str = "max-bframes";
pub const KEY_MAX_INPUT_SIZE: &str = "max-input-size";
pub const KEY_BUFFER_BATCH_MAX_OUTPUT_SIZE: &str = "buffer-batch-max-output-size";
pub const KEY_BUFFER_BATCH_THRESHOLD_OUTPUT_SIZE: &str = "buffer-batch-threshold-output-size";

pub const MIMETYPE_VIDEO_AVC: &str = "video/avc";
pub const MIMETYPE_VIDEO_HEVC: &str = "video/hevc";
pub const MIMETYPE_VIDEO_VP8: &str = "video/x-vnd.on2.vp8";
pub const MIMETYPE_VIDEO_VP9: &str = "video/x-vnd.on2.vp9";
pub const MIMETYPE_VIDEO_AV1: &str = "video/av01";
pub const MIMETYPE_VIDEO_RAW: &str = "video/raw";
pub const MIMETYPE_AUDIO_AAC: &str = "audio/mp4a-latm";
pub const MIMETYPE_AUDIO_OPUS: &str = "audio/opus";
pub const MIMETYPE_AUDIO_FLAC: &str = "audio/flac";
pub const MIMETYPE_AUDIO_RAW: &str = "audio/raw";

/// Flexible YUV 4:2:0 8-bit layout.
pub const COLOR_FORMAT_YUV420_FLEXIBLE: i32 = 0x7F42_0888;
/// 10-bit semi-planar YUV 4:2:0 layout.
pub const COLOR_FORMAT_YUV_P010: i32 = 54;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Entry of the static media type table.
#[derive(Debug)]
pub struct MediaTypeInfo {
    pub media_type: &'static str,
    pub kind: MediaKind,
    /// FourCC used for this media type in IVF containers, if any.
    pub ivf_fourcc: Option<[u8; 4]>,
}

const MEDIA_TYPES: &[MediaTypeInfo] = &[
    MediaTypeInfo {
        media_type: MIMETYPE_VIDEO_AVC,
        kind: MediaKind::Video,
        ivf_fourcc: Some(*b"H264"),
    },
    MediaTypeInfo {
        media_type: MIMETYPE_VIDEO_HEVC,
        kind: MediaKind::Video,
        ivf_fourcc: Some(*b"H265"),
    },
    MediaTypeInfo {
        media_type: MIMETYPE_VIDEO_VP8,
        kind: MediaKind::Video,
        ivf_fourcc: Some(*b"VP80"),
    },
    MediaTypeInfo {
        media_type: MIMETYPE_VIDEO_VP9,
        kind: MediaKind::Video,
        ivf_fourcc: Some(*b"VP90"),
    },
    MediaTypeInfo {
        media_type: MIMETYPE_VIDEO_AV1,
        kind: MediaKind::Video,
        ivf_fourcc: Some(*b"AV01"),
    },
    MediaTypeInfo {
        media_type: MIMETYPE_VIDEO_RAW,
        kind: MediaKind::Video,
        ivf_fourcc: None,
    },
    MediaTypeInfo {
        media_type: MIMETYPE_AUDIO_AAC,
        kind: MediaKind::Audio,
        ivf_fourcc: None,
    },
    MediaTypeInfo {
        media_type: MIMETYPE_AUDIO_OPUS,
        kind: MediaKind::Audio,
        ivf_fourcc: None,
    },
    MediaTypeInfo {
        media_type: MIMETYPE_AUDIO_FLAC,
        kind: MediaKind::Audio,
        ivf_fourcc: None,
    },
    MediaTypeInfo {
        media_type: MIMETYPE_AUDIO_RAW,
        kind: MediaKind::Audio,
        ivf_fourcc: None,
    },
];

/// Looks up `media_type` (case insensitive) in the static table.
pub fn media_type_info(media_type: &str) -> Option<&'static MediaTypeInfo> {
    MEDIA_TYPES
        .iter()
        .find(|info| info.media_type.eq_ignore_ascii_case(media_type))
}

/// Returns the media type stored in IVF containers under `fourcc`.
pub fn media_type_for_ivf_fourcc(fourcc: [u8; 4]) -> Option<&'static str> {
    MEDIA_TYPES
        .iter()
        .find(|info| info.ivf_fourcc == Some(fourcc))
        .map(|info| info.media_type)
}

/// Kind of `media_type`. Types missing from the table are classified by their prefix.
pub fn media_kind(media_type: &str) -> Option<MediaKind> {
    if let Some(info) = media_type_info(media_type) {
        return Some(info.kind);
    }

    let lower = media_type.to_ascii_lowercase();
    if lower.starts_with("audio/") {
        Some(MediaKind::Audio)
    } else if lower.starts_with("video/") {
        Some(MediaKind::Video)
    } else {
        None
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FormatValue {
    Int(i32),
    Long(i64),
    Float(f32),
    String(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for FormatValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FormatValue::Int(v) => write!(f, "{}", v),
            FormatValue::Long(v) => write!(f, "{}", v),
            FormatValue::Float(v) => write!(f, "{}", v),
            FormatValue::String(v) => write!(f, "{}", v),
            FormatValue::Bytes(v) => write!(f, "bytes[{}]", v.len()),
        }
    }
}

/// Ordered set of typed key/value pairs describing a stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaFormat {
    entries: BTreeMap<String, FormatValue>,
}

impl MediaFormat {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn new_audio(media_type: &str, sample_rate: i32, channel_count: i32) -> Self {
        let mut format = Self::new();
        format.set_string(KEY_MIME, media_type);
        format.set_integer(KEY_SAMPLE_RATE, sample_rate);
        format.set_integer(KEY_CHANNEL_COUNT, channel_count);
        format
    }

    pub fn new_video(media_type: &str, width: i32, height: i32) -> Self {
        let mut format = Self::new();
        format.set_string(KEY_MIME, media_type);
        format.set_integer(KEY_WIDTH, width);
        format.set_integer(KEY_HEIGHT, height);
        format
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove_key(&mut self, key: &str) -> Option<FormatValue> {
        self.entries.remove(key)
    }

    pub fn set_integer(&mut self, key: &str, value: i32) {
        self.entries.insert(key.to_string(), FormatValue::Int(value));
    }

    pub fn set_long(&mut self, key: &str, value: i64) {
        self.entries.insert(key.to_string(), FormatValue::Long(value));
    }

    pub fn set_float(&mut self, key: &str, value: f32) {
        self.entries.insert(key.to_string(), FormatValue::Float(value));
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.entries
            .insert(key.to_string(), FormatValue::String(value.to_string()));
    }

    pub fn set_bytes(&mut self, key: &str, value: Vec<u8>) {
        self.entries.insert(key.to_string(), FormatValue::Bytes(value));
    }

    pub fn integer(&self, key: &str) -> Option<i32> {
        match self.entries.get(key) {
            Some(FormatValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn integer_or(&self, key: &str, default: i32) -> i32 {
        self.integer(key).unwrap_or(default)
    }

    pub fn long(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(FormatValue::Long(v)) => Some(*v),
            Some(FormatValue::Int(v)) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f32> {
        match self.entries.get(key) {
            Some(FormatValue::Float(v)) => Some(*v),
            Some(FormatValue::Int(v)) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(FormatValue::String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        match self.entries.get(key) {
            Some(FormatValue::Bytes(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn media_type(&self) -> Option<&str> {
        self.string(KEY_MIME)
    }

    /// Visible width, honoring the crop window when present.
    pub fn width(&self) -> Option<i32> {
        match (self.integer(KEY_CROP_LEFT), self.integer(KEY_CROP_RIGHT)) {
            (Some(left), Some(right)) => Some(right + 1 - left),
            _ => self.integer(KEY_WIDTH),
        }
    }

    /// Visible height, honoring the crop window when present.
    pub fn height(&self) -> Option<i32> {
        match (self.integer(KEY_CROP_TOP), self.integer(KEY_CROP_BOTTOM)) {
            (Some(top), Some(bottom)) => Some(bottom + 1 - top),
            _ => self.integer(KEY_HEIGHT),
        }
    }

    /// Codec specific data buffers `csd-0`, `csd-1`, ... in order.
    pub fn csd_buffers(&self) -> Vec<Vec<u8>> {
        (0..)
            .map(|i| self.bytes(&format!("csd-{}", i)))
            .take_while(Option::is_some)
            .flatten()
            .map(<[u8]>::to_vec)
            .collect()
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let entries = self
            .entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        write!(f, "{{{}}}", entries.join(", "))
    }
}

/// Whether `output` describes the same stream geometry as `input`. The media types are not
/// compared, one side of a codec is always raw.
pub fn is_format_similar(input: Option<&MediaFormat>, output: Option<&MediaFormat>) -> bool {
    let (input, output) = match (input, output) {
        (Some(input), Some(output)) => (input, output),
        _ => return false,
    };

    let in_kind = input.media_type().and_then(media_kind);
    match output.media_type().and_then(media_kind) {
        Some(MediaKind::Audio) => {
            input.integer(KEY_CHANNEL_COUNT).is_some()
                && input.integer(KEY_CHANNEL_COUNT) == output.integer(KEY_CHANNEL_COUNT)
                && input.integer(KEY_SAMPLE_RATE).is_some()
                && input.integer(KEY_SAMPLE_RATE) == output.integer(KEY_SAMPLE_RATE)
                && in_kind == Some(MediaKind::Audio)
        }
        Some(MediaKind::Video) => {
            input.width().is_some()
                && input.width() == output.width()
                && input.height().is_some()
                && input.height() == output.height()
                && in_kind == Some(MediaKind::Video)
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_overrides_dimensions() {
        let mut format = MediaFormat::new_video(MIMETYPE_VIDEO_VP9, 352, 288);
        assert_eq!(format.width(), Some(352));
        format.set_integer(KEY_CROP_LEFT, 0);
        format.set_integer(KEY_CROP_RIGHT, 319);
        format.set_integer(KEY_CROP_TOP, 8);
        format.set_integer(KEY_CROP_BOTTOM, 247);
        assert_eq!(format.width(), Some(320));
        assert_eq!(format.height(), Some(240));
    }

    #[test]
    fn csd_buffers_stop_at_gap() {
        let mut format = MediaFormat::new_audio(MIMETYPE_AUDIO_AAC, 48000, 2);
        format.set_bytes("csd-0", vec![0x11, 0x90]);
        format.set_bytes("csd-1", vec![0x56]);
        format.set_bytes("csd-3", vec![0xff]);
        assert_eq!(format.csd_buffers(), vec![vec![0x11, 0x90], vec![0x56]]);
    }

    #[test]
    fn similar_formats() {
        let input = MediaFormat::new_video(MIMETYPE_VIDEO_VP8, 176, 144);
        let output = MediaFormat::new_video(MIMETYPE_VIDEO_RAW, 176, 144);
        let other = MediaFormat::new_video(MIMETYPE_VIDEO_RAW, 176, 120);
        assert!(is_format_similar(Some(&input), Some(&output)));
        assert!(!is_format_similar(Some(&input), Some(&other)));
        assert!(!is_format_similar(None, Some(&output)));

        let audio_in = MediaFormat::new_audio(MIMETYPE_AUDIO_OPUS, 48000, 2);
        let audio_out = MediaFormat::new_audio(MIMETYPE_AUDIO_RAW, 48000, 2);
        assert!(is_format_similar(Some(&audio_in), Some(&audio_out)));
        assert!(!is_format_similar(Some(&input), Some(&audio_out)));
    }

    #[test]
    fn media_type_table() {
        assert_eq!(media_kind("VIDEO/AVC"), Some(MediaKind::Video));
        assert_eq!(media_kind("audio/x-unknown"), Some(MediaKind::Audio));
        assert_eq!(media_kind("text/plain"), None);
        assert_eq!(media_type_for_ivf_fourcc(*b"VP90"), Some(MIMETYPE_VIDEO_VP9));
        assert_eq!(media_type_for_ivf_fourcc(*b"XXXX"), None);
    }

    #[test]
    fn display_lists_entries() {
        let format = MediaFormat::new_audio(MIMETYPE_AUDIO_RAW, 8000, 1);
        assert_eq!(
            format.to_string(),
            "{channel-count=1, mime=audio/raw, sample-rate=8000}"
        );
    }
}
