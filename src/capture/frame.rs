use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u32)]
pub enum PixelFormat {
    /// Packed luma-chroma 4:2:2 (Y1 U Y2 V)
    Yuyv = 1,
    /// Motion JPEG, one compressed image per frame
    #[serde(alias = "MJPG")]
    Mjpeg = 2,
    /// Interleaved 8-bit RGB, only produced by the converter
    Rgb24 = 3,
}

impl PixelFormat {
    /// Slot bytes reserved per pixel. MJPEG gets the worst case of an
    /// uncompressed RGB image since the encoded size varies per frame.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Yuyv => 2,
            PixelFormat::Mjpeg | PixelFormat::Rgb24 => 3,
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Rgb24 => *b"RGB3",
        }
    }

    pub fn from_fourcc(repr: &[u8; 4]) -> Option<Self> {
        match repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"RGB3" => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }

    /// Formats a capture device may be asked for
    pub fn is_capture_format(self) -> bool {
        matches!(self, PixelFormat::Yuyv | PixelFormat::Mjpeg)
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(PixelFormat::Yuyv),
            2 => Some(PixelFormat::Mjpeg),
            3 => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cc = self.fourcc();
        f.write_str(std::str::from_utf8(&cc).unwrap_or("????"))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported pixel format '{0}' (expected YUYV or MJPG)")]
pub struct UnknownFormat(pub String);

impl FromStr for PixelFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "YUYV" => Ok(PixelFormat::Yuyv),
            "MJPG" | "MJPEG" => Ok(PixelFormat::Mjpeg),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

/// Geometry and encoding shared by every frame of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl FrameFormat {
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
        }
    }

    /// Number of bytes every frame of this format occupies. Saturates for
    /// geometries too large to address; see [`Self::checked_frame_size`].
    pub fn frame_size(&self) -> usize {
        self.checked_frame_size().unwrap_or(usize::MAX)
    }

    /// `None` when the frame size does not fit in `usize`
    pub fn checked_frame_size(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.pixel_format.bytes_per_pixel())
    }

    pub fn with_pixel_format(self, pixel_format: PixelFormat) -> Self {
        Self {
            pixel_format,
            ..self
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.pixel_format, self.width, self.height)
    }
}

/// One captured image payload.
///
/// The payload is immutable once built; cloning shares the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
    format: FrameFormat,
    /// Capture index when built by a source, delivery index once popped
    sequence: u64,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, format: FrameFormat, sequence: u64) -> Self {
        Self {
            data: data.into(),
            format,
            sequence,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .finish()
    }
}
