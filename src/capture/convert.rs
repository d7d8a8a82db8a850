//! Pixel-format conversion stage.
//!
//! Everything here is a pure function of its input: no shared state, one
//! freshly allocated output buffer per call. Any number of consumers may
//! convert concurrently.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;

use super::frame::{Frame, FrameFormat, PixelFormat};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("cannot convert {from} to {to}")]
    Unsupported { from: PixelFormat, to: PixelFormat },
    #[error("input holds {actual} bytes, {expected} needed for {width}x{height}")]
    ShortInput {
        expected: usize,
        actual: usize,
        width: u32,
        height: u32,
    },
    #[error("YUYV needs an even width, got {0}")]
    OddWidth(u32),
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

#[inline]
fn clip(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// BT.601 studio-swing to RGB using 8-bit fixed point coefficients
#[inline]
fn yuv_to_rgb(y: u8, d: i32, e: i32, out: &mut [u8]) {
    let c = 298 * (y as i32 - 16);
    out[0] = clip((c + 409 * e + 128) >> 8);
    out[1] = clip((c - 100 * d - 208 * e + 128) >> 8);
    out[2] = clip((c + 516 * d + 128) >> 8);
}

/// Convert packed YUYV (Y1 U Y2 V per pixel pair) to interleaved RGB24
pub fn yuyv_to_rgb(src: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    if width % 2 != 0 {
        return Err(ConvertError::OddWidth(width));
    }
    let pixels = width as usize * height as usize;
    let expected = pixels * 2;
    if src.len() < expected {
        return Err(ConvertError::ShortInput {
            expected,
            actual: src.len(),
            width,
            height,
        });
    }

    let mut rgb = vec![0u8; pixels * 3];
    for (yuyv, out) in src[..expected].chunks_exact(4).zip(rgb.chunks_exact_mut(6)) {
        let d = yuyv[1] as i32 - 128;
        let e = yuyv[3] as i32 - 128;
        let (first, second) = out.split_at_mut(3);
        yuv_to_rgb(yuyv[0], d, e, first);
        yuv_to_rgb(yuyv[2], d, e, second);
    }
    Ok(rgb)
}

/// Run a frame through the conversion stage
pub fn convert(frame: &Frame, target: PixelFormat) -> Result<Frame, ConvertError> {
    let format = frame.format();
    match (format.pixel_format, target) {
        (from, to) if from == to => Ok(frame.clone()),
        (PixelFormat::Yuyv, PixelFormat::Rgb24) => {
            let rgb = yuyv_to_rgb(frame.data(), format.width, format.height)?;
            Ok(Frame::new(
                rgb,
                format.with_pixel_format(PixelFormat::Rgb24),
                frame.sequence(),
            ))
        }
        (from, to) => Err(ConvertError::Unsupported { from, to }),
    }
}

/// Strip slot padding from a JPEG payload: everything past the last EOI
/// marker. Payloads without a marker are returned whole.
pub fn jpeg_payload(data: &[u8]) -> &[u8] {
    match data.windows(2).rposition(|w| w == [0xFF, 0xD9]) {
        Some(pos) => &data[..pos + 2],
        None => data,
    }
}

pub fn encode_jpeg(
    rgb: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Vec<u8>, ConvertError> {
    let mut out = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder.encode(rgb, width, height, ExtendedColorType::Rgb8)?;
    }
    Ok(out)
}

/// Encode an RGB24 frame, or pass MJPEG through trimmed
pub fn to_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, ConvertError> {
    let FrameFormat {
        pixel_format,
        width,
        height,
    } = frame.format();
    match pixel_format {
        PixelFormat::Mjpeg => Ok(jpeg_payload(frame.data()).to_vec()),
        PixelFormat::Rgb24 => encode_jpeg(frame.data(), width, height, quality),
        from => Err(ConvertError::Unsupported {
            from,
            to: PixelFormat::Mjpeg,
        }),
    }
}
