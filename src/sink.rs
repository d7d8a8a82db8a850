//! Persistence side: where consumed frames end up

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::capture::convert::{jpeg_payload, to_jpeg, ConvertError};
use crate::capture::{Frame, PixelFormat};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encoding frame {sequence}: {source}")]
    Encode {
        sequence: u64,
        #[source]
        source: ConvertError,
    },
}

/// Consumer-side collaborator. Shared by every consumer of a pipeline, so
/// it must tolerate concurrent calls.
pub trait FrameSink: Send + Sync {
    /// Store one frame; `frame.sequence()` is its delivery index
    fn persist(&self, frame: &Frame) -> Result<PathBuf, SinkError>;
}

impl<K: FrameSink + ?Sized> FrameSink for Box<K> {
    fn persist(&self, frame: &Frame) -> Result<PathBuf, SinkError> {
        (**self).persist(frame)
    }
}

/// Writes one file per frame into a directory
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
    jpeg_quality: u8,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>, jpeg_quality: u8) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| SinkError::Io {
            path: dir.clone(),
            source,
        })?;
        info!("Writing frames to {}", dir.display());
        Ok(Self { dir, jpeg_quality })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for a frame: raw YUYV keeps its bytes, MJPEG is already a
    /// JPEG, converted RGB gets encoded
    pub fn file_name(format: PixelFormat, sequence: u64) -> String {
        match format {
            PixelFormat::Yuyv => format!("frame_{sequence}.raw"),
            PixelFormat::Mjpeg => format!("frame_{sequence}.jpg"),
            PixelFormat::Rgb24 => format!("converted_frame_{sequence}.jpg"),
        }
    }
}

impl FrameSink for DirectorySink {
    fn persist(&self, frame: &Frame) -> Result<PathBuf, SinkError> {
        let format = frame.format().pixel_format;
        let path = self.dir.join(Self::file_name(format, frame.sequence()));

        let encoded;
        let bytes: &[u8] = match format {
            PixelFormat::Yuyv => frame.data(),
            PixelFormat::Mjpeg => jpeg_payload(frame.data()),
            PixelFormat::Rgb24 => {
                encoded = to_jpeg(frame, self.jpeg_quality).map_err(|source| SinkError::Encode {
                    sequence: frame.sequence(),
                    source,
                })?;
                &encoded
            }
        };

        fs::write(&path, bytes).map_err(|source| SinkError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::convert::encode_jpeg;
    use crate::capture::FrameFormat;

    #[test]
    fn names_follow_format() {
        assert_eq!(DirectorySink::file_name(PixelFormat::Yuyv, 3), "frame_3.raw");
        assert_eq!(DirectorySink::file_name(PixelFormat::Mjpeg, 0), "frame_0.jpg");
        assert_eq!(
            DirectorySink::file_name(PixelFormat::Rgb24, 12),
            "converted_frame_12.jpg"
        );
    }

    #[test]
    fn raw_frames_are_written_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("frame"), 90).unwrap();
        let frame = Frame::new(vec![1u8, 2, 3, 4], FrameFormat::new(PixelFormat::Yuyv, 2, 1), 5);

        let path = sink.persist(&frame).unwrap();
        assert_eq!(path, dir.path().join("frame").join("frame_5.raw"));
        assert_eq!(fs::read(path).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn mjpeg_padding_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path(), 90).unwrap();
        let jpeg = encode_jpeg(&[50u8; 64 * 64 * 3], 64, 64, 90).unwrap();
        let format = FrameFormat::new(PixelFormat::Mjpeg, 64, 64);
        assert!(jpeg.len() < format.frame_size());
        let mut slot = jpeg.clone();
        slot.resize(format.frame_size(), 0);

        let path = sink.persist(&Frame::new(slot, format, 0)).unwrap();
        assert_eq!(fs::read(path).unwrap(), jpeg);
    }

    #[test]
    fn rgb_frames_become_jpeg_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path(), 90).unwrap();
        let frame = Frame::new(vec![10u8; 4 * 4 * 3], FrameFormat::new(PixelFormat::Rgb24, 4, 4), 1);

        let path = sink.persist(&frame).unwrap();
        assert!(path.ends_with("converted_frame_1.jpg"));
        assert_eq!(&fs::read(path).unwrap()[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("gone"), 90).unwrap();
        fs::remove_dir(sink.dir()).unwrap();

        let frame = Frame::new(vec![0u8; 4], FrameFormat::new(PixelFormat::Yuyv, 2, 1), 0);
        assert!(matches!(sink.persist(&frame), Err(SinkError::Io { .. })));
    }
}
