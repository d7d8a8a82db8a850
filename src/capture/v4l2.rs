//! V4L2 capture through memory-mapped driver buffers

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::{
    fit_to_slot, Acquired, CaptureError, CaptureRequest, Frame, FrameFormat, FrameSource,
    PixelFormat,
};

/// V4L2 frame source.
///
/// The driver buffer ring is only touched while holding `stream`'s lock:
/// dequeue, copy out of the mapped buffer, requeue. Pushing the copied
/// frame into the pipeline happens after the lock is released.
pub struct V4l2Source {
    path: PathBuf,
    device: Device,
    buffer_count: u32,
    format: Option<FrameFormat>,
    stream: Mutex<Option<MmapStream<'static>>>,
    captured: AtomicU64,
}

impl V4l2Source {
    /// Open the device and make sure it can stream video
    pub fn open(path: impl AsRef<Path>, buffer_count: u32) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        info!("Opening V4L2 device {}", path.display());

        let device = Device::with_path(&path)
            .map_err(|e| CaptureError::Config(format!("cannot open {}: {e}", path.display())))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::Config(format!("querying capabilities failed: {e}")))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Config(
                "device doesn't support video capture".into(),
            ));
        }
        if !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(CaptureError::Config("device doesn't support streaming".into()));
        }

        Ok(Self {
            path,
            device,
            buffer_count: buffer_count.max(1),
            format: None,
            stream: Mutex::new(None),
            captured: AtomicU64::new(0),
        })
    }
}

fn fourcc_of(format: PixelFormat) -> FourCC {
    FourCC::new(&format.fourcc())
}

/// Sort a driver error into the capture taxonomy
fn classify(err: io::Error) -> Result<Acquired, CaptureError> {
    if err.kind() == io::ErrorKind::WouldBlock {
        return Ok(Acquired::WouldBlock);
    }
    match err.raw_os_error() {
        Some(libc::ENODEV) | Some(libc::ENXIO) | Some(libc::EBADF) => {
            Err(CaptureError::Fatal(err.to_string()))
        }
        _ => Err(CaptureError::Transient(err)),
    }
}

impl FrameSource for V4l2Source {
    #[instrument(skip(self), fields(device = %self.path.display()))]
    fn configure(&mut self, request: &CaptureRequest) -> Result<FrameFormat, CaptureError> {
        if !request.format.is_capture_format() {
            return Err(CaptureError::Config(format!(
                "{} is not a capture format",
                request.format
            )));
        }

        let mut fmt = self
            .device
            .format()
            .map_err(|e| CaptureError::Config(format!("reading format failed: {e}")))?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = fourcc_of(request.format);

        let accepted = self
            .device
            .set_format(&fmt)
            .map_err(|e| CaptureError::Config(format!("setting format failed: {e}")))?;

        if accepted.fourcc != fmt.fourcc {
            return Err(CaptureError::Config(format!(
                "device substituted {} for {}",
                accepted.fourcc, request.format
            )));
        }
        if accepted.width != request.width || accepted.height != request.height {
            warn!(
                "Requested {}x{}, device accepted {}x{}",
                request.width, request.height, accepted.width, accepted.height
            );
        }
        info!("Accepted format: {} {}x{}", accepted.fourcc, accepted.width, accepted.height);

        let params = self
            .device
            .set_params(&Parameters::with_fps(request.fps))
            .map_err(|e| CaptureError::Config(format!("setting frame rate failed: {e}")))?;
        info!(
            "Frame rate accepted: {}/{} FPS",
            params.interval.denominator, params.interval.numerator
        );

        let format = FrameFormat::new(request.format, accepted.width, accepted.height);
        info!("Frame size: {} bytes", format.frame_size());
        self.format = Some(format);
        Ok(format)
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.format.is_none() {
            return Err(CaptureError::Config("start before configure".into()));
        }

        let stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
                .map_err(|e| CaptureError::Config(format!("buffer request failed: {e}")))?;

        let mut slot = self
            .stream
            .lock()
            .map_err(|_| CaptureError::Fatal("device lock poisoned".into()))?;
        *slot = Some(stream);

        info!("Capture stream started with {} buffers", self.buffer_count);
        Ok(())
    }

    fn acquire(&self) -> Result<Acquired, CaptureError> {
        let format = self
            .format
            .ok_or_else(|| CaptureError::Fatal("source not configured".into()))?;
        let frame_size = format.frame_size();

        let data = {
            let mut guard = self
                .stream
                .lock()
                .map_err(|_| CaptureError::Fatal("device lock poisoned".into()))?;
            let stream = guard
                .as_mut()
                .ok_or_else(|| CaptureError::Fatal("stream not started".into()))?;

            // Requeues the previous buffer and dequeues the next one
            let (buf, meta) = match stream.next() {
                Ok(next) => next,
                Err(e) => return classify(e),
            };
            let used = match meta.bytesused as usize {
                0 => buf.len(),
                n => n.min(buf.len()),
            };
            fit_to_slot(&buf[..used], frame_size)
        };

        let sequence = self.captured.fetch_add(1, Ordering::Relaxed);
        debug!(sequence, "Dequeued frame");
        Ok(Acquired::Frame(Frame::new(data, format, sequence)))
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        let mut slot = self
            .stream
            .lock()
            .map_err(|_| CaptureError::Fatal("device lock poisoned".into()))?;
        if let Some(mut stream) = slot.take() {
            stream
                .stop()
                .map_err(|e| CaptureError::Fatal(format!("stream off failed: {e}")))?;
            info!(
                "Capture stream stopped after {} frames",
                self.captured.load(Ordering::Relaxed)
            );
        }
        Ok(())
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Stopping capture on {} failed: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_is_not_an_error() {
        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(matches!(classify(err), Ok(Acquired::WouldBlock)));
    }

    #[test]
    fn lost_device_is_fatal() {
        let err = io::Error::from_raw_os_error(libc::ENODEV);
        assert!(matches!(classify(err), Err(CaptureError::Fatal(_))));
    }

    #[test]
    fn io_glitch_is_transient() {
        let err = io::Error::from_raw_os_error(libc::EIO);
        assert!(matches!(classify(err), Err(CaptureError::Transient(_))));
    }

    #[test]
    fn missing_device_is_a_config_error() {
        let err = V4l2Source::open("/dev/framepipe-does-not-exist", 4)
            .err()
            .expect("open must fail");
        assert!(matches!(err, CaptureError::Config(_)));
    }
}
