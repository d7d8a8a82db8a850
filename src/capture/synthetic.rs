//! Test-pattern source for running the pipeline without a camera

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

use crate::capture::convert::encode_jpeg;
use crate::capture::{
    fit_to_slot, Acquired, CaptureError, CaptureRequest, Frame, FrameFormat, FrameSource,
    PixelFormat,
};

/// Emits a moving gradient at the configured frame rate
pub struct SyntheticSource {
    format: Option<FrameFormat>,
    interval: Duration,
    limit: Option<u64>,
    /// MJPEG frames are encoded once and replayed
    jpeg: Option<Vec<u8>>,
    next_due: Mutex<Instant>,
    emitted: AtomicU64,
    running: bool,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            format: None,
            interval: Duration::ZERO,
            limit: None,
            jpeg: None,
            next_due: Mutex::new(Instant::now()),
            emitted: AtomicU64::new(0),
            running: false,
        }
    }

    /// Report the device as lost after `frames` frames
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    fn yuyv_pattern(format: &FrameFormat, sequence: u64) -> Vec<u8> {
        let width = format.width as usize;
        let shift = sequence as usize;
        let mut data = Vec::with_capacity(format.frame_size());
        for row in 0..format.height as usize {
            for pair in 0..width / 2 {
                let y = ((pair * 2 + row + shift) % 220 + 16) as u8;
                data.extend_from_slice(&[y, 128, y.saturating_add(1), 128]);
            }
        }
        data
    }

    fn rgb_pattern(format: &FrameFormat) -> Vec<u8> {
        let mut rgb = Vec::with_capacity(format.width as usize * format.height as usize * 3);
        for row in 0..format.height {
            for col in 0..format.width {
                rgb.extend_from_slice(&[
                    (col * 255 / format.width.max(1)) as u8,
                    (row * 255 / format.height.max(1)) as u8,
                    128,
                ]);
            }
        }
        rgb
    }
}

impl FrameSource for SyntheticSource {
    fn configure(&mut self, request: &CaptureRequest) -> Result<FrameFormat, CaptureError> {
        if !request.format.is_capture_format() {
            return Err(CaptureError::Config(format!(
                "{} is not a capture format",
                request.format
            )));
        }
        let format = request.frame_format();
        if format.frame_size() == 0 {
            return Err(CaptureError::Config("empty frame geometry".into()));
        }

        if format.pixel_format == PixelFormat::Mjpeg {
            let rgb = Self::rgb_pattern(&format);
            let jpeg = encode_jpeg(&rgb, format.width, format.height, 80)
                .map_err(|e| CaptureError::Config(e.to_string()))?;
            self.jpeg = Some(fit_to_slot(&jpeg, format.frame_size()));
        }

        self.interval = match request.fps {
            0 => Duration::ZERO,
            fps => Duration::from_secs(1) / fps,
        };
        self.format = Some(format);
        info!("Synthetic source configured: {format} @ {} fps", request.fps);
        Ok(format)
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.format.is_none() {
            return Err(CaptureError::Config("start before configure".into()));
        }
        let mut due = self
            .next_due
            .lock()
            .map_err(|_| CaptureError::Fatal("pacing lock poisoned".into()))?;
        *due = Instant::now();
        self.running = true;
        Ok(())
    }

    fn acquire(&self) -> Result<Acquired, CaptureError> {
        if !self.running {
            return Err(CaptureError::Fatal("stream not started".into()));
        }
        let format = self
            .format
            .ok_or_else(|| CaptureError::Fatal("source not configured".into()))?;

        // Hold the pacing lock across the wait so concurrent producers
        // share one frame cadence, like a real device queue.
        let sequence = {
            let mut due = self
                .next_due
                .lock()
                .map_err(|_| CaptureError::Fatal("pacing lock poisoned".into()))?;
            let sequence = self.emitted.load(Ordering::Relaxed);
            if self.limit.is_some_and(|limit| sequence >= limit) {
                return Err(CaptureError::Fatal("synthetic stream exhausted".into()));
            }
            let now = Instant::now();
            if *due > now {
                std::thread::sleep(*due - now);
            }
            *due += self.interval;
            self.emitted.fetch_add(1, Ordering::Relaxed);
            sequence
        };

        let data = match &self.jpeg {
            Some(jpeg) => jpeg.clone(),
            None => Self::yuyv_pattern(&format, sequence),
        };
        Ok(Acquired::Frame(Frame::new(data, format, sequence)))
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(format: PixelFormat) -> CaptureRequest {
        CaptureRequest {
            format,
            width: 8,
            height: 4,
            fps: 0,
        }
    }

    #[test]
    fn yuyv_frames_fill_the_slot() {
        let mut source = SyntheticSource::new();
        let format = source.configure(&request(PixelFormat::Yuyv)).unwrap();
        source.start().unwrap();

        match source.acquire().unwrap() {
            Acquired::Frame(frame) => {
                assert_eq!(frame.len(), format.frame_size());
                assert_eq!(frame.sequence(), 0);
            }
            Acquired::WouldBlock => panic!("synthetic source never blocks"),
        }
    }

    #[test]
    fn mjpeg_frames_start_with_soi_marker() {
        let mut source = SyntheticSource::new();
        source.configure(&request(PixelFormat::Mjpeg)).unwrap();
        source.start().unwrap();

        let Acquired::Frame(frame) = source.acquire().unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(&frame.data()[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn limit_reports_device_loss() {
        let mut source = SyntheticSource::new().with_limit(2);
        source.configure(&request(PixelFormat::Yuyv)).unwrap();
        source.start().unwrap();

        assert!(source.acquire().is_ok());
        assert!(source.acquire().is_ok());
        let err = source.acquire().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(source.emitted(), 2);
    }

    #[test]
    fn acquire_before_start_fails() {
        let mut source = SyntheticSource::new();
        source.configure(&request(PixelFormat::Yuyv)).unwrap();
        assert!(source.acquire().is_err());
    }
}
