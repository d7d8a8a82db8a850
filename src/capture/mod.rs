//! Frame sources and the pixel conversion stage.
//!
//! A [`FrameSource`] owns the device side of acquisition: negotiating a
//! format, bracketing the capture session and handing out one frame per
//! [`FrameSource::acquire`] call. It never sees the channel.

pub mod convert;
pub mod frame;
pub mod synthetic;
pub mod v4l2;

use std::io;

use thiserror::Error;

pub use convert::{convert, ConvertError};
pub use frame::{Frame, FrameFormat, PixelFormat};
pub use synthetic::SyntheticSource;
pub use v4l2::V4l2Source;

/// What the pipeline asks a device for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl CaptureRequest {
    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat::new(self.format, self.width, self.height)
    }
}

/// Outcome of a single acquisition attempt
#[derive(Debug)]
pub enum Acquired {
    Frame(Frame),
    /// No frame ready yet; try again
    WouldBlock,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture configuration rejected: {0}")]
    Config(String),
    #[error("transient capture failure: {0}")]
    Transient(#[source] io::Error),
    #[error("capture device lost: {0}")]
    Fatal(String),
}

impl CaptureError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CaptureError::Transient(_))
    }
}

/// Producer-side collaborator the acquisition loop pulls frames from.
///
/// `acquire` takes `&self` so several producers can share one source; an
/// implementation serializes its own hardware handoff internally and keeps
/// that lock independent of the channel's.
pub trait FrameSource: Send + Sync {
    /// Negotiate the capture format. Returns what the device accepted,
    /// which the channel is then sized for.
    fn configure(&mut self, request: &CaptureRequest) -> Result<FrameFormat, CaptureError>;

    fn start(&mut self) -> Result<(), CaptureError>;

    fn acquire(&self) -> Result<Acquired, CaptureError>;

    fn stop(&mut self) -> Result<(), CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn configure(&mut self, request: &CaptureRequest) -> Result<FrameFormat, CaptureError> {
        (**self).configure(request)
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        (**self).start()
    }

    fn acquire(&self) -> Result<Acquired, CaptureError> {
        (**self).acquire()
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        (**self).stop()
    }
}

/// Fit a device payload into a fixed-size slot: truncate long payloads,
/// zero-pad short (compressed) ones.
pub(crate) fn fit_to_slot(payload: &[u8], frame_size: usize) -> Vec<u8> {
    let mut data = vec![0u8; frame_size];
    let n = payload.len().min(frame_size);
    data[..n].copy_from_slice(&payload[..n]);
    data
}
