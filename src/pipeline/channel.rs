//! Bounded frame channel contract shared by both transport backends

use thiserror::Error;

use crate::capture::{Frame, FrameFormat};

pub use super::shutdown::ChannelPhase;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Producers are gone and the buffer is drained, or the channel was
    /// closed explicitly
    #[error("channel closed")]
    Closed,
    /// Only returned by non-blocking pushes
    #[error("channel full")]
    Full,
    #[error("frame is {actual} bytes, channel slots hold {expected}")]
    FrameSize { expected: usize, actual: usize },
    #[error("invalid channel geometry: {0}")]
    Geometry(String),
    #[error("synchronization primitive failed: {0}")]
    Sync(String),
}

/// Blocking multi-producer multi-consumer FIFO of fixed-size frames.
///
/// A full channel blocks producers; it never drops or overwrites. A pop
/// on an empty channel blocks until a frame arrives or the last producer
/// has left, after which it returns [`ChannelError::Closed`].
pub trait FrameChannel: Send + Sync {
    /// Block until a slot is free, then enqueue a copy of `frame`
    fn push(&self, frame: &Frame) -> Result<(), ChannelError>;

    /// Enqueue without blocking; [`ChannelError::Full`] when no slot is free
    fn try_push(&self, frame: &Frame) -> Result<(), ChannelError>;

    /// Block until a frame is available or the channel is closed. The
    /// returned frame carries its delivery sequence number.
    fn pop(&self) -> Result<Frame, ChannelError>;

    /// Dequeue without blocking; `Ok(None)` when empty but still running
    fn try_pop(&self) -> Result<Option<Frame>, ChannelError>;

    /// Stop accepting frames and wake every blocked consumer. Buffered
    /// frames are still delivered. Idempotent.
    fn close(&self);

    /// One producer has stopped pushing for good
    fn producer_done(&self);

    fn phase(&self) -> ChannelPhase;

    /// Frames currently buffered
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames the channel holds before producers block
    fn capacity(&self) -> usize;

    fn format(&self) -> FrameFormat;

    fn stats(&self) -> ChannelStats;
}

/// Lifetime counters of a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub pushed: u64,
    pub popped: u64,
    /// Pushes that found the buffer full and had to wait
    pub producer_stalls: u64,
}

/// Reject frames that would not fill exactly one slot
pub(crate) fn check_frame(frame: &Frame, frame_size: usize) -> Result<(), ChannelError> {
    if frame.len() != frame_size {
        return Err(ChannelError::FrameSize {
            expected: frame_size,
            actual: frame.len(),
        });
    }
    Ok(())
}

/// Validate slot count and frame geometry before allocating anything
pub(crate) fn check_geometry(slots: usize, format: &FrameFormat) -> Result<(), ChannelError> {
    if slots < 2 {
        return Err(ChannelError::Geometry(format!(
            "{slots} slots, at least 2 required"
        )));
    }
    let frame_size = format
        .checked_frame_size()
        .ok_or_else(|| ChannelError::Geometry(format!("frame size overflows ({format})")))?;
    if frame_size == 0 {
        return Err(ChannelError::Geometry(format!("empty frames ({format})")));
    }
    slots
        .checked_mul(frame_size)
        .map(|_| ())
        .ok_or_else(|| ChannelError::Geometry("slot region overflows".into()))
}
