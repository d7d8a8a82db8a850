//! Termination protocol shared by producers and consumers.
//!
//! ```text
//!   RUNNING ──last producer exits──▶ DRAINING ──pop sees empty──▶ CLOSED
//! ```
//!
//! Producers never send an end-of-stream payload. Each one decrements
//! `producers_remaining` on exit; the last one flips `finished` and the
//! channel wakes every blocked consumer so it can re-check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::channel::FrameChannel;

/// Lifecycle of a channel as seen by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    /// At least one producer may still push
    Running,
    /// No producers left; buffered frames remain
    Draining,
    /// No producers left and nothing buffered; every pop returns `Closed`
    Closed,
}

/// Producer bookkeeping. `#[repr(C)]` so it can sit in a shared segment.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownState {
    pub producers_remaining: usize,
    pub finished: bool,
}

impl ShutdownState {
    pub fn new(producers: usize) -> Self {
        Self {
            producers_remaining: producers,
            // A channel nobody will ever push into is born draining
            finished: producers == 0,
        }
    }

    /// Record one producer exit. Returns true on the RUNNING → DRAINING
    /// transition, when consumers have to be woken.
    pub fn producer_exited(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.producers_remaining = self.producers_remaining.saturating_sub(1);
        if self.producers_remaining == 0 {
            self.finished = true;
            return true;
        }
        false
    }

    /// Force the finished state. Returns true if this call changed it.
    pub fn finish(&mut self) -> bool {
        let changed = !self.finished;
        self.producers_remaining = 0;
        self.finished = true;
        changed
    }

    pub fn phase(&self, buffer_empty: bool) -> ChannelPhase {
        match (self.finished, buffer_empty) {
            (false, _) => ChannelPhase::Running,
            (true, false) => ChannelPhase::Draining,
            (true, true) => ChannelPhase::Closed,
        }
    }
}

/// Reports a producer's exit to the channel when dropped, on every path
/// out of the acquisition loop including early returns and panics.
pub struct ProducerGuard<'a, C: FrameChannel + ?Sized> {
    channel: &'a C,
}

impl<'a, C: FrameChannel + ?Sized> ProducerGuard<'a, C> {
    pub fn new(channel: &'a C) -> Self {
        Self { channel }
    }
}

impl<C: FrameChannel + ?Sized> Drop for ProducerGuard<'_, C> {
    fn drop(&mut self) {
        self.channel.producer_done();
    }
}

/// Cooperative stop request shared between the signal handler and
/// producers. Checked between acquisitions, never interrupts one.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
