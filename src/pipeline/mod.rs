//! Bounded frame pipeline: ring buffer, channel backends, producer and
//! consumer loops, and the two execution models that wire them together.

pub mod acquisition;
pub mod channel;
pub mod local;
pub mod persistence;
pub mod ringbuf;
pub mod runner;
pub mod shm;
pub mod shutdown;

pub use acquisition::{AcquisitionLoop, AcquisitionReport, AcquisitionSettings, EndReason};
pub use channel::{ChannelError, ChannelStats, FrameChannel};
pub use local::LocalChannel;
pub use persistence::{PersistenceLoop, PersistenceReport};
pub use ringbuf::{RingBuffer, RingCursor};
pub use runner::{run_processes, run_threads, RunSummary};
pub use shm::ShmChannel;
pub use shutdown::{ChannelPhase, ProducerGuard, ShutdownState, StopSignal};
