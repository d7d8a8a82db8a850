//! Producer role: pull frames from the source, push them into the channel

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::channel::{ChannelError, FrameChannel};
use super::shutdown::{ProducerGuard, StopSignal};
use crate::capture::{Acquired, FrameSource};

#[derive(Debug, Clone, Copy)]
pub struct AcquisitionSettings {
    /// Wall-clock instant after which no new acquisition starts
    pub deadline: Instant,
    /// Pause after a WouldBlock or a transient error
    pub retry_backoff: Duration,
    /// Transient errors in a row tolerated before the source counts as lost
    pub max_consecutive_errors: u32,
}

impl AcquisitionSettings {
    pub fn for_duration(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
            retry_backoff: Duration::from_millis(5),
            max_consecutive_errors: 50,
        }
    }
}

/// Why a producer stopped
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EndReason {
    #[default]
    Deadline,
    Stopped,
    SourceLost(String),
    ChannelClosed,
    ChannelFailed(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Deadline => f.write_str("acquisition time elapsed"),
            EndReason::Stopped => f.write_str("stop requested"),
            EndReason::SourceLost(why) => write!(f, "source lost: {why}"),
            EndReason::ChannelClosed => f.write_str("channel closed"),
            EndReason::ChannelFailed(why) => write!(f, "channel failed: {why}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcquisitionReport {
    pub pushed: u64,
    pub would_block: u64,
    pub transient_errors: u64,
    pub end: EndReason,
}

pub struct AcquisitionLoop<'a, S: FrameSource + ?Sized, C: FrameChannel + ?Sized> {
    id: usize,
    source: &'a S,
    channel: &'a C,
    settings: AcquisitionSettings,
    stop: StopSignal,
}

impl<'a, S: FrameSource + ?Sized, C: FrameChannel + ?Sized> AcquisitionLoop<'a, S, C> {
    pub fn new(
        id: usize,
        source: &'a S,
        channel: &'a C,
        settings: AcquisitionSettings,
        stop: StopSignal,
    ) -> Self {
        Self {
            id,
            source,
            channel,
            settings,
            stop,
        }
    }

    /// Acquire until the deadline, a stop request or a fatal fault. The
    /// producer's exit is reported to the channel however the loop ends.
    #[instrument(skip_all, fields(producer = self.id))]
    pub fn run(self) -> AcquisitionReport {
        let _exit = ProducerGuard::new(self.channel);
        let mut report = AcquisitionReport::default();
        let mut consecutive_errors = 0u32;

        info!("Producer started");
        report.end = loop {
            if self.stop.is_raised() {
                break EndReason::Stopped;
            }
            if Instant::now() >= self.settings.deadline {
                break EndReason::Deadline;
            }

            match self.source.acquire() {
                Ok(Acquired::Frame(frame)) => {
                    consecutive_errors = 0;
                    match self.channel.push(&frame) {
                        Ok(()) => {
                            report.pushed += 1;
                            metrics::counter!("frames_acquired").increment(1);
                            debug!(sequence = frame.sequence(), "Frame queued");
                        }
                        Err(ChannelError::Closed) => break EndReason::ChannelClosed,
                        Err(e) => {
                            error!("Queueing frame failed: {}", e);
                            break EndReason::ChannelFailed(e.to_string());
                        }
                    }
                }
                Ok(Acquired::WouldBlock) => {
                    report.would_block += 1;
                    thread::sleep(self.settings.retry_backoff);
                }
                Err(e) if !e.is_fatal() => {
                    consecutive_errors += 1;
                    report.transient_errors += 1;
                    metrics::counter!("acquire_errors").increment(1);
                    if consecutive_errors > self.settings.max_consecutive_errors {
                        error!("Giving up after {} failed dequeues: {}", consecutive_errors, e);
                        break EndReason::SourceLost(format!(
                            "{consecutive_errors} consecutive failures, last: {e}"
                        ));
                    }
                    warn!("Dequeue failed, retrying: {}", e);
                    thread::sleep(self.settings.retry_backoff);
                }
                Err(e) => {
                    error!("Capture failed: {}", e);
                    metrics::counter!("acquire_errors").increment(1);
                    break EndReason::SourceLost(e.to_string());
                }
            }
        };

        info!(
            "Producer finished ({}): {} frames queued, {} transient errors",
            report.end, report.pushed, report.transient_errors
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::capture::{CaptureError, CaptureRequest, Frame, FrameFormat, PixelFormat};
    use crate::pipeline::{ChannelPhase, LocalChannel};

    fn format() -> FrameFormat {
        FrameFormat::new(PixelFormat::Yuyv, 2, 1)
    }

    /// Replays a script of outcomes, then reports the device gone
    struct Scripted {
        script: Mutex<Vec<Result<Acquired, CaptureError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut script: Vec<Result<Acquired, CaptureError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl FrameSource for Scripted {
        fn configure(&mut self, _: &CaptureRequest) -> Result<FrameFormat, CaptureError> {
            Ok(format())
        }
        fn start(&mut self) -> Result<(), CaptureError> {
            Ok(())
        }
        fn acquire(&self) -> Result<Acquired, CaptureError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(CaptureError::Fatal("unplugged".into())))
        }
        fn stop(&mut self) -> Result<(), CaptureError> {
            Ok(())
        }
    }

    fn frame(tag: u8) -> Result<Acquired, CaptureError> {
        Ok(Acquired::Frame(Frame::new(vec![tag; 4], format(), 0)))
    }

    fn transient() -> Result<Acquired, CaptureError> {
        Err(CaptureError::Transient(io::Error::from_raw_os_error(libc::EIO)))
    }

    fn settings() -> AcquisitionSettings {
        AcquisitionSettings {
            deadline: Instant::now() + Duration::from_secs(60),
            retry_backoff: Duration::ZERO,
            max_consecutive_errors: 3,
        }
    }

    #[test]
    fn skips_would_block_and_transient_errors() {
        let source = Scripted::new(vec![
            frame(1),
            Ok(Acquired::WouldBlock),
            transient(),
            frame(2),
        ]);
        let channel = LocalChannel::new(8, format(), 1).unwrap();

        let report = AcquisitionLoop::new(0, &source, &channel, settings(), StopSignal::new()).run();

        assert_eq!(report.pushed, 2);
        assert_eq!(report.would_block, 1);
        assert_eq!(report.transient_errors, 1);
        assert!(matches!(report.end, EndReason::SourceLost(_)));
        // Fatal source errors still release consumers
        assert_eq!(channel.phase(), ChannelPhase::Draining);
        assert_eq!(channel.pop().unwrap().data(), &[1; 4]);
        assert_eq!(channel.pop().unwrap().data(), &[2; 4]);
    }

    #[test]
    fn repeated_transient_errors_escalate() {
        let source = Scripted::new(vec![transient(), transient(), transient(), transient(), frame(9)]);
        let channel = LocalChannel::new(4, format(), 1).unwrap();

        let report = AcquisitionLoop::new(0, &source, &channel, settings(), StopSignal::new()).run();

        assert_eq!(report.pushed, 0);
        assert_eq!(report.transient_errors, 4);
        assert!(matches!(report.end, EndReason::SourceLost(ref why) if why.contains("consecutive")));
    }

    #[test]
    fn expired_deadline_acquires_nothing() {
        let source = Scripted::new(vec![frame(1)]);
        let channel = LocalChannel::new(4, format(), 1).unwrap();
        let settings = AcquisitionSettings {
            deadline: Instant::now(),
            ..settings()
        };

        let report = AcquisitionLoop::new(0, &source, &channel, settings, StopSignal::new()).run();

        assert_eq!(report.end, EndReason::Deadline);
        assert_eq!(source.calls.load(Ordering::Relaxed), 0);
        assert_eq!(channel.phase(), ChannelPhase::Closed);
    }

    #[test]
    fn stop_signal_ends_the_loop() {
        let source = Scripted::new(vec![frame(1)]);
        let channel = LocalChannel::new(4, format(), 2).unwrap();
        let stop = StopSignal::new();
        stop.raise();

        let report = AcquisitionLoop::new(0, &source, &channel, settings(), stop).run();

        assert_eq!(report.end, EndReason::Stopped);
        // One of two producers gone: consumers keep waiting
        assert_eq!(channel.phase(), ChannelPhase::Running);
    }

    #[test]
    fn closed_channel_ends_the_loop() {
        let source = Scripted::new(vec![frame(1), frame(2)]);
        let channel = LocalChannel::new(4, format(), 1).unwrap();
        channel.close();

        let report = AcquisitionLoop::new(0, &source, &channel, settings(), StopSignal::new()).run();
        assert_eq!(report.end, EndReason::ChannelClosed);
        assert_eq!(report.pushed, 0);
    }
}
