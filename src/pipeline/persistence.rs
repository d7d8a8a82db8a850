//! Consumer role: drain the channel into the sink

use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use super::channel::{ChannelError, FrameChannel};
use crate::capture::{convert, PixelFormat};
use crate::sink::FrameSink;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceReport {
    pub persisted: u64,
    pub failed: u64,
    /// Frames stored unconverted because conversion failed
    pub conversion_failures: u64,
    /// Set when the loop ended on a channel fault rather than shutdown
    pub channel_error: Option<String>,
}

pub struct PersistenceLoop<'a, C: FrameChannel + ?Sized, K: FrameSink + ?Sized> {
    id: usize,
    channel: &'a C,
    sink: &'a K,
    convert_to: Option<PixelFormat>,
}

impl<'a, C: FrameChannel + ?Sized, K: FrameSink + ?Sized> PersistenceLoop<'a, C, K> {
    pub fn new(id: usize, channel: &'a C, sink: &'a K) -> Self {
        Self {
            id,
            channel,
            sink,
            convert_to: None,
        }
    }

    /// Convert every frame to `target` before it is persisted
    pub fn converting_to(mut self, target: Option<PixelFormat>) -> Self {
        self.convert_to = target;
        self
    }

    /// Pop and persist until the channel reports closed. A frame that fails
    /// to persist is logged and skipped; the loop carries on.
    #[instrument(skip_all, fields(consumer = self.id))]
    pub fn run(self) -> PersistenceReport {
        let mut report = PersistenceReport::default();
        info!("Consumer started");

        loop {
            let frame = match self.channel.pop() {
                Ok(frame) => frame,
                Err(ChannelError::Closed) => break,
                Err(e) => {
                    error!("Channel failed: {}", e);
                    report.channel_error = Some(e.to_string());
                    break;
                }
            };
            let sequence = frame.sequence();

            let frame = match self.convert_to {
                Some(target) if target != frame.format().pixel_format => {
                    match convert(&frame, target) {
                        Ok(converted) => converted,
                        Err(e) => {
                            warn!(sequence, "Conversion failed, storing raw frame: {}", e);
                            report.conversion_failures += 1;
                            frame
                        }
                    }
                }
                _ => frame,
            };

            let started = Instant::now();
            match self.sink.persist(&frame) {
                Ok(path) => {
                    report.persisted += 1;
                    metrics::counter!("frames_persisted").increment(1);
                    metrics::histogram!("persist_time_us")
                        .record(started.elapsed().as_micros() as f64);
                    debug!(sequence, "Saved {}", path.display());
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::counter!("persist_failures").increment(1);
                    error!(sequence, "Error saving the frame: {}", e);
                }
            }
        }

        info!(
            "Consumer finished: {} frames saved, {} failed",
            report.persisted, report.failed
        );
        report
    }
}
