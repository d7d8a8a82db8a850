//! Execution models: sibling threads in one process, or consumer processes
//! forked around a shared memory channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{error, info, warn};

use super::acquisition::{AcquisitionLoop, AcquisitionReport, AcquisitionSettings, EndReason};
use super::channel::{ChannelStats, FrameChannel};
use super::local::LocalChannel;
use super::persistence::{PersistenceLoop, PersistenceReport};
use super::shm::ShmChannel;
use super::shutdown::StopSignal;
use crate::capture::{FrameFormat, FrameSource, PixelFormat};
use crate::sink::FrameSink;
use crate::Config;

/// What a finished run did
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub format: FrameFormat,
    pub producers: Vec<AcquisitionReport>,
    /// Per-consumer reports; empty for the process model, where reports
    /// stay in the children
    pub consumers: Vec<PersistenceReport>,
    /// Consumers that ended abnormally
    pub failed_consumers: usize,
    pub channel: ChannelStats,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn frames_acquired(&self) -> u64 {
        self.producers.iter().map(|r| r.pushed).sum()
    }

    pub fn frames_persisted(&self) -> u64 {
        self.consumers.iter().map(|r| r.persisted).sum()
    }
}

/// Target format for the conversion stage, if it applies to `format`
fn conversion_target(config: &Config, format: &FrameFormat) -> Option<PixelFormat> {
    (config.pipeline.convert && format.pixel_format == PixelFormat::Yuyv)
        .then_some(PixelFormat::Rgb24)
}

fn acquisition_settings(config: &Config) -> Result<AcquisitionSettings> {
    let duration = Duration::from_secs(config.pipeline.acquisition_secs);
    let deadline = Instant::now()
        .checked_add(duration)
        .ok_or_else(|| eyre!("acquisition time of {} s is out of range", duration.as_secs()))?;
    Ok(AcquisitionSettings {
        deadline,
        retry_backoff: Duration::from_millis(config.pipeline.retry_backoff_ms),
        max_consecutive_errors: config.pipeline.max_consecutive_errors,
    })
}

/// Start one worker on its own OS thread. Workers block in the channel for
/// their whole life, so they must not occupy the runtime's bounded
/// blocking pool.
fn spawn_worker<T, F>(name: String, work: F) -> Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(work)
        .wrap_err_with(|| format!("spawning {name}"))
}

/// Join worker threads without stalling the runtime
async fn join_workers<T: Send + 'static>(
    handles: Vec<JoinHandle<T>>,
) -> Vec<thread::Result<T>> {
    let count = handles.len();
    let joined = tokio::task::spawn_blocking(move || {
        handles
            .into_iter()
            .map(JoinHandle::join)
            .collect::<Vec<_>>()
    });
    match joined.await {
        Ok(results) => results,
        Err(e) => {
            error!("Joining {} workers failed: {}", count, e);
            Vec::new()
        }
    }
}

fn pin_to_core(id: usize) {
    let Some(cores) = core_affinity::get_core_ids() else {
        warn!("CPU topology unavailable, producer {} not pinned", id);
        return;
    };
    if cores.is_empty() {
        return;
    }
    let core = cores[id % cores.len()];
    if core_affinity::set_for_current(core) {
        info!("Producer {} pinned to core {}", id, core.id);
    } else {
        warn!("Pinning producer {} to core {} failed", id, core.id);
    }
}

/// Run the producers on their own threads until they all finish. Ctrl-C
/// raises the stop signal; producers notice it between acquisitions.
async fn drive_producers<S, C>(
    config: &Config,
    settings: AcquisitionSettings,
    source: Arc<S>,
    channel: Arc<C>,
) -> Vec<AcquisitionReport>
where
    S: FrameSource + 'static,
    C: FrameChannel + 'static,
{
    let stop = StopSignal::new();
    let watcher = {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping acquisition");
                stop.raise();
            }
        })
    };

    let pin = config.pipeline.pin_producers;
    let mut handles = Vec::with_capacity(config.pipeline.producers);
    for id in 0..config.pipeline.producers {
        let source = Arc::clone(&source);
        let worker_channel = Arc::clone(&channel);
        let worker_stop = stop.clone();
        let spawned = spawn_worker(format!("producer-{id}"), move || {
            if pin {
                pin_to_core(id);
            }
            AcquisitionLoop::new(id, &*source, &*worker_channel, settings, worker_stop).run()
        });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                // Producers that never started cannot report their exit
                error!("{:#}", e);
                stop.raise();
                channel.close();
                break;
            }
        }
    }

    let reports = join_workers(handles)
        .await
        .into_iter()
        .map(|joined| {
            joined.unwrap_or_else(|_| {
                // The producer guard already reported the exit while unwinding
                error!("Producer thread panicked");
                AcquisitionReport {
                    end: EndReason::SourceLost("producer thread panicked".into()),
                    ..AcquisitionReport::default()
                }
            })
        })
        .collect();
    watcher.abort();
    reports
}

/// Stop the capture session once no producer holds the source any more
fn stop_source<S: FrameSource>(source: Arc<S>) {
    match Arc::try_unwrap(source) {
        Ok(mut source) => {
            if let Err(e) = source.stop() {
                warn!("Stopping capture failed: {}", e);
            }
        }
        Err(_) => warn!("Capture source still shared, leaving it running"),
    }
}

/// Multi-thread model: producers and consumers are sibling threads around
/// an in-process channel.
pub async fn run_threads<S, K>(config: &Config, mut source: S, sink: K) -> Result<RunSummary>
where
    S: FrameSource + 'static,
    K: FrameSink + 'static,
{
    let settings = acquisition_settings(config)?;
    let format = source
        .configure(&config.capture_request())
        .wrap_err("configuring capture")?;
    let channel = Arc::new(
        LocalChannel::new(config.pipeline.ring_slots, format, config.pipeline.producers)
            .wrap_err("creating channel")?,
    );
    source.start().wrap_err("starting capture")?;

    let started = Instant::now();
    let source = Arc::new(source);
    let sink = Arc::new(sink);
    let target = conversion_target(config, &format);

    info!(
        "Starting {} producers and {} consumers for {} s",
        config.pipeline.producers, config.pipeline.consumers, config.pipeline.acquisition_secs
    );

    let mut consumers = Vec::with_capacity(config.pipeline.consumers);
    for id in 0..config.pipeline.consumers {
        let worker_channel = Arc::clone(&channel);
        let worker_sink = Arc::clone(&sink);
        let spawned = spawn_worker(format!("consumer-{id}"), move || {
            PersistenceLoop::new(id, &*worker_channel, &*worker_sink)
                .converting_to(target)
                .run()
        });
        match spawned {
            Ok(handle) => consumers.push(handle),
            Err(e) => {
                channel.close();
                join_workers(consumers).await;
                stop_source(source);
                return Err(e);
            }
        }
    }

    let producers =
        drive_producers(config, settings, Arc::clone(&source), Arc::clone(&channel)).await;
    stop_source(source);

    let mut reports = Vec::with_capacity(consumers.len());
    let mut failed_consumers = 0;
    for joined in join_workers(consumers).await {
        match joined {
            Ok(report) => {
                if report.channel_error.is_some() {
                    failed_consumers += 1;
                }
                reports.push(report);
            }
            Err(_) => {
                error!("Consumer thread panicked");
                failed_consumers += 1;
            }
        }
    }

    Ok(RunSummary {
        format,
        producers,
        consumers: reports,
        failed_consumers,
        channel: channel.stats(),
        elapsed: started.elapsed(),
    })
}

/// Body of a forked consumer process; returns its exit code
fn consumer_child<K: FrameSink>(
    id: usize,
    channel: &ShmChannel,
    sink: &K,
    target: Option<PixelFormat>,
) -> i32 {
    // Ctrl-C is for the producers; consumers drain until closed
    if let Err(e) = unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) } {
        warn!("Consumer {} could not ignore SIGINT: {}", id, e);
    }
    let report = PersistenceLoop::new(id, channel, sink)
        .converting_to(target)
        .run();
    if report.channel_error.is_some() {
        1
    } else {
        0
    }
}

/// Wait for every child; returns how many ended abnormally
fn reap(children: &[Pid]) -> usize {
    let mut failed = 0;
    for &child in children {
        let status = loop {
            match waitpid(child, None) {
                Err(Errno::EINTR) => continue,
                other => break other,
            }
        };
        match status {
            Ok(WaitStatus::Exited(_, 0)) => info!("Consumer process {} exited", child),
            Ok(WaitStatus::Exited(_, code)) => {
                error!("Consumer process {} exited with {}", child, code);
                failed += 1;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                error!("Consumer process {} killed by {}", child, sig);
                failed += 1;
            }
            Ok(other) => {
                warn!("Consumer process {} ended as {:?}", child, other);
                failed += 1;
            }
            Err(e) => {
                error!("Waiting for consumer process {} failed: {}", child, e);
                failed += 1;
            }
        }
    }
    failed
}

/// Multi-process model: consumers are forked children sharing a memory
/// segment with the parent, whose threads run the producers. Must be
/// called before any other thread exists in the process.
pub fn run_processes<S, K>(config: &Config, mut source: S, sink: K) -> Result<RunSummary>
where
    S: FrameSource + 'static,
    K: FrameSink + 'static,
{
    let settings = acquisition_settings(config)?;
    let format = source
        .configure(&config.capture_request())
        .wrap_err("configuring capture")?;
    let channel = Arc::new(
        ShmChannel::create(
            &ShmChannel::unique_name(),
            config.pipeline.ring_slots,
            format,
            config.pipeline.producers,
        )
        .wrap_err("creating shared channel")?,
    );
    let target = conversion_target(config, &format);

    // Fork before the capture session starts so children never inherit
    // mapped device buffers.
    let mut children = Vec::with_capacity(config.pipeline.consumers);
    for id in 0..config.pipeline.consumers {
        // SAFETY: no other thread exists yet; the child only runs the
        // consumer loop and exits without returning.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = consumer_child(id, &channel, &sink, target);
                std::process::exit(code);
            }
            Ok(ForkResult::Parent { child }) => {
                info!("Consumer {} running as process {}", id, child);
                children.push(child);
            }
            Err(e) => {
                channel.close();
                reap(&children);
                return Err(eyre!("forking consumer {}: {}", id, e));
            }
        }
    }

    if let Err(e) = source.start() {
        channel.close();
        reap(&children);
        return Err(e).wrap_err("starting capture");
    }

    let started = Instant::now();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            channel.close();
            reap(&children);
            return Err(e).wrap_err("building runtime");
        }
    };
    let source = Arc::new(source);
    let producers = runtime.block_on(drive_producers(
        config,
        settings,
        Arc::clone(&source),
        Arc::clone(&channel),
    ));
    stop_source(source);

    let failed_consumers = reap(&children);
    let stats = channel.stats();
    info!("All consumer processes finished");

    Ok(RunSummary {
        format,
        producers,
        consumers: Vec::new(),
        failed_consumers,
        channel: stats,
        elapsed: started.elapsed(),
    })
}
