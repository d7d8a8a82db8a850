//! framepipe: acquire frames from a camera for a fixed time and store them
//! through a bounded producer/consumer pipeline

use std::path::PathBuf;

use clap::Parser;
use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use framepipe::capture::{FrameSource, PixelFormat, SyntheticSource, V4l2Source};
use framepipe::pipeline::{self, RunSummary};
use framepipe::sink::DirectorySink;
use framepipe::{utils, Backend, Config};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Capture encoding: YUYV or MJPG
    format: PixelFormat,
    height: u32,
    width: u32,
    /// Frames per second requested from the device
    framerate: u32,
    /// Acquisition time in seconds
    acquisition_time: u64,
    /// Producers, and consumers unless --consumers says otherwise
    thread_count: Option<usize>,

    /// TOML configuration file [default: framepipe.toml if present]
    #[arg(long)]
    config: Option<PathBuf>,
    /// Device node, `auto`, or `synthetic`
    #[arg(long)]
    device: Option<String>,
    #[arg(long, value_enum)]
    backend: Option<Backend>,
    /// Ring slots (one stays free)
    #[arg(long)]
    capacity: Option<usize>,
    #[arg(long)]
    consumers: Option<usize>,
    /// Directory frames are written to
    #[arg(long)]
    output: Option<PathBuf>,
    /// Convert YUYV frames to RGB before storing
    #[arg(long, overrides_with = "no_convert")]
    convert: bool,
    /// Store YUYV frames as captured
    #[arg(long, overrides_with = "convert")]
    no_convert: bool,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        config.capture.format = self.format;
        config.capture.height = self.height;
        config.capture.width = self.width;
        config.capture.fps = self.framerate;
        config.pipeline.acquisition_secs = self.acquisition_time;
        if let Some(threads) = self.thread_count {
            config.pipeline.producers = threads;
            config.pipeline.consumers = threads;
        }
        if let Some(consumers) = self.consumers {
            config.pipeline.consumers = consumers;
        }
        if let Some(device) = self.device {
            config.capture.device = device;
        }
        if let Some(backend) = self.backend {
            config.pipeline.backend = backend;
        }
        if let Some(capacity) = self.capacity {
            config.pipeline.ring_slots = capacity;
        }
        if let Some(output) = self.output {
            config.storage.output_dir = output;
        }
        if self.convert {
            config.pipeline.convert = true;
        } else if self.no_convert {
            config.pipeline.convert = false;
        }
    }
}

fn open_source(config: &Config) -> Result<Box<dyn FrameSource>> {
    let buffers = config.capture.buffer_count;
    let source: Box<dyn FrameSource> = match config.capture.device.as_str() {
        "synthetic" => Box::new(SyntheticSource::new()),
        "auto" => Box::new(V4l2Source::open(
            utils::auto_detect_device(config.capture.format)?,
            buffers,
        )?),
        path => Box::new(V4l2Source::open(path, buffers)?),
    };
    Ok(source)
}

fn report(summary: &RunSummary) {
    for (id, producer) in summary.producers.iter().enumerate() {
        info!(
            "Producer {}: {} frames, {} retries, ended on {}",
            id,
            producer.pushed,
            producer.would_block + producer.transient_errors,
            producer.end
        );
    }
    info!(
        "{} frames acquired, {} delivered, {} producer stalls in {:.1?}",
        summary.frames_acquired(),
        summary.channel.popped,
        summary.channel.producer_stalls,
        summary.elapsed
    );
    if !summary.consumers.is_empty() {
        let failed: u64 = summary.consumers.iter().map(|c| c.failed).sum();
        info!("{} frames saved, {} failed", summary.frames_persisted(), failed);
        if failed > 0 {
            warn!("Some frames could not be saved");
        }
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framepipe=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    info!("framepipe launching...");
    info!(
        "Capturing {} {}x{} at {} fps for {} s from {}",
        config.capture.format,
        config.capture.width,
        config.capture.height,
        config.capture.fps,
        config.pipeline.acquisition_secs,
        config.capture.device
    );

    let source = open_source(&config).wrap_err("opening capture device")?;
    let sink = DirectorySink::new(&config.storage.output_dir, config.storage.jpeg_quality)?;

    let summary = match config.pipeline.backend {
        Backend::Threads => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(pipeline::run_threads(&config, source, sink))?,
        // Forks consumers; no runtime may exist yet
        Backend::Processes => pipeline::run_processes(&config, source, sink)?,
    };

    report(&summary);
    if summary.failed_consumers > 0 {
        return Err(eyre!("{} consumers ended abnormally", summary.failed_consumers));
    }
    info!("framepipe shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSITIONALS: [&str; 6] = ["framepipe", "YUYV", "480", "640", "30", "5"];

    fn cli(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(POSITIONALS.iter().chain(args).copied())
    }

    fn parse(args: &[&str]) -> Config {
        let mut config = Config::default();
        cli(args).unwrap().apply(&mut config);
        config
    }

    #[test]
    fn convert_flags_are_bare_switches() {
        let mut config = Config::default();
        config.pipeline.convert = false;
        cli(&["--convert"]).unwrap().apply(&mut config);
        assert!(config.pipeline.convert);

        assert!(!parse(&["--no-convert"]).pipeline.convert);
        assert!(parse(&["--no-convert", "--convert"]).pipeline.convert);
        assert!(!parse(&["--convert", "--no-convert"]).pipeline.convert);
    }

    #[test]
    fn convert_defaults_to_the_configuration() {
        assert!(parse(&[]).pipeline.convert);
        // No value is taken; `true` lands on the thread count and fails there
        assert!(cli(&["--convert", "true"]).is_err());
    }

    #[test]
    fn thread_count_sets_both_sides_unless_overridden() {
        let config = parse(&["4", "--consumers", "2"]);
        assert_eq!(config.pipeline.producers, 4);
        assert_eq!(config.pipeline.consumers, 2);
        assert_eq!(config.capture.width, 640);
        assert_eq!(config.capture.height, 480);
    }
}
