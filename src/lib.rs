pub mod capture;
pub mod pipeline;
pub mod sink;
pub mod utils;

use std::path::{Path, PathBuf};

use capture::{CaptureRequest, PixelFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest ring allocation accepted, slots times frame size
pub const MAX_RING_BYTES: usize = 2 << 30;
/// Upper bound on producer plus consumer workers
pub const MAX_WORKERS: usize = 1024;
/// One week
pub const MAX_ACQUISITION_SECS: u64 = 7 * 24 * 3600;

/// Where the consumers run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Sibling threads around an in-process channel
    #[default]
    Threads,
    /// Forked consumer processes around a shared memory channel
    Processes,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("loading configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node, `auto` to search /dev/video*, or `synthetic` for the test pattern
    pub device: String,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub backend: Backend,
    /// Ring capacity; one slot stays free, so it holds one frame less
    pub ring_slots: usize,
    pub producers: usize,
    pub consumers: usize,
    pub acquisition_secs: u64,
    /// Convert YUYV frames to RGB before storing them
    pub convert: bool,
    pub retry_backoff_ms: u64,
    pub max_consecutive_errors: u32,
    pub pin_producers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
    pub jpeg_quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            format: PixelFormat::Yuyv,
            width: 640,
            height: 480,
            fps: 30,
            buffer_count: 4,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Threads,
            ring_slots: 16,
            producers: 1,
            consumers: 1,
            acquisition_secs: 10,
            convert: true,
            retry_backoff_ms: 5,
            max_consecutive_errors: 50,
            pin_producers: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("frame"),
            jpeg_quality: 90,
        }
    }
}

impl Config {
    /// Defaults, then `path` (or `framepipe.toml` if present), then
    /// `FRAMEPIPE__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("framepipe").required(false),
        };
        let config: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("FRAMEPIPE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let capture = &self.capture;
        let pipeline = &self.pipeline;

        if !capture.format.is_capture_format() {
            return invalid(format!("{} cannot be captured", capture.format));
        }
        if capture.width == 0 || capture.height == 0 {
            return invalid(format!("frame size {}x{}", capture.width, capture.height));
        }
        if capture.format == PixelFormat::Yuyv && capture.width % 2 != 0 {
            return invalid(format!("YUYV width must be even, got {}", capture.width));
        }
        if capture.fps == 0 {
            return invalid("framerate must be positive".into());
        }
        if capture.buffer_count == 0 {
            return invalid("at least one capture buffer is needed".into());
        }
        let frame_size = self
            .capture_request()
            .frame_format()
            .checked_frame_size()
            .filter(|size| *size <= MAX_RING_BYTES);
        let Some(frame_size) = frame_size else {
            return invalid(format!(
                "frame size {}x{} exceeds {} bytes",
                capture.width, capture.height, MAX_RING_BYTES
            ));
        };
        if pipeline.acquisition_secs == 0 || pipeline.acquisition_secs > MAX_ACQUISITION_SECS {
            return invalid(format!(
                "acquisition time {} s, expected 1..={}",
                pipeline.acquisition_secs, MAX_ACQUISITION_SECS
            ));
        }
        if pipeline.ring_slots < 2 {
            return invalid(format!("ring needs at least 2 slots, got {}", pipeline.ring_slots));
        }
        if pipeline.producers == 0 || pipeline.consumers == 0 {
            return invalid(format!(
                "need at least one producer and one consumer, got {} and {}",
                pipeline.producers, pipeline.consumers
            ));
        }
        if pipeline.ring_slots.saturating_mul(frame_size) > MAX_RING_BYTES {
            return invalid(format!(
                "{} slots of {} bytes exceed {} bytes",
                pipeline.ring_slots, frame_size, MAX_RING_BYTES
            ));
        }
        if pipeline.producers.saturating_add(pipeline.consumers) > MAX_WORKERS {
            return invalid(format!(
                "{} producers and {} consumers exceed {} workers",
                pipeline.producers, pipeline.consumers, MAX_WORKERS
            ));
        }
        if !(1..=100).contains(&self.storage.jpeg_quality) {
            return invalid(format!("JPEG quality {}", self.storage.jpeg_quality));
        }
        Ok(())
    }

    pub fn capture_request(&self) -> CaptureRequest {
        CaptureRequest {
            format: self.capture.format,
            width: self.capture.width,
            height: self.capture.height,
            fps: self.capture.fps,
        }
    }
}
