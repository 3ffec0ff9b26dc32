pub mod error;
pub mod job;
pub mod model;
pub mod pipeline;
pub mod sink;
pub mod source;
mod subprocess;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use error::{JobError, PipelineError, SinkError, SourceError};
pub use job::{Job, JobRequest};
pub use model::{InferenceEngine, ModelInfo, ReferenceEngine};
pub use pipeline::{CancelToken, Pipeline, PipelineOptions, RunOutcome, RunSummary};
pub use source::{Frame, FrameRate, PixelFormat};

/// Environment variable prefix; `VSR__SINK__DEPTH=8` sets `sink.depth`.
pub const ENV_PREFIX: &str = "VSR";

/// Run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub encoder: EncoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run one synthetic inference before timing starts
    pub warmup: bool,
    pub warmup_width: u32,
    pub warmup_height: u32,
    /// Grace period for stopping each stage
    pub shutdown_timeout_ms: u64,
    pub progress: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    /// Decoded frames buffered ahead of the window
    pub queue_capacity: usize,
    /// Frame rate for still-image input
    pub fallback_frame_rate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Restored frames buffered ahead of the writer
    pub queue_capacity: usize,
    /// Bits per channel, 8 or 16
    pub depth: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg: String,
    /// Setting a codec switches the output to video
    pub codec: Option<String>,
    pub crf: u32,
    pub preset: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            warmup: true,
            warmup_width: 720,
            warmup_height: 540,
            shutdown_timeout_ms: 5000,
            progress: true,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            queue_capacity: 8,
            fallback_frame_rate: FrameRate::NTSC_FILM.to_string(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            depth: 16,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            codec: None,
            crf: 11,
            preset: "slow".into(),
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then `VSR__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
