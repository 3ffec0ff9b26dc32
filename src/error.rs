//! Error taxonomy for the restoration pipeline.
//!
//! Each stage owns its own error type so the orchestrator can tell a decode
//! failure from an encode failure when it reports the run outcome.

use std::path::PathBuf;

/// Failures raised while producing frames.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("I/O error while reading input: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Frame source already started")]
    AlreadyStarted,

    #[error("Frame source not started")]
    NotStarted,

    #[error("Decode worker exited without signalling end of stream")]
    WorkerLost,
}

/// Failures raised while persisting restored frames.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error while writing output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("No output name for frame {0}")]
    UnnamedFrame(u64),

    #[error("Frame mismatch: expected {expected}, got {actual}")]
    FrameMismatch { expected: String, actual: String },

    #[error("Frame sink already started")]
    AlreadyStarted,

    #[error("Frame sink not started")]
    NotStarted,

    #[error("Encode worker exited without reporting a result")]
    WorkerLost,
}

/// Failures raised by an inference engine.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Input shape mismatch: {0}")]
    Shape(String),

    #[error("Inference backend error: {0}")]
    Backend(String),
}

/// Misuse of the sliding window.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("clip size must be odd and at least 1, got {0}")]
    InvalidClipSize(usize),

    #[error("frame pushed after end of input")]
    PushAfterEnd,
}

/// Pixel buffer conversions.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },

    #[error("Unsupported channel count {0}")]
    Channels(usize),

    #[error("Empty window")]
    EmptyWindow,

    #[error("Window frames differ in size: {0}")]
    MixedSizes(String),
}

/// Model descriptor loading.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Failed to read model descriptor: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid model descriptor: {0}")]
    Invalid(String),
}

/// Resolving inputs, outputs and run parameters before the pipeline starts.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("input path does not exist: {0}")]
    MissingInput(PathBuf),

    #[error("input video requires a video codec to be set")]
    VideoCodecRequired,

    #[error("output path must be a single video file")]
    VideoOutputIsDirectory,

    #[error("no input images found in {0}")]
    NoImages(PathBuf),

    #[error("invalid frame rate {0:?}")]
    FrameRate(String),

    #[error("invalid resolution {0:?}, expected W:H")]
    Resolution(String),

    #[error("unsupported bit depth {0}, expected 8 or 16")]
    BitDepth(u8),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Anything that can end a run early.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl PipelineError {
    /// Short stage label used in log lines.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Source(_) => "source",
            Self::Sink(_) => "sink",
            Self::Inference(_) => "inference",
            Self::Window(_) | Self::Frame(_) => "pipeline",
        }
    }
}
