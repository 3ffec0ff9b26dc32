//! Turns command-line paths and options into configured stages.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, instrument};

use crate::error::{JobError, SourceError};
use crate::model::ModelInfo;
use crate::pipeline::PipelineOptions;
use crate::sink::{EncoderSettings, FfmpegEncoder, FrameSink, ImageFileWriter, ImageTarget, QueuedSink};
use crate::source::{
    probe_video, BitDepth, FfmpegVideoSource, FrameRate, FrameSource, ImageSequenceSource,
    StreamInfo,
};
use crate::utils::{self, file_stem, output_suffix};
use crate::Config;

/// What the input path turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum InputKind {
    Video(PathBuf),
    ImageDirectory { dir: PathBuf, images: Vec<PathBuf> },
    SingleImage(PathBuf),
}

impl InputKind {
    /// Classify `path`. Video input is only accepted when a codec is set.
    pub fn detect(path: &Path, codec: Option<&str>) -> Result<Self, JobError> {
        if !path.exists() {
            return Err(JobError::MissingInput(path.to_path_buf()));
        }
        if path.is_dir() {
            let images = utils::list_images(path)?;
            if images.is_empty() {
                return Err(JobError::NoImages(path.to_path_buf()));
            }
            return Ok(Self::ImageDirectory {
                dir: path.to_path_buf(),
                images,
            });
        }
        if utils::is_video_path(path) {
            if codec.is_none() {
                return Err(JobError::VideoCodecRequired);
            }
            return Ok(Self::Video(path.to_path_buf()));
        }
        Ok(Self::SingleImage(path.to_path_buf()))
    }

    fn images(&self) -> &[PathBuf] {
        match self {
            Self::Video(_) => &[],
            Self::ImageDirectory { images, .. } => images,
            Self::SingleImage(path) => std::slice::from_ref(path),
        }
    }
}

/// Where restored frames go.
#[derive(Debug, Clone)]
pub enum OutputPlan {
    Video(PathBuf),
    Images(ImageTarget),
}

impl OutputPlan {
    /// Apply the output path rules for the given input and mode.
    pub fn resolve(
        input: &InputKind,
        output: &Path,
        codec: Option<&str>,
        suffix: &str,
    ) -> Result<Self, JobError> {
        if codec.is_some() {
            if output.is_dir() {
                return Err(JobError::VideoOutputIsDirectory);
            }
            return Ok(Self::Video(output.to_path_buf()));
        }

        // A missing, extension-less path is a directory to be created.
        let is_dir = output.is_dir() || (output.extension().is_none() && !output.exists());
        let stems = |paths: &[PathBuf]| -> Vec<String> { paths.iter().map(|p| file_stem(p)).collect() };
        let target = match input {
            InputKind::Video(_) => return Err(JobError::VideoCodecRequired),
            InputKind::SingleImage(_) if !is_dir => ImageTarget::File(output.to_path_buf()),
            InputKind::SingleImage(_) | InputKind::ImageDirectory { .. } => {
                let dir = if is_dir {
                    output.to_path_buf()
                } else {
                    output
                        .parent()
                        .filter(|p| !p.as_os_str().is_empty())
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| PathBuf::from("."))
                };
                ImageTarget::Directory {
                    dir,
                    stems: stems(input.images()),
                    suffix: suffix.to_string(),
                }
            }
        };
        Ok(Self::Images(target))
    }
}

/// Options that come from the command line rather than the config file.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub codec: Option<String>,
    pub suffix: Option<String>,
    pub depth: Option<u8>,
    pub frame_rate: Option<FrameRate>,
    pub resolution: Option<(u32, u32)>,
    pub presize: bool,
}

/// A fully resolved run.
#[derive(Debug, Clone)]
pub struct Job {
    pub input: InputKind,
    pub output: OutputPlan,
    /// Encoder for video output.
    pub codec: Option<String>,
    /// Input stream as decoded, with the frame rate the run uses.
    pub stream: StreamInfo,
    pub depth: BitDepth,
    pub presize: Option<(u32, u32)>,
    pub output_resolution: (u32, u32),
}

impl Job {
    #[instrument(skip_all, fields(input = %request.input.display()))]
    pub fn resolve(request: &JobRequest, model: &ModelInfo, config: &Config) -> Result<Self, JobError> {
        let codec = request.codec.as_deref().or(config.encoder.codec.as_deref());
        let input = InputKind::detect(&request.input, codec)?;
        let suffix = output_suffix(model.scale, &model.name, request.suffix.as_deref());
        let output = OutputPlan::resolve(&input, &request.output, codec, &suffix)?;
        let depth = BitDepth::try_from(request.depth.unwrap_or(config.sink.depth))?;

        let mut stream = match &input {
            InputKind::Video(path) => probe_video(&config.source.ffprobe, path)?,
            other => {
                let images = other.images();
                let (width, height) = first_image_dimensions(images)?;
                StreamInfo {
                    width,
                    height,
                    frame_rate: config.source.fallback_frame_rate.parse()?,
                    estimated_count: images.len() as u64,
                }
            }
        };
        if let Some(rate) = request.frame_rate {
            stream.frame_rate = rate;
        }

        let scale = model.scale.max(1);
        let output_resolution = request.resolution.unwrap_or(if request.presize {
            (stream.width, stream.height)
        } else {
            (stream.width * scale, stream.height * scale)
        });
        // The model then upscales straight to the requested output size.
        let (out_width, out_height) = output_resolution;
        let presize = request
            .presize
            .then(|| ((out_width / scale).max(1), (out_height / scale).max(1)));

        let job = Self {
            input,
            output,
            codec: codec.map(str::to_string),
            stream,
            depth,
            presize,
            output_resolution,
        };
        info!(
            width = job.stream.width,
            height = job.stream.height,
            frames = job.stream.estimated_count,
            rate = %job.stream.frame_rate,
            output = ?job.output_resolution,
            presize = ?job.presize,
            "Job resolved"
        );
        Ok(job)
    }

    pub fn is_video_output(&self) -> bool {
        matches!(self.output, OutputPlan::Video(_))
    }

    pub fn build_source(&self, config: &Config) -> Result<Box<dyn FrameSource>, JobError> {
        let capacity = config.source.queue_capacity;
        let source: Box<dyn FrameSource> = match &self.input {
            InputKind::Video(path) => Box::new(FfmpegVideoSource::new(
                &config.source.ffmpeg,
                path,
                self.stream.clone(),
                capacity,
            )),
            other => Box::new(ImageSequenceSource::new(
                other.images().to_vec(),
                self.stream.frame_rate,
                capacity,
            )?),
        };
        Ok(source)
    }

    pub fn build_sink(&self, config: &Config) -> Box<dyn FrameSink> {
        let capacity = config.sink.queue_capacity;
        match &self.output {
            OutputPlan::Video(path) => {
                let (width, height) = self.output_resolution;
                let settings = EncoderSettings {
                    ffmpeg: config.encoder.ffmpeg.clone(),
                    codec: self.codec.clone().unwrap_or_else(|| "libx264".to_string()),
                    crf: config.encoder.crf,
                    preset: config.encoder.preset.clone(),
                    width,
                    height,
                    frame_rate: self.stream.frame_rate,
                    depth: self.depth,
                };
                Box::new(QueuedSink::new(FfmpegEncoder::new(settings, path), capacity))
            }
            OutputPlan::Images(target) => Box::new(QueuedSink::new(
                ImageFileWriter::new(target.clone()),
                capacity,
            )),
        }
    }

    pub fn pipeline_options(&self, config: &Config, progress: bool) -> PipelineOptions {
        let warmup = config.pipeline.warmup.then(|| {
            (config.pipeline.warmup_width, config.pipeline.warmup_height)
        });
        PipelineOptions {
            output_resolution: Some(self.output_resolution),
            presize: self.presize,
            depth: self.depth,
            shutdown_timeout: Duration::from_millis(config.pipeline.shutdown_timeout_ms),
            warmup,
            progress: progress && config.pipeline.progress,
        }
    }
}

fn first_image_dimensions(images: &[PathBuf]) -> Result<(u32, u32), JobError> {
    let first = images
        .first()
        .ok_or_else(|| JobError::NoImages(PathBuf::new()))?;
    image::image_dimensions(first)
        .map_err(|source| {
            SourceError::Image {
                path: first.clone(),
                source,
            }
            .into()
        })
}
