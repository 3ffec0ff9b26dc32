//! One PNG per restored frame.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::FrameWriter;
use crate::error::SinkError;
use crate::source::{Frame, PixelFormat};

/// Where restored images go.
#[derive(Debug, Clone)]
pub enum ImageTarget {
    /// `<dir>/<stem>_<suffix>.png`, stems indexed by frame sequence.
    Directory {
        dir: PathBuf,
        stems: Vec<String>,
        suffix: String,
    },
    /// A single output file (single-image input).
    File(PathBuf),
}

impl ImageTarget {
    pub fn path_for(&self, sequence: u64) -> Result<PathBuf, SinkError> {
        match self {
            ImageTarget::Directory { dir, stems, suffix } => {
                let stem = stems
                    .get(sequence as usize)
                    .ok_or(SinkError::UnnamedFrame(sequence))?;
                Ok(dir.join(format!("{stem}_{suffix}.png")))
            }
            ImageTarget::File(path) => Ok(path.clone()),
        }
    }
}

pub struct ImageFileWriter {
    target: ImageTarget,
}

impl ImageFileWriter {
    pub fn new(target: ImageTarget) -> Self {
        Self { target }
    }
}

fn save(frame: &Frame, path: &Path) -> Result<(), SinkError> {
    let image_error = |source| SinkError::Image {
        path: path.to_path_buf(),
        source,
    };
    let format = image::ImageFormat::from_path(path).unwrap_or(image::ImageFormat::Png);
    match frame.meta.format {
        PixelFormat::Rgb24 => frame
            .to_rgb8()
            .map_err(|e| SinkError::Encode(e.to_string()))?
            .save_with_format(path, format)
            .map_err(image_error),
        PixelFormat::Rgb48 => frame
            .to_rgb16()
            .map_err(|e| SinkError::Encode(e.to_string()))?
            .save_with_format(path, format)
            .map_err(image_error),
    }
}

impl FrameWriter for ImageFileWriter {
    fn open(&mut self) -> Result<(), SinkError> {
        if let ImageTarget::Directory { dir, .. } = &self.target {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: Frame) -> Result<(), SinkError> {
        let path = self.target.path_for(frame.sequence())?;
        save(&frame, &path)?;
        debug!(path = %path.display(), "Image written");
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.target {
            ImageTarget::Directory { dir, .. } => dir.display().to_string(),
            ImageTarget::File(path) => path.display().to_string(),
        }
    }
}
