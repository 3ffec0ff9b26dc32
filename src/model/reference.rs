//! CPU reference engine described by a small TOML file.
//!
//! ```toml
//! name = "2x_reference"   # optional, defaults to the file stem
//! clip_size = 5
//! scale = 2
//! mode = "temporal_mean"  # or "center"
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use super::{FrameTensor, InferenceEngine, ModelInfo, WindowTensor};
use crate::error::{InferenceError, ModelError};

/// How the engine combines the window before upscaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceMode {
    /// Use the centre frame only.
    Center,
    /// Average every frame of the window.
    TemporalMean,
}

#[derive(Debug, Deserialize)]
struct ModelDescriptor {
    name: Option<String>,
    clip_size: usize,
    scale: u32,
    #[serde(default = "default_mode")]
    mode: ReferenceMode,
}

fn default_mode() -> ReferenceMode {
    ReferenceMode::Center
}

/// Nearest-neighbour upscaler that honours the full window contract.
pub struct ReferenceEngine {
    info: ModelInfo,
    mode: ReferenceMode,
}

impl ReferenceEngine {
    pub fn new(info: ModelInfo, mode: ReferenceMode) -> Result<Self, ModelError> {
        if info.clip_size == 0 || info.clip_size % 2 == 0 {
            return Err(ModelError::Invalid(format!(
                "clip_size must be odd, got {}",
                info.clip_size
            )));
        }
        if info.scale == 0 {
            return Err(ModelError::Invalid("scale must be at least 1".into()));
        }
        Ok(Self { info, mode })
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let descriptor: ModelDescriptor = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        let name = descriptor.name.unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "model".to_string())
        });

        let engine = Self::new(
            ModelInfo {
                name,
                clip_size: descriptor.clip_size,
                scale: descriptor.scale,
            },
            descriptor.mode,
        )?;
        info!(
            model = %engine.info.name,
            clip_size = engine.info.clip_size,
            scale = engine.info.scale,
            mode = ?engine.mode,
            "Reference model loaded"
        );
        Ok(engine)
    }

    pub fn mode(&self) -> ReferenceMode {
        self.mode
    }
}

impl InferenceEngine for ReferenceEngine {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn infer(&mut self, batch: &WindowTensor) -> Result<FrameTensor, InferenceError> {
        let [n, clip, channels, h, w] = batch.shape();
        if n != 1 || clip != self.info.clip_size {
            return Err(InferenceError::Shape(format!(
                "expected [1, {}, C, H, W], got {:?}",
                self.info.clip_size,
                batch.shape()
            )));
        }

        let scale = self.info.scale as usize;
        let (out_h, out_w) = (h * scale, w * scale);
        let mut out = Vec::with_capacity(channels * out_h * out_w);

        for c in 0..channels {
            let plane: Vec<f32> = match self.mode {
                ReferenceMode::Center => batch.plane(clip / 2, c).to_vec(),
                ReferenceMode::TemporalMean => {
                    let mut sum = vec![0.0f32; h * w];
                    for t in 0..clip {
                        for (acc, v) in sum.iter_mut().zip(batch.plane(t, c)) {
                            *acc += v;
                        }
                    }
                    sum.iter().map(|v| v / clip as f32).collect()
                }
            };

            for y in 0..out_h {
                let row = &plane[(y / scale) * w..(y / scale + 1) * w];
                for x in 0..out_w {
                    out.push(row[x / scale]);
                }
            }
        }

        FrameTensor::new([1, channels, out_h, out_w], out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::window::Window;
    use crate::source::Frame;
    use image::{Rgb, RgbImage};

    fn gray(seq: u64, v: u8) -> Frame {
        Frame::from_rgb8(seq, RgbImage::from_pixel(1, 1, Rgb([v, v, v])))
    }

    fn engine(clip_size: usize, scale: u32, mode: ReferenceMode) -> ReferenceEngine {
        ReferenceEngine::new(
            ModelInfo {
                name: "test".into(),
                clip_size,
                scale,
            },
            mode,
        )
        .unwrap()
    }

    #[test]
    fn test_center_mode_upscales_center_frame() {
        let window = Window::from_frames(vec![gray(0, 0), gray(1, 255), gray(2, 0)]);
        let batch = WindowTensor::from_window(&window).unwrap();
        let out = engine(3, 2, ReferenceMode::Center).infer(&batch).unwrap();
        assert_eq!(out.shape(), [1, 3, 2, 2]);
        assert!(out.data().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_temporal_mean_mode() {
        let window = Window::from_frames(vec![gray(0, 0), gray(1, 255), gray(2, 0)]);
        let batch = WindowTensor::from_window(&window).unwrap();
        let out = engine(3, 1, ReferenceMode::TemporalMean).infer(&batch).unwrap();
        assert!((out.data()[0] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_wrong_clip_size_rejected() {
        let batch = WindowTensor::synthetic(3, 2, 2);
        assert!(matches!(
            engine(5, 2, ReferenceMode::Center).infer(&batch),
            Err(InferenceError::Shape(_))
        ));
    }

    #[test]
    fn test_even_clip_size_rejected() {
        let result = ReferenceEngine::new(
            ModelInfo {
                name: "even".into(),
                clip_size: 4,
                scale: 1,
            },
            ReferenceMode::Center,
        );
        assert!(matches!(result, Err(ModelError::Invalid(_))));
    }

    #[test]
    fn test_load_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2x_mean.toml");
        std::fs::write(&path, "clip_size = 5\nscale = 2\nmode = \"temporal_mean\"\n").unwrap();

        let engine = ReferenceEngine::load(&path).unwrap();
        assert_eq!(engine.info().name, "2x_mean");
        assert_eq!(engine.info().clip_size, 5);
        assert_eq!(engine.info().scale, 2);
        assert_eq!(engine.mode(), ReferenceMode::TemporalMean);
    }
}
