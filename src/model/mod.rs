//! Inference engine contract.
//!
//! An engine takes one temporal window shaped `[1, clip_size, C, H, W]`
//! (channel-first, values in `[0, 1]`) and returns the restored centre frame
//! shaped `[1, C, H * scale, W * scale]`. `clip_size` and `scale` are fixed
//! for the lifetime of the engine.

pub mod reference;

use crate::error::{FrameError, InferenceError};
use crate::pipeline::window::Window;
use crate::source::{BitDepth, Frame, PixelFormat};

pub use reference::{ReferenceEngine, ReferenceMode};

/// Channels per frame; the pipeline only carries RGB.
pub const CHANNELS: usize = 3;

/// Static properties of a loaded model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub clip_size: usize,
    pub scale: u32,
}

/// Restoration backend. Calls are strictly sequential; an engine is owned by
/// the orchestrator and never shared.
pub trait InferenceEngine: Send {
    fn info(&self) -> &ModelInfo;

    fn infer(&mut self, batch: &WindowTensor) -> Result<FrameTensor, InferenceError>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn info(&self) -> &ModelInfo {
        (**self).info()
    }

    fn infer(&mut self, batch: &WindowTensor) -> Result<FrameTensor, InferenceError> {
        (**self).infer(batch)
    }
}

/// Dense `[1, clip, C, H, W]` batch.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowTensor {
    shape: [usize; 5],
    data: Vec<f32>,
}

impl WindowTensor {
    /// Stack a window's frames, converting interleaved RGB to planar floats.
    pub fn from_window(window: &Window) -> Result<Self, FrameError> {
        let frames = window.frames();
        let first = frames.first().ok_or(FrameError::EmptyWindow)?;
        let (width, height) = first.dimensions();
        let (w, h) = (width as usize, height as usize);

        let mut data = Vec::with_capacity(frames.len() * CHANNELS * h * w);
        for frame in frames {
            if frame.dimensions() != (width, height) {
                return Err(FrameError::MixedSizes(format!(
                    "frame {} is {:?}, window is {:?}",
                    frame.sequence(),
                    frame.dimensions(),
                    (width, height)
                )));
            }
            for c in 0..CHANNELS {
                for i in 0..h * w {
                    data.push(frame.normalized(i * CHANNELS + c));
                }
            }
        }

        Ok(Self {
            shape: [1, frames.len(), CHANNELS, h, w],
            data,
        })
    }

    /// Constant mid-grey batch used to warm the engine up.
    pub fn synthetic(clip_size: usize, width: u32, height: u32) -> Self {
        let shape = [1, clip_size, CHANNELS, height as usize, width as usize];
        Self {
            shape,
            data: vec![0.5; shape.iter().product()],
        }
    }

    pub fn shape(&self) -> [usize; 5] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Plane `c` of frame `t`, `H * W` values.
    pub fn plane(&self, t: usize, c: usize) -> &[f32] {
        let [_, _, channels, h, w] = self.shape;
        let start = (t * channels + c) * h * w;
        &self.data[start..start + h * w]
    }
}

/// Dense `[1, C, H, W]` restored frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTensor {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl FrameTensor {
    pub fn new(shape: [usize; 4], data: Vec<f32>) -> Result<Self, InferenceError> {
        let expected: usize = shape.iter().product();
        if shape[0] != 1 || data.len() != expected {
            return Err(InferenceError::Shape(format!(
                "{} values for shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Clamp, quantise to `depth` and interleave into a frame.
    pub fn to_frame(&self, sequence: u64, depth: BitDepth) -> Result<Frame, FrameError> {
        let [_, channels, h, w] = self.shape;
        if channels != CHANNELS {
            return Err(FrameError::Channels(channels));
        }

        let format = PixelFormat::for_depth(depth);
        let max = format.max_value();
        let plane = h * w;
        let mut raw = Vec::with_capacity(plane * format.bytes_per_pixel());
        for i in 0..plane {
            for c in 0..CHANNELS {
                let value = (self.data[c * plane + i].clamp(0.0, 1.0) * max).round();
                match format {
                    PixelFormat::Rgb24 => raw.push(value as u8),
                    PixelFormat::Rgb48 => raw.extend_from_slice(&(value as u16).to_le_bytes()),
                }
            }
        }

        Frame::from_raw(sequence, w as u32, h as u32, format, raw.into())
    }
}
