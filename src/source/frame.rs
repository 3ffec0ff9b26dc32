use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::error::FrameError;

/// 16-bit interleaved RGB image.
pub type Rgb16Image = ImageBuffer<Rgb<u16>, Vec<u16>>;

/// One decoded or restored picture.
///
/// The sliding window holds clones of a frame in several slots at once when
/// it reflects at the stream edges, so a clone shares the pixel buffer and
/// metadata instead of duplicating them.
#[derive(Clone)]
pub struct Frame {
    /// Interleaved RGB samples, row-major, in `meta.format`.
    pub data: Bytes,

    pub meta: Arc<FrameMetadata>,

    /// When the source produced the frame.
    pub timestamp: Instant,
}

/// Stream position and geometry of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Position in the source stream, starting at 0.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel formats flowing through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8 bits per channel, interleaved.
    Rgb24,
    /// 16 bits per channel, interleaved, little-endian.
    Rgb48,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgb48 => 6,
        }
    }

    /// Largest channel value, used to normalise into `[0, 1]`.
    pub fn max_value(self) -> f32 {
        match self {
            PixelFormat::Rgb24 => u8::MAX as f32,
            PixelFormat::Rgb48 => u16::MAX as f32,
        }
    }

    /// Pixel format name understood by ffmpeg's rawvideo muxer/demuxer.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Rgb48 => "rgb48le",
        }
    }

    pub fn for_depth(depth: BitDepth) -> Self {
        match depth {
            BitDepth::Eight => PixelFormat::Rgb24,
            BitDepth::Sixteen => PixelFormat::Rgb48,
        }
    }
}

/// Output bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitDepth {
    Eight,
    Sixteen,
}

impl TryFrom<u8> for BitDepth {
    type Error = crate::error::JobError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(BitDepth::Eight),
            16 => Ok(BitDepth::Sixteen),
            other => Err(crate::error::JobError::BitDepth(other)),
        }
    }
}

impl Frame {
    /// Wrap a raw interleaved buffer, checking its length against the geometry.
    pub fn from_raw(
        sequence: u64,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Bytes,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                format,
            }),
            timestamp: Instant::now(),
        })
    }

    pub fn from_rgb8(sequence: u64, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: Bytes::from(image.into_raw()),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                format: PixelFormat::Rgb24,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn from_rgb16(sequence: u64, image: Rgb16Image) -> Self {
        let (width, height) = image.dimensions();
        let mut data = Vec::with_capacity(image.as_raw().len() * 2);
        for value in image.as_raw() {
            data.extend_from_slice(&value.to_le_bytes());
        }
        Self {
            data: Bytes::from(data),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                format: PixelFormat::Rgb48,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.meta.width, self.meta.height)
    }

    /// Channel value at `index` of the interleaved buffer, scaled into `[0, 1]`.
    #[inline]
    pub fn normalized(&self, index: usize) -> f32 {
        match self.meta.format {
            PixelFormat::Rgb24 => self.data[index] as f32 / u8::MAX as f32,
            PixelFormat::Rgb48 => {
                let lo = self.data[index * 2];
                let hi = self.data[index * 2 + 1];
                u16::from_le_bytes([lo, hi]) as f32 / u16::MAX as f32
            }
        }
    }

    /// Copy out as an 8-bit image. 16-bit frames are rounded down to 8 bits.
    pub fn to_rgb8(&self) -> Result<RgbImage, FrameError> {
        let raw: Vec<u8> = match self.meta.format {
            PixelFormat::Rgb24 => self.data.to_vec(),
            PixelFormat::Rgb48 => self
                .data
                .chunks_exact(2)
                .map(|b| (u16::from_le_bytes([b[0], b[1]]) >> 8) as u8)
                .collect(),
        };
        self.buffer(raw)
    }

    /// Copy out as a 16-bit image. 8-bit frames are widened.
    pub fn to_rgb16(&self) -> Result<Rgb16Image, FrameError> {
        let raw: Vec<u16> = match self.meta.format {
            PixelFormat::Rgb24 => self.data.iter().map(|&v| u16::from(v) * 257).collect(),
            PixelFormat::Rgb48 => self
                .data
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .collect(),
        };
        self.buffer(raw)
    }

    fn buffer<P: image::Pixel>(
        &self,
        raw: Vec<P::Subpixel>,
    ) -> Result<ImageBuffer<P, Vec<P::Subpixel>>, FrameError> {
        let actual = raw.len();
        ImageBuffer::from_raw(self.meta.width, self.meta.height, raw).ok_or(
            FrameError::BufferSize {
                expected: self.meta.width as usize * self.meta.height as usize * 3,
                actual,
            },
        )
    }

    /// Cubic resample to `width`x`height`, keeping pixel format, sequence and timestamp.
    pub fn resize(&self, width: u32, height: u32) -> Result<Frame, FrameError> {
        if self.dimensions() == (width, height) {
            return Ok(self.clone());
        }

        let mut resized = match self.meta.format {
            PixelFormat::Rgb24 => Frame::from_rgb8(
                self.sequence(),
                imageops::resize(&self.to_rgb8()?, width, height, FilterType::CatmullRom),
            ),
            PixelFormat::Rgb48 => Frame::from_rgb16(
                self.sequence(),
                imageops::resize(&self.to_rgb16()?, width, height, FilterType::CatmullRom),
            ),
        };
        resized.timestamp = self.timestamp;
        Ok(resized)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("bytes", &self.data.len())
            .finish()
    }
}
