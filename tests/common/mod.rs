//! Scripted stages for driving the orchestrator without ffmpeg.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{Rgb, RgbImage};

use vsr_stream::error::{InferenceError, SinkError, SourceError};
use vsr_stream::model::{FrameTensor, InferenceEngine, ModelInfo, ReferenceEngine, ReferenceMode, WindowTensor};
use vsr_stream::pipeline::{CancelToken, StopOutcome};
use vsr_stream::sink::FrameSink;
use vsr_stream::source::{Frame, FrameRate, FrameSource, StreamInfo};

pub const WIDTH: u32 = 4;
pub const HEIGHT: u32 = 2;

/// Solid frame whose channel value is its sequence number.
pub fn numbered_frame(sequence: u64) -> Frame {
    Frame::from_rgb8(
        sequence,
        RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([sequence as u8; 3])),
    )
}

/// Read the sequence number back out of a normalised plane.
pub fn decode_number(value: f32) -> u64 {
    (value * 255.0).round() as u64
}

#[derive(Default)]
pub struct Calls {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl Calls {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// Serves `count` numbered frames.
pub struct ScriptedSource {
    info: StreamInfo,
    count: u64,
    next: u64,
    fail_at: Option<u64>,
    cancel_at: Option<(u64, CancelToken)>,
    pub calls: Arc<Calls>,
}

impl ScriptedSource {
    pub fn new(count: u64) -> Self {
        Self {
            info: StreamInfo {
                width: WIDTH,
                height: HEIGHT,
                frame_rate: FrameRate::NTSC_FILM,
                estimated_count: count,
            },
            count,
            next: 0,
            fail_at: None,
            cancel_at: None,
            calls: Arc::default(),
        }
    }

    /// Report a decode error instead of frame `sequence`.
    pub fn failing_at(mut self, sequence: u64) -> Self {
        self.fail_at = Some(sequence);
        self
    }

    /// Raise `token` when frame `sequence` is requested, before any failure
    /// scripted for the same frame.
    pub fn cancelling_at(mut self, sequence: u64, token: CancelToken) -> Self {
        self.cancel_at = Some((sequence, token));
        self
    }
}

impl FrameSource for ScriptedSource {
    fn start(&mut self) -> Result<(), SourceError> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.next >= self.count {
            return Ok(None);
        }
        if let Some((at, token)) = &self.cancel_at {
            if *at == self.next {
                token.cancel();
            }
        }
        if self.fail_at == Some(self.next) {
            return Err(SourceError::Decode(format!("corrupt packet at {}", self.next)));
        }
        let frame = numbered_frame(self.next);
        self.next += 1;
        Ok(Some(frame))
    }

    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn stop(&mut self, _timeout: Duration) -> Result<StopOutcome, SourceError> {
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
        Ok(StopOutcome::Finished)
    }
}

/// Centre-frame reference engine that records each window it is fed.
pub struct RecordingEngine {
    inner: ReferenceEngine,
    pub windows: Arc<Mutex<Vec<Vec<u64>>>>,
}

impl RecordingEngine {
    pub fn new(clip_size: usize, scale: u32) -> Self {
        let info = ModelInfo {
            name: "recording".into(),
            clip_size,
            scale,
        };
        Self {
            inner: ReferenceEngine::new(info, ReferenceMode::Center).unwrap(),
            windows: Arc::default(),
        }
    }
}

impl InferenceEngine for RecordingEngine {
    fn info(&self) -> &ModelInfo {
        self.inner.info()
    }

    fn infer(&mut self, batch: &WindowTensor) -> Result<FrameTensor, InferenceError> {
        let [_, clip, _, _, _] = batch.shape();
        let window = (0..clip).map(|t| decode_number(batch.plane(t, 0)[0])).collect();
        self.windows.lock().unwrap().push(window);
        self.inner.infer(batch)
    }
}

/// What the sink saw.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub sequence: u64,
    pub value: u64,
    pub dimensions: (u32, u32),
}

/// Collects restored frames in memory.
#[derive(Default)]
pub struct CollectingSink {
    pub received: Arc<Mutex<Vec<Received>>>,
    pub calls: Arc<Calls>,
    fail_at: Option<u64>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(mut self, sequence: u64) -> Self {
        self.fail_at = Some(sequence);
        self
    }
}

impl FrameSink for CollectingSink {
    fn start(&mut self) -> Result<(), SinkError> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn add_frame(&mut self, frame: Frame) -> Result<(), SinkError> {
        if self.fail_at == Some(frame.sequence()) {
            return Err(SinkError::Encode("disk full".into()));
        }
        let value = frame
            .to_rgb8()
            .map(|image| image.get_pixel(0, 0).0[0] as u64)
            .unwrap_or(u64::MAX);
        self.received.lock().unwrap().push(Received {
            sequence: frame.sequence(),
            value,
            dimensions: frame.dimensions(),
        });
        Ok(())
    }

    fn stop(&mut self, _timeout: Duration) -> Result<StopOutcome, SinkError> {
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
        Ok(StopOutcome::Finished)
    }
}
