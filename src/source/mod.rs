//! Frame producers: decoded video or an ordered list of still images.
//!
//! Both implementations run a decode worker that feeds a bounded flume
//! channel. The orchestrator pulls from that channel through
//! [`FrameSource::next_frame`]; dropping the receiving half is the stop
//! signal for a worker blocked on a full queue.

pub mod frame;
pub mod images;
pub mod video;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use flume::{Receiver, RecvError};

use crate::error::{JobError, SourceError};
use crate::pipeline::worker::StopOutcome;

pub use frame::{BitDepth, Frame, FrameMetadata, PixelFormat};
pub use images::ImageSequenceSource;
pub use video::{probe_video, FfmpegVideoSource};

/// Rational frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    /// NTSC film rate, the fallback for still-image input.
    pub const NTSC_FILM: FrameRate = FrameRate {
        num: 24000,
        den: 1001,
    };

    pub fn new(num: u32, den: u32) -> Option<Self> {
        if num == 0 || den == 0 {
            return None;
        }
        let g = gcd(num, den);
        Some(Self {
            num: num / g,
            den: den / g,
        })
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl FromStr for FrameRate {
    type Err = JobError;

    /// Accepts `N/D`, a decimal such as `23.976`, or an integer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || JobError::FrameRate(s.to_string());
        let s = s.trim();

        if let Some((num, den)) = s.split_once('/') {
            let num = num.trim().parse().map_err(|_| bad())?;
            let den = den.trim().parse().map_err(|_| bad())?;
            return FrameRate::new(num, den).ok_or_else(bad);
        }

        if s.contains('.') {
            let value: f64 = s.parse().map_err(|_| bad())?;
            if !value.is_finite() || value <= 0.0 || value > u32::MAX as f64 / 1000.0 {
                return Err(bad());
            }
            return FrameRate::new((value * 1000.0).round() as u32, 1000).ok_or_else(bad);
        }

        let num = s.parse().map_err(|_| bad())?;
        FrameRate::new(num, 1).ok_or_else(bad)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Stream metadata known once the first frame (or a probe) has been seen.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    /// Best guess at the number of frames; 0 when unknown.
    pub estimated_count: u64,
}

/// A finite, ordered sequence of decoded frames.
pub trait FrameSource: Send {
    /// Start the decode worker. Fails with `AlreadyStarted` while running.
    fn start(&mut self) -> Result<(), SourceError>;

    /// Block until the next frame is decoded.
    ///
    /// `Ok(None)` is the end of the stream; decode failures are `Err` and are
    /// never reported as a short stream.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    fn info(&self) -> &StreamInfo;

    fn resolution(&self) -> (u32, u32) {
        (self.info().width, self.info().height)
    }

    fn frame_rate(&self) -> FrameRate {
        self.info().frame_rate
    }

    fn estimated_count(&self) -> u64 {
        self.info().estimated_count
    }

    /// Close the queue and wait up to `timeout` for the decode worker.
    fn stop(&mut self, timeout: Duration) -> Result<StopOutcome, SourceError>;
}

/// What a decode worker puts on the queue.
pub(crate) enum Decoded {
    Frame(Frame),
    End,
    Failed(SourceError),
}

/// Receiving end shared by both sources.
///
/// Remembers end-of-stream so repeated pulls after the end keep returning
/// `None` instead of reporting a lost worker.
pub(crate) struct DecodedQueue {
    rx: Option<Receiver<Decoded>>,
    ended: bool,
}

impl DecodedQueue {
    pub(crate) fn new() -> Self {
        Self {
            rx: None,
            ended: false,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.rx.is_some()
    }

    pub(crate) fn open(&mut self, rx: Receiver<Decoded>) {
        self.rx = Some(rx);
        self.ended = false;
    }

    pub(crate) fn close(&mut self) {
        self.rx = None;
    }

    pub(crate) fn recv(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.ended {
            return Ok(None);
        }
        let rx = self.rx.as_ref().ok_or(SourceError::NotStarted)?;
        match rx.recv() {
            Ok(Decoded::Frame(frame)) => Ok(Some(frame)),
            Ok(Decoded::End) => {
                self.ended = true;
                Ok(None)
            }
            Ok(Decoded::Failed(e)) => {
                self.ended = true;
                Err(e)
            }
            Err(RecvError::Disconnected) => Err(SourceError::WorkerLost),
        }
    }
}
