//! Temporal sliding window with mirrored padding at both stream boundaries.
//!
//! For `clip_size = 2h + 1` every real frame `i` is emitted exactly once as
//! the centre of the window `[f(i-h) .. f(i+h)]`, where indices outside the
//! stream are mirrored across the first or last frame (without repeating the
//! boundary frame itself). For `h = 2` the first window of a long stream is
//! `[f2, f1, f0, f1, f2]`.

use std::collections::VecDeque;

use tracing::trace;

use crate::error::WindowError;
use crate::source::Frame;

/// Fill state of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing pushed yet.
    NotStarted,
    /// Fewer than `clip_size / 2 + 1` real frames buffered.
    FillingHead,
    /// Head padding applied; one window per pushed frame.
    Streaming,
    /// End of input seen, tail padding queued.
    DrainingTail,
    /// No full window can be formed any more.
    Finished,
}

/// Exactly `clip_size` frames in temporal order, handed to inference.
#[derive(Debug, Clone)]
pub struct Window {
    frames: Vec<Frame>,
}

impl Window {
    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The frame being restored.
    pub fn center(&self) -> Option<&Frame> {
        self.frames.get(self.frames.len() / 2)
    }

    /// Sequence numbers of the frames, oldest first.
    pub fn sequences(&self) -> Vec<u64> {
        self.frames.iter().map(Frame::sequence).collect()
    }
}

/// Mirror `index` into `0..len`, bouncing off both ends as often as needed.
fn reflect(index: i64, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len as i64 - 1);
    let m = index.rem_euclid(period);
    if m >= len as i64 {
        (period - m) as usize
    } else {
        m as usize
    }
}

pub struct SlidingWindowBuffer {
    clip_size: usize,
    half: usize,
    frames: VecDeque<Frame>,
    state: StreamState,
    received: u64,
}

impl SlidingWindowBuffer {
    pub fn new(clip_size: usize) -> Result<Self, WindowError> {
        if clip_size == 0 || clip_size % 2 == 0 {
            return Err(WindowError::InvalidClipSize(clip_size));
        }
        Ok(Self {
            clip_size,
            half: clip_size / 2,
            frames: VecDeque::with_capacity(clip_size + clip_size / 2),
            state: StreamState::NotStarted,
            received: 0,
        })
    }

    pub fn clip_size(&self) -> usize {
        self.clip_size
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Buffered entries, padding included.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Real frames pushed so far.
    pub fn frames_received(&self) -> u64 {
        self.received
    }

    /// Append a frame, or signal end of input with `None`.
    ///
    /// Repeating the end-of-input signal is a no-op; pushing a frame after it
    /// is an error.
    pub fn push(&mut self, frame: Option<Frame>) -> Result<(), WindowError> {
        match frame {
            Some(frame) => self.push_frame(frame),
            None => {
                self.end_of_input();
                Ok(())
            }
        }
    }

    fn push_frame(&mut self, frame: Frame) -> Result<(), WindowError> {
        match self.state {
            StreamState::DrainingTail | StreamState::Finished => {
                return Err(WindowError::PushAfterEnd)
            }
            StreamState::NotStarted | StreamState::FillingHead => {
                self.frames.push_back(frame);
                self.received += 1;
                self.state = StreamState::FillingHead;
                if self.frames.len() == self.half + 1 {
                    self.reflect_head();
                }
            }
            StreamState::Streaming => {
                self.frames.push_back(frame);
                self.received += 1;
            }
        }
        Ok(())
    }

    /// `[f0 .. fh]` becomes `[fh .. f1, f0 .. fh]`.
    fn reflect_head(&mut self) {
        let mirrored: Vec<Frame> = self.frames.iter().skip(1).cloned().collect();
        for frame in mirrored {
            self.frames.push_front(frame);
        }
        trace!(len = self.frames.len(), "Head reflected");
        self.state = StreamState::Streaming;
    }

    fn end_of_input(&mut self) {
        match self.state {
            StreamState::NotStarted => self.state = StreamState::Finished,
            StreamState::FillingHead => self.reflect_short_stream(),
            StreamState::Streaming => self.reflect_tail(),
            StreamState::DrainingTail | StreamState::Finished => return,
        }
        trace!(len = self.frames.len(), state = ?self.state, "End of input");
        self.finish_if_exhausted();
    }

    /// Mirror across the final frame: the `half` frames before it, reversed.
    fn reflect_tail(&mut self) {
        let len = self.frames.len();
        let start = len.saturating_sub(self.half + 1);
        let end = len.saturating_sub(1);
        let mirrored: Vec<Frame> = self.frames.range(start..end).rev().cloned().collect();
        self.frames.extend(mirrored);
        self.state = StreamState::DrainingTail;
    }

    /// Fewer real frames than one side of the window: build the whole padded
    /// stream at once, reflecting as many times as needed.
    fn reflect_short_stream(&mut self) {
        let real: Vec<Frame> = self.frames.drain(..).collect();
        let half = self.half as i64;
        let last = real.len() as i64 - 1;
        self.frames = (-half..=last + half)
            .map(|i| real[reflect(i, real.len())].clone())
            .collect();
        self.state = StreamState::DrainingTail;
    }

    fn finish_if_exhausted(&mut self) {
        if self.state == StreamState::DrainingTail && self.frames.len() < self.clip_size {
            self.frames.clear();
            self.state = StreamState::Finished;
        }
    }

    /// A full window is available.
    pub fn ready(&self) -> bool {
        matches!(
            self.state,
            StreamState::Streaming | StreamState::DrainingTail
        ) && self.frames.len() >= self.clip_size
    }

    /// The oldest `clip_size` entries, or `None` when not [`ready`](Self::ready).
    pub fn current_window(&self) -> Option<Window> {
        if !self.ready() {
            return None;
        }
        Some(Window::from_frames(
            self.frames.iter().take(self.clip_size).cloned().collect(),
        ))
    }

    /// Drop the oldest entry, sliding the window forward by one.
    pub fn advance(&mut self) -> Option<Frame> {
        let evicted = self.frames.pop_front();
        self.finish_if_exhausted();
        evicted
    }
}
