//! Main loop: source → window → inference → sink.
//!
//! The orchestrator runs on one thread and is the only owner of the window
//! and the engine. Decode and encode run on the stages' own workers behind
//! bounded queues, so a slow encoder stalls `add_frame`, which in turn stops
//! further pulls from the source.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::metrics::{PipelineMetrics, ProgressLine};
use super::window::{SlidingWindowBuffer, StreamState};
use super::worker::StopOutcome;
use super::CancelToken;
use crate::error::{FrameError, PipelineError, SinkError};
use crate::model::{InferenceEngine, WindowTensor};
use crate::sink::FrameSink;
use crate::source::{BitDepth, Frame, FrameSource};

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Warmup,
    Running,
    Draining,
    ShuttingDown,
    Done,
}

/// Run parameters reaching the core from the job description.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Final frame size; restored frames of any other size are resized.
    pub output_resolution: Option<(u32, u32)>,
    /// Input frames are resized to this before they enter the window.
    pub presize: Option<(u32, u32)>,
    pub depth: BitDepth,
    /// Grace period for each stage's `stop`.
    pub shutdown_timeout: Duration,
    /// Size of the synthetic warm-up window, `None` to skip warm-up.
    pub warmup: Option<(u32, u32)>,
    pub progress: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            output_resolution: None,
            presize: None,
            depth: BitDepth::Sixteen,
            shutdown_timeout: Duration::from_secs(5),
            warmup: None,
            progress: false,
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed(PipelineError),
}

#[derive(Debug)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub frames_processed: u64,
    pub metrics: PipelineMetrics,
    /// `None` when the sink's own shutdown failed.
    pub sink: Option<StopOutcome>,
}

impl RunSummary {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, RunOutcome::Failed(_))
    }
}

enum LoopExit {
    Exhausted,
    Cancelled,
}

pub struct Pipeline {
    source: Box<dyn FrameSource>,
    engine: Box<dyn InferenceEngine>,
    sink: Box<dyn FrameSink>,
    window: SlidingWindowBuffer,
    options: PipelineOptions,
    cancel: CancelToken,
    state: PipelineState,
    metrics: PipelineMetrics,
    progress: ProgressLine,
}

impl Pipeline {
    /// The window length comes from the engine; an even clip size is rejected
    /// here, before any stage is started.
    pub fn new(
        source: Box<dyn FrameSource>,
        engine: Box<dyn InferenceEngine>,
        sink: Box<dyn FrameSink>,
        options: PipelineOptions,
        cancel: CancelToken,
    ) -> Result<Self, PipelineError> {
        let window = SlidingWindowBuffer::new(engine.info().clip_size)?;
        let metrics = PipelineMetrics::new(source.estimated_count());
        let progress = ProgressLine::new(options.progress);
        Ok(Self {
            source,
            engine,
            sink,
            window,
            options,
            cancel,
            state: PipelineState::Warmup,
            metrics,
            progress,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Drive the stream to the end, then shut both stages down.
    ///
    /// Shutdown runs on every path, including warm-up and start-up failures,
    /// and stops each stage exactly once.
    #[instrument(skip(self), fields(model = %self.engine.info().name))]
    pub fn run(mut self) -> RunSummary {
        let mut outcome = match self.execute() {
            Ok(LoopExit::Exhausted) => RunOutcome::Completed,
            Ok(LoopExit::Cancelled) => RunOutcome::Cancelled,
            // A stage torn down by the interrupt fails on its way out.
            Err(e @ (PipelineError::Source(_) | PipelineError::Sink(_)))
                if self.cancel.is_cancelled() =>
            {
                self.progress.finish();
                info!(stage = e.stage(), error = %e, "Stage error after cancellation");
                RunOutcome::Cancelled
            }
            Err(e) => {
                self.progress.finish();
                error!(stage = e.stage(), error = %e, "Pipeline failed");
                RunOutcome::Failed(e)
            }
        };

        let sink = match self.shutdown() {
            Ok(stopped) => Some(stopped),
            Err(e) => {
                error!(error = %e, "Frame sink failed to finalise");
                if !matches!(outcome, RunOutcome::Failed(_)) {
                    outcome = RunOutcome::Failed(e.into());
                }
                None
            }
        };

        RunSummary {
            outcome,
            frames_processed: self.metrics.frames_done(),
            metrics: self.metrics,
            sink,
        }
    }

    fn execute(&mut self) -> Result<LoopExit, PipelineError> {
        self.warmup()?;
        self.start_stages()?;
        self.process()
    }

    /// One throwaway inference so one-time backend setup is not timed.
    fn warmup(&mut self) -> Result<(), PipelineError> {
        if let Some((width, height)) = self.options.warmup {
            let started = Instant::now();
            let batch = WindowTensor::synthetic(self.window.clip_size(), width, height);
            self.engine.infer(&batch)?;
            debug!(width, height, elapsed = ?started.elapsed(), "Warm-up inference done");
        }
        self.state = PipelineState::Running;
        Ok(())
    }

    fn start_stages(&mut self) -> Result<(), PipelineError> {
        self.source.start()?;
        self.sink.start()?;
        Ok(())
    }

    fn process(&mut self) -> Result<LoopExit, PipelineError> {
        let mut last = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                self.progress.finish();
                info!(frames = self.metrics.frames_done(), "Cancellation requested");
                return Ok(LoopExit::Cancelled);
            }

            if self.state == PipelineState::Running {
                self.pull()?;
            }

            if self.window.state() == StreamState::Finished {
                return Ok(LoopExit::Exhausted);
            }
            if !self.window.ready() {
                continue;
            }

            self.emit()?;
            self.metrics.record(last.elapsed());
            last = Instant::now();
            self.progress.update(&self.metrics.progress_line());
        }
    }

    fn pull(&mut self) -> Result<(), PipelineError> {
        match self.source.next_frame()? {
            Some(frame) => {
                let frame = self.presize(frame)?;
                self.window.push(Some(frame))?;
            }
            None => {
                self.window.push(None)?;
                let total = self.window.frames_received();
                self.metrics.set_total(total);
                self.state = PipelineState::Draining;
                debug!(frames = total, "End of input, draining window");
            }
        }
        Ok(())
    }

    fn presize(&self, frame: Frame) -> Result<Frame, FrameError> {
        match self.options.presize {
            Some((width, height)) if frame.dimensions() != (width, height) => {
                frame.resize(width, height)
            }
            _ => Ok(frame),
        }
    }

    /// Restore the centre of the current window and hand it to the sink.
    fn emit(&mut self) -> Result<(), PipelineError> {
        let window = self
            .window
            .current_window()
            .ok_or(FrameError::EmptyWindow)?;
        let center = window.center().ok_or(FrameError::EmptyWindow)?;
        let (sequence, decoded_at) = (center.sequence(), center.timestamp);

        let batch = WindowTensor::from_window(&window)?;
        let restored = self.engine.infer(&batch)?;
        self.window.advance();

        let mut frame = restored.to_frame(sequence, self.options.depth)?;
        if let Some((width, height)) = self.options.output_resolution {
            if frame.dimensions() != (width, height) {
                frame = frame.resize(width, height)?;
            }
        }
        frame.timestamp = decoded_at;

        self.sink.add_frame(frame)?;
        Ok(())
    }

    /// Stop the source, then the sink, each with the configured grace period.
    fn shutdown(&mut self) -> Result<StopOutcome, SinkError> {
        self.state = PipelineState::ShuttingDown;
        self.progress.finish();
        let timeout = self.options.shutdown_timeout;

        match self.source.stop(timeout) {
            Ok(StopOutcome::TimedOut) => warn!(?timeout, "Frame source did not stop in time"),
            Ok(outcome) => debug!(?outcome, "Frame source stopped"),
            Err(e) => warn!(error = %e, "Frame source failed to stop cleanly"),
        }

        let stopped = self.sink.stop(timeout);
        match &stopped {
            Ok(StopOutcome::TimedOut) => {
                warn!(?timeout, "Frame sink did not finish in time, output was force-finalised")
            }
            Ok(outcome) => debug!(?outcome, "Frame sink stopped"),
            Err(_) => {}
        }
        self.state = PipelineState::Done;
        stopped
    }
}
