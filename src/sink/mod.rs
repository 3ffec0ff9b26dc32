//! Frame consumers: an ffmpeg encode stream or individual image files.
//!
//! [`QueuedSink`] owns the concurrency: a bounded flume queue feeding one
//! encode worker, so a slow writer stalls [`FrameSink::add_frame`] instead of
//! growing memory. Writers only deal with one frame at a time.

pub mod images;
pub mod video;

use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::error::SinkError;
use crate::pipeline::worker::{StopOutcome, Worker};
use crate::source::Frame;

pub use images::{ImageFileWriter, ImageTarget};
pub use video::{EncoderSettings, FfmpegEncoder};

/// Ordered consumer of restored frames.
pub trait FrameSink: Send {
    fn start(&mut self) -> Result<(), SinkError>;

    /// Queue a frame; blocks while the queue is full.
    fn add_frame(&mut self, frame: Frame) -> Result<(), SinkError>;

    /// Close the queue, finalise the artifact and wait up to `timeout`.
    ///
    /// If the worker does not finish in time the output is force-finalised
    /// and `StopOutcome::TimedOut` is returned; that is not an error.
    fn stop(&mut self, timeout: Duration) -> Result<StopOutcome, SinkError>;
}

/// Persists frames one at a time on the encode worker.
pub trait FrameWriter: Send + 'static {
    /// Acquire the output resource. Called on the caller's thread by `start`.
    fn open(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn write_frame(&mut self, frame: Frame) -> Result<(), SinkError>;

    /// Flush and close the artifact after the last frame.
    fn finish(&mut self) -> Result<(), SinkError>;

    /// Handle that can close the artifact from another thread if the worker
    /// hangs.
    fn finalizer(&self) -> Option<Box<dyn Finalizer>> {
        None
    }

    /// Human-readable output location.
    fn describe(&self) -> String;
}

/// Out-of-band finalisation of a writer's resource.
pub trait Finalizer: Send {
    fn force_finalize(&mut self, grace: Duration) -> Result<(), SinkError>;
}

enum SinkState<W> {
    Idle(W),
    Running {
        tx: Sender<Frame>,
        status: Receiver<Result<u64, SinkError>>,
        worker: Worker,
        finalizer: Option<Box<dyn Finalizer>>,
    },
    Stopped,
}

/// Bounded queue plus encode worker around a [`FrameWriter`].
pub struct QueuedSink<W: FrameWriter> {
    state: SinkState<W>,
    capacity: usize,
    description: String,
    failure: Option<SinkError>,
}

impl<W: FrameWriter> QueuedSink<W> {
    pub fn new(writer: W, capacity: usize) -> Self {
        Self {
            description: writer.describe(),
            state: SinkState::Idle(writer),
            capacity: capacity.max(1),
            failure: None,
        }
    }

    pub fn describe(&self) -> &str {
        &self.description
    }

    /// The worker's error, once it has given up.
    fn worker_failure(status: &Receiver<Result<u64, SinkError>>) -> SinkError {
        match status.try_recv() {
            Ok(Err(e)) => e,
            Ok(Ok(_)) | Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                SinkError::WorkerLost
            }
        }
    }
}

fn run_writer<W: FrameWriter>(
    mut writer: W,
    rx: Receiver<Frame>,
    status: Sender<Result<u64, SinkError>>,
) {
    let mut written = 0u64;
    for frame in rx.iter() {
        let latency = frame.timestamp.elapsed();
        if let Err(e) = writer.write_frame(frame) {
            // Report before the queue drops so add_frame can pick it up.
            let _ = status.send(Err(e));
            return;
        }
        written += 1;
        metrics::histogram!("frame_latency_ms").record(latency.as_secs_f64() * 1000.0);
    }
    debug!(frames = written, "Encode queue drained");
    let _ = status.send(writer.finish().map(|()| written));
}

impl<W: FrameWriter> FrameSink for QueuedSink<W> {
    fn start(&mut self) -> Result<(), SinkError> {
        let mut writer = match std::mem::replace(&mut self.state, SinkState::Stopped) {
            SinkState::Idle(writer) => writer,
            other => {
                self.state = other;
                return Err(SinkError::AlreadyStarted);
            }
        };

        writer.open()?;
        let finalizer = writer.finalizer();
        let (tx, rx) = flume::bounded(self.capacity);
        let (status_tx, status) = flume::bounded(1);
        let worker = Worker::spawn("frame-writer", move || run_writer(writer, rx, status_tx))?;

        info!(output = %self.description, capacity = self.capacity, "Frame sink started");
        self.state = SinkState::Running {
            tx,
            status,
            worker,
            finalizer,
        };
        Ok(())
    }

    fn add_frame(&mut self, frame: Frame) -> Result<(), SinkError> {
        let SinkState::Running { tx, status, .. } = &self.state else {
            return Err(SinkError::NotStarted);
        };
        if tx.send(frame).is_ok() {
            return Ok(());
        }

        let e = Self::worker_failure(status);
        self.failure = Some(SinkError::Encode(e.to_string()));
        Err(e)
    }

    fn stop(&mut self, timeout: Duration) -> Result<StopOutcome, SinkError> {
        let (tx, status, mut worker, finalizer) =
            match std::mem::replace(&mut self.state, SinkState::Stopped) {
                SinkState::Running {
                    tx,
                    status,
                    worker,
                    finalizer,
                } => (tx, status, worker, finalizer),
                SinkState::Idle(_) | SinkState::Stopped => return Ok(StopOutcome::AlreadyStopped),
            };

        // Closing the queue is the stop signal; the worker drains what is left.
        drop(tx);

        // One budget covers both the status wait and the join.
        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        match status.recv_deadline(deadline) {
            Ok(Ok(frames)) => {
                worker.join_timeout(remaining());
                info!(output = %self.description, frames, "Frame sink finalised");
                Ok(StopOutcome::Finished)
            }
            Ok(Err(e)) => {
                worker.join_timeout(remaining());
                Err(e)
            }
            // The worker's own report was already consumed by add_frame.
            Err(RecvTimeoutError::Disconnected) => {
                worker.join_timeout(remaining());
                Err(self.failure.take().unwrap_or(SinkError::WorkerLost))
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(output = %self.description, ?timeout, "Frame sink did not finish in time, forcing finalisation");
                if let Some(mut finalizer) = finalizer {
                    if let Err(e) = finalizer.force_finalize(timeout) {
                        warn!(error = %e, "Forced finalisation failed");
                    }
                }
                Ok(StopOutcome::TimedOut)
            }
        }
    }
}
