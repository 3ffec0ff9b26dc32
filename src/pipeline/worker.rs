//! Named worker threads with a bounded join.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

/// How a stage shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Worker drained and exited within the grace period.
    Finished,
    /// Grace period elapsed; the resource was force-finalised instead.
    TimedOut,
    /// `stop` was already called, or the stage never started.
    AlreadyStopped,
}

/// A spawned stage worker.
///
/// The thread holds the sending half of a private channel for its whole
/// lifetime. The channel disconnects when the thread exits, including by
/// panic, which is what [`Worker::join_timeout`] waits on.
pub struct Worker {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    exited: Receiver<()>,
}

impl Worker {
    pub fn spawn<F>(name: &'static str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (alive, exited): (Sender<()>, Receiver<()>) = flume::bounded(0);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _alive = alive;
                body();
            })?;

        debug!(worker = name, "Worker started");
        Ok(Self {
            name,
            handle: Some(handle),
            exited,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.exited.is_disconnected()
    }

    /// Wait up to `timeout` for the thread to exit.
    ///
    /// On timeout the thread is detached and left to die with the process.
    pub fn join_timeout(&mut self, timeout: Duration) -> StopOutcome {
        let Some(handle) = self.handle.take() else {
            return StopOutcome::AlreadyStopped;
        };

        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(worker = self.name, ?timeout, "Worker did not exit in time");
                StopOutcome::TimedOut
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!(worker = self.name, "Worker panicked");
                }
                debug!(worker = self.name, "Worker joined");
                StopOutcome::Finished
            }
        }
    }
}
