//! Spawning helpers shared by the ffmpeg decoder and encoder.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;

use crate::pipeline::worker::Worker;

/// Lines of child stderr kept for error messages.
pub const STDERR_TAIL_LINES: usize = 32;

/// Spawn `command` with stderr captured, in a process group of its own.
///
/// A terminal Ctrl-C reaches only this process; the pipeline decides when
/// and how its children stop.
pub fn spawn_detached(command: &mut Command) -> std::io::Result<(Child, StderrTail)> {
    command.stderr(Stdio::piped()).process_group(0);
    let mut child = command.spawn()?;
    let tail = match child.stderr.take() {
        Some(stderr) => StderrTail::drain(stderr),
        None => Ok(StderrTail::empty()),
    };
    match tail {
        Ok(tail) => Ok((child, tail)),
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(e)
        }
    }
}

/// Last lines a child wrote to stderr, read continuously on a worker so the
/// pipe never fills.
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    worker: Option<Worker>,
}

impl StderrTail {
    fn empty() -> Self {
        Self {
            lines: Arc::default(),
            worker: None,
        }
    }

    pub fn drain(stderr: ChildStderr) -> std::io::Result<Self> {
        let lines: Arc<Mutex<VecDeque<String>>> = Arc::default();
        let sink = Arc::clone(&lines);
        let worker = Worker::spawn("ffmpeg-stderr", move || {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        trace!(%line, "ffmpeg");
                        let Ok(mut lines) = sink.lock() else { break };
                        if lines.len() == STDERR_TAIL_LINES {
                            lines.pop_front();
                        }
                        lines.push_back(line);
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        })?;
        Ok(Self {
            lines,
            worker: Some(worker),
        })
    }

    /// Wait up to `wait` for the pipe to close, then join what was kept.
    ///
    /// A grandchild still holding the pipe only costs the wait; whatever was
    /// read so far is returned.
    pub fn text(&mut self, wait: Duration) -> String {
        if let Some(mut worker) = self.worker.take() {
            worker.join_timeout(wait);
        }
        self.lines
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }
}

/// Write an executable `sh` script standing in for ffmpeg.
#[cfg(test)]
pub(crate) fn fake_ffmpeg(dir: &std::path::Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("ffmpeg");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}
