//! Throughput and ETA accounting for the main loop.

use std::io::Write;
use std::time::Duration;

/// Running totals, written only by the orchestrator.
#[derive(Debug, Default, Clone)]
pub struct PipelineMetrics {
    frames_done: u64,
    total_elapsed: Duration,
    last_frame: Duration,
    estimated_total: u64,
}

impl PipelineMetrics {
    pub fn new(estimated_total: u64) -> Self {
        Self {
            estimated_total,
            ..Self::default()
        }
    }

    /// Account for one emitted frame that took `elapsed` end to end.
    pub fn record(&mut self, elapsed: Duration) {
        self.frames_done += 1;
        self.total_elapsed += elapsed;
        self.last_frame = elapsed;

        metrics::counter!("frames_processed").increment(1);
        metrics::histogram!("frame_time_ms").record(elapsed.as_secs_f64() * 1000.0);
    }

    /// Replace the estimate once the exact count is known.
    pub fn set_total(&mut self, total: u64) {
        self.estimated_total = total;
    }

    pub fn frames_done(&self) -> u64 {
        self.frames_done
    }

    pub fn estimated_total(&self) -> u64 {
        self.estimated_total
    }

    pub fn total_elapsed(&self) -> Duration {
        self.total_elapsed
    }

    pub fn last_frame(&self) -> Duration {
        self.last_frame
    }

    /// Instantaneous rate from the latest frame.
    pub fn fps(&self) -> f64 {
        let secs = self.last_frame.as_secs_f64();
        if secs > 0.0 {
            1.0 / secs
        } else {
            0.0
        }
    }

    pub fn average(&self) -> Option<Duration> {
        if self.frames_done == 0 {
            return None;
        }
        Some(self.total_elapsed.div_f64(self.frames_done as f64))
    }

    /// `(total_elapsed / frames_done) * frames_remaining`.
    pub fn eta(&self) -> Option<Duration> {
        let remaining = self.estimated_total.saturating_sub(self.frames_done);
        Some(self.average()?.mul_f64(remaining as f64))
    }

    /// `"12/300   fps: 4.20  frame time: 238.10ms   time remaining: 0h1m8s"`.
    pub fn progress_line(&self) -> String {
        let eta = self.eta().unwrap_or_default().as_secs();
        format!(
            "{}/{}   fps: {:.2}  frame time: {:.2}ms   time remaining: {}h{}m{}s",
            self.frames_done,
            self.estimated_total,
            self.fps(),
            self.last_frame.as_secs_f64() * 1000.0,
            eta / 3600,
            (eta / 60) % 60,
            eta % 60,
        )
    }

    /// `"Processed 3 images in 0:00:01.250, average 416.67ms per image"`.
    pub fn summary_line(&self) -> String {
        let average = self.average().unwrap_or_default().as_secs_f64() * 1000.0;
        format!(
            "Processed {} images in {}, average {:.2}ms per image",
            self.frames_done,
            format_elapsed(self.total_elapsed),
            average
        )
    }
}

/// `h:mm:ss.mmm`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        elapsed.subsec_millis()
    )
}

/// Single status line on stderr, overwritten in place.
///
/// Anything else printed while a line is showing must call [`finish`](Self::finish)
/// first so it lands on its own line.
#[derive(Debug, Default)]
pub struct ProgressLine {
    enabled: bool,
    dirty: bool,
}

impl ProgressLine {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            dirty: false,
        }
    }

    pub fn update(&mut self, line: &str) {
        if !self.enabled {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r{line} ");
        let _ = stderr.flush();
        self.dirty = true;
    }

    pub fn finish(&mut self) {
        if self.dirty {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr);
            self.dirty = false;
        }
    }
}
