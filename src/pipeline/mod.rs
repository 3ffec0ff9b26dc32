pub mod metrics;
pub mod orchestrator;
pub mod window;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use metrics::{format_elapsed, PipelineMetrics, ProgressLine};
pub use orchestrator::{Pipeline, PipelineOptions, PipelineState, RunOutcome, RunSummary};
pub use window::{SlidingWindowBuffer, StreamState, Window};
pub use worker::{StopOutcome, Worker};

/// Interrupt flag checked by the orchestrator between iterations.
///
/// Clones share the flag, so a signal handler can hold one while the
/// pipeline holds another.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let handler = token.clone();
        assert!(!token.is_cancelled());
        handler.cancel();
        assert!(token.is_cancelled());
    }
}
