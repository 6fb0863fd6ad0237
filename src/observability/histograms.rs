//! Latency histograms for storage, ledger and checkpoint operations.

use metrics::histogram;
use std::time::{Duration, Instant};

/// Records the elapsed time into a histogram when dropped.
pub struct LatencyTimer {
    start: Instant,
    metric_name: &'static str,
    label: Option<(&'static str, String)>,
}

impl LatencyTimer {
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
            label: None,
        }
    }

    pub fn with_label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.label = Some((key, value.into()));
        self
    }

    /// Get elapsed time without recording.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record now and consume the timer.
    pub fn record(self) {
        drop(self);
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        let seconds = self.start.elapsed().as_secs_f64();
        match &self.label {
            Some((key, value)) => {
                histogram!(self.metric_name, *key => value.clone()).record(seconds);
            }
            None => histogram!(self.metric_name).record(seconds),
        }
    }
}

/// Timer for a façade operation.
pub fn storage_timer(op: &'static str) -> LatencyTimer {
    LatencyTimer::new("evidence_storage_op_duration_seconds").with_label("op", op)
}

/// Timer for a ledger append.
pub fn ledger_timer() -> LatencyTimer {
    LatencyTimer::new("evidence_ledger_append_duration_seconds")
}

/// Timer for one checkpoint run.
pub fn checkpoint_timer() -> LatencyTimer {
    LatencyTimer::new("evidence_checkpoint_duration_seconds")
}
