//! Atomic send counters and a bounded log of recent errors.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};

/// Default number of error descriptions retained.
pub const DEFAULT_ERROR_CAPACITY: usize = 1000;

/// How many recent errors the summary prints.
const DISPLAYED_ERRORS: usize = 10;

/// Thread-safe counters shared by every dispatch loop and send attempt.
#[derive(Debug)]
pub struct DispatchMetrics {
    attempted: AtomicU64,
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    errors_recorded: AtomicU64,
    recent_errors: Mutex<VecDeque<String>>,
    error_capacity: usize,
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::with_error_capacity(DEFAULT_ERROR_CAPACITY)
    }
}

impl DispatchMetrics {
    /// Creates a collector retaining [`DEFAULT_ERROR_CAPACITY`] errors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collector retaining at most `capacity` errors; older ones are evicted.
    pub fn with_error_capacity(capacity: usize) -> Self {
        Self {
            attempted: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            errors_recorded: AtomicU64::new(0),
            recent_errors: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_ERROR_CAPACITY))),
            error_capacity: capacity,
        }
    }

    /// Records a send attempt that obtained an admission slot.
    pub fn record_attempt(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a transaction accepted by the endpoint.
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a transaction later seen as pending or included.
    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed attempt along with its cause.
    pub fn record_failed(&self, error: impl fmt::Display) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_error(error);
    }

    /// Records an error that is not tied to a send attempt.
    pub fn record_error(&self, error: impl fmt::Display) {
        self.errors_recorded.fetch_add(1, Ordering::Relaxed);
        if self.error_capacity == 0 {
            return;
        }
        let mut errors = self.recent_errors.lock().unwrap_or_else(PoisonError::into_inner);
        if errors.len() == self.error_capacity {
            errors.pop_front();
        }
        errors.push_back(error.to_string());
    }

    /// Returns the number of attempts.
    pub fn attempted(&self) -> u64 {
        self.attempted.load(Ordering::Relaxed)
    }

    /// Returns the number of accepted submissions.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Returns the number of verified transactions.
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    /// Returns the number of failed attempts.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Takes a point-in-time snapshot.
    pub fn summary(&self) -> MetricsSummary {
        let recent_errors = self
            .recent_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        MetricsSummary {
            attempted: self.attempted(),
            submitted: self.submitted(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            total_errors: self.errors_recorded.load(Ordering::Relaxed),
            recent_errors,
        }
    }
}

/// Snapshot of [`DispatchMetrics`] for printing or export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Attempts that obtained an admission slot.
    pub attempted: u64,
    /// Transactions accepted by the endpoint.
    pub submitted: u64,
    /// Transactions verified as pending or included.
    pub succeeded: u64,
    /// Attempts that failed.
    pub failed: u64,
    /// Errors recorded over the whole run, including evicted ones.
    pub total_errors: u64,
    /// Most recent error descriptions, oldest first.
    pub recent_errors: Vec<String>,
}

impl MetricsSummary {
    /// Fraction of attempts accepted by the endpoint, between 0.0 and 1.0.
    pub fn submit_rate(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.submitted as f64 / self.attempted as f64
    }
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Transaction Summary ===")?;
        writeln!(f, "Attempted: {}", self.attempted)?;
        writeln!(f, "Submitted: {}", self.submitted)?;
        writeln!(f, "Succeeded: {}", self.succeeded)?;
        writeln!(f, "Failed: {}", self.failed)?;

        if !self.recent_errors.is_empty() {
            let shown = self.recent_errors.len().min(DISPLAYED_ERRORS);
            writeln!(f, "\nShowing last {shown} of {} errors:", self.total_errors)?;
            for error in &self.recent_errors[self.recent_errors.len() - shown..] {
                writeln!(f, "  - {error}")?;
            }
        }

        write!(f, "===========================")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = DispatchMetrics::new();
        metrics.record_attempt();
        metrics.record_attempt();
        metrics.record_submitted();
        metrics.record_succeeded();
        metrics.record_failed("boom");

        let summary = metrics.summary();
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.recent_errors, vec!["boom".to_string()]);
        assert_eq!(summary.submit_rate(), 0.5);
    }

    #[test]
    fn test_error_log_is_bounded_and_keeps_newest() {
        let metrics = DispatchMetrics::with_error_capacity(3);
        for i in 0..10 {
            metrics.record_failed(format!("error {i}"));
        }

        let summary = metrics.summary();
        assert_eq!(summary.failed, 10);
        assert_eq!(summary.total_errors, 10);
        assert_eq!(summary.recent_errors, vec!["error 7", "error 8", "error 9"]);
    }

    #[test]
    fn test_record_error_does_not_count_failure() {
        let metrics = DispatchMetrics::new();
        metrics.record_error("balance check failed");
        assert_eq!(metrics.failed(), 0);
        assert_eq!(metrics.summary().total_errors, 1);
    }

    #[test]
    fn test_display_shows_tail() {
        let metrics = DispatchMetrics::new();
        for i in 0..12 {
            metrics.record_failed(format!("error {i}"));
        }
        let rendered = metrics.summary().to_string();
        assert!(rendered.contains("Showing last 10 of 12 errors"));
        assert!(rendered.contains("error 11"));
        assert!(!rendered.contains("error 1\n"));
    }
}
