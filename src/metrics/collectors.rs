//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library users and tests that never initialize metrics are
//! unaffected.

use super::prometheus::{
    DISPATCH_FAILURES, EXECUTIONS_ADMITTED, EXECUTIONS_CREATED, EXECUTIONS_FINISHED,
    RUNNING_EXECUTIONS, SCAN_DURATION, SWEEP_DURATION, ZOMBIES_REAPED,
};

/// Terminal outcome of an execution, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Completed,
    Failed,
    Killed,
    Zombie,
}

impl FinishOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishOutcome::Completed => "completed",
            FinishOutcome::Failed => "failed",
            FinishOutcome::Killed => "killed",
            FinishOutcome::Zombie => "zombie",
        }
    }
}

/// Metrics collector for recording coordinator operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a created execution. `origin` is `schedule`, `catch_up` or `manual`.
    pub fn record_created(&self, origin: &str) {
        if let Some(created) = EXECUTIONS_CREATED.get() {
            created.with_label_values(&[origin]).inc();
        }
    }

    pub fn record_admitted(&self) {
        if let Some(admitted) = EXECUTIONS_ADMITTED.get() {
            admitted.inc();
        }
    }

    pub fn record_dispatch_failure(&self) {
        if let Some(failures) = DISPATCH_FAILURES.get() {
            failures.inc();
        }
    }

    /// Record a terminal execution and, when known, how long the scan ran.
    pub fn record_finished(&self, outcome: FinishOutcome, duration_secs: Option<f64>) {
        if let Some(finished) = EXECUTIONS_FINISHED.get() {
            finished.with_label_values(&[outcome.as_str()]).inc();
        }
        if outcome == FinishOutcome::Zombie {
            if let Some(zombies) = ZOMBIES_REAPED.get() {
                zombies.inc();
            }
        }
        if let (Some(histogram), Some(secs)) = (SCAN_DURATION.get(), duration_secs) {
            histogram.observe(secs);
        }

        tracing::trace!(outcome = outcome.as_str(), ?duration_secs, "Recorded finish metric");
    }

    pub fn set_running(&self, running: u32) {
        if let Some(gauge) = RUNNING_EXECUTIONS.get() {
            gauge.set(f64::from(running));
        }
    }

    pub fn record_sweep(&self, sweep: &str, duration_secs: f64) {
        if let Some(histogram) = SWEEP_DURATION.get() {
            histogram.with_label_values(&[sweep]).observe(duration_secs);
        }
    }
}
