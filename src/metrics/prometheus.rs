//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the coordinator and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all coordinator metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Executions created, labeled by origin (schedule, catch_up, manual).
pub static EXECUTIONS_CREATED: OnceLock<CounterVec> = OnceLock::new();

/// Executions promoted from queued to running.
pub static EXECUTIONS_ADMITTED: OnceLock<Counter> = OnceLock::new();

/// Executions that reached a terminal state, labeled by outcome.
pub static EXECUTIONS_FINISHED: OnceLock<CounterVec> = OnceLock::new();

/// Hand-offs to the worker pool that failed and were reverted to queued.
pub static DISPATCH_FAILURES: OnceLock<Counter> = OnceLock::new();

/// Executions force-failed because their process was gone.
pub static ZOMBIES_REAPED: OnceLock<Counter> = OnceLock::new();

/// Executions observed in the running state at the last admission pass.
pub static RUNNING_EXECUTIONS: OnceLock<Gauge> = OnceLock::new();

/// Wall-clock duration of scan processes in seconds.
pub static SCAN_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Duration of periodic sweeps in seconds, labeled by sweep name.
pub static SWEEP_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric construction or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let executions_created = CounterVec::new(
        Opts::new(
            "scan_coordinator_executions_created_total",
            "Executions created",
        ),
        &["origin"],
    )?;

    let executions_admitted = Counter::new(
        "scan_coordinator_executions_admitted_total",
        "Executions promoted from queued to running",
    )?;

    let executions_finished = CounterVec::new(
        Opts::new(
            "scan_coordinator_executions_finished_total",
            "Executions that reached a terminal state",
        ),
        &["outcome"],
    )?;

    let dispatch_failures = Counter::new(
        "scan_coordinator_dispatch_failures_total",
        "Worker pool hand-offs that failed",
    )?;

    let zombies_reaped = Counter::new(
        "scan_coordinator_zombies_reaped_total",
        "Executions force-failed because their process was gone",
    )?;

    let running_executions = Gauge::new(
        "scan_coordinator_running_executions",
        "Executions in the running state",
    )?;

    let scan_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "scan_coordinator_scan_duration_seconds",
            "Scan process duration in seconds",
        )
        .buckets(vec![10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0]),
    )?;

    let sweep_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "scan_coordinator_sweep_duration_seconds",
            "Periodic sweep duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["sweep"],
    )?;

    registry.register(Box::new(executions_created.clone()))?;
    registry.register(Box::new(executions_admitted.clone()))?;
    registry.register(Box::new(executions_finished.clone()))?;
    registry.register(Box::new(dispatch_failures.clone()))?;
    registry.register(Box::new(zombies_reaped.clone()))?;
    registry.register(Box::new(running_executions.clone()))?;
    registry.register(Box::new(scan_duration.clone()))?;
    registry.register(Box::new(sweep_duration.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = EXECUTIONS_CREATED.set(executions_created);
    let _ = EXECUTIONS_ADMITTED.set(executions_admitted);
    let _ = EXECUTIONS_FINISHED.set(executions_finished);
    let _ = DISPATCH_FAILURES.set(dispatch_failures);
    let _ = ZOMBIES_REAPED.set(zombies_reaped);
    let _ = RUNNING_EXECUTIONS.set(running_executions);
    let _ = SCAN_DURATION.set(scan_duration);
    let _ = SWEEP_DURATION.set(sweep_duration);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_init() {
        let _ = init_metrics();
        if let Some(counter) = ZOMBIES_REAPED.get() {
            counter.inc();
        }
        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("scan_coordinator_zombies_reaped_total"));
    }
}
