//! Periodic sweep loop shared by the auditor, admission controller and reaper.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::CoordinatorError;
use crate::metrics::MetricsCollector;

/// Runs `sweep` every `period` until a shutdown signal arrives.
///
/// The sweep is awaited before the next tick is taken, and missed ticks are
/// skipped, so passes never overlap or pile up. A failed pass is logged and
/// the loop carries on.
pub async fn run_periodic<F, Fut, T>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut sweep: F,
) where
    F: FnMut(chrono::DateTime<Utc>) -> Fut,
    Fut: Future<Output = Result<T, CoordinatorError>>,
    T: std::fmt::Debug,
{
    let metrics = MetricsCollector::new();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(sweep = name, period_secs = period.as_secs_f64(), "Sweep started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let started = Instant::now();
                match sweep(Utc::now()).await {
                    Ok(report) => debug!(sweep = name, ?report, "Sweep pass finished"),
                    Err(e) => error!(sweep = name, error = %e, "Sweep pass failed"),
                }
                metrics.record_sweep(name, started.elapsed().as_secs_f64());
            }
        }
    }

    info!(sweep = name, "Sweep stopped");
}
