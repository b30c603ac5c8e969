//! Metrics module for Prometheus-based monitoring.
//!
//! Counts created, admitted and finished executions, dispatch failures and
//! reaped zombies, and times scans and periodic sweeps.
//!
//! # Example
//!
//! ```ignore
//! use scan_coordinator::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_created("manual");
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{FinishOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};
