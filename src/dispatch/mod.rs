//! Execution of admitted scans.
//!
//! This module provides:
//!
//! - **WorkerPool**: fixed-size pool fed through a bounded channel
//! - **ScanRunner**: runs one execution under its task's run lock, supervises
//!   the scan process and records the outcome
//! - **command / output / results**: command line construction, output
//!   monitoring and XML report parsing
//! - **process**: pid inspection and signalling
//!
//! # Architecture
//!
//! ```text
//!   ┌─────────────────────┐
//!   │ AdmissionController │  queued -> running
//!   └──────────┬──────────┘
//!              │ submit (try_send)
//!       ┌──────▼───────┐
//!       │  WorkerPool  │  bounded channel, N slots
//!       └──────┬───────┘
//!      ┌───────┼────────┐
//!      ▼       ▼        ▼
//!   ┌──────┐┌──────┐┌──────┐
//!   │Worker││Worker││Worker│ -> ScanRunner -> scan process
//!   └──────┘└──────┘└──────┘
//! ```

pub mod command;
pub mod output;
pub mod process;
pub mod results;
pub mod runner;
pub mod worker_pool;

pub use command::{requires_privileges, sanitize_arguments, sanitize_targets, CommandBuilder};
pub use process::{ProcessInspector, ProcessState, SysinfoInspector};
pub use runner::ScanRunner;
pub use worker_pool::{
    ExecutionHandler, ExecutionRequest, PoolStats, RunOutcome, WorkerPool, WorkerPoolConfig,
};

use crate::error::DispatchError;

/// Accepts admitted executions for asynchronous execution.
pub trait ExecutionDispatcher: Send + Sync {
    /// Hands an execution over without waiting. Errors when no slot is free
    /// or the dispatcher is stopped.
    fn submit(&self, execution_id: i64, task_id: i64) -> Result<(), DispatchError>;

    /// Upper bound on concurrently executing scans.
    fn capacity(&self) -> usize;
}
