//! Error types for scan coordination.
//!
//! Defines the error taxonomy shared by the subsystems:
//! - Schedule computation (invalid fields, unknown or ambiguous local times)
//! - Dispatch to the worker pool
//! - Scan process failures
//! - The coordinator facade that aggregates them
//!
//! Lock contention is not an error: [`RunLock::acquire`](crate::storage::RunLock::acquire)
//! reports it as `Ok(false)` and callers treat it as a silent no-op.

use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;

pub use crate::coordinator::config::ConfigError;
pub use crate::storage::StorageError;

/// Errors produced while translating a recurrence into a fire instant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("Invalid {field} value {value}: expected {min}..={max}")]
    InvalidField {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("Unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("Local time {local} is ambiguous in {timezone}")]
    AmbiguousLocalTime {
        local: NaiveDateTime,
        timezone: String,
    },

    #[error("Local time {local} does not exist in {timezone}")]
    NonexistentLocalTime {
        local: NaiveDateTime,
        timezone: String,
    },

    #[error("Interval schedules have no calendar anchor")]
    NoCalendarAnchor,

    #[error("Computed date is out of range")]
    OutOfRange,
}

/// Errors returned when handing an execution to the worker pool.
///
/// Any of these reverts the execution to `queued` so a later admission pass
/// retries it.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Worker pool is saturated")]
    PoolSaturated,

    #[error("Worker pool is not running")]
    NotRunning,

    #[error("Worker pool is already running")]
    AlreadyRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Errors raised while running the external scan binary.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("No valid targets specified")]
    NoTargets,

    #[error("Rejected scan arguments: {0}")]
    UnsafeArguments(String),

    #[error("Failed to launch scan process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to parse scan results: {0}")]
    Results(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task {0} not found")]
    TaskNotFound(i64),

    #[error("Execution {0} not found")]
    ExecutionNotFound(i64),

    #[error("Execution {id} is not active (status: {status})")]
    NotActive { id: i64, status: String },

    #[error("Another coordinator already holds the leader lock (pid {0})")]
    NotLeader(i32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the coordinator.
pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;
