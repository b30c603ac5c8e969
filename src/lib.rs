//! scan-coordinator: scheduling and execution coordination for recurring network scans.
//!
//! Tasks describe when a scan runs in local terms. The coordinator turns
//! those schedules into queued executions, admits them under a global
//! concurrency ceiling, runs the scanner in a worker pool and recovers
//! executions whose process has disappeared.

// Core modules
pub mod cli;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod schedule;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use coordinator::{Coordinator, CoordinatorConfig, LeaderLock};
pub use error::{
    ConfigError, CoordinatorError, DispatchError, ScanError, ScheduleError, StorageError,
};
pub use models::{Execution, ExecutionStatus, Task, TaskDefinition};
pub use schedule::Recurrence;
