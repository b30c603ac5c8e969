//! Interfaces to the layers the coordinator consumes.
//!
//! The scheduling core reads task definitions and live settings, and hands
//! parsed results to a findings sink, only through these traits. The
//! [`Database`](crate::storage::Database) implements all three over SQLite.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::models::{ScanPlan, ScanResults, Task};

/// Default ceiling on concurrently running executions.
pub const DEFAULT_MAX_CONCURRENT_TASKS: u32 = 4;

/// Default number of reports kept per task.
pub const DEFAULT_MAX_REPORTS_PER_TASK: u32 = 15;

/// Read access to task definitions.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn task(&self, task_id: i64) -> Result<Option<Task>, StorageError>;

    async fn enabled_tasks(&self) -> Result<Vec<Task>, StorageError>;

    /// Resolves targets and arguments for the next run of `task_id`.
    async fn resolve_plan(&self, task_id: i64) -> Result<Option<ScanPlan>, StorageError>;
}

/// Live settings. Implementations must not cache: callers read once per cycle.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn max_concurrent_tasks(&self) -> Result<u32, StorageError>;

    async fn max_reports_per_task(&self) -> Result<u32, StorageError>;
}

/// Destination for parsed scan findings.
#[async_trait]
pub trait FindingsSink: Send + Sync {
    /// Stores results for an execution and returns the new report id.
    async fn record_results(
        &self,
        execution_id: i64,
        task_id: i64,
        results: &ScanResults,
        xml_path: &str,
        normal_path: &str,
    ) -> Result<i64, StorageError>;

    /// Keeps the newest `keep` reports of a task, deleting older rows and
    /// their files. Returns how many reports were removed.
    async fn trim_reports(&self, task_id: i64, keep: u32) -> Result<usize, StorageError>;
}
