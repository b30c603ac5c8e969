//! Execution records: one concrete run of a task's scan.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Starting,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Starting => "starting",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    /// Queued, starting and running executions block new ones for the same task.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Queued | ExecutionStatus::Starting | ExecutionStatus::Running
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ExecutionStatus::Queued),
            "starting" => Ok(ExecutionStatus::Starting),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// A persisted execution row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub task_id: i64,
    pub status: ExecutionStatus,
    /// Percentage reported by the scan, 0..=100.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    /// The scheduled instant this execution stands for. Admission orders by it.
    pub priority_timestamp: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub external_pid: Option<u32>,
    pub error_message: Option<String>,
    pub xml_output_path: Option<String>,
    pub normal_output_path: Option<String>,
}

impl Execution {
    /// Start of the running window, falling back to creation for rows
    /// promoted by an external writer without a start time.
    pub fn running_since(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }
}
