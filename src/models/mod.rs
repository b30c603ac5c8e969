//! Domain records shared by the scheduler, the dispatcher and storage.

pub mod execution;
pub mod findings;
pub mod task;

pub use execution::{Execution, ExecutionStatus};
pub use findings::{HostResult, PortResult, ReportRecord, ScanResults, ScanSummary};
pub use task::{ScanPlan, Task, TaskDefinition, TriggerJob};
