//! Operator-facing queries and cancellation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dispatch::process;
use crate::error::CoordinatorError;
use crate::metrics::{FinishOutcome, MetricsCollector};
use crate::models::{Execution, ExecutionStatus, Task};
use crate::schedule::{next_fire, parse_timezone};
use crate::storage::{execution_lock_key, Database, RunLock};

/// Message stored on executions cancelled through [`ExecutionControl::kill`].
pub const KILLED_MESSAGE: &str = "Killed by user";

/// Message stored on executions failed by [`ExecutionControl::cleanup_stuck`].
pub const STUCK_MESSAGE: &str = "Marked as failed by stuck-execution cleanup";

/// Snapshot of one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStatusView {
    pub execution_id: i64,
    pub task_id: i64,
    pub status: ExecutionStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl From<Execution> for ExecutionStatusView {
    fn from(execution: Execution) -> Self {
        Self {
            execution_id: execution.id,
            task_id: execution.task_id,
            status: execution.status,
            progress: execution.progress,
            created_at: execution.created_at,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            error_message: execution.error_message,
        }
    }
}

/// The upcoming run of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextRunView {
    pub task_id: i64,
    pub description: String,
    pub timezone: String,
    pub next_run_utc: Option<DateTime<Utc>>,
    /// `next_run_utc` rendered in the task's timezone.
    pub next_run_local: Option<String>,
}

impl NextRunView {
    pub fn for_task(task: &Task, now: DateTime<Utc>) -> Result<Self, CoordinatorError> {
        let tz = parse_timezone(&task.timezone)?;
        let next = if task.enabled {
            next_fire(&task.recurrence, &task.timezone, now)?
        } else {
            None
        };
        Ok(Self {
            task_id: task.id,
            description: task.recurrence.describe(),
            timezone: task.timezone.clone(),
            next_run_utc: next,
            next_run_local: next.map(|at| {
                at.with_timezone(&tz)
                    .format("%Y-%m-%d %H:%M:%S %Z")
                    .to_string()
            }),
        })
    }
}

/// Outcome of a stuck-execution cleanup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub candidates: Vec<ExecutionStatusView>,
    /// Candidates actually failed; zero on a dry run.
    pub cleaned: usize,
}

/// Status, kill and next-run operations over the execution store.
#[derive(Clone)]
pub struct ExecutionControl {
    db: Database,
    lock: RunLock,
    kill_grace: Duration,
    metrics: MetricsCollector,
}

impl ExecutionControl {
    pub fn new(db: Database, kill_grace: Duration) -> Self {
        Self {
            lock: RunLock::new(db.clone()),
            db,
            kill_grace,
            metrics: MetricsCollector::new(),
        }
    }

    pub async fn status(&self, execution_id: i64) -> Result<ExecutionStatusView, CoordinatorError> {
        self.db
            .get_execution(execution_id)
            .await?
            .map(ExecutionStatusView::from)
            .ok_or(CoordinatorError::ExecutionNotFound(execution_id))
    }

    /// Fails an active execution and stops its process.
    ///
    /// The failed status is stored before any signal is sent. The process
    /// gets SIGTERM and, if it outlives the kill grace, SIGKILL; the call
    /// returns only after that escalation.
    pub async fn kill(&self, execution_id: i64) -> Result<ExecutionStatusView, CoordinatorError> {
        let now = Utc::now();
        if !self
            .db
            .fail_active_execution(execution_id, KILLED_MESSAGE, now)
            .await?
        {
            return match self.db.get_execution(execution_id).await? {
                Some(execution) => Err(CoordinatorError::NotActive {
                    id: execution_id,
                    status: execution.status.to_string(),
                }),
                None => Err(CoordinatorError::ExecutionNotFound(execution_id)),
            };
        }

        let execution = self
            .db
            .get_execution(execution_id)
            .await?
            .ok_or(CoordinatorError::ExecutionNotFound(execution_id))?;
        self.stop(&execution, now).await;

        info!(
            execution_id,
            task_id = execution.task_id,
            pid = execution.external_pid,
            "Execution killed"
        );
        Ok(ExecutionStatusView::from(execution))
    }

    /// Fails executions whose scan started more than `older_than` ago and
    /// stops their processes. A dry run only reports the candidates.
    pub async fn cleanup_stuck(
        &self,
        older_than: Duration,
        dry_run: bool,
    ) -> Result<CleanupReport, CoordinatorError> {
        let now = Utc::now();
        let cutoff = chrono::TimeDelta::from_std(older_than)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stuck = self.db.stuck_executions(cutoff).await?;

        let mut report = CleanupReport {
            dry_run,
            ..CleanupReport::default()
        };
        for execution in stuck {
            if !dry_run {
                if self
                    .db
                    .fail_active_execution(execution.id, STUCK_MESSAGE, now)
                    .await?
                {
                    self.stop(&execution, now).await;
                    report.cleaned += 1;
                    warn!(
                        execution_id = execution.id,
                        task_id = execution.task_id,
                        started_at = ?execution.started_at,
                        "Stuck execution failed"
                    );
                } else {
                    debug!(execution_id = execution.id, "Stuck execution finalized concurrently");
                }
            }
            report.candidates.push(ExecutionStatusView::from(execution));
        }

        info!(
            candidates = report.candidates.len(),
            cleaned = report.cleaned,
            dry_run,
            "Stuck-execution cleanup finished"
        );
        Ok(report)
    }

    /// Releases the run lock of an execution that was just failed, then
    /// terminates its process and waits for the escalation to finish.
    async fn stop(&self, execution: &Execution, now: DateTime<Utc>) {
        if let Err(e) = self.lock.release(&execution_lock_key(execution.task_id)).await {
            warn!(execution_id = execution.id, error = %e, "Failed to release run lock");
        }

        if let Some(pid) = execution.external_pid {
            let termination = process::terminate(pid, self.kill_grace).await;
            debug!(execution_id = execution.id, pid, ?termination, "Scan process stopped");
        }

        let duration = execution
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
        self.metrics.record_finished(FinishOutcome::Killed, duration);
    }

    pub async fn next_run(&self, task_id: i64) -> Result<NextRunView, CoordinatorError> {
        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or(CoordinatorError::TaskNotFound(task_id))?;
        NextRunView::for_task(&task, Utc::now())
    }
}
