//! Detection and cleanup of executions whose scan process is gone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::dispatch::{ProcessInspector, ProcessState};
use crate::error::CoordinatorError;
use crate::metrics::{FinishOutcome, MetricsCollector};
use crate::models::Execution;
use crate::storage::{execution_lock_key, Database, RunLock};

/// Counts from one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub examined: usize,
    pub reaped: usize,
}

/// Fails in-flight executions whose process no longer exists or is no
/// longer the scanner, and frees their run locks.
pub struct ZombieReaper {
    db: Database,
    lock: RunLock,
    inspector: Arc<dyn ProcessInspector>,
    binary: String,
    warmup: TimeDelta,
    no_pid_grace: TimeDelta,
    metrics: MetricsCollector,
}

impl ZombieReaper {
    pub fn new(
        db: Database,
        inspector: Arc<dyn ProcessInspector>,
        binary: impl Into<String>,
        warmup: Duration,
        no_pid_grace: Duration,
    ) -> Self {
        Self {
            lock: RunLock::new(db.clone()),
            db,
            inspector,
            binary: binary.into(),
            warmup: TimeDelta::from_std(warmup).unwrap_or(TimeDelta::MAX),
            no_pid_grace: TimeDelta::from_std(no_pid_grace).unwrap_or(TimeDelta::MAX),
            metrics: MetricsCollector::new(),
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<ReapReport, CoordinatorError> {
        let mut report = ReapReport::default();
        for execution in self.db.in_flight_executions().await? {
            report.examined += 1;
            let Some(reason) = self.diagnose(&execution, now) else {
                continue;
            };
            if self.reap(&execution, &reason, now).await? {
                report.reaped += 1;
            }
        }
        Ok(report)
    }

    /// Returns the reason an execution counts as a zombie, if it does.
    fn diagnose(&self, execution: &Execution, now: DateTime<Utc>) -> Option<String> {
        let age = now - execution.running_since();
        if age < self.warmup {
            return None;
        }

        match execution.external_pid {
            Some(pid) => match self.inspector.inspect(pid) {
                state if state.runs(&self.binary) => None,
                ProcessState::Missing => Some(format!("process {pid} no longer exists")),
                ProcessState::Defunct => Some(format!("process {pid} exited without reporting")),
                ProcessState::Alive { name, .. } => {
                    Some(format!("pid {pid} now belongs to '{name}'"))
                }
            },
            None if age > self.no_pid_grace => Some(format!(
                "no process recorded after {}s",
                age.num_seconds()
            )),
            None => None,
        }
    }

    async fn reap(
        &self,
        execution: &Execution,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        let message = format!("Zombie execution: {reason}");
        if !self
            .db
            .fail_running_execution(execution.id, &message, now)
            .await?
        {
            debug!(execution_id = execution.id, "Execution finished before it could be reaped");
            return Ok(false);
        }

        self.lock.release(&execution_lock_key(execution.task_id)).await?;
        self.metrics.record_finished(FinishOutcome::Zombie, None);
        warn!(
            anomaly = "zombie",
            execution_id = execution.id,
            task_id = execution.task_id,
            pid = execution.external_pid,
            reason,
            "Reaped zombie execution"
        );
        Ok(true)
    }
}
