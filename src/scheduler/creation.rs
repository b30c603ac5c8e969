//! Deduplicated execution creation.
//!
//! Every path that produces an execution (trigger fires, auditor catch-ups
//! and manual triggers) goes through [`ExecutionCreator`]. Creation is a
//! no-op when the task is gone or disabled, when it already has an active
//! execution, or when another creator holds the task's creation guard.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::metrics::MetricsCollector;
use crate::models::Execution;
use crate::ports::TaskSource;
use crate::storage::{creation_lock_key, Database, RunLock};

/// What produced a creation request. Used as a log field and metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOrigin {
    Schedule,
    CatchUp,
    Manual,
}

impl CreateOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreateOrigin::Schedule => "schedule",
            CreateOrigin::CatchUp => "catch_up",
            CreateOrigin::Manual => "manual",
        }
    }
}

/// Result of a creation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Execution),
    /// The task does not exist or is disabled.
    TaskInactive,
    /// The task already has a queued, starting or running execution.
    AlreadyActive,
    /// Another creator holds the creation guard.
    Contended,
}

impl CreateOutcome {
    pub fn into_execution(self) -> Option<Execution> {
        match self {
            CreateOutcome::Created(execution) => Some(execution),
            _ => None,
        }
    }
}

/// Creates queued executions under the creation guard.
#[derive(Clone)]
pub struct ExecutionCreator {
    db: Database,
    tasks: Arc<dyn TaskSource>,
    lock: RunLock,
    metrics: MetricsCollector,
}

impl ExecutionCreator {
    pub fn new(db: Database, tasks: Arc<dyn TaskSource>) -> Self {
        let lock = RunLock::new(db.clone());
        Self {
            db,
            tasks,
            lock,
            metrics: MetricsCollector::new(),
        }
    }

    /// Creates a queued execution for `task_id` standing for `priority_timestamp`.
    pub async fn create_execution(
        &self,
        task_id: i64,
        priority_timestamp: DateTime<Utc>,
        origin: CreateOrigin,
    ) -> Result<Option<Execution>, StorageError> {
        Ok(self
            .create(task_id, priority_timestamp, Utc::now(), origin)
            .await?
            .into_execution())
    }

    /// Like [`create_execution`](Self::create_execution) with an explicit
    /// clock, reporting why nothing was created.
    pub async fn create(
        &self,
        task_id: i64,
        priority_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
        origin: CreateOrigin,
    ) -> Result<CreateOutcome, StorageError> {
        match self.tasks.task(task_id).await? {
            Some(task) if task.enabled => {}
            _ => {
                debug!(task_id, origin = origin.as_str(), "Task missing or disabled, not creating");
                return Ok(CreateOutcome::TaskInactive);
            }
        }

        if self.db.active_execution(task_id).await?.is_some() {
            debug!(task_id, origin = origin.as_str(), "Active execution exists, not creating");
            return Ok(CreateOutcome::AlreadyActive);
        }

        let key = creation_lock_key(task_id);
        if !self.lock.acquire(&key).await? {
            return Ok(CreateOutcome::Contended);
        }

        let inserted = self
            .db
            .insert_execution(task_id, priority_timestamp, now)
            .await;

        if let Err(e) = self.lock.release(&key).await {
            warn!(task_id, error = %e, "Failed to release creation guard");
        }

        match inserted? {
            Some(execution) => {
                self.metrics.record_created(origin.as_str());
                info!(
                    execution_id = execution.id,
                    task_id,
                    origin = origin.as_str(),
                    priority = %priority_timestamp,
                    "Execution queued"
                );
                Ok(CreateOutcome::Created(execution))
            }
            None => {
                debug!(task_id, "Unique index rejected a second active execution");
                Ok(CreateOutcome::AlreadyActive)
            }
        }
    }
}
