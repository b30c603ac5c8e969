//! Durable per-task triggers.
//!
//! Each enabled task owns one row in `trigger_jobs` holding its next fire
//! instant. A timer loop fires due jobs, creates executions through the
//! [`ExecutionCreator`] and persists the following instant, so schedules
//! survive restarts. Overdue jobs fire once and then jump to their next
//! future instant; the missed-run auditor decides whether a skipped run
//! deserves a catch-up.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::creation::{CreateOrigin, CreateOutcome, ExecutionCreator};
use crate::error::CoordinatorError;
use crate::models::{Task, TriggerJob};
use crate::ports::TaskSource;
use crate::schedule::{next_fire, Recurrence};
use crate::storage::Database;

/// Counts from one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub installed: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Holds and fires the trigger jobs of all enabled tasks.
pub struct TriggerScheduler {
    db: Database,
    tasks: Arc<dyn TaskSource>,
    creator: ExecutionCreator,
    in_flight: Mutex<HashSet<i64>>,
}

/// Marks a task as firing until dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<i64>>,
    task_id: i64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.task_id);
    }
}

impl TriggerScheduler {
    pub fn new(db: Database, tasks: Arc<dyn TaskSource>, creator: ExecutionCreator) -> Self {
        Self {
            db,
            tasks,
            creator,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Computes the task's next fire instant and stores its job, replacing
    /// any previous one.
    ///
    /// Disabled tasks and exhausted one-time schedules end up without a job.
    /// A schedule that cannot be computed removes the old job and returns
    /// the error.
    pub async fn install(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> Result<Option<TriggerJob>, CoordinatorError> {
        if !task.enabled {
            self.remove(task.id).await?;
            return Ok(None);
        }

        let next = task
            .validate()
            .and_then(|_| next_fire(&task.recurrence, &task.timezone, now));

        match next {
            Ok(Some(next_fire_at)) => {
                let job = task.trigger_job(Some(next_fire_at));
                self.db.upsert_trigger_job(&job).await?;
                info!(
                    task_id = task.id,
                    schedule = %task.recurrence.describe(),
                    next_fire_at = %next_fire_at,
                    "Trigger installed"
                );
                Ok(Some(job))
            }
            Ok(None) => {
                self.db.delete_trigger_job(task.id).await?;
                debug!(task_id = task.id, "Schedule exhausted, no trigger installed");
                Ok(None)
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Cannot schedule task, trigger removed");
                self.db.delete_trigger_job(task.id).await?;
                Err(e.into())
            }
        }
    }

    /// Drops the task's trigger job. Returns false if there was none.
    pub async fn remove(&self, task_id: i64) -> Result<bool, CoordinatorError> {
        let removed = self.db.delete_trigger_job(task_id).await?;
        if removed {
            info!(task_id, "Trigger removed");
        }
        Ok(removed)
    }

    /// Handles one fire signal for a task.
    ///
    /// Returns `None` when a fire for the same task is already in progress.
    pub async fn on_fire(
        &self,
        task_id: i64,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<CreateOutcome>, CoordinatorError> {
        let Some(_guard) = self.begin_fire(task_id) else {
            debug!(task_id, "Fire already in progress, coalesced");
            return Ok(None);
        };

        let outcome = self
            .creator
            .create(task_id, scheduled_at, now, CreateOrigin::Schedule)
            .await?;

        self.reschedule(task_id, scheduled_at.max(now)).await?;
        Ok(Some(outcome))
    }

    fn begin_fire(&self, task_id: i64) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(task_id) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            task_id,
        })
    }

    async fn reschedule(&self, task_id: i64, from: DateTime<Utc>) -> Result<(), CoordinatorError> {
        let Some(job) = self.db.get_trigger_job(task_id).await? else {
            return Ok(());
        };

        if matches!(job.recurrence, Recurrence::OneTime { .. }) {
            self.db.delete_trigger_job(task_id).await?;
            debug!(task_id, "One-time trigger fired and removed");
            return Ok(());
        }

        match next_fire(&job.recurrence, &job.timezone, from) {
            Ok(next) => {
                self.db.set_next_fire(task_id, next).await?;
                debug!(task_id, next_fire_at = ?next, "Trigger advanced");
                Ok(())
            }
            Err(e) => {
                warn!(task_id, error = %e, "Cannot compute next fire, trigger removed");
                self.db.delete_trigger_job(task_id).await?;
                Err(e.into())
            }
        }
    }

    /// Fires every job due at `now`. Returns how many jobs fired.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, CoordinatorError> {
        let jobs = self.db.list_trigger_jobs().await?;
        let mut fired = 0;

        for job in jobs.into_iter().filter(|job| job.is_due(now)) {
            let Some(scheduled_at) = job.next_fire_at else {
                continue;
            };
            match self.on_fire(job.task_id, scheduled_at, now).await {
                Ok(Some(_)) => fired += 1,
                Ok(None) => {}
                Err(e) => error!(task_id = job.task_id, error = %e, "Trigger fire failed"),
            }
        }

        Ok(fired)
    }

    /// Brings the stored jobs in line with the current task definitions.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport, CoordinatorError> {
        let tasks: HashMap<i64, Task> = self
            .tasks
            .enabled_tasks()
            .await?
            .into_iter()
            .map(|task| (task.id, task))
            .collect();
        let jobs: HashMap<i64, TriggerJob> = self
            .db
            .list_trigger_jobs()
            .await?
            .into_iter()
            .map(|job| (job.task_id, job))
            .collect();

        let mut report = ReconcileReport::default();

        for task_id in jobs.keys().filter(|id| !tasks.contains_key(id)) {
            if self.remove(*task_id).await? {
                report.removed += 1;
            }
        }

        for task in tasks.values() {
            if jobs.get(&task.id).is_some_and(|job| job.matches(task)) {
                report.unchanged += 1;
                continue;
            }
            match self.install(task, now).await {
                Ok(Some(_)) => report.installed += 1,
                // A fired one-time schedule has no job to install.
                Ok(None) => report.unchanged += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(task_id = task.id, error = %e, "Failed to install trigger");
                }
            }
        }

        if report.installed + report.removed + report.failed > 0 {
            info!(
                installed = report.installed,
                removed = report.removed,
                failed = report.failed,
                "Triggers reconciled"
            );
        }
        Ok(report)
    }

    /// Timer loop: reconciles at startup and every `reconcile_every`, and
    /// fires due jobs every `tick_every`, until shutdown.
    pub async fn run(
        self: Arc<Self>,
        tick_every: Duration,
        reconcile_every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut tick = tokio::time::interval(tick_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reconcile = tokio::time::interval(reconcile_every);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Trigger scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile(Utc::now()).await {
                        error!(error = %e, "Trigger reconcile failed");
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Trigger tick failed");
                    }
                }
            }
        }

        info!("Trigger scheduler stopped");
    }
}
