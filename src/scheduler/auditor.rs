//! Missed-run auditor.
//!
//! Compares each enabled task's most recent expected fire with its actual
//! executions and creates a catch-up execution when a run was skipped, for
//! example because the coordinator was down at the scheduled instant.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info};

use super::creation::{CreateOrigin, CreateOutcome, ExecutionCreator};
use crate::error::CoordinatorError;
use crate::models::Task;
use crate::ports::TaskSource;
use crate::schedule::{most_recent_fire, Recurrence};
use crate::storage::Database;

/// Counts from one audit pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub examined: usize,
    pub created: usize,
    pub failed: usize,
}

/// Oldest missed fire still worth catching up, per recurrence kind.
fn staleness(recurrence: &Recurrence) -> Option<TimeDelta> {
    match recurrence {
        Recurrence::Daily { .. } | Recurrence::OneTime { .. } => Some(TimeDelta::days(2)),
        Recurrence::Weekly { .. } => Some(TimeDelta::days(8)),
        Recurrence::Monthly { .. } => Some(TimeDelta::days(32)),
        Recurrence::Interval { .. } => None,
    }
}

pub struct MissedRunAuditor {
    db: Database,
    tasks: Arc<dyn TaskSource>,
    creator: ExecutionCreator,
    grace: TimeDelta,
}

impl MissedRunAuditor {
    pub fn new(
        db: Database,
        tasks: Arc<dyn TaskSource>,
        creator: ExecutionCreator,
        grace: Duration,
    ) -> Self {
        Self {
            db,
            tasks,
            creator,
            grace: TimeDelta::from_std(grace).unwrap_or(TimeDelta::hours(1)),
        }
    }

    /// Audits every enabled task. A failure on one task is logged and the
    /// pass continues.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<AuditReport, CoordinatorError> {
        let tasks = self.tasks.enabled_tasks().await?;
        let mut report = AuditReport::default();

        for task in &tasks {
            report.examined += 1;
            match self.audit_task(task, now).await {
                Ok(true) => report.created += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    error!(task_id = task.id, error = %e, "Missed-run audit failed");
                }
            }
        }

        Ok(report)
    }

    /// Returns true when a catch-up execution was created.
    pub async fn audit_task(&self, task: &Task, now: DateTime<Utc>) -> Result<bool, CoordinatorError> {
        if let Recurrence::Interval { hours } = task.recurrence {
            return self.audit_interval(task, hours, now).await;
        }

        let Some(expected) = most_recent_fire(&task.recurrence, &task.timezone, now)? else {
            return Ok(false);
        };

        if expected < task.created_at {
            return Ok(false);
        }

        if let Some(max_age) = staleness(&task.recurrence) {
            if expected < now - max_age {
                debug!(task_id = task.id, expected = %expected, "Missed run too old to catch up");
                return Ok(false);
            }
        }

        if self.db.active_execution(task.id).await?.is_some() {
            return Ok(false);
        }

        let missed = match self.db.latest_execution(task.id).await? {
            None => true,
            Some(latest) => latest.created_at < expected - self.grace,
        };
        if !missed {
            return Ok(false);
        }

        let outcome = self.catch_up(task, expected, now).await?;
        Ok(matches!(outcome, CreateOutcome::Created(_)))
    }

    async fn audit_interval(
        &self,
        task: &Task,
        hours: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        let Some(job) = self.db.get_trigger_job(task.id).await? else {
            return Ok(false);
        };
        let Some(due) = job.next_fire_at.filter(|at| *at < now) else {
            return Ok(false);
        };

        if self.db.active_execution(task.id).await?.is_some() {
            return Ok(false);
        }

        // The job only moves on once the missed run is accounted for; a
        // contended or refused creation is retried on the next pass.
        let outcome = self.catch_up(task, due, now).await?;
        match outcome {
            CreateOutcome::Created(_) | CreateOutcome::AlreadyActive => {
                self.db
                    .set_next_fire(task.id, Some(now + TimeDelta::hours(i64::from(hours))))
                    .await?;
            }
            CreateOutcome::TaskInactive | CreateOutcome::Contended => {
                debug!(task_id = task.id, due = %due, ?outcome, "Interval catch-up deferred");
            }
        }
        Ok(matches!(outcome, CreateOutcome::Created(_)))
    }

    async fn catch_up(
        &self,
        task: &Task,
        expected: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, CoordinatorError> {
        let outcome = self
            .creator
            .create(task.id, expected, now, CreateOrigin::CatchUp)
            .await?;
        if matches!(outcome, CreateOutcome::Created(_)) {
            info!(
                task_id = task.id,
                expected = %expected,
                schedule = %task.recurrence.describe(),
                "Missed run detected, catch-up queued"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveDate, Timelike};

    use crate::storage::database::test_support::temp_database;
    use crate::storage::tasks::test_support::{daily_definition, insert_daily_task};
    use crate::storage::{creation_lock_key, RunLock};

    fn auditor(db: &Database) -> MissedRunAuditor {
        let tasks: Arc<dyn TaskSource> = Arc::new(db.clone());
        let creator = ExecutionCreator::new(db.clone(), Arc::clone(&tasks));
        MissedRunAuditor::new(db.clone(), tasks, creator, Duration::from_secs(3600))
    }

    async fn backdate_task(db: &Database, task_id: i64, at: DateTime<Utc>) {
        sqlx::query("UPDATE scan_tasks SET created_at = ?1 WHERE id = ?2")
            .bind(at)
            .bind(task_id)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missed_daily_run_is_caught_up_once() {
        let (db, _dir) = temp_database().await;
        let task = insert_daily_task(&db, "nightly").await;
        let auditor = auditor(&db);
        let now = Utc::now() + ChronoDuration::days(2);

        let report = auditor.sweep(now).await.unwrap();
        assert_eq!(report.created, 1);

        let execution = db.active_execution(task.id).await.unwrap().unwrap();
        assert_eq!(execution.priority_timestamp.hour(), 2);
        assert!(execution.priority_timestamp <= now);

        // Active execution blocks a second catch-up.
        assert_eq!(auditor.sweep(now).await.unwrap().created, 0);

        // A finished run created after the expected instant is not a miss.
        assert!(db.mark_running(execution.id, now).await.unwrap());
        assert!(db.complete_execution(execution.id, now).await.unwrap());
        assert_eq!(auditor.sweep(now).await.unwrap().created, 0);
        assert_eq!(db.list_executions(task.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fire_before_task_creation_is_ignored() {
        let (db, _dir) = temp_database().await;
        let task = insert_daily_task(&db, "fresh").await;
        let created = NaiveDate::from_ymd_opt(2026, 6, 10)
            .unwrap()
            .and_hms_opt(3, 0, 0)
            .unwrap()
            .and_utc();
        backdate_task(&db, task.id, created).await;
        let task = db.get_task(task.id).await.unwrap().unwrap();

        // The 02:00 fire of the creation day predates the task.
        let now = created + ChronoDuration::hours(1);
        assert!(!auditor(&db).audit_task(&task, now).await.unwrap());
        assert!(db.latest_execution(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_one_time_run_is_skipped() {
        let (db, _dir) = temp_database().await;
        let mut definition = daily_definition("once");
        let at = NaiveDate::from_ymd_opt(2026, 3, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        definition.recurrence = Recurrence::OneTime { at };
        let task = db.upsert_task(&definition).await.unwrap();
        backdate_task(&db, task.id, at.and_utc() - ChronoDuration::days(10)).await;
        let task = db.get_task(task.id).await.unwrap().unwrap();
        let auditor = auditor(&db);

        let late = at.and_utc() + ChronoDuration::days(3);
        assert!(!auditor.audit_task(&task, late).await.unwrap());

        let within = at.and_utc() + ChronoDuration::days(1);
        assert!(auditor.audit_task(&task, within).await.unwrap());
        let execution = db.active_execution(task.id).await.unwrap().unwrap();
        assert_eq!(execution.priority_timestamp, at.and_utc());
    }

    #[tokio::test]
    async fn test_overdue_interval_job_catches_up_and_advances() {
        let (db, _dir) = temp_database().await;
        let mut definition = daily_definition("every-six");
        definition.recurrence = Recurrence::Interval { hours: 6 };
        let task = db.upsert_task(&definition).await.unwrap();

        let now = Utc::now().with_nanosecond(0).unwrap();
        let due = now - ChronoDuration::hours(3);
        db.upsert_trigger_job(&task.trigger_job(Some(due))).await.unwrap();

        assert!(auditor(&db).audit_task(&task, now).await.unwrap());

        let execution = db.active_execution(task.id).await.unwrap().unwrap();
        assert_eq!(execution.priority_timestamp, due);
        let job = db.get_trigger_job(task.id).await.unwrap().unwrap();
        assert_eq!(job.next_fire_at, Some(now + ChronoDuration::hours(6)));

        // Not overdue any more.
        assert!(!auditor(&db).audit_task(&task, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_contended_interval_catch_up_keeps_due_time() {
        let (db, _dir) = temp_database().await;
        let mut definition = daily_definition("every-six");
        definition.recurrence = Recurrence::Interval { hours: 6 };
        let task = db.upsert_task(&definition).await.unwrap();

        let now = Utc::now().with_nanosecond(0).unwrap();
        let due = now - ChronoDuration::hours(3);
        db.upsert_trigger_job(&task.trigger_job(Some(due))).await.unwrap();

        let lock = RunLock::new(db.clone());
        assert!(lock.acquire(&creation_lock_key(task.id)).await.unwrap());

        assert!(!auditor(&db).audit_task(&task, now).await.unwrap());
        let job = db.get_trigger_job(task.id).await.unwrap().unwrap();
        assert_eq!(job.next_fire_at, Some(due));
        assert!(db.active_execution(task.id).await.unwrap().is_none());

        // Once the guard is gone the missed run is still recovered.
        lock.release(&creation_lock_key(task.id)).await.unwrap();
        assert!(auditor(&db).audit_task(&task, now).await.unwrap());
        let job = db.get_trigger_job(task.id).await.unwrap().unwrap();
        assert_eq!(job.next_fire_at, Some(now + ChronoDuration::hours(6)));
    }

    #[tokio::test]
    async fn test_catch_up_across_spring_forward() {
        let (db, _dir) = temp_database().await;
        let mut definition = daily_definition("dst");
        definition.recurrence = Recurrence::Daily {
            hour: 2,
            minute: 30,
        };
        definition.timezone = "America/New_York".to_string();
        let task = db.upsert_task(&definition).await.unwrap();
        let created = NaiveDate::from_ymd_opt(2026, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        backdate_task(&db, task.id, created).await;
        let task = db.get_task(task.id).await.unwrap().unwrap();

        // 01:00 EST on the changeover day: today's 02:30 never happens, so the
        // run to recover is yesterday's.
        let now = NaiveDate::from_ymd_opt(2026, 3, 8)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap()
            .and_utc();
        assert!(auditor(&db).audit_task(&task, now).await.unwrap());

        let execution = db.active_execution(task.id).await.unwrap().unwrap();
        let expected = NaiveDate::from_ymd_opt(2026, 3, 7)
            .unwrap()
            .and_hms_opt(7, 30, 0)
            .unwrap()
            .and_utc();
        assert_eq!(execution.priority_timestamp, expected);
    }

    #[tokio::test]
    async fn test_weekly_and_monthly_misses_outlive_daily_window() {
        let (db, _dir) = temp_database().await;
        let created = NaiveDate::from_ymd_opt(2026, 5, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();

        let mut weekly = daily_definition("weekly");
        weekly.recurrence = Recurrence::Weekly {
            day_of_week: 0,
            hour: 9,
            minute: 0,
        };
        let weekly = db.upsert_task(&weekly).await.unwrap();
        backdate_task(&db, weekly.id, created).await;
        let weekly = db.get_task(weekly.id).await.unwrap().unwrap();

        let mut monthly = daily_definition("monthly");
        monthly.recurrence = Recurrence::Monthly {
            day: 1,
            hour: 9,
            minute: 0,
        };
        let monthly = db.upsert_task(&monthly).await.unwrap();
        backdate_task(&db, monthly.id, created).await;
        let monthly = db.get_task(monthly.id).await.unwrap().unwrap();

        let auditor = auditor(&db);

        // Sunday 2026-06-14: Monday's run is six days old.
        let sunday = NaiveDate::from_ymd_opt(2026, 6, 14)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();
        assert!(auditor.audit_task(&weekly, sunday).await.unwrap());
        let execution = db.active_execution(weekly.id).await.unwrap().unwrap();
        assert_eq!(
            execution.priority_timestamp,
            NaiveDate::from_ymd_opt(2026, 6, 8)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap()
                .and_utc()
        );

        // The first-of-month run is 29 days old at the end of June.
        let month_end = NaiveDate::from_ymd_opt(2026, 6, 30)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();
        assert!(auditor.audit_task(&monthly, month_end).await.unwrap());
        let execution = db.active_execution(monthly.id).await.unwrap().unwrap();
        assert_eq!(
            execution.priority_timestamp,
            NaiveDate::from_ymd_opt(2026, 6, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap()
                .and_utc()
        );
    }

    #[test]
    fn test_staleness_windows() {
        assert_eq!(
            staleness(&Recurrence::Daily { hour: 0, minute: 0 }),
            Some(TimeDelta::days(2))
        );
        assert_eq!(
            staleness(&Recurrence::Weekly {
                day_of_week: 0,
                hour: 0,
                minute: 0
            }),
            Some(TimeDelta::days(8))
        );
        assert_eq!(
            staleness(&Recurrence::Monthly {
                day: 1,
                hour: 0,
                minute: 0
            }),
            Some(TimeDelta::days(32))
        );
        assert_eq!(staleness(&Recurrence::Interval { hours: 6 }), None);
    }
}
