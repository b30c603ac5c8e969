//! Execution repository.
//!
//! State transitions are conditional updates: each statement names the
//! statuses it may move from and reports whether it applied, so concurrent
//! admission passes, the dispatcher, kill requests and the zombie reaper
//! never overwrite one another's verdicts.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::database::{Database, StorageError};
use crate::models::{Execution, ExecutionStatus};

const EXECUTION_COLUMNS: &str = "id, task_id, status, progress, created_at, priority_timestamp, \
     started_at, completed_at, external_pid, error_message, xml_output_path, normal_output_path";

impl Database {
    /// Inserts a queued execution.
    ///
    /// Returns `Ok(None)` when the task already has an active execution; the
    /// one-active-per-task index rejects the row.
    pub async fn insert_execution(
        &self,
        task_id: i64,
        priority_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Execution>, StorageError> {
        let result = sqlx::query(
            "INSERT INTO executions (task_id, status, progress, created_at, priority_timestamp) \
             VALUES (?1, 'queued', 0, ?2, ?3)",
        )
        .bind(task_id)
        .bind(now)
        .bind(priority_timestamp)
        .execute(self.pool())
        .await;

        match result {
            Ok(done) => self.get_execution(done.last_insert_rowid()).await,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_execution(&self, id: i64) -> Result<Option<Execution>, StorageError> {
        let sql = format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .map(|row| execution_from_row(&row))
            .transpose()
    }

    /// The queued, starting or running execution of a task, if any.
    pub async fn active_execution(&self, task_id: i64) -> Result<Option<Execution>, StorageError> {
        let sql = format!(
            "SELECT {} FROM executions \
             WHERE task_id = ?1 AND status IN ('queued', 'starting', 'running') \
             ORDER BY id DESC LIMIT 1",
            EXECUTION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(self.pool())
            .await?
            .map(|row| execution_from_row(&row))
            .transpose()
    }

    /// The most recently created execution of a task, in any status.
    pub async fn latest_execution(&self, task_id: i64) -> Result<Option<Execution>, StorageError> {
        let sql = format!(
            "SELECT {} FROM executions WHERE task_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            EXECUTION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(self.pool())
            .await?
            .map(|row| execution_from_row(&row))
            .transpose()
    }

    /// Executions of a task, newest first.
    pub async fn list_executions(
        &self,
        task_id: i64,
        limit: u32,
    ) -> Result<Vec<Execution>, StorageError> {
        let sql = format!(
            "SELECT {} FROM executions WHERE task_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(task_id)
            .bind(i64::from(limit))
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(execution_from_row).collect()
    }

    pub async fn count_executions(&self, status: ExecutionStatus) -> Result<u32, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM executions WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Queued executions, oldest scheduled instant first, ties by id.
    pub async fn queued_executions(&self, limit: u32) -> Result<Vec<Execution>, StorageError> {
        let sql = format!(
            "SELECT {} FROM executions WHERE status = 'queued' \
             ORDER BY priority_timestamp ASC, id ASC LIMIT ?1",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(execution_from_row).collect()
    }

    /// Executions in `starting` or `running`.
    pub async fn in_flight_executions(&self) -> Result<Vec<Execution>, StorageError> {
        let sql = format!(
            "SELECT {} FROM executions WHERE status IN ('starting', 'running') ORDER BY id",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(self.pool()).await?;
        rows.iter().map(execution_from_row).collect()
    }

    /// Starting or running executions whose scan began before `cutoff`.
    pub async fn stuck_executions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StorageError> {
        let sql = format!(
            "SELECT {} FROM executions \
             WHERE status IN ('starting', 'running') AND started_at < ?1 ORDER BY id",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(execution_from_row).collect()
    }

    /// queued -> running. Returns false if another pass got there first.
    pub async fn mark_running(&self, id: i64, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'running', started_at = ?2 \
             WHERE id = ?1 AND status = 'queued'",
        )
        .bind(id)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// running -> queued after a failed hand-off. Only applies while no
    /// process has been recorded for the execution.
    pub async fn revert_to_queued(&self, id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'queued', started_at = NULL \
             WHERE id = ?1 AND status IN ('starting', 'running') AND external_pid IS NULL",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records the scan process and its output files.
    pub async fn record_process(
        &self,
        id: i64,
        pid: u32,
        xml_output_path: &str,
        normal_output_path: &str,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'running', external_pid = ?2, \
             xml_output_path = ?3, normal_output_path = ?4 \
             WHERE id = ?1 AND status IN ('starting', 'running')",
        )
        .bind(id)
        .bind(i64::from(pid))
        .bind(xml_output_path)
        .bind(normal_output_path)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_progress(&self, id: i64, progress: u8) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE executions SET progress = ?2 \
             WHERE id = ?1 AND status IN ('starting', 'running')",
        )
        .bind(id)
        .bind(i64::from(progress.min(100)))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// starting/running -> completed.
    pub async fn complete_execution(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'completed', progress = 100, completed_at = ?2, \
             error_message = NULL \
             WHERE id = ?1 AND status IN ('starting', 'running')",
        )
        .bind(id)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// starting/running -> failed. Used by the dispatcher and the reaper.
    pub async fn fail_running_execution(
        &self,
        id: i64,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'failed', completed_at = ?2, error_message = ?3 \
             WHERE id = ?1 AND status IN ('starting', 'running')",
        )
        .bind(id)
        .bind(now)
        .bind(message)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Any active status -> failed. Used by explicit kill requests.
    pub async fn fail_active_execution(
        &self,
        id: i64,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'failed', completed_at = ?2, error_message = ?3 \
             WHERE id = ?1 AND status IN ('queued', 'starting', 'running')",
        )
        .bind(id)
        .bind(now)
        .bind(message)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn execution_from_row(row: &SqliteRow) -> Result<Execution, StorageError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<ExecutionStatus>()
        .map_err(StorageError::InvalidData)?;
    let progress: i64 = row.try_get("progress")?;
    let pid: Option<i64> = row.try_get("external_pid")?;

    Ok(Execution {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        status,
        progress: progress.clamp(0, 100) as u8,
        created_at: row.try_get("created_at")?,
        priority_timestamp: row.try_get("priority_timestamp")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        external_pid: pid.and_then(|p| u32::try_from(p).ok()),
        error_message: row.try_get("error_message")?,
        xml_output_path: row.try_get("xml_output_path")?,
        normal_output_path: row.try_get("normal_output_path")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::test_support::temp_database;
    use crate::storage::tasks::test_support::insert_daily_task;
    use chrono::TimeDelta;

    #[tokio::test]
    async fn test_second_active_insert_is_rejected() {
        let (db, _dir) = temp_database().await;
        let task = insert_daily_task(&db, "nightly").await;
        let now = Utc::now();

        let first = db.insert_execution(task.id, now, now).await.unwrap();
        assert!(first.is_some());
        let second = db.insert_execution(task.id, now, now).await.unwrap();
        assert!(second.is_none());

        let exec = first.unwrap();
        assert!(db
            .fail_active_execution(exec.id, "stopped", now)
            .await
            .unwrap());
        assert!(db.insert_execution(task.id, now, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_queued_order_uses_priority_then_id() {
        let (db, _dir) = temp_database().await;
        let now = Utc::now();
        let a = insert_daily_task(&db, "a").await;
        let b = insert_daily_task(&db, "b").await;
        let c = insert_daily_task(&db, "c").await;

        let late = db.insert_execution(a.id, now, now).await.unwrap().unwrap();
        let early = db
            .insert_execution(b.id, now - TimeDelta::hours(3), now)
            .await
            .unwrap()
            .unwrap();
        let tie = db.insert_execution(c.id, now, now).await.unwrap().unwrap();

        let queued = db.queued_executions(10).await.unwrap();
        let ids: Vec<i64> = queued.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![early.id, late.id, tie.id]);

        assert_eq!(db.queued_executions(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conditional_transitions() {
        let (db, _dir) = temp_database().await;
        let task = insert_daily_task(&db, "t").await;
        let now = Utc::now();
        let exec = db.insert_execution(task.id, now, now).await.unwrap().unwrap();

        assert!(db.mark_running(exec.id, now).await.unwrap());
        assert!(!db.mark_running(exec.id, now).await.unwrap());
        assert_eq!(db.count_executions(ExecutionStatus::Running).await.unwrap(), 1);

        assert!(db.revert_to_queued(exec.id).await.unwrap());
        assert!(db.mark_running(exec.id, now).await.unwrap());
        assert!(db
            .record_process(exec.id, 4242, "/tmp/a.xml", "/tmp/a.txt")
            .await
            .unwrap());
        // A recorded process pins the execution in running.
        assert!(!db.revert_to_queued(exec.id).await.unwrap());

        assert!(db.update_progress(exec.id, 42).await.unwrap());
        assert!(db.complete_execution(exec.id, now).await.unwrap());
        // Terminal rows are never rewritten.
        assert!(!db
            .fail_running_execution(exec.id, "late", now)
            .await
            .unwrap());

        let stored = db.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.external_pid, Some(4242));
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_latest_and_in_flight() {
        let (db, _dir) = temp_database().await;
        let task = insert_daily_task(&db, "t").await;
        let now = Utc::now();

        assert!(db.latest_execution(task.id).await.unwrap().is_none());
        let first = db.insert_execution(task.id, now, now).await.unwrap().unwrap();
        db.fail_active_execution(first.id, "x", now).await.unwrap();
        let later = now + TimeDelta::minutes(5);
        let second = db
            .insert_execution(task.id, later, later)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            db.latest_execution(task.id).await.unwrap().map(|e| e.id),
            Some(second.id)
        );
        assert!(db.in_flight_executions().await.unwrap().is_empty());
        db.mark_running(second.id, later).await.unwrap();
        assert_eq!(db.in_flight_executions().await.unwrap().len(), 1);
        assert_eq!(db.list_executions(task.id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stuck_executions_by_start_time() {
        let (db, _dir) = temp_database().await;
        let old_task = insert_daily_task(&db, "old").await;
        let fresh_task = insert_daily_task(&db, "fresh").await;
        let waiting_task = insert_daily_task(&db, "waiting").await;
        let now = Utc::now();
        let long_ago = now - TimeDelta::hours(5);

        let old = db
            .insert_execution(old_task.id, long_ago, long_ago)
            .await
            .unwrap()
            .unwrap();
        db.mark_running(old.id, long_ago).await.unwrap();
        let fresh = db
            .insert_execution(fresh_task.id, now, now)
            .await
            .unwrap()
            .unwrap();
        db.mark_running(fresh.id, now).await.unwrap();
        // Queued for hours but never started.
        db.insert_execution(waiting_task.id, long_ago, long_ago)
            .await
            .unwrap()
            .unwrap();

        let stuck = db
            .stuck_executions(now - TimeDelta::hours(2))
            .await
            .unwrap();
        assert_eq!(stuck.iter().map(|e| e.id).collect::<Vec<_>>(), vec![old.id]);
    }
}
