//! Durable trigger job persistence.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::database::{Database, StorageError};
use crate::models::TriggerJob;

impl Database {
    /// Inserts or replaces the job for `job.task_id`.
    pub async fn upsert_trigger_job(&self, job: &TriggerJob) -> Result<(), StorageError> {
        let recurrence = serde_json::to_string(&job.recurrence)?;
        sqlx::query(
            "INSERT INTO trigger_jobs (task_id, recurrence, timezone, next_fire_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(task_id) DO UPDATE SET recurrence = excluded.recurrence, \
             timezone = excluded.timezone, next_fire_at = excluded.next_fire_at, \
             updated_at = excluded.updated_at",
        )
        .bind(job.task_id)
        .bind(&recurrence)
        .bind(&job.timezone)
        .bind(job.next_fire_at)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_trigger_job(&self, task_id: i64) -> Result<Option<TriggerJob>, StorageError> {
        sqlx::query(
            "SELECT task_id, recurrence, timezone, next_fire_at FROM trigger_jobs WHERE task_id = ?1",
        )
        .bind(task_id)
        .fetch_optional(self.pool())
        .await?
        .map(|row| trigger_job_from_row(&row))
        .transpose()
    }

    pub async fn list_trigger_jobs(&self) -> Result<Vec<TriggerJob>, StorageError> {
        let rows = sqlx::query(
            "SELECT task_id, recurrence, timezone, next_fire_at FROM trigger_jobs ORDER BY task_id",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(trigger_job_from_row).collect()
    }

    /// Moves only the next fire instant of an existing job.
    pub async fn set_next_fire(
        &self,
        task_id: i64,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE trigger_jobs SET next_fire_at = ?2, updated_at = ?3 WHERE task_id = ?1",
        )
        .bind(task_id)
        .bind(next_fire_at)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_trigger_job(&self, task_id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM trigger_jobs WHERE task_id = ?1")
            .bind(task_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn trigger_job_from_row(row: &SqliteRow) -> Result<TriggerJob, StorageError> {
    let recurrence: String = row.try_get("recurrence")?;
    Ok(TriggerJob {
        task_id: row.try_get("task_id")?,
        recurrence: serde_json::from_str(&recurrence)?,
        timezone: row.try_get("timezone")?,
        next_fire_at: row.try_get("next_fire_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Recurrence;
    use crate::storage::database::test_support::temp_database;
    use chrono::{SubsecRound, TimeDelta};

    #[tokio::test]
    async fn test_trigger_job_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let next = (Utc::now() + TimeDelta::hours(1)).trunc_subsecs(0);

        {
            let db = Database::open(&path).await.unwrap();
            let job = TriggerJob {
                task_id: 3,
                recurrence: Recurrence::Interval { hours: 2 },
                timezone: "UTC".into(),
                next_fire_at: Some(next),
            };
            db.upsert_trigger_job(&job).await.unwrap();
            db.close().await;
        }

        let db = Database::open(&path).await.unwrap();
        let job = db.get_trigger_job(3).await.unwrap().unwrap();
        assert_eq!(job.recurrence, Recurrence::Interval { hours: 2 });
        assert_eq!(job.next_fire_at, Some(next));
    }

    #[tokio::test]
    async fn test_upsert_replaces_instead_of_stacking() {
        let (db, _dir) = temp_database().await;
        let mut job = TriggerJob {
            task_id: 1,
            recurrence: Recurrence::Daily { hour: 1, minute: 0 },
            timezone: "UTC".into(),
            next_fire_at: None,
        };
        db.upsert_trigger_job(&job).await.unwrap();
        job.recurrence = Recurrence::Daily { hour: 5, minute: 0 };
        db.upsert_trigger_job(&job).await.unwrap();

        let jobs = db.list_trigger_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].recurrence, Recurrence::Daily { hour: 5, minute: 0 });

        assert!(db.set_next_fire(1, Some(Utc::now())).await.unwrap());
        assert!(db.delete_trigger_job(1).await.unwrap());
        assert!(!db.set_next_fire(1, None).await.unwrap());
    }
}
