//! Task definitions and settings tables.
//!
//! These back the [`TaskSource`] and [`SettingsSource`] traits for
//! deployments that keep task definitions in the coordinator's database.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::database::{Database, StorageError};
use crate::models::{ScanPlan, Task, TaskDefinition};
use crate::ports::{
    SettingsSource, TaskSource, DEFAULT_MAX_CONCURRENT_TASKS, DEFAULT_MAX_REPORTS_PER_TASK,
};

/// Settings keys.
pub mod settings_keys {
    pub const MAX_CONCURRENT_TASKS: &str = "max_concurrent_tasks";
    pub const MAX_REPORTS_PER_TASK: &str = "max_reports_per_task";
}

const TASK_COLUMNS: &str = "id, name, recurrence, timezone, enabled, profile, custom_args, \
     targets, max_reports, created_at";

impl Database {
    /// Inserts a task, or updates it when `definition.id` names an existing one.
    pub async fn upsert_task(&self, definition: &TaskDefinition) -> Result<Task, StorageError> {
        let now = Utc::now();
        let recurrence = serde_json::to_string(&definition.recurrence)?;
        let targets = serde_json::to_string(&definition.targets)?;
        let max_reports = definition.max_reports.map(i64::from);

        let id = match definition.id {
            Some(id) => {
                let updated = sqlx::query(
                    "UPDATE scan_tasks SET name = ?2, recurrence = ?3, timezone = ?4, \
                     enabled = ?5, profile = ?6, custom_args = ?7, targets = ?8, \
                     max_reports = ?9, updated_at = ?10 WHERE id = ?1",
                )
                .bind(id)
                .bind(&definition.name)
                .bind(&recurrence)
                .bind(&definition.timezone)
                .bind(definition.enabled)
                .bind(&definition.profile)
                .bind(&definition.custom_args)
                .bind(&targets)
                .bind(max_reports)
                .bind(now)
                .execute(self.pool())
                .await?;
                if updated.rows_affected() == 0 {
                    return Err(StorageError::NotFound(format!("task {}", id)));
                }
                id
            }
            None => sqlx::query(
                "INSERT INTO scan_tasks (name, recurrence, timezone, enabled, profile, \
                 custom_args, targets, max_reports, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            )
            .bind(&definition.name)
            .bind(&recurrence)
            .bind(&definition.timezone)
            .bind(definition.enabled)
            .bind(&definition.profile)
            .bind(&definition.custom_args)
            .bind(&targets)
            .bind(max_reports)
            .bind(now)
            .execute(self.pool())
            .await?
            .last_insert_rowid(),
        };

        self.get_task(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("task {}", id)))
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>, StorageError> {
        let sql = format!("SELECT {} FROM scan_tasks WHERE id = ?1", TASK_COLUMNS);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .map(|row| task_from_row(&row))
            .transpose()
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, StorageError> {
        let sql = format!("SELECT {} FROM scan_tasks ORDER BY id", TASK_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(self.pool()).await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn set_task_enabled(&self, id: i64, enabled: bool) -> Result<bool, StorageError> {
        let result =
            sqlx::query("UPDATE scan_tasks SET enabled = ?2, updated_at = ?3 WHERE id = ?1")
                .bind(id)
                .bind(enabled)
                .bind(Utc::now())
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_task(&self, id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM scan_tasks WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Reads a positive integer setting, falling back to `default` when the
    /// row is missing or unparsable.
    pub async fn get_int_setting(&self, key: &str, default: u32) -> Result<u32, StorageError> {
        let value = self.get_setting(key).await?;
        Ok(value
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(default))
    }
}

#[async_trait]
impl TaskSource for Database {
    async fn task(&self, task_id: i64) -> Result<Option<Task>, StorageError> {
        self.get_task(task_id).await
    }

    async fn enabled_tasks(&self) -> Result<Vec<Task>, StorageError> {
        let sql = format!(
            "SELECT {} FROM scan_tasks WHERE enabled = 1 ORDER BY id",
            TASK_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(self.pool()).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn resolve_plan(&self, task_id: i64) -> Result<Option<ScanPlan>, StorageError> {
        Ok(self.get_task(task_id).await?.map(|task| ScanPlan {
            profile: task.profile,
            custom_args: task.custom_args,
            targets: task.targets,
            max_reports: task.max_reports,
        }))
    }
}

#[async_trait]
impl SettingsSource for Database {
    async fn max_concurrent_tasks(&self) -> Result<u32, StorageError> {
        self.get_int_setting(
            settings_keys::MAX_CONCURRENT_TASKS,
            DEFAULT_MAX_CONCURRENT_TASKS,
        )
        .await
    }

    async fn max_reports_per_task(&self) -> Result<u32, StorageError> {
        self.get_int_setting(
            settings_keys::MAX_REPORTS_PER_TASK,
            DEFAULT_MAX_REPORTS_PER_TASK,
        )
        .await
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StorageError> {
    let recurrence: String = row.try_get("recurrence")?;
    let targets: String = row.try_get("targets")?;
    let max_reports: Option<i64> = row.try_get("max_reports")?;

    Ok(Task {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        recurrence: serde_json::from_str(&recurrence)?,
        timezone: row.try_get("timezone")?,
        enabled: row.try_get("enabled")?,
        profile: row.try_get("profile")?,
        custom_args: row.try_get("custom_args")?,
        targets: serde_json::from_str(&targets)?,
        max_reports: max_reports.and_then(|v| u32::try_from(v).ok()),
        created_at: row.try_get("created_at")?,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::schedule::Recurrence;
    use crate::storage::database::test_support::temp_database;

    #[tokio::test]
    async fn test_upsert_round_trip() {
        let (db, _dir) = temp_database().await;
        let task = insert_daily_task(&db, "nightly").await;
        assert_eq!(task.name, "nightly");
        assert_eq!(task.recurrence, Recurrence::Daily { hour: 2, minute: 0 });

        let mut def = daily_definition("nightly-v2");
        def.id = Some(task.id);
        def.recurrence = Recurrence::Interval { hours: 6 };
        def.enabled = false;
        let updated = db.upsert_task(&def).await.unwrap();
        assert_eq!(updated.id, task.id);
        assert_eq!(updated.recurrence, Recurrence::Interval { hours: 6 });
        assert!(!updated.enabled);
        assert!(db.enabled_tasks().await.unwrap().is_empty());

        def.id = Some(9999);
        assert!(matches!(
            db.upsert_task(&def).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_settings_are_read_fresh_with_defaults() {
        let (db, _dir) = temp_database().await;
        assert_eq!(db.max_concurrent_tasks().await.unwrap(), 4);
        assert_eq!(db.max_reports_per_task().await.unwrap(), 15);

        db.set_setting(settings_keys::MAX_CONCURRENT_TASKS, "2")
            .await
            .unwrap();
        assert_eq!(db.max_concurrent_tasks().await.unwrap(), 2);

        db.set_setting(settings_keys::MAX_CONCURRENT_TASKS, "lots")
            .await
            .unwrap();
        assert_eq!(db.max_concurrent_tasks().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_resolve_plan() {
        let (db, _dir) = temp_database().await;
        let task = insert_daily_task(&db, "t").await;
        let plan = db.resolve_plan(task.id).await.unwrap().unwrap();
        assert_eq!(plan.targets, vec!["127.0.0.1"]);
        assert_eq!(plan.profile.as_deref(), Some("quick_scan"));
        assert!(db.resolve_plan(task.id + 100).await.unwrap().is_none());
    }
}
