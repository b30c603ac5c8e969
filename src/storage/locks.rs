//! Per-task run locks backed by the `task_locks` table.
//!
//! A row is a mutex token: inserting it acquires the lock, deleting it
//! releases it. There is no lease; locks orphaned by a crashed dispatcher are
//! force-released by the zombie reaper or an explicit kill.

use chrono::{DateTime, Utc};

use super::database::{Database, StorageError};

/// Key of the lock held for the whole lifetime of a task's scan process.
pub fn execution_lock_key(task_id: i64) -> String {
    format!("run:task:{}", task_id)
}

/// Key of the short-lived guard around execution creation.
pub fn creation_lock_key(task_id: i64) -> String {
    format!("create:task:{}", task_id)
}

/// Insert-if-absent mutual exclusion over a database row.
#[derive(Debug, Clone)]
pub struct RunLock {
    db: Database,
}

impl RunLock {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Attempts to take the lock. `Ok(false)` means another holder owns it.
    pub async fn acquire(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "INSERT INTO task_locks (lock_key, created_at) VALUES (?1, ?2) \
             ON CONFLICT(lock_key) DO NOTHING",
        )
        .bind(key)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?;

        let acquired = result.rows_affected() == 1;
        if !acquired {
            tracing::debug!(lock_key = key, "Lock contention");
        }
        Ok(acquired)
    }

    /// Releases the lock. Releasing a lock that is not held is a no-op.
    pub async fn release(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM task_locks WHERE lock_key = ?1")
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Deletes every lock row and returns how many there were.
    pub async fn clear_all(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM task_locks")
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn is_held(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.held_since(key).await?.is_some())
    }

    /// When the lock was taken, if it is held.
    pub async fn held_since(&self, key: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT created_at FROM task_locks WHERE lock_key = ?1")
                .bind(key)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.map(|(at,)| at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::test_support::temp_database;

    #[tokio::test]
    async fn test_lock_round_trip() {
        let (db, _dir) = temp_database().await;
        let lock = RunLock::new(db);
        let key = execution_lock_key(7);

        assert!(lock.acquire(&key).await.unwrap());
        assert!(!lock.acquire(&key).await.unwrap());
        assert!(lock.is_held(&key).await.unwrap());

        assert!(lock.release(&key).await.unwrap());
        assert!(!lock.release(&key).await.unwrap());
        assert!(!lock.is_held(&key).await.unwrap());

        assert!(lock.acquire(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_creation_and_execution_keys_are_independent() {
        let (db, _dir) = temp_database().await;
        let lock = RunLock::new(db);

        assert!(lock.acquire(&execution_lock_key(1)).await.unwrap());
        assert!(lock.acquire(&creation_lock_key(1)).await.unwrap());
        assert!(lock.acquire(&execution_lock_key(2)).await.unwrap());
        assert_ne!(execution_lock_key(1), creation_lock_key(1));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let (db, _dir) = temp_database().await;
        let lock = RunLock::new(db);

        let attempts = (0..8).map(|_| {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("run:task:99").await.unwrap() })
        });
        let results = futures::future::join_all(attempts).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_clear_all_frees_every_key() {
        let (db, _dir) = temp_database().await;
        let lock = RunLock::new(db);
        for id in 1..=3 {
            assert!(lock.acquire(&execution_lock_key(id)).await.unwrap());
        }
        assert!(lock.acquire(&creation_lock_key(1)).await.unwrap());

        assert_eq!(lock.clear_all().await.unwrap(), 4);
        assert!(!lock.is_held(&execution_lock_key(2)).await.unwrap());
        assert!(lock.acquire(&creation_lock_key(1)).await.unwrap());
        assert_eq!(lock.clear_all().await.unwrap(), 1);
    }
}
