//! SQLite persistent storage.
//!
//! # Overview
//!
//! The storage layer consists of:
//! - **Database**: connection pool plus the execution repository, task and
//!   settings tables, trigger jobs and scan findings
//! - **RunLock**: per-task mutual exclusion over the `task_locks` table
//! - **Migrations**: schema management and versioning
//!
//! # Usage
//!
//! ```rust,ignore
//! use scan_coordinator::storage::{Database, RunLock, execution_lock_key};
//!
//! let db = Database::open("coordinator.db").await?;
//! let lock = RunLock::new(db.clone());
//!
//! if lock.acquire(&execution_lock_key(task_id)).await? {
//!     // ... run the scan ...
//!     lock.release(&execution_lock_key(task_id)).await?;
//! }
//! ```

pub mod database;
pub mod executions;
pub mod findings;
pub mod locks;
pub mod migrations;
pub mod schema;
pub mod tasks;
pub mod trigger_jobs;

pub use database::{Database, StorageError};
pub use locks::{creation_lock_key, execution_lock_key, RunLock};
pub use migrations::{MigrationError, MigrationRunner};
pub use tasks::settings_keys;
