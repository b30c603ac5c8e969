//! The coordinator service: wiring and lifecycle for every scheduling component.
//!
//! [`Coordinator::new`] builds the components over one [`Database`]. Any
//! process may use it to import tasks, trigger runs or query executions;
//! only the process holding the [`LeaderLock`] calls [`Coordinator::start`],
//! which launches the trigger loop, the three sweeps and the worker pool.

pub mod config;
pub mod control;
pub mod leader;

pub use config::{ConfigError, CoordinatorConfig};
pub use control::{
    CleanupReport, ExecutionControl, ExecutionStatusView, NextRunView, KILLED_MESSAGE,
    STUCK_MESSAGE,
};
pub use leader::LeaderLock;

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dispatch::{
    ExecutionDispatcher, PoolStats, ScanRunner, SysinfoInspector, WorkerPool, WorkerPoolConfig,
};
use crate::error::CoordinatorError;
use crate::models::{Execution, Task, TaskDefinition, TriggerJob};
use crate::ports::{FindingsSink, SettingsSource, TaskSource};
use crate::scheduler::{
    run_periodic, AdmissionController, CreateOrigin, ExecutionCreator, MissedRunAuditor,
    TriggerScheduler, ZombieReaper,
};
use crate::storage::{Database, RunLock};

/// Owns the scheduling components and their background tasks.
pub struct Coordinator {
    config: Arc<CoordinatorConfig>,
    db: Database,
    creator: ExecutionCreator,
    trigger: Arc<TriggerScheduler>,
    auditor: Arc<MissedRunAuditor>,
    admission: Arc<AdmissionController>,
    reaper: Arc<ZombieReaper>,
    pool: Arc<WorkerPool>,
    control: ExecutionControl,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    leader: Mutex<Option<LeaderLock>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, db: Database) -> Self {
        let config = Arc::new(config);
        let tasks: Arc<dyn TaskSource> = Arc::new(db.clone());
        let settings: Arc<dyn SettingsSource> = Arc::new(db.clone());
        let findings: Arc<dyn FindingsSink> = Arc::new(db.clone());

        let creator = ExecutionCreator::new(db.clone(), Arc::clone(&tasks));
        let trigger = TriggerScheduler::new(db.clone(), Arc::clone(&tasks), creator.clone());
        let auditor = MissedRunAuditor::new(
            db.clone(),
            Arc::clone(&tasks),
            creator.clone(),
            config.missed_run_grace,
        );

        let runner = ScanRunner::new(
            db.clone(),
            Arc::clone(&tasks),
            Arc::clone(&settings),
            findings,
            Arc::clone(&config),
        );
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig::new(config.pool_size).with_shutdown_timeout(config.shutdown_timeout),
            Arc::new(runner),
        ));
        let dispatcher: Arc<dyn ExecutionDispatcher> = pool.clone();
        let admission = AdmissionController::new(db.clone(), settings, dispatcher);

        let reaper = ZombieReaper::new(
            db.clone(),
            Arc::new(SysinfoInspector),
            config.scan_binary.clone(),
            config.zombie_warmup,
            config.zombie_no_pid_grace,
        );
        let control = ExecutionControl::new(db.clone(), config.kill_grace);

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            db,
            creator,
            trigger: Arc::new(trigger),
            auditor: Arc::new(auditor),
            admission: Arc::new(admission),
            reaper: Arc::new(reaper),
            pool,
            control,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            leader: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Starts the worker pool, the trigger loop and the periodic sweeps.
    ///
    /// Leadership is held for as long as the coordinator runs and is given
    /// up by [`shutdown`](Self::shutdown).
    pub fn start(&self, leader: LeaderLock) -> Result<(), CoordinatorError> {
        if let Err(e) = crate::metrics::init_metrics() {
            warn!(error = %e, "Metrics registry unavailable");
        }

        self.pool.start()?;
        *lock(&self.leader) = Some(leader);

        let mut handles = lock(&self.handles);

        let trigger = Arc::clone(&self.trigger);
        handles.push(tokio::spawn(trigger.run(
            self.config.trigger_tick,
            self.config.reconcile_interval,
            self.shutdown_tx.subscribe(),
        )));

        let auditor = Arc::clone(&self.auditor);
        handles.push(tokio::spawn(run_periodic(
            "missed_run_audit",
            self.config.audit_interval,
            self.shutdown_tx.subscribe(),
            move |now| {
                let auditor = Arc::clone(&auditor);
                async move { auditor.sweep(now).await }
            },
        )));

        let admission = Arc::clone(&self.admission);
        handles.push(tokio::spawn(run_periodic(
            "admission",
            self.config.admission_interval,
            self.shutdown_tx.subscribe(),
            move |now| {
                let admission = Arc::clone(&admission);
                async move { admission.sweep(now).await }
            },
        )));

        let reaper = Arc::clone(&self.reaper);
        handles.push(tokio::spawn(run_periodic(
            "zombie_reaper",
            self.config.reaper_interval,
            self.shutdown_tx.subscribe(),
            move |now| {
                let reaper = Arc::clone(&reaper);
                async move { reaper.sweep(now).await }
            },
        )));

        info!(
            pool_size = self.config.pool_size,
            reports_dir = %self.config.reports_dir.display(),
            "Coordinator started"
        );
        Ok(())
    }

    /// Stops the background loops, drains the worker pool and releases
    /// leadership.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background loop panicked");
            }
        }

        let result = if self.pool.is_running() {
            self.pool.shutdown().await.map_err(CoordinatorError::from)
        } else {
            Ok(())
        };

        lock(&self.leader).take();
        info!("Coordinator stopped");
        result
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stores a task definition and refreshes its trigger job.
    pub async fn install_task(
        &self,
        definition: &TaskDefinition,
    ) -> Result<(Task, Option<TriggerJob>), CoordinatorError> {
        let task = self.db.upsert_task(definition).await?;
        let job = self.trigger.install(&task, Utc::now()).await?;
        Ok((task, job))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, CoordinatorError> {
        Ok(self.db.list_tasks().await?)
    }

    /// Queues a run of `task_id` now. Returns `None` when the task is
    /// disabled or already has an active execution.
    pub async fn trigger(&self, task_id: i64) -> Result<Option<Execution>, CoordinatorError> {
        if self.db.get_task(task_id).await?.is_none() {
            return Err(CoordinatorError::TaskNotFound(task_id));
        }
        Ok(self
            .creator
            .create_execution(task_id, Utc::now(), CreateOrigin::Manual)
            .await?)
    }

    pub async fn status(&self, execution_id: i64) -> Result<ExecutionStatusView, CoordinatorError> {
        self.control.status(execution_id).await
    }

    pub async fn kill(&self, execution_id: i64) -> Result<ExecutionStatusView, CoordinatorError> {
        self.control.kill(execution_id).await
    }

    pub async fn cleanup_stuck(
        &self,
        older_than: std::time::Duration,
        dry_run: bool,
    ) -> Result<CleanupReport, CoordinatorError> {
        self.control.cleanup_stuck(older_than, dry_run).await
    }

    /// Drops every run lock and creation guard. Returns how many were held.
    pub async fn clear_locks(&self) -> Result<u64, CoordinatorError> {
        let cleared = RunLock::new(self.db.clone()).clear_all().await?;
        warn!(cleared, "All task locks cleared");
        Ok(cleared)
    }

    pub async fn next_run(&self, task_id: i64) -> Result<NextRunView, CoordinatorError> {
        self.control.next_run(task_id).await
    }

    pub fn trigger_scheduler(&self) -> &Arc<TriggerScheduler> {
        &self.trigger
    }

    pub fn auditor(&self) -> &Arc<MissedRunAuditor> {
        &self.auditor
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn reaper(&self) -> &Arc<ZombieReaper> {
        &self.reaper
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::models::ExecutionStatus;
    use crate::storage::database::test_support::temp_database;
    use crate::storage::tasks::test_support::daily_definition;

    #[tokio::test]
    async fn test_install_trigger_and_kill() {
        let (db, dir) = temp_database().await;
        let config = CoordinatorConfig::new().with_reports_dir(dir.path().join("reports"));
        let coordinator = Coordinator::new(config, db);

        let (task, job) = coordinator
            .install_task(&daily_definition("nightly"))
            .await
            .unwrap();
        assert!(job.and_then(|j| j.next_fire_at).is_some());

        let execution = coordinator.trigger(task.id).await.unwrap().unwrap();
        assert!(coordinator.trigger(task.id).await.unwrap().is_none());

        let view = coordinator.kill(execution.id).await.unwrap();
        assert_eq!(view.status, ExecutionStatus::Failed);
        assert!(coordinator.trigger(task.id).await.unwrap().is_some());

        assert!(matches!(
            coordinator.trigger(404).await,
            Err(CoordinatorError::TaskNotFound(404))
        ));
    }

    #[tokio::test]
    async fn test_clear_locks_unblocks_creation() {
        use crate::storage::{creation_lock_key, execution_lock_key};

        let (db, dir) = temp_database().await;
        let config = CoordinatorConfig::new().with_reports_dir(dir.path().join("reports"));
        let coordinator = Coordinator::new(config, db.clone());
        let (task, _) = coordinator
            .install_task(&daily_definition("orphaned"))
            .await
            .unwrap();

        let lock = RunLock::new(db);
        lock.acquire(&creation_lock_key(task.id)).await.unwrap();
        lock.acquire(&execution_lock_key(task.id)).await.unwrap();
        assert!(coordinator.trigger(task.id).await.unwrap().is_none());

        assert_eq!(coordinator.clear_locks().await.unwrap(), 2);
        assert!(coordinator.trigger(task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (db, dir) = temp_database().await;
        let mut config = CoordinatorConfig::new()
            .with_reports_dir(dir.path().join("reports"))
            .with_leader_lock_path(dir.path().join("leader.lock"));
        config.shutdown_timeout = Duration::from_secs(2);
        let coordinator = Coordinator::new(config, db);

        let leader = LeaderLock::try_acquire(&coordinator.config().leader_lock_path).unwrap();
        coordinator.start(leader).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.shutdown().await.unwrap();

        // Leadership is free again once the coordinator stops.
        assert!(LeaderLock::try_acquire(&coordinator.config().leader_lock_path).is_ok());
    }
}
