//! Fixed-size pool of scan workers.
//!
//! Admitted executions are handed to the pool through a bounded channel with
//! one slot per worker. Each worker runs as an independent async task, takes
//! requests from the shared channel and passes them to an
//! [`ExecutionHandler`], which launches and supervises the scan process.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Non-blocking submission that reports saturation instead of waiting
//! - Graceful shutdown with broadcast channel; requests still queued in the
//!   channel are handed back through [`ExecutionHandler::abandon`]
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::ExecutionDispatcher;
use crate::error::DispatchError;

/// One admitted execution waiting for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub execution_id: i64,
    pub task_id: i64,
}

/// How a handled request ended, for pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    /// Nothing ran: the execution was gone, inactive or locked elsewhere.
    Skipped,
}

/// Runs one execution to completion.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn handle(&self, request: ExecutionRequest) -> RunOutcome;

    /// Gives back a request that was accepted but will never be run.
    async fn abandon(&self, request: ExecutionRequest);
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn. Also the submission channel capacity.
    pub num_workers: usize,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently running a scan.
    pub active_workers: usize,
    pub scans_completed: u64,
    pub scans_failed: u64,
    pub scans_skipped: u64,
    /// Average duration of completed and failed scans.
    pub average_scan_duration: Duration,
}

impl PoolStats {
    /// Returns the number of scans that ran (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.scans_completed + self.scans_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.scans_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    scans_completed: AtomicU64,
    scans_failed: AtomicU64,
    scans_skipped: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            scans_completed: AtomicU64::new(0),
            scans_failed: AtomicU64::new(0),
            scans_skipped: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: RunOutcome, duration: Duration) {
        let counter = match outcome {
            RunOutcome::Completed => &self.scans_completed,
            RunOutcome::Failed => &self.scans_failed,
            RunOutcome::Skipped => {
                self.scans_skipped.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.scans_completed.load(Ordering::SeqCst);
        let failed = self.scans_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            scans_completed: completed,
            scans_failed: failed,
            scans_skipped: self.scans_skipped.load(Ordering::SeqCst),
            average_scan_duration: average_duration,
        }
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<ExecutionRequest>>>;

/// Worker pool that runs admitted executions.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    handler: Arc<dyn ExecutionHandler>,
    sender: Mutex<Option<mpsc::Sender<ExecutionRequest>>>,
    receiver: Mutex<Option<SharedReceiver>>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, handler: Arc<dyn ExecutionHandler>) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            handler,
            sender: Mutex::new(None),
            receiver: Mutex::new(None),
            shutdown_tx,
            worker_handles: Mutex::new(Vec::new()),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::AlreadyRunning` if the pool is already running.
    pub fn start(&self) -> Result<(), DispatchError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::AlreadyRunning);
        }

        let capacity = self.config.num_workers.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = lock(&self.worker_handles);
        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                receiver: Arc::clone(&receiver),
                handler: Arc::clone(&self.handler),
                shutdown_rx: self.shutdown_tx.subscribe(),
                stats: Arc::clone(&self.stats),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        *lock(&self.sender) = Some(tx);
        *lock(&self.receiver) = Some(receiver);

        info!(num_workers = self.config.num_workers, "Worker pool started");
        Ok(())
    }

    /// Stops accepting work and waits for workers to finish their current scan.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(DispatchError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        lock(&self.sender).take();
        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = lock(&self.worker_handles).drain(..).collect();
        let shutdown_future = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.abandon_pending().await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(DispatchError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Hands every request still waiting in the channel back to the handler.
    async fn abandon_pending(&self) {
        let Some(shared) = lock(&self.receiver).take() else {
            return;
        };
        let mut receiver = shared.lock().await;
        receiver.close();

        let mut abandoned = 0usize;
        while let Ok(request) = receiver.try_recv() {
            self.handler.abandon(request).await;
            abandoned += 1;
        }
        if abandoned > 0 {
            info!(abandoned, "Returned undispatched executions at shutdown");
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

impl ExecutionDispatcher for WorkerPool {
    fn submit(&self, execution_id: i64, task_id: i64) -> Result<(), DispatchError> {
        let guard = lock(&self.sender);
        let sender = guard.as_ref().ok_or(DispatchError::NotRunning)?;
        sender
            .try_send(ExecutionRequest {
                execution_id,
                task_id,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::PoolSaturated,
                mpsc::error::TrySendError::Closed(_) => DispatchError::NotRunning,
            })
    }

    fn capacity(&self) -> usize {
        self.config.num_workers
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A single worker that runs executions from the shared channel.
struct Worker {
    id: String,
    receiver: SharedReceiver,
    handler: Arc<dyn ExecutionHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Main worker loop. Takes requests until shutdown or until the channel
    /// closes.
    async fn run(mut self) {
        debug!(worker_id = %self.id, "Worker started");

        loop {
            let receiver = Arc::clone(&self.receiver);
            let next = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => break,
                request = async move { receiver.lock().await.recv().await } => request,
            };
            let Some(request) = next else {
                break;
            };
            self.process(request).await;
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, request: ExecutionRequest) {
        let start_time = Instant::now();
        debug!(
            worker_id = %self.id,
            execution_id = request.execution_id,
            task_id = request.task_id,
            "Processing execution"
        );

        self.stats.increment_active();
        let outcome = self.handler.handle(request).await;
        self.stats.decrement_active();
        self.stats.record(outcome, start_time.elapsed());

        debug!(
            worker_id = %self.id,
            execution_id = request.execution_id,
            outcome = ?outcome,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "Execution handled"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    struct GatedHandler {
        gate: Semaphore,
        seen: Mutex<Vec<i64>>,
        abandoned: Mutex<Vec<i64>>,
    }

    impl GatedHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                seen: Mutex::new(Vec::new()),
                abandoned: Mutex::new(Vec::new()),
            })
        }
    }

    async fn wait_until_seen(handler: &GatedHandler, count: usize) {
        for _ in 0..100 {
            if lock(&handler.seen).len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[async_trait]
    impl ExecutionHandler for GatedHandler {
        async fn handle(&self, request: ExecutionRequest) -> RunOutcome {
            lock(&self.seen).push(request.execution_id);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            RunOutcome::Completed
        }

        async fn abandon(&self, request: ExecutionRequest) {
            lock(&self.abandoned).push(request.execution_id);
        }
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8).with_shutdown_timeout(Duration::from_secs(120));
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
        assert_eq!(WorkerPoolConfig::default().num_workers, 2);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record(RunOutcome::Completed, Duration::from_secs(10));
        stats.record(RunOutcome::Completed, Duration::from_secs(20));
        stats.record(RunOutcome::Failed, Duration::from_secs(5));
        stats.record(RunOutcome::Skipped, Duration::from_secs(500));

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.scans_completed, 2);
        assert_eq!(pool_stats.scans_failed, 1);
        assert_eq!(pool_stats.scans_skipped, 1);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_scan_duration.as_millis() > 11000);
        assert!(pool_stats.average_scan_duration.as_millis() < 12000);
        assert!((pool_stats.success_rate() - 66.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_submit_before_start_fails() {
        let handler = GatedHandler::new();
        let pool = WorkerPool::new(WorkerPoolConfig::new(1), handler);
        assert!(matches!(pool.submit(1, 1), Err(DispatchError::NotRunning)));
        assert!(matches!(
            pool.shutdown().await,
            Err(DispatchError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_saturation_and_shutdown() {
        let handler = GatedHandler::new();
        let pool = WorkerPool::new(
            WorkerPoolConfig::new(1).with_shutdown_timeout(Duration::from_secs(5)),
            Arc::clone(&handler) as Arc<dyn ExecutionHandler>,
        );
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(DispatchError::AlreadyRunning)));

        pool.submit(1, 10).unwrap();
        wait_until_seen(&handler, 1).await;
        assert_eq!(pool.stats().active_workers, 1);

        pool.submit(2, 20).unwrap();
        assert!(matches!(pool.submit(3, 30), Err(DispatchError::PoolSaturated)));

        handler.gate.add_permits(2);
        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
        assert!(matches!(pool.submit(4, 40), Err(DispatchError::NotRunning)));
        assert!(pool.stats().scans_completed >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_hands_back_queued_requests() {
        let handler = GatedHandler::new();
        let pool = WorkerPool::new(
            WorkerPoolConfig::new(1).with_shutdown_timeout(Duration::from_secs(5)),
            Arc::clone(&handler) as Arc<dyn ExecutionHandler>,
        );
        pool.start().unwrap();

        pool.submit(1, 10).unwrap();
        wait_until_seen(&handler, 1).await;
        pool.submit(2, 20).unwrap();

        // The in-flight scan finishes only after shutdown has begun.
        let (result, ()) = tokio::join!(pool.shutdown(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handler.gate.add_permits(1);
        });
        result.unwrap();

        assert_eq!(*lock(&handler.seen), vec![1]);
        assert_eq!(*lock(&handler.abandoned), vec![2]);
        assert_eq!(pool.stats().scans_completed, 1);
    }
}
