//! Admission of queued executions under the global concurrency ceiling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::dispatch::ExecutionDispatcher;
use crate::error::CoordinatorError;
use crate::metrics::MetricsCollector;
use crate::models::ExecutionStatus;
use crate::ports::SettingsSource;
use crate::storage::Database;

/// Counts from one admission pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionReport {
    pub ceiling: u32,
    pub running: u32,
    pub admitted: usize,
    pub reverted: usize,
}

/// Promotes queued executions to running, oldest scheduled instant first,
/// and hands them to the dispatcher.
pub struct AdmissionController {
    db: Database,
    settings: Arc<dyn SettingsSource>,
    dispatcher: Arc<dyn ExecutionDispatcher>,
    metrics: MetricsCollector,
}

impl AdmissionController {
    pub fn new(
        db: Database,
        settings: Arc<dyn SettingsSource>,
        dispatcher: Arc<dyn ExecutionDispatcher>,
    ) -> Self {
        Self {
            db,
            settings,
            dispatcher,
            metrics: MetricsCollector::new(),
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<AdmissionReport, CoordinatorError> {
        let configured = self.settings.max_concurrent_tasks().await?;
        let pool = u32::try_from(self.dispatcher.capacity()).unwrap_or(u32::MAX);
        let ceiling = configured.min(pool);

        let running = self.db.count_executions(ExecutionStatus::Running).await?;
        self.metrics.set_running(running);

        let mut report = AdmissionReport {
            ceiling,
            running,
            ..AdmissionReport::default()
        };
        if running >= ceiling {
            debug!(running, ceiling, "At concurrency ceiling, nothing admitted");
            return Ok(report);
        }

        let queued = self.db.queued_executions(ceiling - running).await?;
        for execution in queued {
            match self.db.mark_running(execution.id, now).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(execution_id = execution.id, "Execution left the queue, skipping");
                    continue;
                }
                Err(e) => {
                    error!(execution_id = execution.id, error = %e, "Failed to admit execution");
                    continue;
                }
            }

            match self.dispatcher.submit(execution.id, execution.task_id) {
                Ok(()) => {
                    report.admitted += 1;
                    self.metrics.record_admitted();
                    info!(
                        execution_id = execution.id,
                        task_id = execution.task_id,
                        priority = %execution.priority_timestamp,
                        "Execution admitted"
                    );
                }
                Err(e) => {
                    self.metrics.record_dispatch_failure();
                    warn!(execution_id = execution.id, error = %e, "Dispatch failed, returning to queue");
                    if self.db.revert_to_queued(execution.id).await? {
                        report.reverted += 1;
                    }
                    break;
                }
            }
        }

        self.metrics.set_running(running + report.admitted as u32);
        Ok(report)
    }
}
