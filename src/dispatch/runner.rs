//! Runs one admitted execution end to end.
//!
//! The runner holds the task's run lock for the whole life of the scan
//! process. It resolves what to scan, launches the scanner with merged
//! stdout/stderr, reports progress, relaunches once with the privilege
//! wrapper when the scanner asks for root, and records the final verdict.
//! Every finalizing write is conditional on the execution still being
//! starting or running, so a kill or zombie verdict is never overwritten.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use super::command::{requires_privileges, sanitize_arguments, sanitize_targets, CommandBuilder};
use super::output::{classify, truncate_message, LineEvent, OutputMonitor, Verdict};
use super::results::load_results;
use super::worker_pool::{ExecutionHandler, ExecutionRequest, RunOutcome};
use crate::coordinator::config::CoordinatorConfig;
use crate::error::{CoordinatorError, ScanError};
use crate::metrics::{FinishOutcome, MetricsCollector};
use crate::models::ScanPlan;
use crate::ports::{FindingsSink, SettingsSource, TaskSource};
use crate::storage::{execution_lock_key, Database, RunLock};

struct OutputPaths {
    xml: PathBuf,
    normal: PathBuf,
}

enum Launch {
    Finished {
        monitor: OutputMonitor,
        exit_code: Option<i32>,
    },
    NeedsPrivileges {
        monitor: OutputMonitor,
        exit_code: Option<i32>,
    },
    /// The execution was finalized elsewhere before the process was recorded.
    Abandoned,
}

/// [`ExecutionHandler`] that runs the external scanner.
pub struct ScanRunner {
    db: Database,
    tasks: Arc<dyn TaskSource>,
    settings: Arc<dyn SettingsSource>,
    findings: Arc<dyn FindingsSink>,
    lock: RunLock,
    config: Arc<CoordinatorConfig>,
    builder: CommandBuilder,
    metrics: MetricsCollector,
}

impl ScanRunner {
    pub fn new(
        db: Database,
        tasks: Arc<dyn TaskSource>,
        settings: Arc<dyn SettingsSource>,
        findings: Arc<dyn FindingsSink>,
        config: Arc<CoordinatorConfig>,
    ) -> Self {
        let builder = CommandBuilder {
            binary: config.scan_binary.clone(),
            privilege_wrapper: config.privilege_wrapper.clone(),
            stats_every: config.stats_every.clone(),
        };
        Self {
            lock: RunLock::new(db.clone()),
            db,
            tasks,
            settings,
            findings,
            config,
            builder,
            metrics: MetricsCollector::new(),
        }
    }

    fn output_paths(&self, request: ExecutionRequest) -> OutputPaths {
        let stem = format!(
            "task_{}_execution_{}",
            request.task_id, request.execution_id
        );
        OutputPaths {
            xml: self.config.reports_dir.join(format!("{}.xml", stem)),
            normal: self.config.reports_dir.join(format!("{}.txt", stem)),
        }
    }

    async fn run(&self, request: ExecutionRequest) -> Result<RunOutcome, CoordinatorError> {
        let Some(execution) = self.db.get_execution(request.execution_id).await? else {
            warn!(execution_id = request.execution_id, "Execution vanished before dispatch");
            return Ok(RunOutcome::Skipped);
        };
        if !execution.status.is_active() {
            debug!(
                execution_id = execution.id,
                status = %execution.status,
                "Execution no longer active, not running"
            );
            return Ok(RunOutcome::Skipped);
        }

        let Some(plan) = self.tasks.resolve_plan(request.task_id).await? else {
            return Ok(self.fail(request, "Task no longer exists", None).await);
        };

        let args = sanitize_arguments(
            &self
                .config
                .scan_arguments(plan.profile.as_deref(), plan.custom_args.as_deref()),
        )?;
        let targets = sanitize_targets(&plan.targets);
        if targets.is_empty() {
            return Err(ScanError::NoTargets.into());
        }

        tokio::fs::create_dir_all(&self.config.reports_dir).await?;
        let paths = self.output_paths(request);
        let elevate = requires_privileges(&args);
        let started = Instant::now();

        let mut launch = self
            .launch(request, &args, &targets, &paths, elevate)
            .await?;
        if matches!(launch, Launch::NeedsPrivileges { .. })
            && !elevate
            && self.config.privilege_wrapper.is_some()
        {
            info!(
                execution_id = request.execution_id,
                "Scan requires elevated privileges, relaunching"
            );
            launch = self.launch(request, &args, &targets, &paths, true).await?;
        }

        let (monitor, exit_code) = match launch {
            Launch::Abandoned => return Ok(RunOutcome::Skipped),
            Launch::Finished { monitor, exit_code }
            | Launch::NeedsPrivileges { monitor, exit_code } => (monitor, exit_code),
        };
        let duration = started.elapsed().as_secs_f64();

        match classify(&monitor, exit_code, paths.xml.exists()) {
            Verdict::Succeeded => self.finish(request, &plan, &paths, duration).await,
            Verdict::Failed(message) => Ok(self.fail(request, &message, Some(duration)).await),
        }
    }

    async fn launch(
        &self,
        request: ExecutionRequest,
        args: &str,
        targets: &[String],
        paths: &OutputPaths,
        elevate: bool,
    ) -> Result<Launch, CoordinatorError> {
        let command = self
            .builder
            .build(args, targets, &paths.xml, &paths.normal, elevate);
        debug!(program = %command.program, args = ?command.args, "Launching scan");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ScanError::Spawn)?;

        if let Some(pid) = child.id() {
            let recorded = self
                .db
                .record_process(
                    request.execution_id,
                    pid,
                    &paths.xml.display().to_string(),
                    &paths.normal.display().to_string(),
                )
                .await?;
            if !recorded {
                info!(
                    execution_id = request.execution_id,
                    pid, "Execution finalized before scan start, stopping process"
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Ok(Launch::Abandoned);
            }
            info!(
                execution_id = request.execution_id,
                task_id = request.task_id,
                pid,
                elevated = command.elevated,
                "Scan process started"
            );
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScanError::Io(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ScanError::Io(std::io::Error::other("stderr not captured")))?;
        let mut lines = LinesStream::new(BufReader::new(stdout).lines())
            .merge(LinesStream::new(BufReader::new(stderr).lines()));

        let mut monitor = OutputMonitor::new(self.config.output_tail_lines);
        let mut privilege_required = false;
        let mut last_progress = 0u8;

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!(error = %e, "Unreadable scan output line");
                    continue;
                }
            };
            match monitor.observe(&line) {
                LineEvent::Progress(pct) if pct > last_progress => {
                    last_progress = pct;
                    if let Err(e) = self.db.update_progress(request.execution_id, pct).await {
                        warn!(execution_id = request.execution_id, error = %e, "Progress update failed");
                    }
                }
                LineEvent::PrivilegeRequired => {
                    privilege_required = true;
                    let _ = child.start_kill();
                    break;
                }
                _ => {}
            }
        }
        drop(lines);

        let status = child.wait().await.map_err(ScanError::Io)?;
        let exit_code = status.code();
        Ok(if privilege_required {
            Launch::NeedsPrivileges { monitor, exit_code }
        } else {
            Launch::Finished { monitor, exit_code }
        })
    }

    async fn finish(
        &self,
        request: ExecutionRequest,
        plan: &ScanPlan,
        paths: &OutputPaths,
        duration: f64,
    ) -> Result<RunOutcome, CoordinatorError> {
        let results = match load_results(&paths.xml).await {
            Ok(results) => results,
            Err(e) => return Ok(self.fail(request, &e.to_string(), Some(duration)).await),
        };

        self.findings
            .record_results(
                request.execution_id,
                request.task_id,
                &results,
                &paths.xml.display().to_string(),
                &paths.normal.display().to_string(),
            )
            .await?;

        let keep = match plan.max_reports {
            Some(keep) => keep,
            None => self.settings.max_reports_per_task().await?,
        };
        if let Err(e) = self.findings.trim_reports(request.task_id, keep).await {
            warn!(task_id = request.task_id, error = %e, "Report retention failed");
        }

        if !self
            .db
            .complete_execution(request.execution_id, Utc::now())
            .await?
        {
            info!(
                execution_id = request.execution_id,
                "Execution finalized elsewhere, completion not recorded"
            );
            return Ok(RunOutcome::Skipped);
        }

        self.metrics
            .record_finished(FinishOutcome::Completed, Some(duration));
        info!(
            execution_id = request.execution_id,
            task_id = request.task_id,
            hosts_up = results.summary.hosts_up,
            open_ports = results.open_port_count(),
            duration_secs = duration,
            "Scan completed"
        );
        Ok(RunOutcome::Completed)
    }

    async fn fail(&self, request: ExecutionRequest, message: &str, duration: Option<f64>) -> RunOutcome {
        let message = truncate_message(message, self.config.max_error_len);
        match self
            .db
            .fail_running_execution(request.execution_id, &message, Utc::now())
            .await
        {
            Ok(true) => {
                self.metrics.record_finished(FinishOutcome::Failed, duration);
                warn!(
                    execution_id = request.execution_id,
                    task_id = request.task_id,
                    error = %message,
                    "Scan failed"
                );
            }
            Ok(false) => debug!(
                execution_id = request.execution_id,
                "Execution already finalized, failure not recorded"
            ),
            Err(e) => error!(
                execution_id = request.execution_id,
                error = %e,
                "Failed to record scan failure"
            ),
        }
        RunOutcome::Failed
    }
}

#[async_trait]
impl ExecutionHandler for ScanRunner {
    async fn handle(&self, request: ExecutionRequest) -> RunOutcome {
        let key = execution_lock_key(request.task_id);
        match self.lock.acquire(&key).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    execution_id = request.execution_id,
                    task_id = request.task_id,
                    "Run lock held elsewhere, not dispatching"
                );
                self.abandon(request).await;
                return RunOutcome::Skipped;
            }
            Err(e) => {
                error!(task_id = request.task_id, error = %e, "Failed to acquire run lock");
                self.abandon(request).await;
                return RunOutcome::Skipped;
            }
        }

        let outcome = match AssertUnwindSafe(self.run(request)).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => self.fail(request, &e.to_string(), None).await,
            Err(_) => {
                error!(execution_id = request.execution_id, "Scan worker panicked");
                self.fail(request, "Internal error: scan worker panicked", None)
                    .await
            }
        };

        if let Err(e) = self.lock.release(&key).await {
            warn!(task_id = request.task_id, error = %e, "Failed to release run lock");
        }
        outcome
    }

    /// Puts an admitted execution that never got a process back in the queue
    /// so the next admission pass retries it.
    async fn abandon(&self, request: ExecutionRequest) {
        match self.db.revert_to_queued(request.execution_id).await {
            Ok(true) => info!(
                execution_id = request.execution_id,
                task_id = request.task_id,
                "Execution returned to queue"
            ),
            Ok(false) => debug!(
                execution_id = request.execution_id,
                "Execution already moved on, not requeued"
            ),
            Err(e) => warn!(
                execution_id = request.execution_id,
                error = %e,
                "Failed to requeue execution"
            ),
        }
    }
}
