//! CLI command definitions for scan-coordinator.
//!
//! `run` elects a leader and keeps the coordinator alive until Ctrl-C. Every
//! other command works against the shared database and is safe to use while
//! a leader is running elsewhere.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use crate::coordinator::{Coordinator, CoordinatorConfig, LeaderLock};
use crate::models::TaskDefinition;
use crate::storage::{settings_keys, Database};

/// Scan scheduling and execution coordinator.
#[derive(Parser)]
#[command(name = "scan-coordinator")]
#[command(about = "Schedule, dispatch and supervise recurring network scans")]
#[command(version)]
#[command(
    long_about = "scan-coordinator turns recurring scan tasks into executions, admits them under a global concurrency ceiling and supervises the scan processes.\n\nExample usage:\n  scan-coordinator task import tasks.yaml\n  scan-coordinator run --config coordinator.yaml"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Database connection string. Overrides the configuration file.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// YAML configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Become the leader and run triggers, sweeps and the worker pool until Ctrl-C.
    Run,

    /// Manage scan tasks.
    #[command(subcommand)]
    Task(TaskCommand),

    /// Queue a run of a task now.
    Trigger {
        task_id: i64,
    },

    /// Show the state of an execution.
    Status {
        execution_id: i64,
    },

    /// Fail an active execution and stop its scan process.
    Kill {
        execution_id: i64,
    },

    /// Show when a task runs next.
    #[command(name = "next-run")]
    NextRun {
        task_id: i64,
    },

    /// Manage live settings.
    #[command(subcommand)]
    Settings(SettingsCommand),

    /// Repair executions left behind by a crashed coordinator.
    #[command(subcommand)]
    Executions(ExecutionsCommand),

    /// Inspect or repair task locks.
    #[command(subcommand)]
    Locks(LocksCommand),
}

#[derive(clap::Subcommand, Debug)]
pub enum TaskCommand {
    /// Insert or update task definitions from a JSON or YAML file.
    Import {
        file: PathBuf,
    },

    /// List all tasks.
    List,
}

#[derive(clap::Subcommand, Debug)]
pub enum SettingsCommand {
    /// Set a live setting (max_concurrent_tasks, max_reports_per_task).
    Set { key: String, value: String },
}

#[derive(clap::Subcommand, Debug)]
pub enum ExecutionsCommand {
    /// Fail starting or running executions that started too long ago and stop their scans.
    Cleanup {
        /// Executions started more than this many hours ago count as stuck.
        #[arg(long, default_value_t = 2)]
        older_than_hours: u32,

        /// List what would be cleaned without changing anything.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum LocksCommand {
    /// Delete every task lock. Only use this while no leader is running.
    Clear,
}

/// A task file holds either one definition or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    Many(Vec<TaskDefinition>),
    One(TaskDefinition),
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = CoordinatorConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        config = config.with_database_url(url);
    }

    let db = Database::connect(&config.database_url).await?;
    db.run_migrations().await?;
    let coordinator = Coordinator::new(config, db.clone());

    let result = match cli.command {
        Commands::Run => run_daemon(&coordinator).await,
        Commands::Task(TaskCommand::Import { file }) => import_tasks(&coordinator, &file).await,
        Commands::Task(TaskCommand::List) => list_tasks(&coordinator).await,
        Commands::Trigger { task_id } => trigger_task(&coordinator, task_id).await,
        Commands::Status { execution_id } => {
            let view = coordinator.status(execution_id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Commands::Kill { execution_id } => {
            let view = coordinator.kill(execution_id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Commands::NextRun { task_id } => {
            let view = coordinator.next_run(task_id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Commands::Settings(SettingsCommand::Set { key, value }) => {
            set_setting(&db, &key, &value).await
        }
        Commands::Executions(ExecutionsCommand::Cleanup {
            older_than_hours,
            dry_run,
        }) => cleanup_executions(&coordinator, older_than_hours, dry_run).await,
        Commands::Locks(LocksCommand::Clear) => {
            let cleared = coordinator.clear_locks().await?;
            println!("Deleted {} lock(s)", cleared);
            Ok(())
        }
    };

    db.close().await;
    result
}

async fn run_daemon(coordinator: &Coordinator) -> anyhow::Result<()> {
    let leader = LeaderLock::try_acquire(&coordinator.config().leader_lock_path)?;
    coordinator.start(leader)?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    coordinator.shutdown().await?;

    let stats = coordinator.pool_stats();
    info!(
        completed = stats.scans_completed,
        failed = stats.scans_failed,
        skipped = stats.scans_skipped,
        "Worker pool summary"
    );
    info!(metrics = %crate::metrics::export_metrics(), "Final metrics snapshot");
    Ok(())
}

async fn import_tasks(coordinator: &Coordinator, file: &Path) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", file.display(), e))?;
    let definitions = parse_task_file(&contents)?;

    let mut failed = 0usize;
    for definition in &definitions {
        let task = match coordinator.install_task(definition).await {
            Ok((task, _)) => task,
            Err(e) => {
                failed += 1;
                warn!(name = %definition.name, error = %e, "Task import failed");
                println!("-\t{}\timport error: {}", definition.name, e);
                continue;
            }
        };
        match coordinator.next_run(task.id).await {
            Ok(view) => println!(
                "{}\t{}\t{}\tnext: {}",
                task.id,
                task.name,
                view.description,
                view.next_run_local.as_deref().unwrap_or("never")
            ),
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Imported task has no computable schedule");
                println!("{}\t{}\tschedule error: {}", task.id, task.name, e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} task definitions failed to import", failed, definitions.len());
    }
    Ok(())
}

async fn cleanup_executions(
    coordinator: &Coordinator,
    older_than_hours: u32,
    dry_run: bool,
) -> anyhow::Result<()> {
    let older_than = Duration::from_secs(u64::from(older_than_hours) * 3600);
    let report = coordinator.cleanup_stuck(older_than, dry_run).await?;

    if report.candidates.is_empty() {
        println!("No executions stuck for more than {} hours", older_than_hours);
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&report.candidates)?);
    if dry_run {
        println!("Dry run: would fail {} execution(s)", report.candidates.len());
    } else {
        println!("Failed {} execution(s)", report.cleaned);
    }
    Ok(())
}

fn parse_task_file(contents: &str) -> anyhow::Result<Vec<TaskDefinition>> {
    // JSON documents are valid YAML, so one parser covers both formats.
    let parsed: TaskFile = serde_yaml::from_str(contents)?;
    Ok(match parsed {
        TaskFile::Many(definitions) => definitions,
        TaskFile::One(definition) => vec![definition],
    })
}

async fn list_tasks(coordinator: &Coordinator) -> anyhow::Result<()> {
    for task in coordinator.list_tasks().await? {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            task.id,
            task.name,
            if task.enabled { "enabled" } else { "disabled" },
            task.timezone,
            task.recurrence.describe()
        );
    }
    Ok(())
}

async fn trigger_task(coordinator: &Coordinator, task_id: i64) -> anyhow::Result<()> {
    match coordinator.trigger(task_id).await? {
        Some(execution) => println!("Queued execution {}", execution.id),
        None => println!("Task {} is disabled or already has an active execution", task_id),
    }
    Ok(())
}

async fn set_setting(db: &Database, key: &str, value: &str) -> anyhow::Result<()> {
    match key {
        settings_keys::MAX_CONCURRENT_TASKS | settings_keys::MAX_REPORTS_PER_TASK => {
            let parsed: u32 = value
                .parse()
                .map_err(|_| anyhow::anyhow!("{} must be a positive integer", key))?;
            if parsed == 0 {
                anyhow::bail!("{} must be a positive integer", key);
            }
        }
        other => anyhow::bail!("Unknown setting '{}'", other),
    }
    db.set_setting(key, value).await?;
    println!("{} = {}", key, value);
    Ok(())
}
