//! Coordinator configuration.
//!
//! Values come from built-in defaults, optionally overlaid by a YAML file,
//! then by `SCAN_COORDINATOR_*` environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Configuration for the scan coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// SQLite connection string.
    pub database_url: String,
    /// File used to elect the single dispatching process.
    pub leader_lock_path: PathBuf,
    /// Directory receiving scan output files.
    pub reports_dir: PathBuf,
    /// Scan binary, resolved through `PATH` when not absolute.
    pub scan_binary: String,
    /// Command prefixed to scans that need elevated privileges. `None` disables elevation.
    pub privilege_wrapper: Option<String>,
    /// Number of dispatcher workers, and the hard cap on concurrent scans.
    pub pool_size: usize,
    /// How often due trigger jobs are checked.
    #[serde(with = "duration_secs")]
    pub trigger_tick: Duration,
    /// How often trigger jobs are re-derived from task definitions.
    #[serde(with = "duration_secs")]
    pub reconcile_interval: Duration,
    #[serde(with = "duration_secs")]
    pub audit_interval: Duration,
    #[serde(with = "duration_secs")]
    pub admission_interval: Duration,
    #[serde(with = "duration_secs")]
    pub reaper_interval: Duration,
    /// How late an execution may be before the auditor calls the run missed.
    #[serde(with = "duration_secs")]
    pub missed_run_grace: Duration,
    /// Executions younger than this are never reaped.
    #[serde(with = "duration_secs")]
    pub zombie_warmup: Duration,
    /// How long a running execution may go without a recorded pid.
    #[serde(with = "duration_secs")]
    pub zombie_no_pid_grace: Duration,
    /// Delay between SIGTERM and SIGKILL on kill.
    #[serde(with = "duration_secs")]
    pub kill_grace: Duration,
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
    /// Stored error messages are truncated to this many characters.
    pub max_error_len: usize,
    /// Lines of scan output kept for error reporting.
    pub output_tail_lines: usize,
    /// Value passed to `--stats-every`.
    pub stats_every: String,
    /// Arguments used when a task names no profile and no custom arguments.
    pub default_scan_args: String,
    /// Named argument sets a task can refer to.
    pub scan_profiles: BTreeMap<String, String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://scan-coordinator.db".to_string(),
            leader_lock_path: PathBuf::from("./scan-coordinator.lock"),
            reports_dir: PathBuf::from("./reports"),
            scan_binary: "nmap".to_string(),
            privilege_wrapper: Some("sudo".to_string()),
            pool_size: 2,
            trigger_tick: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(60),
            audit_interval: Duration::from_secs(20),
            admission_interval: Duration::from_secs(10),
            reaper_interval: Duration::from_secs(60),
            missed_run_grace: Duration::from_secs(3600),
            zombie_warmup: Duration::from_secs(60),
            zombie_no_pid_grace: Duration::from_secs(120),
            kill_grace: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            max_error_len: 1023,
            output_tail_lines: 10,
            stats_every: "5s".to_string(),
            default_scan_args: "-T4 -F".to_string(),
            scan_profiles: default_scan_profiles(),
        }
    }
}

fn default_scan_profiles() -> BTreeMap<String, String> {
    [
        ("quick_scan", "-T4 -F"),
        ("intense_scan", "-T4 -A -v"),
        ("intense_scan_Pn", "-T4 -A -v -Pn"),
        ("ping_scan", "-sn"),
        ("port_scan", "-p 1-1000"),
        ("service_scan", "-sV"),
        ("os_detection", "-O"),
        ("comprehensive", "-T4 -A -v -p- -Pn"),
    ]
    .into_iter()
    .map(|(name, args)| (name.to_string(), args.to_string()))
    .collect()
}

impl CoordinatorConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads defaults, then the optional YAML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        let config = config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Creates configuration from environment variables over the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: SQLite connection string
    /// - `SCAN_COORDINATOR_LEADER_LOCK`: leader lock file path
    /// - `SCAN_COORDINATOR_REPORTS_DIR`: scan output directory
    /// - `SCAN_COORDINATOR_SCAN_BINARY`: scan binary (default: nmap)
    /// - `SCAN_COORDINATOR_PRIVILEGE_WRAPPER`: elevation command, empty to disable
    /// - `SCAN_COORDINATOR_POOL_SIZE`: dispatcher workers (default: 2)
    /// - `SCAN_COORDINATOR_AUDIT_INTERVAL_SECS`: missed-run sweep interval (default: 20)
    /// - `SCAN_COORDINATOR_ADMISSION_INTERVAL_SECS`: admission sweep interval (default: 10)
    /// - `SCAN_COORDINATOR_REAPER_INTERVAL_SECS`: zombie sweep interval (default: 60)
    /// - `SCAN_COORDINATOR_MISSED_RUN_GRACE_SECS`: missed-run grace (default: 3600)
    /// - `SCAN_COORDINATOR_KILL_GRACE_SECS`: SIGTERM to SIGKILL delay (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.database_url = val;
        }

        if let Ok(val) = std::env::var("SCAN_COORDINATOR_LEADER_LOCK") {
            self.leader_lock_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("SCAN_COORDINATOR_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("SCAN_COORDINATOR_SCAN_BINARY") {
            self.scan_binary = val;
        }

        if let Ok(val) = std::env::var("SCAN_COORDINATOR_PRIVILEGE_WRAPPER") {
            self.privilege_wrapper = if val.trim().is_empty() {
                None
            } else {
                Some(val)
            };
        }

        if let Ok(val) = std::env::var("SCAN_COORDINATOR_POOL_SIZE") {
            self.pool_size = parse_env_value(&val, "SCAN_COORDINATOR_POOL_SIZE")?;
        }

        let durations = [
            (
                "SCAN_COORDINATOR_AUDIT_INTERVAL_SECS",
                &mut self.audit_interval,
            ),
            (
                "SCAN_COORDINATOR_ADMISSION_INTERVAL_SECS",
                &mut self.admission_interval,
            ),
            (
                "SCAN_COORDINATOR_REAPER_INTERVAL_SECS",
                &mut self.reaper_interval,
            ),
            (
                "SCAN_COORDINATOR_MISSED_RUN_GRACE_SECS",
                &mut self.missed_run_grace,
            ),
            ("SCAN_COORDINATOR_KILL_GRACE_SECS", &mut self.kill_grace),
        ];
        for (key, target) in durations {
            if let Ok(val) = std::env::var(key) {
                let secs: u64 = parse_env_value(&val, key)?;
                *target = Duration::from_secs(secs);
            }
        }

        Ok(self)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.scan_binary.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "scan_binary cannot be empty".to_string(),
            ));
        }

        if self.pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool_size must be greater than 0".to_string(),
            ));
        }

        let intervals = [
            ("trigger_tick", self.trigger_tick),
            ("reconcile_interval", self.reconcile_interval),
            ("audit_interval", self.audit_interval),
            ("admission_interval", self.admission_interval),
            ("reaper_interval", self.reaper_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.max_error_len == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_error_len must be greater than 0".to_string(),
            ));
        }

        if self.output_tail_lines < 5 {
            return Err(ConfigError::ValidationFailed(
                "output_tail_lines must be at least 5".to_string(),
            ));
        }

        Ok(())
    }

    /// Arguments for a task: custom arguments win, then the named profile,
    /// then the default.
    pub fn scan_arguments(&self, profile: Option<&str>, custom_args: Option<&str>) -> String {
        if let Some(custom) = custom_args.map(str::trim).filter(|s| !s.is_empty()) {
            return custom.to_string();
        }
        profile
            .and_then(|name| self.scan_profiles.get(name))
            .cloned()
            .unwrap_or_else(|| self.default_scan_args.clone())
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the leader lock path.
    pub fn with_leader_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.leader_lock_path = path.into();
        self
    }

    /// Builder method to set the reports directory.
    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = dir.into();
        self
    }

    /// Builder method to set the scan binary.
    pub fn with_scan_binary(mut self, binary: impl Into<String>) -> Self {
        self.scan_binary = binary.into();
        self
    }

    /// Builder method to set or disable the privilege wrapper.
    pub fn with_privilege_wrapper(mut self, wrapper: Option<String>) -> Self {
        self.privilege_wrapper = wrapper;
        self
    }

    /// Builder method to set the worker pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Builder method to set the missed-run grace window.
    pub fn with_missed_run_grace(mut self, grace: Duration) -> Self {
        self.missed_run_grace = grace;
        self
    }

    /// Builder method to set the zombie warm-up and no-pid grace.
    pub fn with_zombie_windows(mut self, warmup: Duration, no_pid_grace: Duration) -> Self {
        self.zombie_warmup = warmup;
        self.zombie_no_pid_grace = no_pid_grace;
        self
    }

    /// Builder method to set the kill grace period.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Serializes durations as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
