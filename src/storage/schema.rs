//! Database schema constants.
//!
//! Each constant holds exactly one SQLite statement; the migration runner
//! applies them in order and records each by name.

/// Task definitions owned by the task management layer.
pub const CREATE_SCAN_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS scan_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    recurrence TEXT NOT NULL,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    enabled INTEGER NOT NULL DEFAULT 1,
    profile TEXT,
    custom_args TEXT,
    targets TEXT NOT NULL DEFAULT '[]',
    max_reports INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// Execution records.
pub const CREATE_EXECUTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES scan_tasks(id) ON DELETE CASCADE,
    status TEXT NOT NULL CHECK (status IN ('queued', 'starting', 'running', 'completed', 'failed')),
    progress INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    priority_timestamp TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    external_pid INTEGER,
    error_message TEXT,
    xml_output_path TEXT,
    normal_output_path TEXT
)
"#;

/// At most one queued/starting/running execution per task.
pub const CREATE_ONE_ACTIVE_EXECUTION_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_one_active
    ON executions(task_id)
    WHERE status IN ('queued', 'starting', 'running')
"#;

pub const CREATE_EXECUTIONS_ADMISSION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_executions_status_priority
    ON executions(status, priority_timestamp, id)
"#;

pub const CREATE_EXECUTIONS_TASK_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_executions_task_created
    ON executions(task_id, created_at)
"#;

/// Mutual-exclusion rows. A row's existence means the lock is held.
pub const CREATE_TASK_LOCKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS task_locks (
    lock_key TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
)
"#;

/// Durable trigger state, one row per scheduled task.
pub const CREATE_TRIGGER_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS trigger_jobs (
    task_id INTEGER PRIMARY KEY,
    recurrence TEXT NOT NULL,
    timezone TEXT NOT NULL,
    next_fire_at TEXT,
    updated_at TEXT NOT NULL
)
"#;

pub const CREATE_SETTINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

pub const CREATE_SCAN_REPORTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS scan_reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id INTEGER NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
    task_id INTEGER NOT NULL,
    summary TEXT NOT NULL,
    xml_report_path TEXT,
    normal_report_path TEXT,
    created_at TEXT NOT NULL
)
"#;

pub const CREATE_HOST_FINDINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS host_findings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    report_id INTEGER NOT NULL REFERENCES scan_reports(id) ON DELETE CASCADE,
    ip_address TEXT NOT NULL,
    hostname TEXT,
    status TEXT NOT NULL,
    os_info TEXT
)
"#;

pub const CREATE_PORT_FINDINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS port_findings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL REFERENCES host_findings(id) ON DELETE CASCADE,
    port_number INTEGER NOT NULL,
    protocol TEXT NOT NULL,
    state TEXT NOT NULL,
    service TEXT,
    version TEXT
)
"#;

pub const CREATE_REPORTS_TASK_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_scan_reports_task
    ON scan_reports(task_id, created_at)
"#;

/// Returns all schema statements in the order they should be executed.
pub fn all_schema_statements() -> Vec<(&'static str, &'static str)> {
    vec![
        ("001_scan_tasks", CREATE_SCAN_TASKS_TABLE),
        ("002_executions", CREATE_EXECUTIONS_TABLE),
        ("003_executions_one_active", CREATE_ONE_ACTIVE_EXECUTION_INDEX),
        ("004_executions_admission", CREATE_EXECUTIONS_ADMISSION_INDEX),
        ("005_executions_task", CREATE_EXECUTIONS_TASK_INDEX),
        ("006_task_locks", CREATE_TASK_LOCKS_TABLE),
        ("007_trigger_jobs", CREATE_TRIGGER_JOBS_TABLE),
        ("008_settings", CREATE_SETTINGS_TABLE),
        ("009_scan_reports", CREATE_SCAN_REPORTS_TABLE),
        ("010_host_findings", CREATE_HOST_FINDINGS_TABLE),
        ("011_port_findings", CREATE_PORT_FINDINGS_TABLE),
        ("012_scan_reports_task", CREATE_REPORTS_TASK_INDEX),
    ]
}
