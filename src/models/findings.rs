//! Parsed scan results and persisted report rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run-level metadata from the machine-readable output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scanner: String,
    pub args: String,
    pub start: String,
    pub startstr: String,
    pub version: String,
    pub xmloutputversion: String,
    pub hosts_total: u32,
    pub hosts_up: u32,
    pub hosts_down: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortResult {
    pub number: u16,
    pub protocol: String,
    pub state: String,
    /// Detected service name, `unknown` when undetected.
    pub service: String,
    /// Product, version and extra info joined by spaces.
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResult {
    pub address: String,
    pub hostname: Option<String>,
    /// `up`, `down` or `unknown`.
    pub status: String,
    pub os_guesses: Vec<String>,
    pub ports: Vec<PortResult>,
}

impl HostResult {
    pub fn is_up(&self) -> bool {
        self.status == "up"
    }
}

/// Everything the coordinator keeps from one finished scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResults {
    pub summary: ScanSummary,
    pub hosts: Vec<HostResult>,
}

impl ScanResults {
    pub fn open_port_count(&self) -> usize {
        self.hosts
            .iter()
            .flat_map(|h| h.ports.iter())
            .filter(|p| p.state == "open")
            .count()
    }
}

/// A stored report row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub id: i64,
    pub execution_id: i64,
    pub task_id: i64,
    pub summary: ScanSummary,
    pub xml_report_path: Option<String>,
    pub normal_report_path: Option<String>,
    pub created_at: DateTime<Utc>,
}
