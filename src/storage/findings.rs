//! Scan report persistence and retention trimming.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{info, warn};

use super::database::{Database, StorageError};
use crate::models::{HostResult, PortResult, ReportRecord, ScanResults};
use crate::ports::FindingsSink;

impl Database {
    /// Reports of a task, newest first.
    pub async fn list_reports(&self, task_id: i64) -> Result<Vec<ReportRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, execution_id, task_id, summary, xml_report_path, normal_report_path, \
             created_at FROM scan_reports WHERE task_id = ?1 \
             ORDER BY created_at DESC, id DESC",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(report_from_row).collect()
    }

    /// Hosts and ports stored for a report.
    pub async fn report_hosts(&self, report_id: i64) -> Result<Vec<HostResult>, StorageError> {
        let hosts = sqlx::query(
            "SELECT id, ip_address, hostname, status, os_info FROM host_findings \
             WHERE report_id = ?1 ORDER BY id",
        )
        .bind(report_id)
        .fetch_all(self.pool())
        .await?;

        let mut results = Vec::with_capacity(hosts.len());
        for host in hosts {
            let host_id: i64 = host.try_get("id")?;
            let os_info: Option<String> = host.try_get("os_info")?;
            let ports = sqlx::query(
                "SELECT port_number, protocol, state, service, version FROM port_findings \
                 WHERE host_id = ?1 ORDER BY port_number",
            )
            .bind(host_id)
            .fetch_all(self.pool())
            .await?;

            results.push(HostResult {
                address: host.try_get("ip_address")?,
                hostname: host.try_get("hostname")?,
                status: host.try_get("status")?,
                os_guesses: match os_info {
                    Some(json) => serde_json::from_str(&json)?,
                    None => Vec::new(),
                },
                ports: ports.iter().map(port_from_row).collect::<Result<_, _>>()?,
            });
        }
        Ok(results)
    }
}

#[async_trait]
impl FindingsSink for Database {
    async fn record_results(
        &self,
        execution_id: i64,
        task_id: i64,
        results: &ScanResults,
        xml_path: &str,
        normal_path: &str,
    ) -> Result<i64, StorageError> {
        let summary = serde_json::to_string(&results.summary)?;
        let mut tx = self.pool().begin().await?;

        let report_id = sqlx::query(
            "INSERT INTO scan_reports (execution_id, task_id, summary, xml_report_path, \
             normal_report_path, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(execution_id)
        .bind(task_id)
        .bind(&summary)
        .bind(xml_path)
        .bind(normal_path)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for host in &results.hosts {
            let os_info = if host.os_guesses.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&host.os_guesses)?)
            };
            let host_id = sqlx::query(
                "INSERT INTO host_findings (report_id, ip_address, hostname, status, os_info) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(report_id)
            .bind(&host.address)
            .bind(&host.hostname)
            .bind(&host.status)
            .bind(os_info)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            for port in &host.ports {
                sqlx::query(
                    "INSERT INTO port_findings (host_id, port_number, protocol, state, service, \
                     version) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .bind(host_id)
                .bind(i64::from(port.number))
                .bind(&port.protocol)
                .bind(&port.state)
                .bind(&port.service)
                .bind(&port.version)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(report_id)
    }

    async fn trim_reports(&self, task_id: i64, keep: u32) -> Result<usize, StorageError> {
        let reports = self.list_reports(task_id).await?;
        let stale: Vec<&ReportRecord> = reports.iter().skip(keep as usize).collect();
        if stale.is_empty() {
            return Ok(0);
        }

        for report in &stale {
            sqlx::query("DELETE FROM scan_reports WHERE id = ?1")
                .bind(report.id)
                .execute(self.pool())
                .await?;

            for path in [&report.xml_report_path, &report.normal_report_path]
                .into_iter()
                .flatten()
            {
                remove_report_file(path).await;
            }
        }

        info!(
            task_id,
            removed = stale.len(),
            keep,
            "Trimmed old scan reports"
        );
        Ok(stale.len())
    }
}

async fn remove_report_file(path: &str) {
    if !Path::new(path).exists() {
        return;
    }
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path, error = %e, "Failed to delete report file");
    }
}

fn report_from_row(row: &SqliteRow) -> Result<ReportRecord, StorageError> {
    let summary: String = row.try_get("summary")?;
    Ok(ReportRecord {
        id: row.try_get("id")?,
        execution_id: row.try_get("execution_id")?,
        task_id: row.try_get("task_id")?,
        summary: serde_json::from_str(&summary)?,
        xml_report_path: row.try_get("xml_report_path")?,
        normal_report_path: row.try_get("normal_report_path")?,
        created_at: row.try_get("created_at")?,
    })
}

fn port_from_row(row: &SqliteRow) -> Result<PortResult, StorageError> {
    let number: i64 = row.try_get("port_number")?;
    let service: Option<String> = row.try_get("service")?;
    Ok(PortResult {
        number: u16::try_from(number)
            .map_err(|_| StorageError::InvalidData(format!("port number {}", number)))?,
        protocol: row.try_get("protocol")?,
        state: row.try_get("state")?,
        service: service.unwrap_or_default(),
        version: row.try_get("version")?,
    })
}
