//! Scan task definitions and their durable trigger jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;
use crate::schedule::{parse_timezone, Recurrence};

/// A user-defined recurring or one-off scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub recurrence: Recurrence,
    /// IANA timezone name the recurrence is expressed in.
    pub timezone: String,
    pub enabled: bool,
    /// Named scan profile, resolved to arguments by the dispatcher.
    pub profile: Option<String>,
    /// Custom arguments; take precedence over the profile.
    pub custom_args: Option<String>,
    pub targets: Vec<String>,
    /// Per-task retention override. `None` uses the global setting.
    pub max_reports: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// An enabled task must carry a range-valid recurrence and a known timezone.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if !self.enabled {
            return Ok(());
        }
        self.recurrence.validate()?;
        parse_timezone(&self.timezone)?;
        Ok(())
    }

    /// The trigger job derived from this task's schedule.
    pub fn trigger_job(&self, next_fire_at: Option<DateTime<Utc>>) -> TriggerJob {
        TriggerJob {
            task_id: self.id,
            recurrence: self.recurrence.clone(),
            timezone: self.timezone.clone(),
            next_fire_at,
        }
    }
}

/// Task fields as supplied by an importer. `id` selects the task to update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    pub recurrence: Recurrence,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub custom_args: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub max_reports: Option<u32>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

/// What to scan and how, as resolved for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    pub profile: Option<String>,
    pub custom_args: Option<String>,
    pub targets: Vec<String>,
    pub max_reports: Option<u32>,
}

/// Durable trigger state for one task.
///
/// `next_fire_at` is `None` once a one-time schedule has fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerJob {
    pub task_id: i64,
    pub recurrence: Recurrence,
    pub timezone: String,
    pub next_fire_at: Option<DateTime<Utc>>,
}

impl TriggerJob {
    /// True when the job describes the same schedule as `task`.
    pub fn matches(&self, task: &Task) -> bool {
        self.recurrence == task.recurrence && self.timezone == task.timezone
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_defaults() {
        let def: TaskDefinition = serde_json::from_str(
            r#"{"name":"nightly","recurrence":{"kind":"daily","hour":2,"minute":0}}"#,
        )
        .unwrap();
        assert_eq!(def.timezone, "UTC");
        assert!(def.enabled);
        assert!(def.targets.is_empty());
        assert!(def.id.is_none());
    }

    #[test]
    fn test_disabled_task_skips_validation() {
        let task = Task {
            id: 1,
            name: "broken".into(),
            recurrence: Recurrence::Daily {
                hour: 99,
                minute: 0,
            },
            timezone: "Nowhere/Land".into(),
            enabled: false,
            profile: None,
            custom_args: None,
            targets: vec![],
            max_reports: None,
            created_at: Utc::now(),
        };
        assert!(task.validate().is_ok());

        let enabled = Task {
            enabled: true,
            ..task
        };
        assert!(enabled.validate().is_err());
    }
}
