//! Declarative recurrence definitions attached to scan tasks.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// Names used when rendering weekly schedules. Index 0 is Monday.
const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

/// When a task fires.
///
/// Calendar kinds are expressed in the owner's local time and converted to
/// UTC with the task's timezone. `OneTime` holds a naive local wall-clock
/// instant that is localized exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    Daily {
        hour: u32,
        minute: u32,
    },
    Weekly {
        /// 0 = Monday ... 6 = Sunday.
        day_of_week: u32,
        hour: u32,
        minute: u32,
    },
    Monthly {
        /// Days past the end of a short month clamp to its last day.
        day: u32,
        hour: u32,
        minute: u32,
    },
    Interval {
        hours: u32,
    },
    OneTime {
        at: NaiveDateTime,
    },
}

impl Recurrence {
    /// Short lowercase name of the recurrence kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Recurrence::Daily { .. } => "daily",
            Recurrence::Weekly { .. } => "weekly",
            Recurrence::Monthly { .. } => "monthly",
            Recurrence::Interval { .. } => "interval",
            Recurrence::OneTime { .. } => "one_time",
        }
    }

    /// Returns true for kinds computed from a calendar anchor.
    pub fn is_calendar(&self) -> bool {
        matches!(
            self,
            Recurrence::Daily { .. } | Recurrence::Weekly { .. } | Recurrence::Monthly { .. }
        )
    }

    /// Checks that every field is within range.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match *self {
            Recurrence::Daily { hour, minute } => check_time(hour, minute),
            Recurrence::Weekly {
                day_of_week,
                hour,
                minute,
            } => {
                check_field("day_of_week", day_of_week, 0, 6)?;
                check_time(hour, minute)
            }
            Recurrence::Monthly { day, hour, minute } => {
                check_field("day", day, 1, 31)?;
                check_time(hour, minute)
            }
            Recurrence::Interval { hours } => check_field("hours", hours, 1, 24 * 366),
            Recurrence::OneTime { .. } => Ok(()),
        }
    }

    /// Human-readable description, e.g. "Weekly on Monday at 08:00".
    pub fn describe(&self) -> String {
        match *self {
            Recurrence::Daily { hour, minute } => format!("Daily at {:02}:{:02}", hour, minute),
            Recurrence::Weekly {
                day_of_week,
                hour,
                minute,
            } => {
                let day = WEEKDAY_NAMES
                    .get(day_of_week as usize)
                    .copied()
                    .unwrap_or("?");
                format!("Weekly on {} at {:02}:{:02}", day, hour, minute)
            }
            Recurrence::Monthly { day, hour, minute } => format!(
                "Monthly on the {} at {:02}:{:02}",
                ordinal(day),
                hour,
                minute
            ),
            Recurrence::Interval { hours: 1 } => "Every hour".to_string(),
            Recurrence::Interval { hours } => format!("Every {} hours", hours),
            Recurrence::OneTime { at } => format!("Once at {}", at.format("%Y-%m-%d %H:%M")),
        }
    }
}

fn check_time(hour: u32, minute: u32) -> Result<(), ScheduleError> {
    check_field("hour", hour, 0, 23)?;
    check_field("minute", minute, 0, 59)
}

fn check_field(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), ScheduleError> {
    if value < min || value > max {
        return Err(ScheduleError::InvalidField {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}
