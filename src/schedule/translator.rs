//! Conversion of recurrence definitions into concrete UTC fire instants.
//!
//! All functions here are pure: the same recurrence, timezone and reference
//! instant always produce the same result.

use chrono::{
    DateTime, Datelike, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone,
    Utc,
};
use chrono_tz::Tz;

use super::recurrence::Recurrence;
use crate::error::ScheduleError;

/// Which fire instant to compute relative to `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireMode {
    /// First fire strictly after `now`.
    Next,
    /// Latest fire at or before `now`.
    MostRecent,
}

/// Parses an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}

/// Next fire instant strictly after `now`.
///
/// Returns `Ok(None)` once a one-time schedule has passed.
pub fn next_fire(
    recurrence: &Recurrence,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    fire_instant(recurrence, timezone, now, FireMode::Next)
}

/// Most recent fire instant at or before `now`.
///
/// Interval schedules have no calendar anchor and return
/// [`ScheduleError::NoCalendarAnchor`].
pub fn most_recent_fire(
    recurrence: &Recurrence,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    fire_instant(recurrence, timezone, now, FireMode::MostRecent)
}

/// Computes a fire instant in the given mode.
pub fn fire_instant(
    recurrence: &Recurrence,
    timezone: &str,
    now: DateTime<Utc>,
    mode: FireMode,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    recurrence.validate()?;
    let tz = parse_timezone(timezone)?;

    match (recurrence, mode) {
        (Recurrence::Interval { hours }, FireMode::Next) => now
            .checked_add_signed(TimeDelta::hours(i64::from(*hours)))
            .map(Some)
            .ok_or(ScheduleError::OutOfRange),
        (Recurrence::Interval { .. }, FireMode::MostRecent) => Err(ScheduleError::NoCalendarAnchor),
        (Recurrence::OneTime { at }, _) => {
            let instant = localize(tz, *at)?;
            let reached = match mode {
                FireMode::Next => instant > now,
                FireMode::MostRecent => instant <= now,
            };
            Ok(reached.then_some(instant))
        }
        _ => calendar_fire(recurrence, tz, now, mode).map(Some),
    }
}

fn calendar_fire(
    recurrence: &Recurrence,
    tz: Tz,
    now: DateTime<Utc>,
    mode: FireMode,
) -> Result<DateTime<Utc>, ScheduleError> {
    let local_now = now.with_timezone(&tz).naive_local();
    let today = local_now.date();
    let time = time_of_day(recurrence)?;

    // The day is chosen on wall-clock time; only the chosen candidate is
    // mapped to UTC, so a gap or fold on a neighbouring day is never touched.
    let anchor = period_date(recurrence, today, 0)?.and_time(time);
    let step = match mode {
        FireMode::Next if anchor <= local_now => 1,
        FireMode::MostRecent if anchor > local_now => -1,
        _ => 0,
    };

    let chosen = period_date(recurrence, today, step)?;
    localize(tz, chosen.and_time(time))
}

/// Date of the occurrence `offset` periods away from the period containing `today`.
fn period_date(
    recurrence: &Recurrence,
    today: NaiveDate,
    offset: i32,
) -> Result<NaiveDate, ScheduleError> {
    let date = match *recurrence {
        Recurrence::Daily { .. } => {
            today.checked_add_signed(TimeDelta::days(i64::from(offset)))
        }
        Recurrence::Weekly { day_of_week, .. } => {
            let current = i64::from(today.weekday().num_days_from_monday());
            let delta = i64::from(day_of_week) - current + 7 * i64::from(offset);
            today.checked_add_signed(TimeDelta::days(delta))
        }
        Recurrence::Monthly { day, .. } => shift_month(today, offset, day),
        Recurrence::Interval { .. } | Recurrence::OneTime { .. } => None,
    };
    date.ok_or(ScheduleError::OutOfRange)
}

fn time_of_day(recurrence: &Recurrence) -> Result<NaiveTime, ScheduleError> {
    let (hour, minute) = match *recurrence {
        Recurrence::Daily { hour, minute }
        | Recurrence::Weekly { hour, minute, .. }
        | Recurrence::Monthly { hour, minute, .. } => (hour, minute),
        Recurrence::Interval { .. } | Recurrence::OneTime { .. } => {
            return Err(ScheduleError::NoCalendarAnchor)
        }
    };
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or(ScheduleError::OutOfRange)
}

/// Moves `date` by `months` and pins it to `day`, clamped to the month length.
fn shift_month(date: NaiveDate, months: i32, day: u32) -> Option<NaiveDate> {
    let total = date.year() * 12 + date.month0() as i32 + months;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    let last = last_day_of_month(year, month)?;
    NaiveDate::from_ymd_opt(year, month, day.min(last))
}

fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|d| d.day())
}

fn localize(tz: Tz, local: NaiveDateTime) -> Result<DateTime<Utc>, ScheduleError> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(_, _) => Err(ScheduleError::AmbiguousLocalTime {
            local,
            timezone: tz.name().to_string(),
        }),
        LocalResult::None => Err(ScheduleError::NonexistentLocalTime {
            local,
            timezone: tz.name().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_daily_most_recent_steps_back_a_day() {
        // 10:00 local in UTC+5 is 05:00 UTC; today's 23:30 local has not happened yet.
        let rec = Recurrence::Daily {
            hour: 23,
            minute: 30,
        };
        let now = utc(2026, 6, 10, 5, 0);
        let expected = most_recent_fire(&rec, "Asia/Karachi", now).unwrap();
        assert_eq!(expected, Some(utc(2026, 6, 9, 18, 30)));
    }

    #[test]
    fn test_daily_next_is_strictly_after_now() {
        let rec = Recurrence::Daily { hour: 9, minute: 0 };
        let now = utc(2026, 6, 10, 9, 0);
        let next = next_fire(&rec, "UTC", now).unwrap();
        assert_eq!(next, Some(utc(2026, 6, 11, 9, 0)));

        let earlier = utc(2026, 6, 10, 8, 59);
        assert_eq!(next_fire(&rec, "UTC", earlier).unwrap(), Some(now));
    }

    #[test]
    fn test_translator_is_idempotent() {
        let rec = Recurrence::Weekly {
            day_of_week: 4,
            hour: 7,
            minute: 45,
        };
        let now = utc(2026, 2, 3, 12, 0);
        let first = next_fire(&rec, "Europe/Berlin", now).unwrap();
        let second = next_fire(&rec, "Europe/Berlin", now).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_weekly_next_and_most_recent() {
        // 2026-06-10 is a Wednesday.
        let rec = Recurrence::Weekly {
            day_of_week: 0,
            hour: 8,
            minute: 0,
        };
        let now = utc(2026, 6, 10, 12, 0);
        assert_eq!(
            next_fire(&rec, "UTC", now).unwrap(),
            Some(utc(2026, 6, 15, 8, 0))
        );
        assert_eq!(
            most_recent_fire(&rec, "UTC", now).unwrap(),
            Some(utc(2026, 6, 8, 8, 0))
        );

        let friday = Recurrence::Weekly {
            day_of_week: 4,
            hour: 8,
            minute: 0,
        };
        assert_eq!(
            next_fire(&friday, "UTC", now).unwrap(),
            Some(utc(2026, 6, 12, 8, 0))
        );
        assert_eq!(
            most_recent_fire(&friday, "UTC", now).unwrap(),
            Some(utc(2026, 6, 5, 8, 0))
        );
    }

    #[test]
    fn test_monthly_clamps_to_short_month() {
        let rec = Recurrence::Monthly {
            day: 31,
            hour: 12,
            minute: 0,
        };
        // June has 30 days.
        let now = utc(2026, 6, 10, 0, 0);
        assert_eq!(
            next_fire(&rec, "UTC", now).unwrap(),
            Some(utc(2026, 6, 30, 12, 0))
        );

        let feb = utc(2026, 2, 1, 0, 0);
        assert_eq!(
            next_fire(&rec, "UTC", feb).unwrap(),
            Some(utc(2026, 2, 28, 12, 0))
        );
    }

    #[test]
    fn test_monthly_steps_across_year_boundary() {
        let rec = Recurrence::Monthly {
            day: 15,
            hour: 6,
            minute: 0,
        };
        let now = utc(2026, 12, 20, 0, 0);
        assert_eq!(
            next_fire(&rec, "UTC", now).unwrap(),
            Some(utc(2027, 1, 15, 6, 0))
        );
        let january = utc(2027, 1, 10, 0, 0);
        assert_eq!(
            most_recent_fire(&rec, "UTC", january).unwrap(),
            Some(utc(2026, 12, 15, 6, 0))
        );
    }

    #[test]
    fn test_interval_next_and_missing_anchor() {
        let rec = Recurrence::Interval { hours: 6 };
        let now = utc(2026, 6, 10, 1, 0);
        assert_eq!(
            next_fire(&rec, "UTC", now).unwrap(),
            Some(utc(2026, 6, 10, 7, 0))
        );
        assert_eq!(
            most_recent_fire(&rec, "UTC", now),
            Err(ScheduleError::NoCalendarAnchor)
        );
    }

    #[test]
    fn test_one_time_exhausts() {
        let at = NaiveDate::from_ymd_opt(2026, 6, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let rec = Recurrence::OneTime { at };
        let before = utc(2026, 6, 10, 9, 0);
        let after = utc(2026, 6, 11, 0, 0);

        // America/New_York is UTC-4 in June.
        assert_eq!(
            next_fire(&rec, "America/New_York", before).unwrap(),
            Some(utc(2026, 6, 10, 16, 0))
        );
        assert_eq!(next_fire(&rec, "America/New_York", after).unwrap(), None);
        assert_eq!(
            most_recent_fire(&rec, "America/New_York", after).unwrap(),
            Some(utc(2026, 6, 10, 16, 0))
        );
        assert_eq!(most_recent_fire(&rec, "America/New_York", before).unwrap(), None);
    }

    #[test]
    fn test_nonexistent_local_time_is_rejected() {
        // Clocks jump from 02:00 to 03:00 in New York on 2026-03-08.
        let rec = Recurrence::Daily {
            hour: 2,
            minute: 30,
        };
        let now = utc(2026, 3, 8, 5, 0);
        let err = next_fire(&rec, "America/New_York", now).unwrap_err();
        assert!(matches!(err, ScheduleError::NonexistentLocalTime { .. }));
    }

    #[test]
    fn test_changeover_day_does_not_block_neighbouring_days() {
        // 02:30 does not exist in New York on 2026-03-08, but by noon UTC it
        // is long past and the next run is the following night.
        let rec = Recurrence::Daily {
            hour: 2,
            minute: 30,
        };
        let now = utc(2026, 3, 8, 12, 0);
        assert_eq!(
            next_fire(&rec, "America/New_York", now).unwrap(),
            Some(utc(2026, 3, 9, 6, 30))
        );

        let evening = utc(2026, 3, 9, 23, 0);
        assert_eq!(
            most_recent_fire(&rec, "America/New_York", evening).unwrap(),
            Some(utc(2026, 3, 9, 6, 30))
        );

        // Sunday 01:30 falls in the November fold; a Saturday evening
        // reference still finds last Sunday's run.
        let weekly = Recurrence::Weekly {
            day_of_week: 6,
            hour: 1,
            minute: 30,
        };
        let saturday = utc(2026, 11, 1, 1, 0);
        assert_eq!(
            most_recent_fire(&weekly, "America/New_York", saturday).unwrap(),
            Some(utc(2026, 10, 25, 5, 30))
        );
    }

    #[test]
    fn test_ambiguous_local_time_is_rejected() {
        // 01:30 happens twice in New York on 2026-11-01.
        let rec = Recurrence::Daily {
            hour: 1,
            minute: 30,
        };
        let now = utc(2026, 11, 1, 4, 0);
        let err = next_fire(&rec, "America/New_York", now).unwrap_err();
        assert!(matches!(err, ScheduleError::AmbiguousLocalTime { .. }));
    }

    #[test]
    fn test_unknown_timezone() {
        let rec = Recurrence::Daily { hour: 1, minute: 0 };
        let err = next_fire(&rec, "Mars/Olympus", Utc::now()).unwrap_err();
        assert_eq!(err, ScheduleError::UnknownTimezone("Mars/Olympus".into()));
    }
}
