//! Recurrence definitions and their translation into UTC fire instants.
//!
//! A task owner describes *when* a scan should run in local terms (daily at
//! 23:30 in `Asia/Karachi`, monthly on the 31st, every 6 hours, ...). The
//! translator turns that into the concrete UTC instant of the next or the
//! most recent fire.
//!
//! Local times that are ambiguous or skipped by a DST transition are
//! reported as [`ScheduleError`](crate::error::ScheduleError) instead of
//! being resolved to a guessed offset.

pub mod recurrence;
pub mod translator;

pub use recurrence::Recurrence;
pub use translator::{fire_instant, most_recent_fire, next_fire, parse_timezone, FireMode};
