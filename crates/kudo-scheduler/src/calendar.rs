//! Working-day calendar — pure date logic, no IO, no wall clock.
//!
//! Answers two questions for the scheduler: "may a run execute on this
//! day" and "what is the next day it may execute on". Days are evaluated
//! as timezone-local calendar days under the deployment's fixed UTC
//! offset.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use kudo_core::config::SchedulerSettings;
use kudo_core::error::{KudoError, Result};

/// Upper bound on the roll-forward search. A calendar that permits no day
/// within a year is a configuration error, not something to loop on.
const MAX_ROLL_FORWARD_DAYS: u32 = 366;

/// The timezone-local calendar day an instant falls on.
pub fn local_date(instant: DateTime<Utc>, settings: &SchedulerSettings) -> Result<NaiveDate> {
    Ok(instant.with_timezone(&settings.offset()?).date_naive())
}

/// Is execution permitted on this (timezone-local) calendar day?
///
/// Holidays always block execution; the weekday check only applies when
/// `working_days_only` is set.
pub fn is_permitted_day(date: NaiveDate, settings: &SchedulerSettings) -> bool {
    if settings.working_days_only {
        let weekday = date.weekday().number_from_monday() as u8;
        if !settings.working_days.contains(&weekday) {
            return false;
        }
    }
    !settings.holidays.contains(&date)
}

/// Advance an instant one calendar day at a time (preserving time of day)
/// until it lands on a permitted day.
///
/// Fails fast on an empty working-day set instead of looping; with the
/// usual Mon–Fri set this terminates within 7 iterations, and a
/// holiday-saturated calendar is cut off after [`MAX_ROLL_FORWARD_DAYS`].
pub fn roll_forward_to_permitted_day(
    instant: DateTime<Utc>,
    settings: &SchedulerSettings,
) -> Result<DateTime<Utc>> {
    if settings.working_days_only && settings.working_days.is_empty() {
        return Err(KudoError::Config(
            "working_days must not be empty when working_days_only is set".into(),
        ));
    }
    let offset = settings.offset()?;
    let mut candidate = instant;
    for _ in 0..MAX_ROLL_FORWARD_DAYS {
        if is_permitted_day(candidate.with_timezone(&offset).date_naive(), settings) {
            return Ok(candidate);
        }
        candidate += Duration::days(1);
    }
    Err(KudoError::Config(format!(
        "no permitted day within {MAX_ROLL_FORWARD_DAYS} days of {instant}"
    )))
}
