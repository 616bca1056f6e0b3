//! Cadence calculation — maps a policy's period and history to its next
//! due instant.
//!
//! Pure and deterministic: "now" is an explicit input, so re-arming is
//! idempotent and every path is unit-testable with fixed clocks.

use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use kudo_core::config::SchedulerSettings;
use kudo_core::error::{KudoError, Result};
use serde::{Deserialize, Serialize};

use crate::calendar;

/// Distribution period of a reward policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Week,
    Month,
    Quarter,
    HalfYear,
    Year,
}

impl Period {
    /// Calendar months per occurrence; `None` for the day-based week period.
    fn months(self) -> Option<u32> {
        match self {
            Period::Week => None,
            Period::Month => Some(1),
            Period::Quarter => Some(3),
            Period::HalfYear => Some(6),
            Period::Year => Some(12),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Week => "week",
            Period::Month => "month",
            Period::Quarter => "quarter",
            Period::HalfYear => "half_year",
            Period::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            "quarter" => Ok(Period::Quarter),
            "half_year" => Ok(Period::HalfYear),
            "year" => Ok(Period::Year),
            other => Err(KudoError::Validation(format!("Unknown period: {other}"))),
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the next scheduled instant for a policy.
///
/// First ever run: today at the configured execution time (deployment
/// timezone), or tomorrow if that instant is not strictly in the future.
/// Subsequent runs: the previous execution advanced by exactly one period
/// (weeks add 7 days; month-based periods add calendar months with
/// end-of-month clamping), time of day reset to the execution time.
/// Either way the candidate is rolled forward to a permitted day.
pub fn compute_next_run(
    period: Period,
    last_executed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    settings: &SchedulerSettings,
) -> Result<DateTime<Utc>> {
    let offset = settings.offset()?;
    let exec_time = settings.execution_time()?;

    let candidate_day: NaiveDate = match last_executed_at {
        None => now.with_timezone(&offset).date_naive(),
        Some(last) => {
            let last_day = last.with_timezone(&offset).date_naive();
            match period.months() {
                None => last_day + Duration::days(7),
                Some(months) => last_day.checked_add_months(Months::new(months)).ok_or_else(
                    || KudoError::Validation(format!("Cannot advance {last_day} by {months} months")),
                )?,
            }
        }
    };

    let local = candidate_day
        .and_time(exec_time)
        .and_local_timezone(offset)
        .single()
        .ok_or_else(|| KudoError::Config("Ambiguous local execution time".into()))?;
    let mut candidate = local.with_timezone(&Utc);

    // First run: never schedule into the past (or the current instant).
    if last_executed_at.is_none() && candidate <= now {
        candidate += Duration::days(1);
    }

    calendar::roll_forward_to_permitted_day(candidate, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings() -> SchedulerSettings {
        SchedulerSettings::default() // 09:00, UTC, Mon–Fri
    }

    #[test]
    fn first_run_schedules_tomorrow_when_time_has_passed() {
        // Wednesday 2026-02-18 10:00 UTC, execution time 09:00 →
        // Thursday 2026-02-19 09:00 UTC.
        let now = Utc.with_ymd_and_hms(2026, 2, 18, 10, 0, 0).unwrap();
        let next = compute_next_run(Period::Month, None, now, &settings()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 19, 9, 0, 0).unwrap());
    }

    #[test]
    fn first_run_schedules_today_when_time_is_ahead() {
        let now = Utc.with_ymd_and_hms(2026, 2, 18, 7, 30, 0).unwrap();
        let next = compute_next_run(Period::Week, None, now, &settings()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 18, 9, 0, 0).unwrap());
    }

    #[test]
    fn first_run_rolls_over_weekend() {
        // Friday 10:00 → candidate Saturday 09:00 → rolled to Monday.
        let now = Utc.with_ymd_and_hms(2026, 2, 20, 10, 0, 0).unwrap();
        let next = compute_next_run(Period::Month, None, now, &settings()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 23, 9, 0, 0).unwrap());
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let now = Utc.with_ymd_and_hms(2026, 2, 18, 10, 0, 0).unwrap();
        let last = Some(Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap());
        let a = compute_next_run(Period::Quarter, last, now, &settings()).unwrap();
        let b = compute_next_run(Period::Quarter, last, now, &settings()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn month_end_clamps() {
        // Executed Jan 31 → February candidate clamps to the 28th (2026 is
        // not a leap year). Working-day restriction off so the Saturday
        // clamp target is observable directly.
        let mut s = settings();
        s.working_days_only = false;
        let last = Some(Utc.with_ymd_and_hms(2026, 1, 31, 9, 0, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2026, 1, 31, 9, 5, 0).unwrap();
        let next = compute_next_run(Period::Month, last, now, &s).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 28, 9, 0, 0).unwrap());
    }

    #[test]
    fn week_advances_seven_days() {
        let last = Some(Utc.with_ymd_and_hms(2026, 2, 16, 9, 0, 0).unwrap()); // Monday
        let now = Utc.with_ymd_and_hms(2026, 2, 16, 9, 5, 0).unwrap();
        let next = compute_next_run(Period::Week, last, now, &settings()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 23, 9, 0, 0).unwrap());
    }

    #[test]
    fn cadence_is_monotonic() {
        let last = Utc.with_ymd_and_hms(2026, 2, 16, 14, 30, 0).unwrap();
        for period in [
            Period::Week,
            Period::Month,
            Period::Quarter,
            Period::HalfYear,
            Period::Year,
        ] {
            let next = compute_next_run(period, Some(last), last, &settings()).unwrap();
            assert!(next > last, "{period:?} must advance past the last run");
        }
    }

    #[test]
    fn respects_timezone_offset() {
        let mut s = settings();
        s.utc_offset_minutes = 7 * 60; // UTC+7, execution at 09:00 local = 02:00 UTC
        s.working_days_only = false;
        let now = Utc.with_ymd_and_hms(2026, 2, 18, 0, 0, 0).unwrap();
        let next = compute_next_run(Period::Month, None, now, &s).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 18, 2, 0, 0).unwrap());
    }

    #[test]
    fn period_string_roundtrip() {
        for p in [
            Period::Week,
            Period::Month,
            Period::Quarter,
            Period::HalfYear,
            Period::Year,
        ] {
            assert_eq!(Period::parse(p.as_str()).unwrap(), p);
        }
        assert!(Period::parse("fortnight").is_err());
    }
}
