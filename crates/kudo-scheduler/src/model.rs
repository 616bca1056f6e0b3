//! Data model — reward policies, distribution runs, and per-recipient
//! outcomes and counters.

use chrono::{DateTime, Utc};
use kudo_core::config::SchedulerSettings;
use kudo_core::error::{KudoError, Result};
use serde::{Deserialize, Serialize};

use crate::cadence::Period;

/// A reward-unit type eligible for automatic distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardPolicy {
    pub id: String,
    /// Human-readable name (shown in run listings and notifications).
    pub name: String,
    /// The policy supports scheduling at all.
    pub auto_distribution_enabled: bool,
    /// The policy is currently armed.
    pub auto_distribution_active: bool,
    pub period: Period,
    /// Units granted to each recipient per occurrence. Positive.
    pub amount_per_recipient: i64,
}

/// State of a distribution run.
///
/// `scheduled` may transition to `in_progress` (atomic claim) or
/// `cancelled` (operator action); `in_progress` finalizes as `completed`
/// or `failed`. Terminal runs are immutable history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Scheduled => "scheduled",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(RunStatus::Scheduled),
            "in_progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(KudoError::Validation(format!("Unknown run status: {other}"))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled-or-executed occurrence of a policy's distribution.
///
/// Invariant (checked by the store after every batch):
/// `success_count + error_count == processed_recipient_count
///   <= target_recipient_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionRun {
    pub id: String,
    pub policy_id: String,
    pub status: RunStatus,
    pub scheduled_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub target_recipient_count: u32,
    pub processed_recipient_count: u32,
    pub success_count: u32,
    pub error_count: u32,
    pub total_units_distributed: i64,
    pub error_summary: Option<String>,
    /// Timezone snapshot taken at creation time.
    pub utc_offset_minutes: i32,
    /// Working-day restriction snapshot taken at creation time.
    pub working_days_only: bool,
    /// Operator-triggered run: bypasses the due-check and calendar gate.
    pub manual: bool,
    pub created_at: DateTime<Utc>,
}

impl DistributionRun {
    /// A freshly armed automatic run.
    pub fn scheduled(
        policy: &RewardPolicy,
        scheduled_at: DateTime<Utc>,
        settings: &SchedulerSettings,
    ) -> Self {
        Self {
            id: new_run_id(),
            policy_id: policy.id.clone(),
            status: RunStatus::Scheduled,
            scheduled_at,
            executed_at: None,
            target_recipient_count: 0,
            processed_recipient_count: 0,
            success_count: 0,
            error_count: 0,
            total_units_distributed: 0,
            error_summary: None,
            utc_offset_minutes: settings.utc_offset_minutes,
            working_days_only: settings.working_days_only,
            manual: false,
            created_at: Utc::now(),
        }
    }

    /// An operator-triggered run, due immediately and exempt from the
    /// working-day gate.
    pub fn manual(policy: &RewardPolicy, now: DateTime<Utc>, utc_offset_minutes: i32) -> Self {
        Self {
            id: new_run_id(),
            policy_id: policy.id.clone(),
            status: RunStatus::Scheduled,
            scheduled_at: now,
            executed_at: None,
            target_recipient_count: 0,
            processed_recipient_count: 0,
            success_count: 0,
            error_count: 0,
            total_units_distributed: 0,
            error_summary: None,
            utc_offset_minutes,
            working_days_only: false,
            manual: true,
            created_at: now,
        }
    }
}

/// One execution-log entry: the outcome for a single recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientOutcome {
    pub recipient_id: String,
    pub success: bool,
    /// Units actually credited (0 on failure).
    pub units: i64,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl RecipientOutcome {
    pub fn granted(recipient_id: &str, units: i64, at: DateTime<Utc>) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            success: true,
            units,
            error: None,
            at,
        }
    }

    pub fn failed(recipient_id: &str, error: String, at: DateTime<Utc>) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            success: false,
            units: 0,
            error: Some(error),
            at,
        }
    }
}

/// A run together with its full execution log.
#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    pub run: DistributionRun,
    pub log: Vec<RecipientOutcome>,
}

/// Cumulative balance of one reward unit for one recipient in one
/// accounting period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientCounter {
    pub recipient_id: String,
    pub policy_id: String,
    pub period_key: String,
    pub balance: i64,
}

/// Accounting-period key for a grant: the calendar month the instant falls
/// in, evaluated in the run's timezone.
pub fn period_key(instant: DateTime<Utc>, utc_offset_minutes: i32) -> String {
    use chrono::Offset;
    let offset =
        chrono::FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
    instant.with_timezone(&offset).format("%Y-%m").to_string()
}

fn new_run_id() -> String {
    format!("run-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn period_key_is_local_month() {
        // 23:30 UTC on Jan 31 is already February in UTC+7.
        let instant = Utc.with_ymd_and_hms(2026, 1, 31, 23, 30, 0).unwrap();
        assert_eq!(period_key(instant, 0), "2026-01");
        assert_eq!(period_key(instant, 7 * 60), "2026-02");
    }

    #[test]
    fn manual_run_bypasses_working_day_gate() {
        let policy = RewardPolicy {
            id: "p1".into(),
            name: "Kudos".into(),
            auto_distribution_enabled: true,
            auto_distribution_active: true,
            period: Period::Month,
            amount_per_recipient: 5,
        };
        let now = Utc::now();
        let run = DistributionRun::manual(&policy, now, 0);
        assert!(run.manual);
        assert!(!run.working_days_only);
        assert_eq!(run.scheduled_at, now);
        assert_eq!(run.status, RunStatus::Scheduled);
    }

    #[test]
    fn status_string_roundtrip() {
        for s in [
            RunStatus::Scheduled,
            RunStatus::InProgress,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(RunStatus::parse("paused").is_err());
    }
}
