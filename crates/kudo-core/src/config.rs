//! Kudo configuration system.
//!
//! Two layers:
//! - [`KudoConfig`] — process-level knobs (database path, tick interval),
//!   loaded from `~/.kudo/config.toml`.
//! - [`SchedulerSettings`] — the operator-mutable scheduler singleton
//!   (execution time, calendar, retry/concurrency limits, notification
//!   target). Persisted by the run store and re-read every tick, so
//!   operator changes take effect within one tick interval.

use chrono::{FixedOffset, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{KudoError, Result};

/// Process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KudoConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Scheduler tick interval in seconds (default: 30 minutes).
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

fn default_db_path() -> String {
    KudoConfig::home_dir()
        .join("kudo.db")
        .to_string_lossy()
        .into_owned()
}
fn default_tick_interval() -> u64 {
    1800
}

impl Default for KudoConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            tick_interval_secs: default_tick_interval(),
        }
    }
}

impl KudoConfig {
    /// Load config from the default path (~/.kudo/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KudoError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| KudoError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| KudoError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Kudo home directory (~/.kudo).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kudo")
    }
}

/// Where to send error notifications when a run finishes with failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifyTargetConfig {
    /// Telegram Bot API — send via `sendMessage`.
    Telegram { bot_token: String, chat_id: String },
    /// Generic HTTP webhook — POST with JSON body.
    Webhook { url: String },
}

/// Operator-mutable scheduler settings. Lazily created with defaults on
/// first access; every mutation goes through [`SchedulerSettings::validate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSettings {
    /// Global on/off switch for automatic distribution.
    #[serde(default = "default_true")]
    pub service_enabled: bool,
    /// Time of day runs execute at, "HH:MM" in the deployment timezone.
    #[serde(default = "default_execution_time")]
    pub execution_time_of_day: String,
    /// Deployment timezone as a fixed UTC offset in minutes.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// When set, runs only execute on configured working days.
    #[serde(default = "default_true")]
    pub working_days_only: bool,
    /// Permitted weekdays, 1 = Monday .. 7 = Sunday.
    #[serde(default = "default_working_days")]
    pub working_days: Vec<u8>,
    /// Calendar days on which execution is never permitted.
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
    /// Per-recipient write attempts before recording an error (1–10).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Fixed delay between retry attempts in seconds (1–1440).
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Global cap on concurrently executing runs (1–10).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_runs: usize,
    /// Recipients per progress checkpoint (1–1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Send a notification when a run finishes with errors.
    #[serde(default)]
    pub notify_on_error: bool,
    /// Required when `notify_on_error` is set.
    #[serde(default)]
    pub error_notification_target: Option<NotifyTargetConfig>,
}

fn default_true() -> bool {
    true
}
fn default_execution_time() -> String {
    "09:00".to_string()
}
fn default_working_days() -> Vec<u8> {
    vec![1, 2, 3, 4, 5]
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    30
}
fn default_max_concurrent() -> usize {
    2
}
fn default_batch_size() -> usize {
    100
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            service_enabled: true,
            execution_time_of_day: default_execution_time(),
            utc_offset_minutes: 0,
            working_days_only: true,
            working_days: default_working_days(),
            holidays: Vec::new(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay(),
            max_concurrent_runs: default_max_concurrent(),
            batch_size: default_batch_size(),
            notify_on_error: false,
            error_notification_target: None,
        }
    }
}

impl SchedulerSettings {
    /// Validate operator-supplied settings. Configuration errors are
    /// rejected here, at the settings boundary — they never reach the
    /// scheduler loop.
    pub fn validate(&self) -> Result<()> {
        self.execution_time()?;
        self.offset()?;
        if !(1..=10).contains(&self.retry_attempts) {
            return Err(KudoError::Validation(
                "retry_attempts must be between 1 and 10".into(),
            ));
        }
        if !(1..=1440).contains(&self.retry_delay_secs) {
            return Err(KudoError::Validation(
                "retry_delay_secs must be between 1 and 1440".into(),
            ));
        }
        if !(1..=10).contains(&self.max_concurrent_runs) {
            return Err(KudoError::Validation(
                "max_concurrent_runs must be between 1 and 10".into(),
            ));
        }
        if !(1..=1000).contains(&self.batch_size) {
            return Err(KudoError::Validation(
                "batch_size must be between 1 and 1000".into(),
            ));
        }
        if self.working_days_only && self.working_days.is_empty() {
            return Err(KudoError::Validation(
                "working_days must not be empty when working_days_only is set".into(),
            ));
        }
        if self.working_days.iter().any(|d| !(1..=7).contains(d)) {
            return Err(KudoError::Validation(
                "working_days entries must be 1 (Monday) through 7 (Sunday)".into(),
            ));
        }
        if self.notify_on_error && self.error_notification_target.is_none() {
            return Err(KudoError::Validation(
                "error_notification_target is required when notify_on_error is set".into(),
            ));
        }
        Ok(())
    }

    /// Parsed execution time of day.
    pub fn execution_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.execution_time_of_day, "%H:%M").map_err(|_| {
            KudoError::Config(format!(
                "Invalid execution_time_of_day '{}' (expected HH:MM)",
                self.execution_time_of_day
            ))
        })
    }

    /// Deployment timezone as a chrono offset.
    pub fn offset(&self) -> Result<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                KudoError::Config(format!(
                    "Invalid utc_offset_minutes: {}",
                    self.utc_offset_minutes
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SchedulerSettings::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_limits() {
        let mut s = SchedulerSettings::default();
        s.retry_attempts = 0;
        assert!(s.validate().is_err());

        let mut s = SchedulerSettings::default();
        s.retry_attempts = 11;
        assert!(s.validate().is_err());

        let mut s = SchedulerSettings::default();
        s.batch_size = 1001;
        assert!(s.validate().is_err());

        let mut s = SchedulerSettings::default();
        s.max_concurrent_runs = 0;
        assert!(s.validate().is_err());

        let mut s = SchedulerSettings::default();
        s.retry_delay_secs = 2000;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_empty_working_days_when_restricted() {
        let mut s = SchedulerSettings::default();
        s.working_days = Vec::new();
        assert!(s.validate().is_err());

        // Fine when the restriction is off.
        s.working_days_only = false;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn rejects_notify_without_target() {
        let mut s = SchedulerSettings::default();
        s.notify_on_error = true;
        assert!(s.validate().is_err());

        s.error_notification_target = Some(NotifyTargetConfig::Webhook {
            url: "https://example.com/hook".into(),
        });
        assert!(s.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_utc_offset() {
        let mut s = SchedulerSettings::default();
        s.utc_offset_minutes = i32::MAX; // would overflow the seconds conversion
        assert!(s.validate().is_err());

        s.utc_offset_minutes = 24 * 60; // a full day ahead is not a timezone
        assert!(s.validate().is_err());

        s.utc_offset_minutes = -(12 * 60);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn rejects_bad_time_of_day() {
        let mut s = SchedulerSettings::default();
        s.execution_time_of_day = "25:99".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn settings_roundtrip_json_compatible() {
        let s = SchedulerSettings::default();
        let json = serde_json::to_string(&s).unwrap();
        let back: SchedulerSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }
}
