//! Operator-facing service — the surface consumed by the portal's HTTP
//! layer.
//!
//! Everything here validates at the edge: bad settings never reach the
//! scheduler loop, and every run mutation goes through the store's atomic
//! transitions.

use chrono::Utc;
use kudo_core::config::SchedulerSettings;
use kudo_core::error::{KudoError, Result};
use std::sync::Arc;

use crate::cadence;
use crate::engine::SchedulerEngine;
use crate::model::{DistributionRun, RunDetail, RunStatus};
use crate::store::RunStore;

pub struct SchedulerService {
    store: Arc<RunStore>,
    engine: Arc<SchedulerEngine>,
}

impl SchedulerService {
    pub fn new(store: Arc<RunStore>, engine: Arc<SchedulerEngine>) -> Self {
        Self { store, engine }
    }

    // ─── Settings ─────────────────────────────────────────────

    pub fn settings(&self) -> Result<SchedulerSettings> {
        self.store.load_settings()
    }

    /// Replace the settings singleton. Rejected synchronously on any
    /// validation failure; the scheduler picks the change up next tick.
    pub fn update_settings(&self, settings: SchedulerSettings) -> Result<()> {
        settings.validate()?;
        self.store.save_settings(&settings)?;
        tracing::info!("⚙️ Scheduler settings updated");
        Ok(())
    }

    /// Global service on/off switch.
    pub fn set_service_enabled(&self, enabled: bool) -> Result<()> {
        let mut settings = self.store.load_settings()?;
        settings.service_enabled = enabled;
        self.store.save_settings(&settings)?;
        tracing::info!(
            "⚙️ Distribution service {}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    // ─── Policies ─────────────────────────────────────────────

    /// Toggle automatic distribution for one policy. Enabling re-arms it
    /// immediately; disabling cancels a pending `scheduled` run but lets
    /// an `in_progress` run finish (the executor will then see the flag
    /// and skip re-arming).
    pub fn set_auto_distribution(&self, policy_id: &str, active: bool) -> Result<()> {
        let policy = self.store.get_policy(policy_id)?;
        if active && !policy.auto_distribution_enabled {
            return Err(KudoError::Validation(format!(
                "Policy '{policy_id}' does not support automatic distribution"
            )));
        }
        self.store.set_auto_distribution(policy_id, active)?;

        if active {
            if self.store.active_run(policy_id)?.is_none() {
                let settings = self.store.load_settings()?;
                let last = self.store.latest_completed_execution(policy_id)?;
                let next =
                    cadence::compute_next_run(policy.period, last, Utc::now(), &settings)?;
                let mut armed = policy.clone();
                armed.auto_distribution_active = true;
                let run = DistributionRun::scheduled(&armed, next, &settings);
                match self.store.insert_run(&run) {
                    Ok(()) => {
                        tracing::info!("📅 Policy '{policy_id}' re-armed for {next}");
                    }
                    Err(KudoError::RunConflict(_)) => {} // armed concurrently
                    Err(e) => return Err(e),
                }
            }
        } else if let Some(run) = self.store.active_run(policy_id)? {
            if run.status == RunStatus::Scheduled && self.store.cancel_run(&run.id)? {
                tracing::info!("🚫 Cancelled scheduled run {} for policy '{policy_id}'", run.id);
            }
            // An in_progress run is immutable history in the making —
            // leave it to finish.
        }
        Ok(())
    }

    /// Operator-requested immediate execution. Bypasses the due-check and
    /// the calendar gate, but still obeys the one-active-run invariant and
    /// the global concurrency cap.
    pub fn trigger_manual_run(&self, policy_id: &str) -> Result<String> {
        let policy = self.store.get_policy(policy_id)?;
        let settings = self.store.load_settings()?;

        if self.store.active_run(policy_id)?.is_some() {
            return Err(KudoError::RunConflict(format!(
                "Policy '{policy_id}' already has a scheduled or in-progress run"
            )));
        }
        if self.store.in_progress_count()? >= settings.max_concurrent_runs {
            return Err(KudoError::Validation(format!(
                "Concurrency limit of {} runs reached, try again later",
                settings.max_concurrent_runs
            )));
        }

        let now = Utc::now();
        let run = DistributionRun::manual(&policy, now, settings.utc_offset_minutes);
        self.store.insert_run(&run)?;
        if !self.store.claim_run(&run.id, now)? {
            return Err(KudoError::RunConflict(format!(
                "Run {} was taken before manual dispatch",
                run.id
            )));
        }
        let claimed = self.store.get_run(&run.id)?;
        tracing::info!("▶️ Manual run {} triggered for policy '{policy_id}'", run.id);
        self.engine.spawn_execution(claimed, policy, settings);
        Ok(run.id)
    }

    // ─── Runs ─────────────────────────────────────────────────

    pub fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DistributionRun>> {
        self.store.list_runs(status, limit, offset)
    }

    /// One run with its full execution log, for failure diagnosis.
    pub fn run_detail(&self, run_id: &str) -> Result<RunDetail> {
        self.store.run_detail(run_id)
    }

    /// Delete a run — only permitted while it is still `scheduled`.
    pub fn delete_run(&self, run_id: &str) -> Result<()> {
        if self.store.delete_scheduled_run(run_id)? {
            tracing::info!("🗑️ Deleted scheduled run {run_id}");
            Ok(())
        } else {
            Err(KudoError::Validation(format!(
                "Run '{run_id}' is not in the scheduled state (or does not exist)"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadence::Period;
    use crate::model::RewardPolicy;

    fn temp_service(name: &str) -> SchedulerService {
        let path = std::env::temp_dir()
            .join("kudo-service-tests")
            .join(format!("{name}-{}.db", uuid::Uuid::new_v4()));
        let store = Arc::new(RunStore::open(&path).unwrap());
        let engine = Arc::new(SchedulerEngine::with_store(Arc::clone(&store)));
        SchedulerService::new(store, engine)
    }

    fn seed_policy(service: &SchedulerService, id: &str, active: bool) -> RewardPolicy {
        let policy = RewardPolicy {
            id: id.into(),
            name: format!("Policy {id}"),
            auto_distribution_enabled: true,
            auto_distribution_active: active,
            period: Period::Week,
            amount_per_recipient: 3,
        };
        service.store.upsert_policy(&policy).unwrap();
        policy
    }

    #[test]
    fn settings_update_is_validated_at_the_edge() {
        let service = temp_service("validate");
        let mut bad = service.settings().unwrap();
        bad.batch_size = 0;
        assert!(matches!(
            service.update_settings(bad),
            Err(KudoError::Validation(_))
        ));
        // The stored singleton is untouched.
        assert_eq!(service.settings().unwrap().batch_size, 100);

        let mut good = service.settings().unwrap();
        good.batch_size = 500;
        service.update_settings(good).unwrap();
        assert_eq!(service.settings().unwrap().batch_size, 500);
    }

    #[tokio::test]
    async fn enabling_arms_and_disabling_cancels() {
        let service = temp_service("toggle");
        seed_policy(&service, "p1", false);

        service.set_auto_distribution("p1", true).unwrap();
        let run = service.store.active_run("p1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Scheduled);

        // Enabling again is idempotent.
        service.set_auto_distribution("p1", true).unwrap();
        assert_eq!(
            service
                .store
                .list_runs(Some(RunStatus::Scheduled), 10, 0)
                .unwrap()
                .len(),
            1
        );

        service.set_auto_distribution("p1", false).unwrap();
        assert!(service.store.active_run("p1").unwrap().is_none());
        assert_eq!(
            service.store.get_run(&run.id).unwrap().status,
            RunStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn disabling_leaves_in_progress_run_to_finish() {
        let service = temp_service("in-progress");
        seed_policy(&service, "p1", true);
        service.set_auto_distribution("p1", true).unwrap();
        let run = service.store.active_run("p1").unwrap().unwrap();
        assert!(service.store.claim_run(&run.id, Utc::now()).unwrap());

        service.set_auto_distribution("p1", false).unwrap();
        assert_eq!(
            service.store.get_run(&run.id).unwrap().status,
            RunStatus::InProgress
        );
    }

    #[tokio::test]
    async fn manual_trigger_respects_uniqueness() {
        let service = temp_service("manual");
        seed_policy(&service, "p1", true);
        service.store.upsert_recipient("alice", "", true).unwrap();
        let mut settings = service.settings().unwrap();
        settings.retry_delay_secs = 1;
        service.update_settings(settings).unwrap();

        // A pending scheduled run blocks a manual trigger.
        service.set_auto_distribution("p1", true).unwrap();
        assert!(matches!(
            service.trigger_manual_run("p1"),
            Err(KudoError::RunConflict(_))
        ));

        // With the pending run gone, the manual trigger goes through.
        let pending = service.store.active_run("p1").unwrap().unwrap();
        service.delete_run(&pending.id).unwrap();
        let run_id = service.trigger_manual_run("p1").unwrap();
        let run = service.store.get_run(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        assert!(run.manual);
        assert!(!run.working_days_only);
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let service = temp_service("unknown");
        assert!(matches!(
            service.set_auto_distribution("ghost", true),
            Err(KudoError::NotFound(_))
        ));
        assert!(matches!(
            service.trigger_manual_run("ghost"),
            Err(KudoError::NotFound(_))
        ));
    }

    #[test]
    fn delete_rejects_non_scheduled_runs() {
        let service = temp_service("delete");
        seed_policy(&service, "p1", true);
        service.set_auto_distribution("p1", true).unwrap();
        let run = service.store.active_run("p1").unwrap().unwrap();
        assert!(service.store.claim_run(&run.id, Utc::now()).unwrap());
        assert!(matches!(
            service.delete_run(&run.id),
            Err(KudoError::Validation(_))
        ));
    }
}
