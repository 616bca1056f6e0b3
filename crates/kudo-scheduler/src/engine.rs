//! Scheduler engine — the periodic driver that arms, selects, and
//! dispatches distribution runs.
//!
//! Each tick re-reads the settings (operator changes propagate within one
//! tick interval), ensures every active policy has exactly one pending
//! run, and hands due runs to the executor under the global concurrency
//! cap. Dispatch is fire-and-forget: the tick never blocks on executor
//! completion, and run ownership is taken via the store's atomic claim.

use chrono::{DateTime, Utc};
use kudo_core::config::SchedulerSettings;
use kudo_core::error::{KudoError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::cadence;
use crate::calendar;
use crate::executor::{self, GrantLedger, RecipientSource};
use crate::model::{DistributionRun, RewardPolicy};
use crate::store::RunStore;

pub struct SchedulerEngine {
    store: Arc<RunStore>,
    recipients: Arc<dyn RecipientSource>,
    ledger: Arc<dyn GrantLedger>,
    /// Run IDs currently executing in this process. Prevents double
    /// dispatch within one process; cross-process safety comes from the
    /// store's atomic claim. Shared with the spawned executor tasks,
    /// which remove their entry on completion.
    executing: Arc<Mutex<HashSet<String>>>,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<RunStore>,
        recipients: Arc<dyn RecipientSource>,
        ledger: Arc<dyn GrantLedger>,
    ) -> Self {
        Self {
            store,
            recipients,
            ledger,
            executing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Engine whose recipient snapshot and counter ledger both live in the
    /// run store (the default deployment).
    pub fn with_store(store: Arc<RunStore>) -> Self {
        let recipients: Arc<dyn RecipientSource> = store.clone();
        let ledger: Arc<dyn GrantLedger> = store.clone();
        Self::new(store, recipients, ledger)
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    /// One scheduler tick. Returns the number of runs dispatched.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let settings = self.store.load_settings()?;
        if !settings.service_enabled {
            tracing::debug!("Scheduler disabled, skipping tick");
            return Ok(0);
        }

        self.arm_policies(now, &settings);
        self.dispatch_due(now, &settings)
    }

    /// Arm phase: every policy with automatic distribution enabled and
    /// active gets exactly one `scheduled` run. A per-policy error (e.g. a
    /// broken calendar) is logged and does not stall the other policies.
    fn arm_policies(&self, now: DateTime<Utc>, settings: &SchedulerSettings) {
        let policies = match self.store.active_policies() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Cannot list active policies: {e}");
                return;
            }
        };
        for policy in policies {
            if let Err(e) = self.arm_policy(&policy, now, settings) {
                match e {
                    KudoError::RunConflict(_) => {} // lost a race with another armer
                    other => tracing::warn!("Failed to arm policy '{}': {other}", policy.id),
                }
            }
        }
    }

    fn arm_policy(
        &self,
        policy: &RewardPolicy,
        now: DateTime<Utc>,
        settings: &SchedulerSettings,
    ) -> Result<()> {
        if self.store.active_run(&policy.id)?.is_some() {
            return Ok(());
        }
        let last = self.store.latest_completed_execution(&policy.id)?;
        let next = cadence::compute_next_run(policy.period, last, now, settings)?;
        let run = DistributionRun::scheduled(policy, next, settings);
        self.store.insert_run(&run)?;
        tracing::info!(
            "📅 Policy '{}' armed: run {} scheduled for {next}",
            policy.id,
            run.id
        );
        Ok(())
    }

    /// Select-and-dispatch phase: due runs in ascending `scheduled_at`
    /// order, re-validated against the *current* calendar, claimed
    /// atomically, and handed to executor tasks up to the concurrency cap.
    fn dispatch_due(&self, now: DateTime<Utc>, settings: &SchedulerSettings) -> Result<usize> {
        let mut capacity = settings
            .max_concurrent_runs
            .saturating_sub(self.store.in_progress_count()?);
        let mut dispatched = 0;

        for run in self.store.due_runs(now)? {
            if capacity == 0 {
                // Remaining runs stay scheduled and are reconsidered next
                // tick, oldest first.
                tracing::debug!("Concurrency cap reached, deferring remaining due runs");
                break;
            }

            // Settings may have changed since the run was armed: skip (do
            // not cancel) runs whose day is no longer permitted. Manual
            // runs bypass the calendar gate.
            if !run.manual {
                let day = calendar::local_date(run.scheduled_at, settings)?;
                if !calendar::is_permitted_day(day, settings) {
                    tracing::debug!("Run {} not on a permitted day, skipping this tick", run.id);
                    continue;
                }
            }

            if !self.executing.lock().unwrap().insert(run.id.clone()) {
                continue; // already dispatched by this process
            }
            if !self.store.claim_run(&run.id, now)? {
                // Another tick or process won the claim.
                self.executing.lock().unwrap().remove(&run.id);
                continue;
            }

            let policy = match self.store.get_policy(&run.policy_id) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("Claimed run {} has no policy: {e}", run.id);
                    let _ = self.store.finalize_run(
                        &run.id,
                        crate::model::RunStatus::Failed,
                        Some("policy not found"),
                    );
                    self.executing.lock().unwrap().remove(&run.id);
                    continue;
                }
            };

            let claimed = self.store.get_run(&run.id)?;
            self.spawn_execution(claimed, policy, settings.clone());
            capacity -= 1;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Fire-and-forget executor task for a claimed run. Also used by the
    /// operator service for manual triggers.
    pub(crate) fn spawn_execution(
        &self,
        run: DistributionRun,
        policy: RewardPolicy,
        settings: SchedulerSettings,
    ) {
        self.executing.lock().unwrap().insert(run.id.clone());
        let store = Arc::clone(&self.store);
        let recipients = Arc::clone(&self.recipients);
        let ledger = Arc::clone(&self.ledger);
        let executing = Arc::clone(&self.executing);
        let run_id = run.id.clone();
        tokio::spawn(async move {
            executor::execute_run(store, recipients, ledger, run, policy, settings).await;
            executing.lock().unwrap().remove(&run_id);
        });
    }

    /// Number of runs currently executing in this process.
    pub fn executing_count(&self) -> usize {
        self.executing.lock().unwrap().len()
    }
}

/// Drive the scheduler loop: one eager tick at process start, then a fixed
/// interval. Never returns; spawn it on the runtime.
pub async fn spawn_scheduler(engine: Arc<SchedulerEngine>, tick_interval_secs: u64) {
    tracing::info!("⏰ Distribution scheduler started (tick every {tick_interval_secs}s)");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_interval_secs));
    loop {
        interval.tick().await; // first tick completes immediately
        match engine.tick(Utc::now()) {
            Ok(0) => {}
            Ok(n) => tracing::info!("Tick dispatched {n} run(s)"),
            Err(e) => tracing::warn!("⚠️ Scheduler tick failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadence::Period;
    use crate::model::RunStatus;
    use chrono::TimeZone;

    fn temp_engine(name: &str) -> Arc<SchedulerEngine> {
        let path = std::env::temp_dir()
            .join("kudo-engine-tests")
            .join(format!("{name}-{}.db", uuid::Uuid::new_v4()));
        Arc::new(SchedulerEngine::with_store(Arc::new(
            RunStore::open(&path).unwrap(),
        )))
    }

    fn seed_policy(store: &RunStore, id: &str, active: bool) -> RewardPolicy {
        let policy = RewardPolicy {
            id: id.into(),
            name: format!("Policy {id}"),
            auto_distribution_enabled: true,
            auto_distribution_active: active,
            period: Period::Month,
            amount_per_recipient: 5,
        };
        store.upsert_policy(&policy).unwrap();
        policy
    }

    fn fast_settings(store: &RunStore) -> SchedulerSettings {
        let mut s = store.load_settings().unwrap();
        s.retry_delay_secs = 1;
        store.save_settings(&s).unwrap();
        s
    }

    #[tokio::test]
    async fn tick_arms_active_policies_once() {
        let engine = temp_engine("arm");
        seed_policy(engine.store(), "p1", true);
        seed_policy(engine.store(), "p2", false);
        fast_settings(engine.store());

        // Wednesday 10:00 UTC → armed for Thursday 09:00.
        let now = Utc.with_ymd_and_hms(2026, 2, 18, 10, 0, 0).unwrap();
        engine.tick(now).unwrap();

        let run = engine.store().active_run("p1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Scheduled);
        assert_eq!(
            run.scheduled_at,
            Utc.with_ymd_and_hms(2026, 2, 19, 9, 0, 0).unwrap()
        );
        assert!(engine.store().active_run("p2").unwrap().is_none());

        // A second tick must not create a duplicate.
        engine.tick(now).unwrap();
        let runs = engine
            .store()
            .list_runs(Some(RunStatus::Scheduled), 10, 0)
            .unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn disabled_service_does_nothing() {
        let engine = temp_engine("disabled");
        seed_policy(engine.store(), "p1", true);
        let mut settings = engine.store().load_settings().unwrap();
        settings.service_enabled = false;
        engine.store().save_settings(&settings).unwrap();

        let dispatched = engine.tick(Utc::now()).unwrap();
        assert_eq!(dispatched, 0);
        assert!(engine.store().active_run("p1").unwrap().is_none());
    }

    #[tokio::test]
    async fn due_run_is_claimed_and_executed() {
        let engine = temp_engine("execute");
        seed_policy(engine.store(), "p1", true);
        engine.store().upsert_recipient("alice", "", true).unwrap();
        engine.store().upsert_recipient("bob", "", true).unwrap();
        fast_settings(engine.store());

        // Arm on Wednesday, then tick after the scheduled instant.
        let wednesday = Utc.with_ymd_and_hms(2026, 2, 18, 10, 0, 0).unwrap();
        engine.tick(wednesday).unwrap();
        let thursday = Utc.with_ymd_and_hms(2026, 2, 19, 9, 30, 0).unwrap();
        let dispatched = engine.tick(thursday).unwrap();
        assert_eq!(dispatched, 1);

        // Wait for the fire-and-forget executor task to finish.
        for _ in 0..100 {
            if engine.executing_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let completed = engine
            .store()
            .list_runs(Some(RunStatus::Completed), 10, 0)
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].success_count, 2);

        // The executor re-armed the next occurrence.
        let next = engine.store().active_run("p1").unwrap().unwrap();
        assert_eq!(next.status, RunStatus::Scheduled);
        assert!(next.scheduled_at > thursday);
    }

    #[tokio::test]
    async fn dispatch_respects_concurrency_cap_oldest_first() {
        let engine = temp_engine("cap");
        let mut settings = fast_settings(engine.store());
        settings.max_concurrent_runs = 1;
        settings.working_days_only = false;
        engine.store().save_settings(&settings).unwrap();

        // Two due runs with different ages.
        let mut run_ids = std::collections::HashMap::new();
        for (id, hour) in [("p1", 8), ("p2", 7)] {
            let policy = seed_policy(engine.store(), id, true);
            let run = DistributionRun::scheduled(
                &policy,
                Utc.with_ymd_and_hms(2026, 2, 19, hour, 0, 0).unwrap(),
                &settings,
            );
            engine.store().insert_run(&run).unwrap();
            run_ids.insert(id, run.id);
        }

        let now = Utc.with_ymd_and_hms(2026, 2, 19, 12, 0, 0).unwrap();
        let dispatched = engine.tick(now).unwrap();
        assert_eq!(dispatched, 1);

        // The older run (p2, 07:00) was claimed; p1 stays scheduled.
        let p2 = engine.store().get_run(&run_ids["p2"]).unwrap();
        assert_ne!(p2.status, RunStatus::Scheduled);
        let p1 = engine.store().get_run(&run_ids["p1"]).unwrap();
        assert_eq!(p1.status, RunStatus::Scheduled);
    }

    #[tokio::test]
    async fn non_permitted_day_is_skipped_not_cancelled() {
        let engine = temp_engine("skip");
        let settings = fast_settings(engine.store());
        let policy = seed_policy(engine.store(), "p1", true);

        // A run armed for a Saturday (settings changed after arming, say).
        let run = DistributionRun::scheduled(
            &policy,
            Utc.with_ymd_and_hms(2026, 2, 21, 9, 0, 0).unwrap(),
            &settings,
        );
        engine.store().insert_run(&run).unwrap();

        let saturday_noon = Utc.with_ymd_and_hms(2026, 2, 21, 12, 0, 0).unwrap();
        let dispatched = engine.tick(saturday_noon).unwrap();
        assert_eq!(dispatched, 0);
        // Still scheduled — skipped, not cancelled.
        assert_eq!(
            engine.store().get_run(&run.id).unwrap().status,
            RunStatus::Scheduled
        );

        // Once the restriction is lifted, the same run dispatches.
        let mut relaxed = engine.store().load_settings().unwrap();
        relaxed.working_days_only = false;
        engine.store().save_settings(&relaxed).unwrap();
        let dispatched = engine.tick(saturday_noon).unwrap();
        assert_eq!(dispatched, 1);
    }
}
