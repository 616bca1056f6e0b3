//! Run execution — snapshot, batch, retry, finalize, re-arm.
//!
//! A claimed run is processed in batches of `batch_size`; progress is
//! persisted after every batch so a crash mid-run leaves an accurate,
//! auditable partial state. A single recipient failure never aborts the
//! run, and even a failed run re-arms the next occurrence — only
//! switching the policy's automatic distribution off stops the cadence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kudo_core::config::SchedulerSettings;
use kudo_core::error::{KudoError, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::cadence;
use crate::model::{DistributionRun, RecipientOutcome, RewardPolicy, RunStatus, period_key};
use crate::notify;
use crate::store::RunStore;

/// Supplies the eligible recipient snapshot for a run. Evaluated once at
/// claim time; mid-run eligibility changes apply from the next occurrence.
#[async_trait]
pub trait RecipientSource: Send + Sync {
    async fn eligible_recipients(&self) -> Result<Vec<String>>;
}

/// Credits one recipient's cumulative counter for an accounting period.
/// Implementations must serialize updates per (recipient, policy, period).
#[async_trait]
pub trait GrantLedger: Send + Sync {
    async fn credit(
        &self,
        recipient_id: &str,
        policy_id: &str,
        period_key: &str,
        amount: i64,
    ) -> Result<()>;
}

/// Execute one claimed run to its terminal state. Never returns an error:
/// run-level failures finalize the run as `failed` (with the failure in
/// `error_summary`) and the cadence is still re-armed.
pub async fn execute_run(
    store: Arc<RunStore>,
    recipients: Arc<dyn RecipientSource>,
    ledger: Arc<dyn GrantLedger>,
    run: DistributionRun,
    policy: RewardPolicy,
    settings: SchedulerSettings,
) {
    let executed_at = run.executed_at.unwrap_or_else(Utc::now);
    tracing::info!(
        "▶️ Executing run {} for policy '{}' ({})",
        run.id,
        policy.name,
        policy.period
    );

    match distribute(&store, recipients, ledger, &run, &policy, &settings).await {
        Ok(outcome) => {
            if settings.notify_on_error && outcome.error_count > 0 {
                notify_failure(&settings, &policy, &run.id, outcome.error_count, outcome.target);
            }
        }
        Err(e) => {
            // Run-level failure: terminal but self-healing.
            tracing::warn!("❌ Run {} aborted: {e}", run.id);
            if let Err(fin) = store.finalize_run(
                &run.id,
                RunStatus::Failed,
                Some(&format!("run aborted: {e}")),
            ) {
                tracing::warn!("Failed to finalize aborted run {}: {fin}", run.id);
            }
            if settings.notify_on_error {
                notify_failure(&settings, &policy, &run.id, 0, 0);
            }
        }
    }

    rearm(&store, &policy, &settings, executed_at);
}

struct RunOutcome {
    error_count: u32,
    target: u32,
}

async fn distribute(
    store: &RunStore,
    recipients: Arc<dyn RecipientSource>,
    ledger: Arc<dyn GrantLedger>,
    run: &DistributionRun,
    policy: &RewardPolicy,
    settings: &SchedulerSettings,
) -> Result<RunOutcome> {
    let snapshot = recipients.eligible_recipients().await?;
    let target = snapshot.len() as u32;
    store.set_target_count(&run.id, target)?;

    let executed_at = run.executed_at.unwrap_or_else(Utc::now);
    let key = period_key(executed_at, run.utc_offset_minutes);
    let batch_size = settings.batch_size.max(1);

    let mut error_count = 0u32;
    let mut processed = 0u32;
    for batch in snapshot.chunks(batch_size) {
        let mut outcomes = Vec::with_capacity(batch.len());
        for recipient_id in batch {
            let outcome =
                grant_with_retry(ledger.as_ref(), recipient_id, policy, &key, settings).await;
            if !outcome.success {
                error_count += 1;
            }
            outcomes.push(outcome);
        }
        store.record_batch_progress(&run.id, &outcomes)?;
        processed += batch.len() as u32;
        tracing::debug!(
            "Run {}: {processed}/{target} recipients processed ({error_count} errors)",
            run.id
        );
    }

    let (status, summary) = if error_count == 0 {
        (RunStatus::Completed, None)
    } else {
        (
            RunStatus::Failed,
            Some(format!("{error_count} of {target} recipients failed")),
        )
    };
    store.finalize_run(&run.id, status, summary.as_deref())?;
    tracing::info!(
        "✅ Run {} finished as {status}: {}/{target} succeeded",
        run.id,
        target - error_count
    );

    Ok(RunOutcome {
        error_count,
        target,
    })
}

/// Attempt one recipient's grant with bounded retries and a fixed delay
/// between attempts. All attempts exhausted → recorded as an error; the
/// batch continues.
async fn grant_with_retry(
    ledger: &dyn GrantLedger,
    recipient_id: &str,
    policy: &RewardPolicy,
    period_key: &str,
    settings: &SchedulerSettings,
) -> RecipientOutcome {
    let attempts = settings.retry_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match ledger
            .credit(recipient_id, &policy.id, period_key, policy.amount_per_recipient)
            .await
        {
            Ok(()) => {
                return RecipientOutcome::granted(
                    recipient_id,
                    policy.amount_per_recipient,
                    Utc::now(),
                );
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_secs(settings.retry_delay_secs)).await;
                }
            }
        }
    }
    tracing::warn!(
        "Grant failed for recipient '{recipient_id}' after {attempts} attempts: {last_error}"
    );
    RecipientOutcome::failed(recipient_id, last_error, Utc::now())
}

/// Arm the next occurrence from this run's execution instant. Skipped only
/// when the operator has switched the policy's automatic distribution off
/// mid-run; a conflicting concurrent arm is a no-op.
fn rearm(
    store: &RunStore,
    policy: &RewardPolicy,
    settings: &SchedulerSettings,
    executed_at: DateTime<Utc>,
) {
    let current = match store.get_policy(&policy.id) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("Cannot re-arm policy '{}': {e}", policy.id);
            return;
        }
    };
    if !current.auto_distribution_enabled || !current.auto_distribution_active {
        tracing::info!(
            "Policy '{}' automatic distribution is off, not re-arming",
            policy.id
        );
        return;
    }

    let next = match cadence::compute_next_run(current.period, Some(executed_at), executed_at, settings)
    {
        Ok(next) => next,
        Err(e) => {
            tracing::warn!("Cannot compute next run for policy '{}': {e}", policy.id);
            return;
        }
    };
    let run = DistributionRun::scheduled(&current, next, settings);
    match store.insert_run(&run) {
        Ok(()) => {
            tracing::info!("🔁 Policy '{}' re-armed for {next}", policy.id);
        }
        Err(KudoError::RunConflict(_)) => {
            tracing::debug!("Policy '{}' already re-armed elsewhere", policy.id);
        }
        Err(e) => {
            tracing::warn!("Failed to re-arm policy '{}': {e}", policy.id);
        }
    }
}

fn notify_failure(
    settings: &SchedulerSettings,
    policy: &RewardPolicy,
    run_id: &str,
    error_count: u32,
    target: u32,
) {
    let Some(target_cfg) = settings.error_notification_target.clone() else {
        return;
    };
    let title = format!("Distribution run failed: {}", policy.name);
    let body = if error_count > 0 {
        format!("{error_count} of {target} grants failed (run {run_id})")
    } else {
        format!("Run {run_id} aborted before completion")
    };
    // Fire-and-forget: dispatch failure is logged, never affects run state.
    tokio::spawn(async move {
        if let Err(e) = notify::send(&target_cfg, &title, &body).await {
            tracing::warn!("⚠️ Error notification failed: {e}");
        }
    });
}
