//! SQLite-backed run store — the only component with persistent, mutable
//! shared state.
//!
//! Every state transition on a run (claim, batch progress, finalize) is a
//! single atomic statement, so overlapping ticks or multiple processes can
//! never both own one run. The "at most one `scheduled`/`in_progress` run
//! per policy" invariant is enforced by a partial unique index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kudo_core::config::SchedulerSettings;
use kudo_core::error::{KudoError, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

use crate::cadence::Period;
use crate::executor::{GrantLedger, RecipientSource};
use crate::model::{
    DistributionRun, RecipientCounter, RecipientOutcome, RewardPolicy, RunDetail, RunStatus,
};

pub struct RunStore {
    conn: Mutex<Connection>,
}

impl RunStore {
    /// Acquire the connection, surfacing lock poisoning as a database
    /// error instead of propagating the panic.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| KudoError::Database(format!("Connection lock poisoned: {e}")))
    }

    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| KudoError::Database(format!("DB open: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS reward_policies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                auto_distribution_enabled INTEGER NOT NULL DEFAULT 0,
                auto_distribution_active INTEGER NOT NULL DEFAULT 0,
                period TEXT NOT NULL,
                amount_per_recipient INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS distribution_runs (
                id TEXT PRIMARY KEY,
                policy_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'scheduled',
                scheduled_at TEXT NOT NULL,
                executed_at TEXT,
                target_recipient_count INTEGER NOT NULL DEFAULT 0,
                processed_recipient_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                total_units_distributed INTEGER NOT NULL DEFAULT 0,
                error_summary TEXT,
                utc_offset_minutes INTEGER NOT NULL DEFAULT 0,
                working_days_only INTEGER NOT NULL DEFAULT 1,
                manual INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (policy_id) REFERENCES reward_policies(id)
            );

            -- At most one scheduled/in_progress run per policy, ever.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active_run_per_policy
                ON distribution_runs(policy_id)
                WHERE status IN ('scheduled', 'in_progress');

            CREATE INDEX IF NOT EXISTS idx_runs_status_scheduled_at
                ON distribution_runs(status, scheduled_at);

            -- Execution log: one row per recipient per run.
            CREATE TABLE IF NOT EXISTS run_outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                success INTEGER NOT NULL,
                units INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                at TEXT NOT NULL,
                FOREIGN KEY (run_id) REFERENCES distribution_runs(id)
            );
            CREATE INDEX IF NOT EXISTS idx_outcomes_run ON run_outcomes(run_id);

            -- Cumulative balance per recipient, policy, and accounting period.
            CREATE TABLE IF NOT EXISTS recipient_counters (
                recipient_id TEXT NOT NULL,
                policy_id TEXT NOT NULL,
                period_key TEXT NOT NULL,
                balance INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (recipient_id, policy_id, period_key)
            );

            CREATE TABLE IF NOT EXISTS recipients (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 1
            );

            -- Singleton settings row, JSON payload.
            CREATE TABLE IF NOT EXISTS scheduler_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| KudoError::Database(format!("Migration: {e}")))?;
        Ok(())
    }

    // ─── Policies ─────────────────────────────────────────────

    pub fn upsert_policy(&self, policy: &RewardPolicy) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO reward_policies
             (id, name, auto_distribution_enabled, auto_distribution_active, period, amount_per_recipient)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                policy.id,
                policy.name,
                policy.auto_distribution_enabled as i32,
                policy.auto_distribution_active as i32,
                policy.period.as_str(),
                policy.amount_per_recipient,
            ],
        )
        .map_err(|e| KudoError::Database(format!("Save policy: {e}")))?;
        Ok(())
    }

    pub fn get_policy(&self, id: &str) -> Result<RewardPolicy> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, auto_distribution_enabled, auto_distribution_active, period, amount_per_recipient
             FROM reward_policies WHERE id = ?1",
            [id],
            policy_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                KudoError::NotFound(format!("Policy '{id}'"))
            }
            other => KudoError::Database(format!("Get policy: {other}")),
        })
    }

    /// Policies that are both schedulable and currently armed.
    pub fn active_policies(&self) -> Result<Vec<RewardPolicy>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, auto_distribution_enabled, auto_distribution_active, period, amount_per_recipient
                 FROM reward_policies
                 WHERE auto_distribution_enabled = 1 AND auto_distribution_active = 1
                 ORDER BY id",
            )
            .map_err(|e| KudoError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], policy_from_row)
            .map_err(|e| KudoError::Database(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| KudoError::Database(format!("Row mapping: {e}")))
    }

    pub fn set_auto_distribution(&self, id: &str, active: bool) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE reward_policies SET auto_distribution_active = ?2 WHERE id = ?1",
                rusqlite::params![id, active as i32],
            )
            .map_err(|e| KudoError::Database(format!("Update policy: {e}")))?;
        if changed == 0 {
            return Err(KudoError::NotFound(format!("Policy '{id}'")));
        }
        Ok(())
    }

    // ─── Runs ─────────────────────────────────────────────────

    /// Insert a freshly created `scheduled` run. A unique-index violation
    /// means the policy already has an active run and surfaces as
    /// [`KudoError::RunConflict`].
    pub fn insert_run(&self, run: &DistributionRun) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO distribution_runs
             (id, policy_id, status, scheduled_at, executed_at,
              target_recipient_count, processed_recipient_count, success_count, error_count,
              total_units_distributed, error_summary, utc_offset_minutes, working_days_only,
              manual, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            rusqlite::params![
                run.id,
                run.policy_id,
                run.status.as_str(),
                run.scheduled_at.to_rfc3339(),
                run.executed_at.map(|t| t.to_rfc3339()),
                run.target_recipient_count,
                run.processed_recipient_count,
                run.success_count,
                run.error_count,
                run.total_units_distributed,
                run.error_summary,
                run.utc_offset_minutes,
                run.working_days_only as i32,
                run.manual as i32,
                run.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                KudoError::RunConflict(format!(
                    "Policy '{}' already has a scheduled or in-progress run",
                    run.policy_id
                ))
            }
            other => KudoError::Database(format!("Insert run: {other}")),
        })?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<DistributionRun> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM distribution_runs WHERE id = ?1"),
            [id],
            run_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => KudoError::NotFound(format!("Run '{id}'")),
            other => KudoError::Database(format!("Get run: {other}")),
        })
    }

    /// The policy's `scheduled` or `in_progress` run, if any.
    pub fn active_run(&self, policy_id: &str) -> Result<Option<DistributionRun>> {
        let conn = self.lock()?;
        let run = conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM distribution_runs
                     WHERE policy_id = ?1 AND status IN ('scheduled', 'in_progress')"
                ),
                [policy_id],
                run_from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(KudoError::Database(format!("Active run: {other}"))),
            })?;
        Ok(run)
    }

    /// All `scheduled` runs due at `now`, oldest first.
    pub fn due_runs(&self, now: DateTime<Utc>) -> Result<Vec<DistributionRun>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM distribution_runs
                 WHERE status = 'scheduled' AND scheduled_at <= ?1
                 ORDER BY scheduled_at ASC"
            ))
            .map_err(|e| KudoError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([now.to_rfc3339()], run_from_row)
            .map_err(|e| KudoError::Database(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| KudoError::Database(format!("Row mapping: {e}")))
    }

    pub fn in_progress_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM distribution_runs WHERE status = 'in_progress'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| KudoError::Database(e.to_string()))?;
        Ok(count as usize)
    }

    /// `executed_at` of the policy's most recent `completed` run.
    pub fn latest_completed_execution(&self, policy_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let executed: Option<String> = conn
            .query_row(
                "SELECT executed_at FROM distribution_runs
                 WHERE policy_id = ?1 AND status = 'completed' AND executed_at IS NOT NULL
                 ORDER BY executed_at DESC LIMIT 1",
                [policy_id],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(KudoError::Database(e_to_string(other))),
            })?;
        match executed {
            Some(s) => parse_instant(&s)
                .map(Some)
                .ok_or_else(|| KudoError::Database(format!("Bad executed_at timestamp: {s}"))),
            None => Ok(None),
        }
    }

    /// Atomically claim a run: `scheduled` → `in_progress`, stamping
    /// `executed_at`. Returns false if another claimer won (or the run was
    /// cancelled/deleted in the meantime).
    pub fn claim_run(&self, id: &str, executed_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE distribution_runs
                 SET status = 'in_progress', executed_at = ?2
                 WHERE id = ?1 AND status = 'scheduled'",
                rusqlite::params![id, executed_at.to_rfc3339()],
            )
            .map_err(|e| KudoError::Database(format!("Claim run: {e}")))?;
        Ok(changed == 1)
    }

    pub fn set_target_count(&self, id: &str, target: u32) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE distribution_runs SET target_recipient_count = ?2 WHERE id = ?1",
            rusqlite::params![id, target],
        )
        .map_err(|e| KudoError::Database(format!("Set target: {e}")))?;
        Ok(())
    }

    /// Persist one batch's progress: counters advance and execution-log
    /// rows append in a single transaction, so a crash between batches
    /// leaves an accurate partial state.
    pub fn record_batch_progress(&self, run_id: &str, outcomes: &[RecipientOutcome]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| KudoError::Database(format!("Begin progress tx: {e}")))?;

        let mut success = 0u32;
        let mut errors = 0u32;
        let mut units = 0i64;
        for outcome in outcomes {
            if outcome.success {
                success += 1;
                units += outcome.units;
            } else {
                errors += 1;
            }
            tx.execute(
                "INSERT INTO run_outcomes (run_id, recipient_id, success, units, error, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    run_id,
                    outcome.recipient_id,
                    outcome.success as i32,
                    outcome.units,
                    outcome.error,
                    outcome.at.to_rfc3339(),
                ],
            )
            .map_err(|e| KudoError::Database(format!("Append outcome: {e}")))?;
        }

        tx.execute(
            "UPDATE distribution_runs SET
                processed_recipient_count = processed_recipient_count + ?2,
                success_count = success_count + ?3,
                error_count = error_count + ?4,
                total_units_distributed = total_units_distributed + ?5
             WHERE id = ?1",
            rusqlite::params![run_id, outcomes.len() as u32, success, errors, units],
        )
        .map_err(|e| KudoError::Database(format!("Batch progress: {e}")))?;

        // Counter invariant, checked after every batch.
        let (processed, ok, err, target): (u32, u32, u32, u32) = tx
            .query_row(
                "SELECT processed_recipient_count, success_count, error_count,
                        target_recipient_count
                 FROM distribution_runs WHERE id = ?1",
                [run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(|e| KudoError::Database(format!("Progress check: {e}")))?;
        if ok + err != processed || processed > target {
            tracing::warn!(
                "Run {run_id} counter invariant violated: {ok}+{err} != {processed} (target {target})"
            );
        }

        tx.commit()
            .map_err(|e| KudoError::Database(format!("Commit progress: {e}")))?;
        Ok(())
    }

    /// Finalize an `in_progress` run as `completed` or `failed`.
    pub fn finalize_run(
        &self,
        id: &str,
        status: RunStatus,
        error_summary: Option<&str>,
    ) -> Result<()> {
        if !matches!(status, RunStatus::Completed | RunStatus::Failed) {
            return Err(KudoError::Validation(format!(
                "Cannot finalize a run as '{status}'"
            )));
        }
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE distribution_runs SET status = ?2, error_summary = ?3
                 WHERE id = ?1 AND status = 'in_progress'",
                rusqlite::params![id, status.as_str(), error_summary],
            )
            .map_err(|e| KudoError::Database(format!("Finalize run: {e}")))?;
        if changed == 0 {
            return Err(KudoError::RunConflict(format!(
                "Run '{id}' is not in progress"
            )));
        }
        Ok(())
    }

    /// Cancel a `scheduled` run. Returns false if the run was already
    /// claimed (the same atomic conditional update resolves the race).
    pub fn cancel_run(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE distribution_runs SET status = 'cancelled'
                 WHERE id = ?1 AND status = 'scheduled'",
                [id],
            )
            .map_err(|e| KudoError::Database(format!("Cancel run: {e}")))?;
        Ok(changed == 1)
    }

    /// Delete a run, but only while it is still `scheduled`.
    pub fn delete_scheduled_run(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "DELETE FROM distribution_runs WHERE id = ?1 AND status = 'scheduled'",
                [id],
            )
            .map_err(|e| KudoError::Database(format!("Delete run: {e}")))?;
        Ok(changed == 1)
    }

    /// Paginated run listing, newest scheduled first, optionally filtered
    /// by status.
    pub fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DistributionRun>> {
        let conn = self.lock()?;
        match status {
            Some(s) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {RUN_COLUMNS} FROM distribution_runs WHERE status = ?1
                         ORDER BY scheduled_at DESC LIMIT ?2 OFFSET ?3"
                    ))
                    .map_err(|e| KudoError::Database(e.to_string()))?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![s.as_str(), limit as i64, offset as i64],
                        run_from_row,
                    )
                    .map_err(|e| KudoError::Database(e.to_string()))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| KudoError::Database(format!("Row mapping: {e}")))
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {RUN_COLUMNS} FROM distribution_runs
                         ORDER BY scheduled_at DESC LIMIT ?1 OFFSET ?2"
                    ))
                    .map_err(|e| KudoError::Database(e.to_string()))?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![limit as i64, offset as i64],
                        run_from_row,
                    )
                    .map_err(|e| KudoError::Database(e.to_string()))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| KudoError::Database(format!("Row mapping: {e}")))
            }
        }
    }

    /// One run with its full execution log.
    pub fn run_detail(&self, id: &str) -> Result<RunDetail> {
        let run = self.get_run(id)?;
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT recipient_id, success, units, error, at
                 FROM run_outcomes WHERE run_id = ?1 ORDER BY id",
            )
            .map_err(|e| KudoError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([id], |row| {
                let at: String = row.get(4)?;
                Ok(RecipientOutcome {
                    recipient_id: row.get(0)?,
                    success: row.get::<_, i32>(1)? != 0,
                    units: row.get(2)?,
                    error: row.get(3)?,
                    at: instant_from_sql(4, &at)?,
                })
            })
            .map_err(|e| KudoError::Database(e.to_string()))?;
        let log = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| KudoError::Database(format!("Row mapping: {e}")))?;
        Ok(RunDetail { run, log })
    }

    // ─── Recipient counters ───────────────────────────────────

    /// Atomic read-increment-write of a recipient's period balance. The
    /// upsert serializes concurrent updates per (recipient, policy,
    /// period) key.
    pub fn add_to_counter(
        &self,
        recipient_id: &str,
        policy_id: &str,
        period_key: &str,
        amount: i64,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO recipient_counters (recipient_id, policy_id, period_key, balance)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (recipient_id, policy_id, period_key)
             DO UPDATE SET balance = balance + excluded.balance",
            rusqlite::params![recipient_id, policy_id, period_key, amount],
        )
        .map_err(|e| KudoError::Database(format!("Counter upsert: {e}")))?;
        Ok(())
    }

    /// All period balances for one recipient (the portal's "my balance"
    /// view).
    pub fn recipient_counters(&self, recipient_id: &str) -> Result<Vec<RecipientCounter>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT recipient_id, policy_id, period_key, balance
                 FROM recipient_counters WHERE recipient_id = ?1
                 ORDER BY period_key DESC, policy_id",
            )
            .map_err(|e| KudoError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([recipient_id], |row| {
                Ok(RecipientCounter {
                    recipient_id: row.get(0)?,
                    policy_id: row.get(1)?,
                    period_key: row.get(2)?,
                    balance: row.get(3)?,
                })
            })
            .map_err(|e| KudoError::Database(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| KudoError::Database(format!("Row mapping: {e}")))
    }

    pub fn counter_balance(
        &self,
        recipient_id: &str,
        policy_id: &str,
        period_key: &str,
    ) -> Result<i64> {
        let conn = self.lock()?;
        let balance: i64 = conn
            .query_row(
                "SELECT balance FROM recipient_counters
                 WHERE recipient_id = ?1 AND policy_id = ?2 AND period_key = ?3",
                rusqlite::params![recipient_id, policy_id, period_key],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(0),
                other => Err(KudoError::Database(e_to_string(other))),
            })?;
        Ok(balance)
    }

    // ─── Recipients ───────────────────────────────────────────

    pub fn upsert_recipient(&self, id: &str, name: &str, active: bool) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO recipients (id, name, active) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, name, active as i32],
        )
        .map_err(|e| KudoError::Database(format!("Save recipient: {e}")))?;
        Ok(())
    }

    pub fn active_recipient_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id FROM recipients WHERE active = 1 ORDER BY id")
            .map_err(|e| KudoError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| KudoError::Database(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| KudoError::Database(format!("Row mapping: {e}")))
    }

    // ─── Settings ─────────────────────────────────────────────

    /// Load the settings singleton, lazily seeding defaults on first
    /// access. The scheduler loop re-reads this every tick.
    pub fn load_settings(&self) -> Result<SchedulerSettings> {
        let conn = self.lock()?;
        let payload: Option<String> = conn
            .query_row("SELECT payload FROM scheduler_settings WHERE id = 1", [], |row| {
                row.get(0)
            })
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(KudoError::Database(e_to_string(other))),
            })?;
        match payload {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| KudoError::Database(format!("Settings payload: {e}"))),
            None => {
                let defaults = SchedulerSettings::default();
                let json = serde_json::to_string(&defaults)
                    .map_err(|e| KudoError::Database(format!("Settings payload: {e}")))?;
                conn.execute(
                    "INSERT OR IGNORE INTO scheduler_settings (id, payload) VALUES (1, ?1)",
                    [json],
                )
                .map_err(|e| KudoError::Database(format!("Seed settings: {e}")))?;
                Ok(defaults)
            }
        }
    }

    pub fn save_settings(&self, settings: &SchedulerSettings) -> Result<()> {
        let json = serde_json::to_string(settings)
            .map_err(|e| KudoError::Database(format!("Settings payload: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scheduler_settings (id, payload) VALUES (1, ?1)
             ON CONFLICT (id) DO UPDATE SET payload = excluded.payload",
            [json],
        )
        .map_err(|e| KudoError::Database(format!("Save settings: {e}")))?;
        Ok(())
    }
}

/// Default recipient source: the store's `recipients` table, filtered on
/// the active flag. Snapshot semantics — evaluated once at claim time.
#[async_trait]
impl RecipientSource for RunStore {
    async fn eligible_recipients(&self) -> Result<Vec<String>> {
        self.active_recipient_ids()
    }
}

#[async_trait]
impl GrantLedger for RunStore {
    async fn credit(
        &self,
        recipient_id: &str,
        policy_id: &str,
        period_key: &str,
        amount: i64,
    ) -> Result<()> {
        self.add_to_counter(recipient_id, policy_id, period_key, amount)
    }
}

const RUN_COLUMNS: &str = "id, policy_id, status, scheduled_at, executed_at, \
     target_recipient_count, processed_recipient_count, success_count, error_count, \
     total_units_distributed, error_summary, utc_offset_minutes, working_days_only, \
     manual, created_at";

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DistributionRun> {
    let status: String = row.get(2)?;
    let scheduled_at: String = row.get(3)?;
    let executed_at: Option<String> = row.get(4)?;
    let created_at: String = row.get(14)?;
    Ok(DistributionRun {
        id: row.get(0)?,
        policy_id: row.get(1)?,
        status: RunStatus::parse(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        scheduled_at: instant_from_sql(3, &scheduled_at)?,
        executed_at: executed_at
            .as_deref()
            .map(|s| instant_from_sql(4, s))
            .transpose()?,
        target_recipient_count: row.get(5)?,
        processed_recipient_count: row.get(6)?,
        success_count: row.get(7)?,
        error_count: row.get(8)?,
        total_units_distributed: row.get(9)?,
        error_summary: row.get(10)?,
        utc_offset_minutes: row.get(11)?,
        working_days_only: row.get::<_, i32>(12)? != 0,
        manual: row.get::<_, i32>(13)? != 0,
        created_at: instant_from_sql(14, &created_at)?,
    })
}

fn policy_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RewardPolicy> {
    let period: String = row.get(4)?;
    Ok(RewardPolicy {
        id: row.get(0)?,
        name: row.get(1)?,
        auto_distribution_enabled: row.get::<_, i32>(2)? != 0,
        auto_distribution_active: row.get::<_, i32>(3)? != 0,
        period: Period::parse(&period).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        amount_per_recipient: row.get(5)?,
    })
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

/// Timestamp column mapping for row callbacks: a corrupt value is a
/// conversion failure, never silently rewritten.
fn instant_from_sql(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn e_to_string(e: rusqlite::Error) -> String {
    e.to_string()
}
