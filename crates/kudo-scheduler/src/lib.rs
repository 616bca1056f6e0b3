//! # Kudo Scheduler
//!
//! Recurring reward-token distribution: each active reward policy grants a
//! fixed token amount to every eligible recipient on a calendar-driven
//! cadence (weekly through yearly), honoring working-day/holiday calendars
//! and the deployment timezone.
//!
//! ## Architecture
//! ```text
//! Scheduler loop (tokio interval, eager first tick)
//!   ├── arm:      every active policy gets exactly one scheduled run
//!   ├── select:   due runs, permitted-day re-validated, oldest first
//!   └── dispatch: atomic claim (scheduled → in_progress), then
//!                 Executor task per run, capped by max_concurrent_runs
//!
//! Executor (per claimed run)
//!   ├── snapshot eligible recipients
//!   ├── batches of batch_size, progress persisted after every batch
//!   ├── per-recipient retry with fixed delay, errors never abort the run
//!   ├── finalize completed/failed, re-arm the next occurrence
//!   └── best-effort error notification (Telegram / webhook)
//! ```
//!
//! The run store (SQLite) is the only shared mutable state; claims and
//! progress updates are single atomic statements so two overlapping ticks
//! or two processes can never both own one run.

pub mod cadence;
pub mod calendar;
pub mod engine;
pub mod executor;
pub mod model;
pub mod notify;
pub mod service;
pub mod store;

pub use cadence::{Period, compute_next_run};
pub use engine::{SchedulerEngine, spawn_scheduler};
pub use executor::{GrantLedger, RecipientSource};
pub use model::{
    DistributionRun, RecipientCounter, RecipientOutcome, RewardPolicy, RunDetail, RunStatus,
};
pub use service::SchedulerService;
pub use store::RunStore;
