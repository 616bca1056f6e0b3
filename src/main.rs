//! # Kudo — Recurring Reward-Token Distribution Daemon
//!
//! Periodically grants reward tokens to eligible recipients per policy
//! cadence (weekly through yearly), honoring working-day/holiday calendars
//! and the deployment timezone.
//!
//! Usage:
//!   kudo                          # Start the scheduler daemon
//!   kudo --db-path ./kudo.db      # Custom database location
//!   kudo --tick-interval 60       # Tick every minute (default from config)

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use kudo_core::config::KudoConfig;
use kudo_scheduler::{RunStore, SchedulerEngine, spawn_scheduler};

#[derive(Parser)]
#[command(
    name = "kudo",
    version,
    about = "🏅 Kudo — recurring reward-token distribution scheduler"
)]
struct Cli {
    /// Config file path (default: ~/.kudo/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Database path (overrides config)
    #[arg(long)]
    db_path: Option<String>,

    /// Scheduler tick interval in seconds (overrides config)
    #[arg(long)]
    tick_interval: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => KudoConfig::load_from(Path::new(&expand_path(path)))?,
        None => KudoConfig::load()?,
    };
    let db_path = expand_path(cli.db_path.as_deref().unwrap_or(&config.db_path));
    let tick_interval = cli.tick_interval.unwrap_or(config.tick_interval_secs);

    tracing::info!("🏅 Kudo starting (db: {db_path}, tick: {tick_interval}s)");

    let store = Arc::new(RunStore::open(Path::new(&db_path))?);
    let settings = store.load_settings()?;
    if !settings.service_enabled {
        tracing::warn!("Distribution service is disabled in settings; ticks will be no-ops");
    }

    let engine = Arc::new(SchedulerEngine::with_store(store));
    tokio::spawn(spawn_scheduler(Arc::clone(&engine), tick_interval.max(1)));

    tokio::signal::ctrl_c().await?;
    tracing::info!("👋 Kudo shutting down");
    Ok(())
}
