//! Workspace-wide error type.

use thiserror::Error;

/// Convenience alias used across all Kudo crates.
pub type Result<T> = std::result::Result<T, KudoError>;

/// All the ways Kudo can fail.
#[derive(Debug, Error)]
pub enum KudoError {
    /// Invalid configuration (bad ranges, empty working-day set, missing
    /// notification target). Rejected at the settings boundary, never
    /// allowed to reach the scheduler loop.
    #[error("Config error: {0}")]
    Config(String),

    /// Operator input that fails validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database failure (open, migrate, read, write).
    #[error("Database error: {0}")]
    Database(String),

    /// A distribution run in `scheduled`/`in_progress` already exists for
    /// the policy, or a claim lost the race. Callers usually treat this as
    /// a no-op.
    #[error("Run conflict: {0}")]
    RunConflict(String),

    /// Entity lookup miss (policy, run).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Notification dispatch failure. Best-effort: logged, never fatal.
    #[error("Notify error: {0}")]
    Notify(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
