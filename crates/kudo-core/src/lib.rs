//! # Kudo Core
//!
//! Shared foundation for the Kudo workspace: the workspace-wide error type
//! and the configuration system (process config file + scheduler settings).

pub mod config;
pub mod error;

pub use config::{KudoConfig, NotifyTargetConfig, SchedulerSettings};
pub use error::{KudoError, Result};
