//! Error types for the supervisor

use gridvisor_process::{PidFileError, ProcessError};
use thiserror::Error;

/// Supervisor errors
///
/// Only failures of the call in progress surface here. A crash of a child
/// that already finished starting is handled by the restart policy and is
/// visible through state and [`SupervisorEvent`](crate::SupervisorEvent)s.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Spawn, readiness or termination failure
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Pidfile could not be written, read or removed
    #[error("Pidfile error: {0}")]
    PidFile(#[from] PidFileError),

    /// `start()` while the instance is not stopped
    #[error("Supervisor is already running (pid: {pid:?})")]
    AlreadyRunning { pid: Option<u32> },

    /// `restart()` without a previous `start()`
    #[error("Nothing to restart: start() was never called")]
    NotStarted,
}

impl SupervisorError {
    /// Whether the error came from a stop request cutting a start short
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SupervisorError::Process(ProcessError::Cancelled))
    }
}

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Settings loading errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings: {0}")]
    Validation(String),
}

/// Result type for settings operations
pub type SettingsResult<T> = std::result::Result<T, SettingsError>;
