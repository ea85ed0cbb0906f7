//! Error types for process management

use std::io;
use thiserror::Error;

/// Process management errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Argument vector was empty or otherwise unusable
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The OS could not create the process
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[from] io::Error),

    /// Trigger line was not seen in time
    #[error("Process did not become ready within {millis}ms")]
    StartupTimeout { millis: u64 },

    /// The process exited before the trigger line was seen
    #[error("Process exited before becoming ready ({status})")]
    ExitedBeforeReady { status: String },

    /// Process survived both terminate and kill
    #[error("Process {pid} did not exit within {millis}ms after SIGKILL")]
    StopTimeout { pid: u32, millis: u64 },

    /// Failed to deliver a signal
    #[error("Failed to kill process: {0}")]
    KillFailed(String),

    /// Startup was abandoned because the owner asked to stop
    #[error("Process startup cancelled")]
    Cancelled,
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
