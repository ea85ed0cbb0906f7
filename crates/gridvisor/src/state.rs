//! Supervisor lifecycle state and status notifications

use std::fmt;
use std::time::Duration;

/// Lifecycle state of a supervisor instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SupervisorState {
    /// No child, no pidfile
    #[default]
    Stopped,
    /// Spawning or waiting for the readiness trigger
    Starting,
    /// Child is up and watched
    Running,
    /// Child died unexpectedly; a relaunch is scheduled
    Restarting,
}

impl SupervisorState {
    /// Whether a new `start()` would be rejected
    pub fn is_active(&self) -> bool {
        !matches!(self, SupervisorState::Stopped)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

/// Events broadcast by a supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A child finished starting (initial start or relaunch)
    Started {
        /// Process ID
        pid: u32,
        /// Resolved process name
        name: String,
    },
    /// The child exited
    Exited {
        /// Process ID
        pid: u32,
        /// Exit code, if any
        code: Option<i32>,
        /// Terminating signal, if any
        signal: Option<i32>,
        /// `true` when caused by `stop()`
        expected: bool,
    },
    /// A relaunch was scheduled after an unexpected exit
    Restarting {
        /// Number of relaunches since the last explicit start
        attempt: u32,
        /// Delay before the relaunch
        delay: Duration,
    },
    /// A scheduled relaunch failed; the instance is stopped
    RestartFailed {
        /// Error description
        reason: String,
    },
    /// The instance reached `Stopped`
    Stopped,
}
