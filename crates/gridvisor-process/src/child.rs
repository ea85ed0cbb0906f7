//! Managed child process wrapper

use std::collections::HashMap;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::{debug, warn};

use crate::{
    config::ProcessConfig,
    error::{ProcessError, Result},
    liveness::ExitReport,
};

/// How long to wait for a half-started child to die after SIGKILL
const ABORT_WAIT: Duration = Duration::from_secs(2);

/// A spawned child together with the identity it was launched with.
///
/// Owns the underlying [`Child`] until it is handed to a
/// [`LivenessMonitor`](crate::LivenessMonitor) with [`ManagedChild::into_child`].
#[derive(Debug)]
pub struct ManagedChild {
    /// Underlying tokio child process
    child: Child,
    /// Process ID
    pid: u32,
    /// Resolved process name
    name: String,
    /// Configuration the process was spawned with
    config: ProcessConfig,
    /// Effective environment at spawn time
    env: HashMap<String, String>,
}

impl ManagedChild {
    pub(crate) fn new(
        child: Child,
        pid: u32,
        name: String,
        config: ProcessConfig,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            child,
            pid,
            name,
            config,
            env,
        }
    }

    /// Get process ID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Get resolved process name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full argument vector the process was started with
    pub fn argv(&self) -> Vec<String> {
        self.config.argv()
    }

    /// Snapshot of the environment the process was started with
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Check if process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Take stdout handle
    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take stderr handle
    pub fn stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the child to exit and reap it.
    ///
    /// Cancel-safe, so it can be raced against other startup conditions.
    pub async fn wait_exit(&mut self) -> ExitReport {
        let status = self.child.wait().await;
        ExitReport::from_wait(self.pid, status)
    }

    /// Kill and reap a child that never made it to running.
    pub async fn abort(mut self) -> Result<()> {
        debug!(pid = %self.pid, "Aborting half-started process");

        if let Err(e) = self.child.start_kill() {
            // InvalidInput means it was already reaped
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!(pid = %self.pid, error = %e, "Failed to kill process");
                return Err(ProcessError::KillFailed(e.to_string()));
            }
        }

        match tokio::time::timeout(ABORT_WAIT, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ProcessError::KillFailed(e.to_string())),
            Err(_) => Err(ProcessError::StopTimeout {
                pid: self.pid,
                millis: ABORT_WAIT.as_millis() as u64,
            }),
        }
    }

    /// Give up ownership of the OS child, e.g. to a liveness monitor
    pub fn into_child(self) -> Child {
        self.child
    }
}
