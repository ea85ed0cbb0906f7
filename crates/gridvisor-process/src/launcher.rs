//! Process launcher - turns a [`ProcessConfig`] into a running [`ManagedChild`]

use std::collections::HashMap;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::{
    child::ManagedChild,
    config::ProcessConfig,
    error::{ProcessError, Result},
    os,
};

/// Spawns OS processes with piped output
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Create new process launcher
    pub fn new() -> Self {
        Self
    }

    /// Spawn a managed process
    ///
    /// The child inherits the host environment plus `config.env`, has its
    /// stdin closed and, unless disabled, stdout/stderr piped so they can be
    /// read as line streams.
    ///
    /// # Examples
    /// ```no_run
    /// use gridvisor_process::{ProcessConfig, ProcessLauncher};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let launcher = ProcessLauncher::new();
    /// let config = ProcessConfig::from_argv(["tahoe", "run", "node"])?;
    /// let child = launcher.spawn(config).await?;
    /// println!("{} running as {}", child.name(), child.pid());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn spawn(&self, config: ProcessConfig) -> Result<ManagedChild> {
        if config.command.trim().is_empty() {
            return Err(ProcessError::InvalidArguments(
                "executable name is empty".into(),
            ));
        }

        debug!(
            command = %config.command,
            args = ?config.args,
            "Spawning process"
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(if config.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(if config.capture_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.kill_on_drop(true);

        let child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            ProcessError::SpawnFailed(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Failed to get process ID",
            ))
        })?;
        let name = os::resolve_name(pid, &config.command);
        let env = environment_snapshot(&config.env);

        info!(pid = %pid, name = %name, command = %config.command, "Process spawned");

        Ok(ManagedChild::new(child, pid, name, config, env))
    }
}

/// Host environment with the configured overrides applied
fn environment_snapshot(overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}
