//! Start options: argument vector, readiness trigger, hooks and restart policy

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gridvisor_process::{LineCollector, ProcessConfig, ProcessError};

use crate::settings::SupervisorConfig;

/// Callback run around each spawn attempt
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Whether and when an unexpectedly exited child is relaunched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestartPolicy {
    /// Wait between the exit and the relaunch
    pub delay: Duration,
    /// Relaunch at all
    pub enabled: bool,
}

/// Everything `start()` needs to launch and relaunch a child.
///
/// Captured by the supervisor so that auto-restarts and `restart()` replay
/// the same launch.
#[derive(Clone, Default)]
pub struct StartOptions {
    /// Full argument vector, executable first
    pub args: Vec<String>,
    /// Substring of a stdout line that marks the child ready; empty = ready on spawn
    pub started_trigger: String,
    /// Receives every stdout line
    pub stdout_line_collector: Option<LineCollector>,
    /// Receives every stderr line
    pub stderr_line_collector: Option<LineCollector>,
    /// Runs before every spawn attempt
    pub call_before_start: Option<Hook>,
    /// Runs after every successful start, once the pidfile is written
    pub call_after_start: Option<Hook>,
    /// Overrides the configured restart delay
    pub restart_delay: Option<Duration>,
    /// Overrides whether restarts are enabled
    pub restart_enabled: Option<bool>,
    /// Extra environment variables on top of the host environment
    pub env: HashMap<String, String>,
    /// Working directory for the child
    pub working_dir: Option<PathBuf>,
}

impl fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartOptions")
            .field("args", &self.args)
            .field("started_trigger", &self.started_trigger)
            .field("stdout_line_collector", &self.stdout_line_collector.is_some())
            .field("stderr_line_collector", &self.stderr_line_collector.is_some())
            .field("call_before_start", &self.call_before_start.is_some())
            .field("call_after_start", &self.call_after_start.is_some())
            .field("restart_delay", &self.restart_delay)
            .field("restart_enabled", &self.restart_enabled)
            .field("env", &self.env)
            .field("working_dir", &self.working_dir)
            .finish()
    }
}

impl StartOptions {
    /// Options for launching `args`
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Wait for a stdout line containing `trigger` before reporting success
    pub fn started_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.started_trigger = trigger.into();
        self
    }

    /// Forward stdout lines to `collector`
    pub fn on_stdout_line<F>(mut self, collector: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.stdout_line_collector = Some(Arc::new(collector));
        self
    }

    /// Forward stderr lines to `collector`
    pub fn on_stderr_line<F>(mut self, collector: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.stderr_line_collector = Some(Arc::new(collector));
        self
    }

    /// Run `hook` before every spawn attempt
    pub fn before_start<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.call_before_start = Some(Arc::new(hook));
        self
    }

    /// Run `hook` after every successful start
    pub fn after_start<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.call_after_start = Some(Arc::new(hook));
        self
    }

    /// Set restart delay
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = Some(delay);
        self
    }

    /// Enable/disable automatic restarts
    pub fn restart_enabled(mut self, enabled: bool) -> Self {
        self.restart_enabled = Some(enabled);
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Restart policy for this start, falling back to the instance defaults
    pub fn restart_policy(&self, defaults: &SupervisorConfig) -> RestartPolicy {
        RestartPolicy {
            delay: self.restart_delay.unwrap_or(defaults.restart_delay),
            enabled: self.restart_enabled.unwrap_or(defaults.restart_enabled),
        }
    }

    /// Process configuration for one spawn attempt
    pub fn process_config(&self) -> Result<ProcessConfig, ProcessError> {
        let mut config = ProcessConfig::from_argv(self.args.iter().cloned())?;
        config.env = self.env.clone();
        config.working_dir = self.working_dir.clone();
        Ok(config)
    }
}
