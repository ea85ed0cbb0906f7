//! Process configuration

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{ProcessError, Result};

/// Configuration for spawning a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Executable command (`argv[0]`)
    pub command: String,
    /// Command arguments (`argv[1..]`)
    pub args: Vec<String>,
    /// Working directory (None = current dir)
    pub working_dir: Option<PathBuf>,
    /// Environment variables (added to parent env)
    pub env: HashMap<String, String>,
    /// Capture stdout
    pub capture_stdout: bool,
    /// Capture stderr
    pub capture_stderr: bool,
}

impl ProcessConfig {
    /// Create new process configuration
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: vec![],
            working_dir: None,
            env: HashMap::new(),
            capture_stdout: true,
            capture_stderr: true,
        }
    }

    /// Build a configuration from a full argument vector.
    ///
    /// Fails with [`ProcessError::InvalidArguments`] when `argv` is empty or
    /// its first element is blank.
    pub fn from_argv<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let command = argv
            .next()
            .ok_or_else(|| ProcessError::InvalidArguments("argument vector is empty".into()))?;
        if command.trim().is_empty() {
            return Err(ProcessError::InvalidArguments(
                "executable name is empty".into(),
            ));
        }
        Ok(Self::new(command).args(argv))
    }

    /// Full argument vector, executable first
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Enable/disable stdout capture
    pub fn capture_stdout(mut self, capture: bool) -> Self {
        self.capture_stdout = capture;
        self
    }

    /// Enable/disable stderr capture
    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }
}
