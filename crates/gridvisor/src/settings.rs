//! Supervisor configuration and its on-disk/environment representation

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{SettingsError, SettingsResult};

/// Environment variable prefix for settings overrides
pub const ENV_PREFIX: &str = "GRIDVISOR";

/// Per-instance supervisor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Pidfile owned by this instance (None = no pidfile)
    pub pidfile: Option<PathBuf>,
    /// Default wait between an unexpected exit and the relaunch
    pub restart_delay: Duration,
    /// Default for relaunching after unexpected exits
    pub restart_enabled: bool,
    /// Bound on waiting for the readiness trigger
    pub startup_timeout: Duration,
    /// Bound on graceful termination before a forceful kill
    pub stop_grace_period: Duration,
    /// Bound on waiting for exit after the forceful kill
    pub kill_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pidfile: None,
            restart_delay: Duration::from_secs(1),
            restart_enabled: true,
            startup_timeout: Duration::from_secs(30),
            stop_grace_period: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(2),
        }
    }
}

impl SupervisorConfig {
    /// Set pidfile path
    pub fn with_pidfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.pidfile = Some(path.into());
        self
    }

    /// Set default restart delay
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Enable/disable restarts by default
    pub fn restart_enabled(mut self, enabled: bool) -> Self {
        self.restart_enabled = enabled;
        self
    }

    /// Set startup timeout
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set stop grace period
    pub fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    /// Set kill timeout
    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }
}

/// Settings as stored in `config.toml` / `GRIDVISOR_*` variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pidfile: Option<PathBuf>,
    pub restart_delay_ms: u64,
    pub restart_enabled: bool,
    pub startup_timeout_ms: u64,
    pub stop_grace_period_ms: u64,
    pub kill_timeout_ms: u64,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = SupervisorConfig::default();
        Self {
            pidfile: defaults.pidfile,
            restart_delay_ms: defaults.restart_delay.as_millis() as u64,
            restart_enabled: defaults.restart_enabled,
            startup_timeout_ms: defaults.startup_timeout.as_millis() as u64,
            stop_grace_period_ms: defaults.stop_grace_period.as_millis() as u64,
            kill_timeout_ms: defaults.kill_timeout.as_millis() as u64,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Reject values the supervisor cannot work with
    pub fn validate(&self) -> SettingsResult<()> {
        if self.startup_timeout_ms == 0 {
            return Err(SettingsError::Validation(
                "startup_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.stop_grace_period_ms == 0 {
            return Err(SettingsError::Validation(
                "stop_grace_period_ms must be greater than 0".to_string(),
            ));
        }
        if !matches!(
            self.log_level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(SettingsError::Validation(format!(
                "unknown log_level {:?}",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Replace the log level, rejecting names the logger does not know
    pub fn with_log_level(mut self, level: impl Into<String>) -> SettingsResult<Self> {
        self.log_level = level.into();
        self.validate()?;
        Ok(self)
    }

    /// Supervisor configuration described by these settings
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            pidfile: self.pidfile.clone(),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            restart_enabled: self.restart_enabled,
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            stop_grace_period: Duration::from_millis(self.stop_grace_period_ms),
            kill_timeout: Duration::from_millis(self.kill_timeout_ms),
        }
    }
}

/// Loads [`Settings`] from a TOML file layered under environment variables
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    /// Configuration file path
    config_path: PathBuf,
    /// Environment prefix
    env_prefix: String,
}

impl SettingsLoader {
    /// Loader for the default config path
    pub fn new() -> Self {
        Self::with_path(Self::default_config_path())
    }

    /// Create with custom config path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    /// Get default config path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gridvisor")
            .join("config.toml")
    }

    /// Path the loader reads from
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load and validate settings; a missing file means defaults
    pub fn load(&self) -> SettingsResult<Settings> {
        let config = Config::builder()
            .add_source(File::from(self.config_path.clone()).required(false))
            .add_source(Environment::with_prefix(&self.env_prefix).try_parsing(true))
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Write settings back as TOML
    pub fn save(&self, settings: &Settings) -> SettingsResult<()> {
        settings.validate()?;
        let toml = toml::to_string(settings)?;
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.config_path, toml)?;
        Ok(())
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}
