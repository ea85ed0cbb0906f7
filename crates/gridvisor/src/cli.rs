//! Command line interface for the gridvisor binary

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use gridvisor_process::{os, pidfile, KillOutcome, PidFileError};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::{
    logging::init_logging,
    settings::{Settings, SettingsLoader},
    StartOptions, Supervisor, SupervisorEvent,
};

/// gridvisor - keep a background daemon running
#[derive(Parser, Debug)]
#[command(name = "gridvisor")]
#[command(bin_name = "gridvisor")]
#[command(about = "Supervise a background daemon: start it, watch it, restart it when it dies")]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (default: <config dir>/gridvisor/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Include targets and source locations in log lines
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a command under supervision until interrupted
    Run {
        /// Pidfile to maintain while the command runs
        #[arg(long, value_name = "PATH")]
        pidfile: Option<PathBuf>,

        /// Stdout substring that marks the command as ready
        #[arg(long, value_name = "TEXT", default_value = "")]
        trigger: String,

        /// Delay before restarting after an unexpected exit
        #[arg(long, value_name = "MS")]
        restart_delay_ms: Option<u64>,

        /// Do not restart after an unexpected exit
        #[arg(long)]
        no_restart: bool,

        /// Command and its arguments
        #[arg(last = true, required = true, value_name = "ARGV")]
        argv: Vec<String>,
    },

    /// Report whether the process recorded in a pidfile is running
    Status {
        /// Pidfile to inspect
        #[arg(long, value_name = "PATH")]
        pidfile: Option<PathBuf>,
    },

    /// Stop the process recorded in a pidfile and remove the pidfile
    Kill {
        /// Pidfile to act on
        #[arg(long, value_name = "PATH")]
        pidfile: Option<PathBuf>,
    },
}

/// Parse arguments, set up logging and run the requested command.
///
/// Returns the process exit code.
pub async fn route() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    let loader = match cli.config {
        Some(ref path) => SettingsLoader::with_path(path),
        None => SettingsLoader::new(),
    };
    let mut settings = loader
        .load()
        .with_context(|| format!("loading {}", loader.config_path().display()))?;
    if let Some(level) = cli.log_level {
        settings = settings.with_log_level(level)?;
    }
    init_logging(&settings.log_level, cli.verbose)?;

    execute(cli.command, settings).await
}

/// Run one command against loaded settings
pub async fn execute(command: Commands, mut settings: Settings) -> anyhow::Result<i32> {
    match command {
        Commands::Run {
            pidfile,
            trigger,
            restart_delay_ms,
            no_restart,
            argv,
        } => {
            if pidfile.is_some() {
                settings.pidfile = pidfile;
            }
            if let Some(delay) = restart_delay_ms {
                settings.restart_delay_ms = delay;
            }
            if no_restart {
                settings.restart_enabled = false;
            }
            run(settings, argv, trigger).await
        }
        Commands::Status { pidfile } => status(resolve_pidfile(pidfile, &settings)?),
        Commands::Kill { pidfile } => kill(resolve_pidfile(pidfile, &settings)?, &settings).await,
    }
}

fn resolve_pidfile(arg: Option<PathBuf>, settings: &Settings) -> anyhow::Result<PathBuf> {
    match arg.or_else(|| settings.pidfile.clone()) {
        Some(path) => Ok(path),
        None => bail!("no pidfile given; pass --pidfile or set pidfile in the settings file"),
    }
}

async fn run(settings: Settings, argv: Vec<String>, trigger: String) -> anyhow::Result<i32> {
    let supervisor = Supervisor::new(settings.supervisor_config());
    let mut events = supervisor.subscribe();

    let options = StartOptions::new(argv)
        .started_trigger(trigger)
        .on_stdout_line(|line| println!("{line}"))
        .on_stderr_line(|line| eprintln!("{line}"));
    let (pid, name) = supervisor.start(options).await?;
    info!(pid = %pid, name = %name, "Supervising; press Ctrl-C to stop");

    let code = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                info!("Interrupted, stopping");
                break 0;
            }
            event = events.recv() => match event {
                Ok(SupervisorEvent::RestartFailed { reason }) => {
                    warn!(reason = %reason, "Giving up on the supervised process");
                    break 1;
                }
                Ok(SupervisorEvent::Stopped) => {
                    warn!("Supervised process exited and will not be restarted");
                    break 1;
                }
                Ok(event) => info!(event = ?event, "Supervisor event"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Missed supervisor events"),
                Err(RecvError::Closed) => break 1,
            },
        }
    };

    supervisor.stop().await?;
    Ok(code)
}

fn status(path: PathBuf) -> anyhow::Result<i32> {
    match pidfile::read(&path) {
        Ok(record) if os::matches_identity(record.pid, &record.name) => {
            println!("running: {record}");
            Ok(0)
        }
        Ok(record) => {
            println!("not running (stale pidfile: {record})");
            Ok(1)
        }
        Err(PidFileError::NotFound { .. }) => {
            println!("not running");
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

async fn kill(path: PathBuf, settings: &Settings) -> anyhow::Result<i32> {
    let outcome = pidfile::kill_recorded(
        &path,
        Duration::from_millis(settings.stop_grace_period_ms),
        Duration::from_millis(settings.kill_timeout_ms),
    )
    .await?;

    match outcome {
        KillOutcome::Terminated(record) => println!("stopped {record}"),
        KillOutcome::NotRunning(record) => println!("not running; removed stale pidfile ({record})"),
        KillOutcome::NameMismatch { record, actual } => println!(
            "pid {} now belongs to {actual:?}, not {:?}; removed stale pidfile",
            record.pid, record.name
        ),
        KillOutcome::Malformed { reason } => println!("removed malformed pidfile: {reason}"),
        KillOutcome::NoPidFile => println!("no pidfile at {}", path.display()),
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "gridvisor",
            "run",
            "--pidfile",
            "/tmp/tahoe.pid",
            "--trigger",
            "client running",
            "--no-restart",
            "--",
            "tahoe",
            "run",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                pidfile,
                trigger,
                no_restart,
                argv,
                ..
            } => {
                assert_eq!(pidfile, Some(PathBuf::from("/tmp/tahoe.pid")));
                assert_eq!(trigger, "client running");
                assert!(no_restart);
                assert_eq!(argv, vec!["tahoe".to_string(), "run".to_string()]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_run_requires_argv() {
        assert!(Cli::try_parse_from(["gridvisor", "run"]).is_err());
    }

    #[test]
    fn test_status_without_pidfile_fails() {
        let result = resolve_pidfile(None, &Settings::default());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_status_of_missing_pidfile() {
        let dir = tempdir().unwrap();
        let code = execute(
            Commands::Status {
                pidfile: Some(dir.path().join("none.pid")),
            },
            Settings::default(),
        )
        .await
        .unwrap();
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn test_kill_of_missing_pidfile() {
        let dir = tempdir().unwrap();
        let code = execute(
            Commands::Kill {
                pidfile: Some(dir.path().join("none.pid")),
            },
            Settings::default(),
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
    }
}
