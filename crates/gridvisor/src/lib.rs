//! # gridvisor
//!
//! **Purpose**: Keep a background storage-node daemon running on behalf of a
//! host application.
//!
//! A [`Supervisor`] launches the daemon, waits until it prints its readiness
//! trigger, records `"<pid> <name>"` in a pidfile, and relaunches it after a
//! delay if it dies on its own. `stop()` is the only way to make it stay down.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use gridvisor::{StartOptions, Supervisor, SupervisorConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let supervisor = Supervisor::new(
//!     SupervisorConfig::default()
//!         .with_pidfile("/var/run/tahoe-client.pid")
//!         .restart_delay(Duration::from_secs(2)),
//! );
//!
//! let (pid, name) = supervisor
//!     .start(
//!         StartOptions::new(["tahoe", "run", "client"])
//!             .started_trigger("client running")
//!             .on_stdout_line(|line| println!("tahoe: {line}")),
//!     )
//!     .await?;
//! println!("{name} is running as {pid}");
//!
//! supervisor.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod error;
pub mod logging;
pub mod options;
pub mod settings;
pub mod state;
pub mod supervisor;

pub use error::{Result, SettingsError, SupervisorError};
pub use gridvisor_process::{pidfile, ExitReport, PidFileRecord, ProcessError};
pub use options::{Hook, RestartPolicy, StartOptions};
pub use settings::{Settings, SettingsLoader, SupervisorConfig};
pub use state::{SupervisorEvent, SupervisorState};
pub use supervisor::Supervisor;
