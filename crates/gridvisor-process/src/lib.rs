//! # gridvisor-process
//!
//! **Purpose**: The building blocks gridvisor composes into a supervisor.
//!
//! ## Features
//!
//! - **Process Launching**: Async process creation from an argument vector,
//!   with stdout/stderr exposed as line streams
//! - **Readiness Detection**: One-shot signal on the first output line that
//!   contains a trigger substring
//! - **Liveness Monitoring**: Wait-for-child exit detection with
//!   SIGTERM→SIGKILL escalation
//! - **Pidfiles**: Atomic `"<pid> <name>"` records for external tooling
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use gridvisor_process::{LivenessMonitor, ProcessConfig, ProcessLauncher, ReadinessDetector};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProcessConfig::from_argv(["tahoe", "run", "node"])?;
//! let mut child = ProcessLauncher::new().spawn(config).await?;
//!
//! let stdout = child.stdout().ok_or("stdout is not piped")?;
//! ReadinessDetector::new("client running")
//!     .spawn(stdout)
//!     .wait(Duration::from_secs(30), &CancellationToken::new())
//!     .await?;
//!
//! let pid = child.pid();
//! let monitor = LivenessMonitor::arm(child.into_child(), pid, |report| async move {
//!     eprintln!("{report}");
//! });
//! monitor.disarm();
//! monitor.terminate(Duration::from_secs(5), Duration::from_secs(2)).await?;
//! # Ok(())
//! # }
//! ```

pub mod child;
pub mod config;
pub mod error;
pub mod launcher;
pub mod liveness;
pub mod os;
pub mod pidfile;
pub mod readiness;

pub use child::ManagedChild;
pub use config::ProcessConfig;
pub use error::{ProcessError, Result};
pub use launcher::ProcessLauncher;
pub use liveness::{ExitReport, LivenessMonitor};
pub use pidfile::{KillOutcome, PidFileError, PidFileRecord};
pub use readiness::{LineCollector, Readiness, ReadinessDetector};
