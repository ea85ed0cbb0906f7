//! OS-level helpers: signal delivery and process identity lookups
//!
//! Signals are addressed by pid. For our own children this is only done while
//! the child is still unreaped, so the pid cannot have been recycled. Foreign
//! pids (read back from a pidfile) must be checked with [`matches_identity`]
//! first.

use std::path::Path;

use sysinfo::{Pid, ProcessStatus, System};
use tracing::debug;

use crate::error::{ProcessError, Result};

/// Resolve the OS-reported name of a live process
pub fn process_name(pid: u32) -> Option<String> {
    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    if !system.refresh_process(sys_pid) {
        return None;
    }
    system
        .process(sys_pid)
        .filter(|process| process.status() != ProcessStatus::Zombie)
        .map(|process| process.name().to_string())
}

/// Resolve the name of a freshly spawned child, falling back to the file
/// name of its executable.
pub fn resolve_name(pid: u32, command: &str) -> String {
    process_name(pid)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| {
            Path::new(command)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| command.to_string())
        })
}

/// Whether a pid currently belongs to a live (non-zombie) process
pub fn is_alive(pid: u32) -> bool {
    process_name(pid).is_some()
}

/// Whether `pid` is alive and still carries the expected name
pub fn matches_identity(pid: u32, expected_name: &str) -> bool {
    match process_name(pid) {
        Some(name) => name == expected_name,
        None => false,
    }
}

/// Ask a process to terminate (SIGTERM on unix)
pub async fn send_terminate(pid: u32) -> Result<()> {
    debug!(pid = %pid, "Sending terminate signal");

    #[cfg(unix)]
    {
        signal_unix(pid, nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(windows)]
    {
        taskkill(pid, false).await
    }
}

/// Forcefully kill a process (SIGKILL on unix)
pub async fn send_kill(pid: u32) -> Result<()> {
    debug!(pid = %pid, "Sending kill signal");

    #[cfg(unix)]
    {
        signal_unix(pid, nix::sys::signal::Signal::SIGKILL)
    }

    #[cfg(windows)]
    {
        taskkill(pid, true).await
    }
}

#[cfg(unix)]
fn signal_unix(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid as NixPid;

    let raw = i32::try_from(pid)
        .map_err(|_| ProcessError::KillFailed(format!("pid {pid} out of range")))?;
    if raw <= 0 {
        return Err(ProcessError::KillFailed(format!("refusing to signal pid {pid}")));
    }

    match kill(NixPid::from_raw(raw), signal) {
        Ok(()) => Ok(()),
        // Already gone
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::KillFailed(format!("{signal} to {pid}: {e}"))),
    }
}

#[cfg(windows)]
async fn taskkill(pid: u32, force: bool) -> Result<()> {
    use std::process::Stdio;
    use tokio::process::Command;

    let pid_arg = pid.to_string();
    let mut args = vec!["/pid", pid_arg.as_str(), "/t"];
    if force {
        args.push("/f");
    }

    let status = Command::new("taskkill")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| ProcessError::KillFailed(e.to_string()))?;

    if !status.success() && is_alive(pid) {
        return Err(ProcessError::KillFailed(format!(
            "taskkill exited with {status}"
        )));
    }
    Ok(())
}
