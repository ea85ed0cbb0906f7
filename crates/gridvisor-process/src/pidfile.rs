//! Pidfile store
//!
//! A pidfile holds a single text line `"<pid> <name>"` so external tooling can
//! find a running daemon without asking the supervisor. Writes go through a
//! temporary file in the same directory followed by a rename, so readers
//! never observe a partial record.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{error::ProcessError, os};

/// How often a foreign pid is re-checked while waiting for it to exit
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pidfile errors
#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pidfile not found: {path}")]
    NotFound { path: String },

    #[error("Malformed pidfile {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("Invalid pidfile record: {0}")]
    InvalidRecord(String),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Result type for pidfile operations
pub type PidFileResult<T> = Result<T, PidFileError>;

/// The `(pid, name)` pair stored in a pidfile
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PidFileRecord {
    pub pid: u32,
    pub name: String,
}

impl PidFileRecord {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
        }
    }

    fn validate(&self) -> PidFileResult<()> {
        if self.pid == 0 {
            return Err(PidFileError::InvalidRecord("pid must be positive".into()));
        }
        if self.name.is_empty() {
            return Err(PidFileError::InvalidRecord("name must not be empty".into()));
        }
        if self.name.contains(|c: char| c == '\n' || c == '\r') {
            return Err(PidFileError::InvalidRecord(
                "name must fit on one line".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for PidFileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.pid, self.name)
    }
}

impl FromStr for PidFileRecord {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s
            .strip_suffix('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .unwrap_or(s);
        let (pid, name) = line
            .split_once(' ')
            .ok_or_else(|| "expected \"<pid> <name>\"".to_string())?;
        let pid: u32 = pid
            .parse()
            .map_err(|e| format!("invalid pid {pid:?}: {e}"))?;
        let record = Self::new(pid, name);
        record.validate().map_err(|e| e.to_string())?;
        Ok(record)
    }
}

/// Atomically write `"<pid> <name>"` to `path`
pub fn write(path: impl AsRef<Path>, pid: u32, name: &str) -> PidFileResult<()> {
    let path = path.as_ref();
    let record = PidFileRecord::new(pid, name);
    record.validate()?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut temp = NamedTempFile::new_in(&dir)?;
    writeln!(temp, "{record}")?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| PidFileError::Io(e.error))?;

    debug!(path = %path.display(), pid = %pid, name = %name, "Pidfile written");
    Ok(())
}

/// Read the record stored at `path`
pub fn read(path: impl AsRef<Path>) -> PidFileResult<PidFileRecord> {
    let path = path.as_ref();
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PidFileError::NotFound {
                path: path.display().to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    content.parse().map_err(|reason| PidFileError::Malformed {
        path: path.display().to_string(),
        reason,
    })
}

/// Delete the pidfile; succeeds when it is already absent
pub fn remove(path: impl AsRef<Path>) -> PidFileResult<()> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Pidfile removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// What [`kill_recorded`] found and did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    /// No pidfile at the path
    NoPidFile,
    /// The pidfile could not be parsed; it was removed
    Malformed { reason: String },
    /// The recorded pid is not running any more
    NotRunning(PidFileRecord),
    /// The pid now belongs to a different program; left alone
    NameMismatch {
        record: PidFileRecord,
        actual: String,
    },
    /// The recorded process was terminated
    Terminated(PidFileRecord),
}

/// Stop the process recorded in a (possibly stale) pidfile and remove it.
///
/// The recorded pid is only signalled when it is alive and its current name
/// equals the recorded name, so a pid recycled by an unrelated program is
/// never touched. The process is not our child, so its exit is observed by
/// polling the process table.
pub async fn kill_recorded(
    path: impl AsRef<Path>,
    grace: Duration,
    kill_timeout: Duration,
) -> PidFileResult<KillOutcome> {
    let path = path.as_ref();
    let record = match read(path) {
        Ok(record) => record,
        Err(PidFileError::NotFound { .. }) => return Ok(KillOutcome::NoPidFile),
        Err(PidFileError::Malformed { reason, .. }) => {
            warn!(path = %path.display(), reason = %reason, "Removing malformed pidfile");
            remove(path)?;
            return Ok(KillOutcome::Malformed { reason });
        }
        Err(e) => return Err(e),
    };

    let outcome = match os::process_name(record.pid) {
        None => {
            debug!(pid = %record.pid, "Recorded process is not running");
            KillOutcome::NotRunning(record)
        }
        Some(actual) if actual != record.name => {
            warn!(
                pid = %record.pid,
                recorded = %record.name,
                actual = %actual,
                "Pid was reused by another program, not signalling it"
            );
            KillOutcome::NameMismatch { record, actual }
        }
        Some(_) => {
            terminate_foreign(&record, grace, kill_timeout).await?;
            info!(pid = %record.pid, name = %record.name, "Stopped process from stale pidfile");
            KillOutcome::Terminated(record)
        }
    };

    remove(path)?;
    Ok(outcome)
}

async fn terminate_foreign(
    record: &PidFileRecord,
    grace: Duration,
    kill_timeout: Duration,
) -> PidFileResult<()> {
    os::send_terminate(record.pid).await?;
    if wait_gone(record, grace).await {
        return Ok(());
    }

    warn!(pid = %record.pid, "Recorded process ignored terminate signal, killing");
    os::send_kill(record.pid).await?;
    if wait_gone(record, kill_timeout).await {
        return Ok(());
    }

    Err(ProcessError::StopTimeout {
        pid: record.pid,
        millis: kill_timeout.as_millis() as u64,
    }
    .into())
}

async fn wait_gone(record: &PidFileRecord, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !os::matches_identity(record.pid, &record.name) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tahoe.pid");

        write(&path, 4242, "tahoe").unwrap();
        assert_eq!(read(&path).unwrap(), PidFileRecord::new(4242, "tahoe"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242 tahoe\n");
    }

    #[test]
    fn test_name_with_spaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.pid");

        write(&path, 7, "Tahoe LAFS").unwrap();
        assert_eq!(read(&path).unwrap().name, "Tahoe LAFS");
    }

    #[test]
    fn test_overwrite_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.pid");

        write(&path, 1, "first").unwrap();
        write(&path, 2, "second").unwrap();

        assert_eq!(read(&path).unwrap(), PidFileRecord::new(2, "second"));
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_read_missing() {
        let dir = tempdir().unwrap();
        let result = read(dir.path().join("missing.pid"));
        assert!(matches!(result, Err(PidFileError::NotFound { .. })));
    }

    #[test]
    fn test_read_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.pid");

        std::fs::write(&path, "not-a-pid tahoe").unwrap();
        assert!(matches!(read(&path), Err(PidFileError::Malformed { .. })));

        std::fs::write(&path, "1234").unwrap();
        assert!(matches!(read(&path), Err(PidFileError::Malformed { .. })));
    }

    #[test]
    fn test_write_rejects_invalid_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.pid");

        assert!(matches!(write(&path, 0, "x"), Err(PidFileError::InvalidRecord(_))));
        assert!(matches!(write(&path, 1, ""), Err(PidFileError::InvalidRecord(_))));
        assert!(matches!(write(&path, 1, "a\nb"), Err(PidFileError::InvalidRecord(_))));
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.pid");

        write(&path, 10, "x").unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
        remove(&path).unwrap();
    }

    #[tokio::test]
    async fn test_kill_recorded_without_pidfile() {
        let dir = tempdir().unwrap();
        let outcome = kill_recorded(
            dir.path().join("none.pid"),
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(outcome, KillOutcome::NoPidFile);
    }

    #[tokio::test]
    async fn test_kill_recorded_removes_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.pid");
        std::fs::write(&path, "garbage").unwrap();

        let outcome = kill_recorded(&path, Duration::from_millis(100), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(outcome, KillOutcome::Malformed { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_kill_recorded_skips_reused_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reused.pid");
        let own_pid = std::process::id();
        write(&path, own_pid, "definitely-not-the-test-runner").unwrap();

        let outcome = kill_recorded(&path, Duration::from_millis(100), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(outcome, KillOutcome::NameMismatch { .. }));
        assert!(!path.exists());
    }
}
