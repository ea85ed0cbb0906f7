//! Liveness monitoring of a single child process
//!
//! The monitor task owns the [`Child`] and waits on it, so exit is observed by
//! reaping rather than by probing a pid number. Signals requested through the
//! monitor are delivered from inside that task, before the child can have been
//! reaped, which keeps them from ever reaching a recycled pid.

use std::fmt;
use std::future::Future;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ProcessError, Result};
use crate::os;

/// How a watched process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Pid of the process that exited
    pub pid: u32,
    /// Exit code, if it exited normally
    pub code: Option<i32>,
    /// Terminating signal, if it was killed by one
    pub signal: Option<i32>,
}

impl ExitReport {
    pub(crate) fn from_wait(pid: u32, status: io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                pid,
                code: status.code(),
                signal: exit_signal(&status),
            },
            Err(e) => {
                warn!(pid = %pid, error = %e, "Failed to wait for process");
                Self {
                    pid,
                    code: None,
                    signal: None,
                }
            }
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "pid {} exited with code {}", self.pid, code),
            (None, Some(signal)) => write!(f, "pid {} killed by signal {}", self.pid, signal),
            (None, None) => write!(f, "pid {} exited", self.pid),
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Terminate,
    Kill,
}

/// Watches exactly one child and reports its exit once.
#[derive(Debug)]
pub struct LivenessMonitor {
    pid: u32,
    disarm: CancellationToken,
    signals: mpsc::UnboundedSender<StopSignal>,
    exit: watch::Receiver<Option<ExitReport>>,
    task: JoinHandle<()>,
}

impl LivenessMonitor {
    /// Take ownership of `child` and start watching it.
    ///
    /// `on_exit` runs once when the child exits, unless the monitor was
    /// disarmed first. The exit itself is always recorded and visible through
    /// [`LivenessMonitor::wait_exit`].
    pub fn arm<F, Fut>(child: Child, pid: u32, on_exit: F) -> Self
    where
        F: FnOnce(ExitReport) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (exit_tx, exit_rx) = watch::channel(None);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let disarm = CancellationToken::new();

        let task = tokio::spawn(watch_child(
            child,
            pid,
            signal_rx,
            exit_tx,
            disarm.clone(),
            on_exit,
        ));

        debug!(pid = %pid, "Liveness monitor armed");

        Self {
            pid,
            disarm,
            signals: signal_tx,
            exit: exit_rx,
            task,
        }
    }

    /// Pid being watched
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Suppress the exit report. Reaping continues.
    pub fn disarm(&self) {
        self.disarm.cancel();
    }

    /// Exit report, if the child already exited
    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit.borrow().clone()
    }

    /// Whether the monitor task has finished (exit seen and reported)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait up to `timeout` for the child to exit
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitReport> {
        let mut exit = self.exit.clone();
        let report = match tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await {
            Ok(Ok(report)) => report.clone(),
            Ok(Err(_)) | Err(_) => None,
        };
        report
    }

    /// Terminate the child: a graceful signal first, a forceful kill once
    /// `grace` elapses, and [`ProcessError::StopTimeout`] if it is still
    /// alive `kill_timeout` after that.
    pub async fn terminate(&self, grace: Duration, kill_timeout: Duration) -> Result<ExitReport> {
        if let Some(report) = self.exit_report() {
            return Ok(report);
        }

        let _ = self.signals.send(StopSignal::Terminate);
        if let Some(report) = self.wait_exit(grace).await {
            debug!(pid = %self.pid, "Process shut down gracefully");
            return Ok(report);
        }

        warn!(
            pid = %self.pid,
            grace_ms = grace.as_millis() as u64,
            "Process ignored terminate signal, escalating to kill"
        );
        let _ = self.signals.send(StopSignal::Kill);
        self.wait_exit(kill_timeout)
            .await
            .ok_or(ProcessError::StopTimeout {
                pid: self.pid,
                millis: kill_timeout.as_millis() as u64,
            })
    }
}

async fn watch_child<F, Fut>(
    mut child: Child,
    pid: u32,
    mut signals: mpsc::UnboundedReceiver<StopSignal>,
    exit: watch::Sender<Option<ExitReport>>,
    disarm: CancellationToken,
    on_exit: F,
) where
    F: FnOnce(ExitReport) -> Fut,
    Fut: Future<Output = ()>,
{
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = signals.recv() => deliver(&mut child, pid, signal).await,
        }
    };

    let report = ExitReport::from_wait(pid, status);
    debug!(pid = %pid, report = %report, "Watched process exited");
    exit.send_replace(Some(report.clone()));

    if disarm.is_cancelled() {
        debug!(pid = %pid, "Monitor disarmed, exit not reported");
        return;
    }
    on_exit(report).await;
}

async fn deliver(child: &mut Child, pid: u32, signal: StopSignal) {
    let result = match signal {
        StopSignal::Terminate => os::send_terminate(pid).await,
        StopSignal::Kill => child
            .start_kill()
            .map_err(|e| ProcessError::KillFailed(e.to_string())),
    };
    if let Err(e) = result {
        warn!(pid = %pid, signal = ?signal, error = %e, "Failed to signal process");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{ProcessConfig, ProcessLauncher};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    async fn spawn(argv: &[&str]) -> (Child, u32) {
        let config = ProcessConfig::from_argv(argv.iter().copied()).unwrap();
        let child = ProcessLauncher::new().spawn(config).await.unwrap();
        let pid = child.pid();
        (child.into_child(), pid)
    }

    #[tokio::test]
    async fn test_reports_exit_once() {
        let (child, pid) = spawn(&["sh", "-c", "exit 3"]).await;
        let (tx, rx) = oneshot::channel();

        let monitor = LivenessMonitor::arm(child, pid, move |report| async move {
            let _ = tx.send(report);
        });

        let report = rx.await.unwrap();
        assert_eq!(report.pid, pid);
        assert_eq!(report.code, Some(3));
        assert_eq!(monitor.exit_report(), Some(report));
    }

    #[tokio::test]
    async fn test_disarmed_monitor_does_not_report() {
        let (child, pid) = spawn(&["sleep", "10"]).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let monitor = LivenessMonitor::arm(child, pid, move |_| async move {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        monitor.disarm();

        let report = monitor
            .terminate(Duration::from_secs(2), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(report.signal, Some(libc_sigterm()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.is_finished());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let (child, pid) = spawn(&["sh", "-c", "trap '' TERM; sleep 10"]).await;
        let monitor = LivenessMonitor::arm(child, pid, |_| async {});
        monitor.disarm();

        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = monitor
            .terminate(Duration::from_millis(200), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(report.signal, Some(9));
    }

    fn libc_sigterm() -> i32 {
        nix::sys::signal::Signal::SIGTERM as i32
    }
}
