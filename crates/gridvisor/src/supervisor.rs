//! Supervisor - keeps one background daemon running for a host application
//!
//! Lifecycle operations (`start`, `stop`, `restart` and scheduled relaunches)
//! are serialized per instance by an async lifecycle lock. The fields they
//! share with the liveness monitor (`pid`, `name`, state, the expected-stop
//! flag) sit behind a short synchronous mutex that is never held across an
//! await point.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use futures::FutureExt;
use gridvisor_process::{
    pidfile, ExitReport, LivenessMonitor, ManagedChild, ProcessConfig, ProcessError,
    ProcessLauncher, ReadinessDetector,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SupervisorError},
    options::{RestartPolicy, StartOptions},
    settings::SupervisorConfig,
    state::{SupervisorEvent, SupervisorState},
};

/// Capacity of the status notification channel
const EVENT_CAPACITY: usize = 64;

/// How long output written just before an early exit may take to arrive
const EXIT_OUTPUT_GRACE: Duration = Duration::from_millis(100);

/// Supervises exactly one child process.
///
/// Cheap to clone; clones share the same instance. Callers should not issue
/// `start`/`stop`/`restart` on one instance concurrently: such calls queue,
/// and a `start()` that finds the instance active is rejected.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    launcher: ProcessLauncher,
    lifecycle: tokio::sync::Mutex<()>,
    shared: Mutex<Shared>,
    events: broadcast::Sender<SupervisorEvent>,
}

#[derive(Default)]
struct Shared {
    state: SupervisorState,
    pid: Option<u32>,
    name: Option<String>,
    monitor: Option<LivenessMonitor>,
    /// Set before any terminate signal so the resulting exit is not a crash
    expected_stop: bool,
    /// Bumped per spawn attempt; stale exit reports are ignored
    generation: u64,
    restart_count: u32,
    started_at: Option<SystemTime>,
    last_options: Option<StartOptions>,
    policy: RestartPolicy,
    /// Cancelled by `stop()`; aborts pending and in-flight relaunches
    cancel: CancellationToken,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("Supervisor")
            .field("state", &shared.state)
            .field("pid", &shared.pid)
            .field("name", &shared.name)
            .field("pidfile", &self.inner.config.pidfile)
            .finish()
    }
}

impl Supervisor {
    /// Create a stopped supervisor
    pub fn new(config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                launcher: ProcessLauncher::new(),
                lifecycle: tokio::sync::Mutex::new(()),
                shared: Mutex::new(Shared::default()),
                events,
            }),
        }
    }

    /// Instance configuration
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Pidfile owned by this instance
    pub fn pidfile(&self) -> Option<&Path> {
        self.inner.config.pidfile.as_deref()
    }

    /// Pid of the supervised child, while starting (post-spawn) or running
    pub fn pid(&self) -> Option<u32> {
        self.inner.shared.lock().pid
    }

    /// Resolved name of the supervised child
    pub fn name(&self) -> Option<String> {
        self.inner.shared.lock().name.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SupervisorState {
        self.inner.shared.lock().state
    }

    /// Whether the child is up and watched
    pub fn is_running(&self) -> bool {
        self.state() == SupervisorState::Running
    }

    /// Relaunches since the last explicit start
    pub fn restart_count(&self) -> u32 {
        self.inner.shared.lock().restart_count
    }

    /// When the current child finished starting
    pub fn started_at(&self) -> Option<SystemTime> {
        self.inner.shared.lock().started_at
    }

    /// Subscribe to status notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Launch the child and wait until it is ready.
    ///
    /// A stale pidfile left by a previous run of the host is cleared with
    /// [`Supervisor::stop`] first. Returns the child's pid and name.
    pub async fn start(&self, options: StartOptions) -> Result<(u32, String)> {
        let config = options.process_config()?;

        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let shared = self.inner.shared.lock();
            if shared.state.is_active() {
                return Err(SupervisorError::AlreadyRunning { pid: shared.pid });
            }
        }

        if let Some(path) = self.pidfile() {
            if path.exists() {
                info!(path = %path.display(), "Found pidfile from a previous run, stopping it first");
                self.inner.stop_locked().await?;
            }
        }

        let cancel = CancellationToken::new();
        {
            let mut shared = self.inner.shared.lock();
            shared.policy = options.restart_policy(&self.inner.config);
            shared.last_options = Some(options.clone());
            shared.cancel = cancel.clone();
            shared.restart_count = 0;
        }

        Inner::launch(&self.inner, &options, config, &cancel).await
    }

    /// Stop the child and clear pid, name and pidfile. Idempotent.
    ///
    /// Cancels any scheduled relaunch, sends a terminate signal, waits up to
    /// the grace period and escalates to a forceful kill.
    pub async fn stop(&self) -> Result<()> {
        self.inner.cancel_pending();
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.stop_locked().await
    }

    /// Stop, then start again with the options of the most recent `start()`
    pub async fn restart(&self) -> Result<(u32, String)> {
        self.inner.cancel_pending();
        let _lifecycle = self.inner.lifecycle.lock().await;

        let options = self
            .inner
            .shared
            .lock()
            .last_options
            .clone()
            .ok_or(SupervisorError::NotStarted)?;
        let config = options.process_config()?;

        self.inner.stop_locked().await?;

        let cancel = CancellationToken::new();
        {
            let mut shared = self.inner.shared.lock();
            shared.cancel = cancel.clone();
            shared.restart_count = 0;
        }
        Inner::launch(&self.inner, &options, config, &cancel).await
    }
}

impl Inner {
    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn cancel_pending(&self) {
        self.shared.lock().cancel.cancel();
    }

    fn remove_pidfile(&self) -> Result<()> {
        if let Some(path) = self.config.pidfile.as_deref() {
            pidfile::remove(path)?;
        }
        Ok(())
    }

    fn clear_to_stopped(&self) -> bool {
        let mut shared = self.shared.lock();
        let was_active = shared.state.is_active();
        shared.state = SupervisorState::Stopped;
        shared.pid = None;
        shared.name = None;
        shared.started_at = None;
        shared.monitor = None;
        was_active
    }

    /// One spawn attempt: hook, spawn, readiness, pidfile, hook, monitor.
    async fn launch(
        inner: &Arc<Inner>,
        options: &StartOptions,
        config: ProcessConfig,
        cancel: &CancellationToken,
    ) -> Result<(u32, String)> {
        let generation = {
            let mut shared = inner.shared.lock();
            shared.state = SupervisorState::Starting;
            shared.expected_stop = false;
            shared.generation += 1;
            shared.generation
        };

        if let Some(hook) = options.call_before_start.as_ref() {
            hook();
        }

        if cancel.is_cancelled() {
            inner.clear_to_stopped();
            return Err(ProcessError::Cancelled.into());
        }

        let mut child = match inner.launcher.spawn(config).await {
            Ok(child) => child,
            Err(e) => {
                error!(args = ?options.args, error = %e, "Failed to spawn process");
                inner.clear_to_stopped();
                return Err(e.into());
            }
        };
        let pid = child.pid();
        let name = child.name().to_string();
        {
            let mut shared = inner.shared.lock();
            shared.pid = Some(pid);
            shared.name = Some(name.clone());
        }

        if let Err(e) = inner.bring_up(&mut child, options, cancel).await {
            if !e.is_cancelled() {
                error!(pid = %pid, error = %e, "Process failed to start");
            }
            if let Err(abort_err) = child.abort().await {
                warn!(pid = %pid, error = %abort_err, "Failed to kill half-started process");
            }
            inner.clear_to_stopped();
            if let Err(remove_err) = inner.remove_pidfile() {
                warn!(error = %remove_err, "Failed to remove pidfile");
            }
            return Err(e);
        }

        {
            let mut shared = inner.shared.lock();
            shared.state = SupervisorState::Running;
            shared.started_at = Some(SystemTime::now());
        }

        if let Some(hook) = options.call_after_start.as_ref() {
            hook();
        }

        info!(pid = %pid, name = %name, "Process started");
        {
            // Armed under the lock so an immediate exit cannot be handled
            // (or announced) before the monitor is recorded
            let mut shared = inner.shared.lock();
            inner.emit(SupervisorEvent::Started {
                pid,
                name: name.clone(),
            });
            let weak = Arc::downgrade(inner);
            let monitor = LivenessMonitor::arm(child.into_child(), pid, move |report| {
                on_exit(weak, generation, report)
            });
            shared.monitor = Some(monitor);
        }
        Ok((pid, name))
    }

    /// Wire up output streams, wait for readiness and record the pidfile
    async fn bring_up(
        &self,
        child: &mut ManagedChild,
        options: &StartOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(stderr) = child.stderr() {
            ReadinessDetector::forwarder("stderr")
                .with_collector(options.stderr_line_collector.clone())
                .spawn(stderr);
        }

        let mut readiness = match child.stdout() {
            Some(stdout) => ReadinessDetector::new(options.started_trigger.clone())
                .with_collector(options.stdout_line_collector.clone())
                .spawn(stdout),
            None => {
                return Err(ProcessError::ExitedBeforeReady {
                    status: "stdout not captured".into(),
                }
                .into())
            }
        };

        if !readiness.is_immediate() {
            debug!(pid = %child.pid(), trigger = %options.started_trigger, "Waiting for readiness trigger");
        }
        let exited = tokio::select! {
            biased;
            ready = readiness.wait(self.config.startup_timeout, cancel) => {
                ready?;
                None
            }
            report = child.wait_exit() => Some(report),
        };
        if let Some(report) = exited {
            if !readiness.seen_within(EXIT_OUTPUT_GRACE).await {
                return Err(ProcessError::ExitedBeforeReady {
                    status: report.to_string(),
                }
                .into());
            }
            debug!(report = %report, "Process exited right after its trigger");
        }

        if let Some(path) = self.config.pidfile.as_deref() {
            pidfile::write(path, child.pid(), child.name())?;
        }
        Ok(())
    }

    /// Stop with the lifecycle lock already held
    async fn stop_locked(&self) -> Result<()> {
        let monitor = {
            let mut shared = self.shared.lock();
            shared.expected_stop = true;
            shared.cancel.cancel();
            shared.monitor.take()
        };

        let mut result = Ok(());
        if let Some(monitor) = monitor {
            monitor.disarm();
            match monitor
                .terminate(self.config.stop_grace_period, self.config.kill_timeout)
                .await
            {
                Ok(report) => {
                    info!(report = %report, "Process stopped");
                    self.emit(SupervisorEvent::Exited {
                        pid: report.pid,
                        code: report.code,
                        signal: report.signal,
                        expected: true,
                    });
                }
                Err(e) => {
                    error!(pid = %monitor.pid(), error = %e, "Failed to stop process");
                    result = Err(e.into());
                }
            }
        } else if let Some(path) = self.config.pidfile.as_deref() {
            let outcome = pidfile::kill_recorded(
                path,
                self.config.stop_grace_period,
                self.config.kill_timeout,
            )
            .await;
            match outcome {
                Ok(outcome) => debug!(outcome = ?outcome, "Checked pidfile for a running process"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stop recorded process");
                    result = Err(e.into());
                }
            }
        }

        let was_active = self.clear_to_stopped();
        self.remove_pidfile()?;
        if was_active {
            self.emit(SupervisorEvent::Stopped);
        }
        result
    }
}

/// Exit callback handed to the liveness monitor.
///
/// Returns a boxed future: it relaunches through [`Inner::launch`], which in
/// turn arms a monitor with this callback.
fn on_exit(inner: Weak<Inner>, generation: u64, report: ExitReport) -> BoxFuture<'static, ()> {
    async move {
        if let Some(inner) = inner.upgrade() {
            handle_exit(inner, generation, report).await;
        }
    }
    .boxed()
}

async fn handle_exit(inner: Arc<Inner>, generation: u64, report: ExitReport) {
    let (policy, cancel, attempt) = {
        let mut shared = inner.shared.lock();
        if shared.generation != generation
            || shared.expected_stop
            || shared.state != SupervisorState::Running
        {
            debug!(report = %report, "Exit was expected, not restarting");
            return;
        }

        warn!(report = %report, "Process exited unexpectedly");
        shared.pid = None;
        shared.name = None;
        shared.started_at = None;
        shared.monitor = None;
        if shared.policy.enabled {
            shared.state = SupervisorState::Restarting;
            shared.restart_count += 1;
        } else {
            shared.state = SupervisorState::Stopped;
        }
        (shared.policy, shared.cancel.clone(), shared.restart_count)
    };

    if let Err(e) = inner.remove_pidfile() {
        warn!(error = %e, "Failed to remove pidfile");
    }
    inner.emit(SupervisorEvent::Exited {
        pid: report.pid,
        code: report.code,
        signal: report.signal,
        expected: false,
    });

    if !policy.enabled {
        inner.emit(SupervisorEvent::Stopped);
        return;
    }

    info!(
        attempt,
        delay_ms = policy.delay.as_millis() as u64,
        "Scheduling restart"
    );
    inner.emit(SupervisorEvent::Restarting {
        attempt,
        delay: policy.delay,
    });

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Pending restart cancelled");
            return;
        }
        _ = tokio::time::sleep(policy.delay) => {}
    }

    let _lifecycle = inner.lifecycle.lock().await;
    let options = {
        let shared = inner.shared.lock();
        if cancel.is_cancelled() || shared.state != SupervisorState::Restarting {
            debug!("Restart no longer wanted");
            return;
        }
        shared.last_options.clone()
    };
    let Some(options) = options else {
        inner.clear_to_stopped();
        return;
    };

    let result = match options.process_config() {
        Ok(config) => Inner::launch(&inner, &options, config, &cancel).await,
        Err(e) => {
            inner.clear_to_stopped();
            Err(e.into())
        }
    };

    match result {
        Ok((pid, name)) => info!(pid = %pid, name = %name, attempt, "Process restarted"),
        Err(e) if e.is_cancelled() => debug!("Restart cancelled by stop"),
        Err(e) => {
            error!(error = %e, attempt, "Restart failed, giving up");
            inner.emit(SupervisorEvent::RestartFailed {
                reason: e.to_string(),
            });
            inner.emit(SupervisorEvent::Stopped);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn quick_config() -> SupervisorConfig {
        SupervisorConfig::default()
            .restart_delay(Duration::ZERO)
            .startup_timeout(Duration::from_secs(5))
            .stop_grace_period(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_start_sets_pid_and_name() {
        let supervisor = Supervisor::new(quick_config());
        let (pid, name) = supervisor
            .start(StartOptions::new(["sleep", "5"]))
            .await
            .unwrap();

        assert!(pid > 0);
        assert_eq!(supervisor.pid(), Some(pid));
        assert_eq!(supervisor.name(), Some(name));
        assert!(supervisor.is_running());
        assert!(supervisor.started_at().is_some());

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.pid(), None);
        assert_eq!(supervisor.name(), None);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let supervisor = Supervisor::new(quick_config());
        supervisor
            .start(StartOptions::new(["sleep", "5"]))
            .await
            .unwrap();

        let result = supervisor.start(StartOptions::new(["sleep", "5"])).await;
        assert!(matches!(result, Err(SupervisorError::AlreadyRunning { .. })));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempdir().unwrap();
        let pidfile = dir.path().join("sleep.pid");
        let supervisor = Supervisor::new(quick_config().with_pidfile(&pidfile));

        supervisor.stop().await.unwrap();
        supervisor
            .start(StartOptions::new(["sleep", "5"]))
            .await
            .unwrap();
        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();

        assert_eq!(supervisor.pid(), None);
        assert!(!pidfile.exists());
    }

    #[tokio::test]
    async fn test_restart_without_start() {
        let supervisor = Supervisor::new(quick_config());
        let result = supervisor.restart().await;
        assert!(matches!(result, Err(SupervisorError::NotStarted)));
    }

    #[tokio::test]
    async fn test_restart_replays_last_options() {
        let supervisor = Supervisor::new(quick_config());
        let spawns = Arc::new(AtomicUsize::new(0));
        let counter = spawns.clone();

        let (first, _) = supervisor
            .start(StartOptions::new(["sleep", "5"]).before_start(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        let (second, _) = supervisor.restart().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(spawns.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.pid(), Some(second));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_stopped() {
        let supervisor = Supervisor::new(quick_config());
        let result = supervisor
            .start(StartOptions::new(["/nonexistent/gridvisor-daemon"]))
            .await;

        assert!(matches!(
            result,
            Err(SupervisorError::Process(ProcessError::SpawnFailed(_)))
        ));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert_eq!(supervisor.pid(), None);
    }
}
