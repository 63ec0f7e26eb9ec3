//! Lifecycle of the local inference daemon.
//!
//! The supervisor only ever terminates a daemon it spawned itself. A daemon that was already
//! reachable before [`ServiceSupervisor::start`] ran is reported as
//! [`ServiceStatus::AlreadyRunning`] and left alone for the rest of the session. Dropping a
//! [`DaemonHandle`] that is still running, including one abandoned mid-startup, kills the
//! daemon's process group.

use super::probe::LivenessProbe;
use super::signals::{self, Delivery};
use serde::Serialize;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Result of a [`ServiceSupervisor::start`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// A daemon was already reachable; this supervisor does not own it.
    AlreadyRunning,
    /// This supervisor spawned the daemon and it became reachable.
    Started,
    /// The daemon executable could not be located.
    NotFound,
    /// Spawning failed or the daemon never became reachable.
    FailedToStart,
}

impl ServiceStatus {
    /// Whether the daemon is usable after this status.
    pub fn is_available(self) -> bool {
        matches!(self, Self::AlreadyRunning | Self::Started)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::AlreadyRunning => "already_running",
            Self::Started => "started",
            Self::NotFound => "not_found",
            Self::FailedToStart => "failed_to_start",
        };
        f.write_str(text)
    }
}

/// Reasons a daemon could not be brought up.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The executable is not installed or not on `PATH`.
    #[error("daemon executable '{0}' not found")]
    NotInstalled(String),
    /// The spawned process never became reachable.
    #[error("daemon did not become reachable within {0:?}")]
    StartTimeout(Duration),
    /// The spawned process exited before becoming reachable.
    #[error("daemon exited during startup with {0}")]
    ExitedEarly(ExitStatus),
    /// Spawning failed for another reason.
    #[error("failed to spawn daemon: {0}")]
    Spawn(#[source] io::Error),
}

impl From<&DaemonError> for ServiceStatus {
    fn from(error: &DaemonError) -> Self {
        match error {
            DaemonError::NotInstalled(_) => ServiceStatus::NotFound,
            _ => ServiceStatus::FailedToStart,
        }
    }
}

/// Timing and command settings for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Timeout of the initial liveness probe.
    pub probe_timeout: Duration,
    /// Delay between readiness probes after spawning.
    pub poll_interval: Duration,
    /// Total time a spawned daemon may take to become reachable.
    pub startup_window: Duration,
    /// Wait between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            command: "ollama".into(),
            args: vec!["serve".into()],
            probe_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            startup_window: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// A daemon process spawned (and therefore owned) by a supervisor.
#[derive(Debug)]
pub struct DaemonHandle {
    child: Child,
    pid: u32,
    launched_at: OffsetDateTime,
}

impl DaemonHandle {
    fn new(child: Child) -> io::Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned daemon has no pid"))?;
        Ok(Self {
            child,
            pid,
            launched_at: OffsetDateTime::now_utc(),
        })
    }

    /// OS process identifier.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// When the process was spawned.
    pub fn launched_at(&self) -> OffsetDateTime {
        self.launched_at
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        if self.exit_status().is_some() {
            return;
        }
        tracing::warn!(pid = self.pid, "Owned daemon dropped while running; killing it");
        if let Err(error) = signals::kill_tree(self.pid) {
            tracing::debug!(error = %error, "Process-group kill failed");
        }
        let _ = self.child.start_kill();
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited.
    AlreadyExited,
    /// The process exited after SIGTERM.
    Graceful,
    /// The process group was killed after the grace period.
    Forced,
}

/// Starts, probes and stops the local inference daemon.
pub struct ServiceSupervisor {
    probe: Arc<dyn LivenessProbe>,
    settings: SupervisorSettings,
    handle: Mutex<Option<DaemonHandle>>,
}

impl ServiceSupervisor {
    /// Create a supervisor that has not started anything yet.
    pub fn new(probe: Arc<dyn LivenessProbe>, settings: SupervisorSettings) -> Self {
        Self {
            probe,
            settings,
            handle: Mutex::new(None),
        }
    }

    /// Make sure a daemon is reachable, spawning one when necessary.
    ///
    /// The handle lock is held for the whole call, so a concurrent [`stop`](Self::stop) or
    /// [`owns_daemon`](Self::owns_daemon) waits until startup settles, at most the initial probe
    /// timeout plus the startup window.
    pub async fn start(&self) -> ServiceStatus {
        let mut slot = self.handle.lock().await;

        if self.probe.probe(self.settings.probe_timeout).await {
            tracing::info!("Inference daemon already running");
            return ServiceStatus::AlreadyRunning;
        }

        let previous = slot.take().and_then(|mut handle| match handle.exit_status() {
            None => Some(handle),
            Some(status) => {
                tracing::warn!(pid = handle.pid(), %status, "Previously spawned daemon has exited");
                None
            }
        });

        let handle = match previous {
            Some(handle) => {
                tracing::info!(pid = handle.pid(), "Re-checking previously spawned daemon");
                handle
            }
            None => match self.spawn() {
                Ok(handle) => handle,
                Err(error) => {
                    let status = ServiceStatus::from(&error);
                    tracing::error!(error = %error, %status, "Failed to spawn inference daemon");
                    return status;
                }
            },
        };

        match self.wait_until_ready(handle).await {
            Ok(handle) => {
                tracing::info!(pid = handle.pid(), "Inference daemon started");
                *slot = Some(handle);
                ServiceStatus::Started
            }
            Err(error) => {
                tracing::error!(error = %error, "Inference daemon failed to start");
                ServiceStatus::from(&error)
            }
        }
    }

    /// Stop the daemon if, and only if, this supervisor spawned it.
    pub async fn stop(&self) {
        let Some(handle) = self.handle.lock().await.take() else {
            tracing::debug!("No owned daemon to stop");
            return;
        };
        let pid = handle.pid();
        let termination = terminate(handle, self.settings.stop_grace).await;
        tracing::info!(pid, ?termination, "Inference daemon stopped");
    }

    /// Run the liveness probe without touching the process.
    pub async fn is_healthy(&self) -> bool {
        self.probe.probe(self.settings.probe_timeout).await
    }

    /// Whether this supervisor currently owns a spawned daemon.
    pub async fn owns_daemon(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Process id of the owned daemon, if any.
    pub async fn daemon_pid(&self) -> Option<u32> {
        self.handle.lock().await.as_ref().map(DaemonHandle::pid)
    }

    fn spawn(&self) -> Result<DaemonHandle, DaemonError> {
        let mut command = std::process::Command::new(&self.settings.command);
        command
            .args(&self.settings.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut command = Command::from(command);
        command.kill_on_drop(true);

        let child = command.spawn().map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => DaemonError::NotInstalled(self.settings.command.clone()),
            _ => DaemonError::Spawn(error),
        })?;
        let handle = DaemonHandle::new(child).map_err(DaemonError::Spawn)?;
        tracing::info!(
            pid = handle.pid(),
            command = %self.settings.command,
            "Spawned inference daemon"
        );
        Ok(handle)
    }

    async fn wait_until_ready(&self, mut handle: DaemonHandle) -> Result<DaemonHandle, DaemonError> {
        let interval = self.settings.poll_interval.max(Duration::from_millis(10));
        let deadline = Instant::now() + self.settings.startup_window;
        let mut attempt = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(interval.min(remaining)).await;
            if let Some(status) = handle.exit_status() {
                return Err(DaemonError::ExitedEarly(status));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            attempt += 1;
            let probe_timeout = interval.min(self.settings.probe_timeout).min(remaining);
            let probe = self.probe.probe(probe_timeout);
            if let Ok(true) = tokio::time::timeout(remaining, probe).await {
                tracing::debug!(attempt, "Daemon answered readiness probe");
                return Ok(handle);
            }
        }

        let termination = terminate(handle, self.settings.stop_grace).await;
        tracing::warn!(?termination, "Terminated unresponsive daemon");
        Err(DaemonError::StartTimeout(self.settings.startup_window))
    }
}

/// Graceful-then-forced termination of an owned daemon. Never fails; problems are logged.
async fn terminate(mut handle: DaemonHandle, grace: Duration) -> Termination {
    if handle.exit_status().is_some() {
        return Termination::AlreadyExited;
    }

    match signals::terminate(handle.pid()) {
        Ok(Delivery::Gone) => {
            let _ = handle.child.wait().await;
            return Termination::AlreadyExited;
        }
        Ok(Delivery::Sent) => {
            if let Ok(Ok(status)) = tokio::time::timeout(grace, handle.child.wait()).await {
                tracing::debug!(pid = handle.pid(), %status, "Daemon exited after SIGTERM");
                return Termination::Graceful;
            }
            tracing::warn!(
                pid = handle.pid(),
                grace_ms = grace.as_millis() as u64,
                "Daemon ignored SIGTERM; escalating"
            );
        }
        Err(error) => {
            tracing::warn!(pid = handle.pid(), error = %error, "SIGTERM failed; escalating");
        }
    }

    if let Err(error) = signals::kill_tree(handle.pid()) {
        tracing::warn!(pid = handle.pid(), error = %error, "Process-group kill failed");
    }
    if let Err(error) = handle.child.kill().await {
        tracing::debug!(pid = handle.pid(), error = %error, "Child kill reported an error");
    }
    Termination::Forced
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Probe that reports dead for the first `dead_for` calls, then alive forever.
    struct ScriptedProbe {
        calls: AtomicUsize,
        dead_for: usize,
    }

    impl ScriptedProbe {
        fn alive_after(dead_for: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                dead_for,
            })
        }
    }

    #[async_trait::async_trait]
    impl LivenessProbe for ScriptedProbe {
        async fn probe(&self, _timeout: Duration) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) >= self.dead_for
        }
    }

    struct FixedProbe(AtomicBool);

    #[async_trait::async_trait]
    impl LivenessProbe for FixedProbe {
        async fn probe(&self, _timeout: Duration) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn settings(command: &str, args: &[&str]) -> SupervisorSettings {
        SupervisorSettings {
            command: command.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            probe_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(50),
            startup_window: Duration::from_millis(500),
            stop_grace: Duration::from_secs(2),
        }
    }

    fn process_exists(pid: u32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[tokio::test]
    async fn reports_already_running_without_owning() {
        let supervisor = ServiceSupervisor::new(
            Arc::new(FixedProbe(AtomicBool::new(true))),
            settings("sleep", &["30"]),
        );
        assert_eq!(supervisor.start().await, ServiceStatus::AlreadyRunning);
        assert!(!supervisor.owns_daemon().await);
    }

    #[tokio::test]
    async fn stop_leaves_foreign_daemon_running() {
        let mut foreign = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn foreign daemon");
        let supervisor = ServiceSupervisor::new(
            Arc::new(FixedProbe(AtomicBool::new(true))),
            settings("sleep", &["30"]),
        );

        assert_eq!(supervisor.start().await, ServiceStatus::AlreadyRunning);
        supervisor.stop().await;

        assert!(foreign.try_wait().expect("try_wait").is_none());
        foreign.kill().expect("kill foreign");
        foreign.wait().expect("reap foreign");
    }

    #[tokio::test]
    async fn missing_executable_reports_not_found() {
        let supervisor = ServiceSupervisor::new(
            Arc::new(FixedProbe(AtomicBool::new(false))),
            settings("rustydoc-no-such-daemon-binary", &["serve"]),
        );
        assert_eq!(supervisor.start().await, ServiceStatus::NotFound);
        assert!(!supervisor.owns_daemon().await);
    }

    #[tokio::test]
    async fn spawned_daemon_reports_started_and_is_owned() {
        let supervisor =
            ServiceSupervisor::new(ScriptedProbe::alive_after(2), settings("sleep", &["30"]));

        assert_eq!(supervisor.start().await, ServiceStatus::Started);
        let pid = supervisor.daemon_pid().await.expect("owned pid");
        assert!(process_exists(pid));

        supervisor.stop().await;
        assert!(!supervisor.owns_daemon().await);
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn repeated_stop_is_a_no_op() {
        let supervisor =
            ServiceSupervisor::new(ScriptedProbe::alive_after(1), settings("sleep", &["30"]));
        assert_eq!(supervisor.start().await, ServiceStatus::Started);

        supervisor.stop().await;
        supervisor.stop().await;
        supervisor.stop().await;
        assert!(supervisor.daemon_pid().await.is_none());
    }

    #[tokio::test]
    async fn unresponsive_daemon_is_killed_and_reported() {
        let supervisor = ServiceSupervisor::new(
            Arc::new(FixedProbe(AtomicBool::new(false))),
            settings("sleep", &["30"]),
        );
        assert_eq!(supervisor.start().await, ServiceStatus::FailedToStart);
        assert!(!supervisor.owns_daemon().await);
    }

    #[tokio::test]
    async fn daemon_exiting_during_startup_fails_fast() {
        let mut settings = settings("true", &[]);
        settings.startup_window = Duration::from_secs(30);
        let supervisor =
            ServiceSupervisor::new(Arc::new(FixedProbe(AtomicBool::new(false))), settings);

        let started = std::time::Instant::now();
        assert_eq!(supervisor.start().await, ServiceStatus::FailedToStart);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn sigterm_resistant_daemon_is_force_killed() {
        let mut settings = settings("sh", &["-c", "trap '' TERM; sleep 30"]);
        settings.stop_grace = Duration::from_millis(200);
        let supervisor = ServiceSupervisor::new(ScriptedProbe::alive_after(1), settings);
        assert_eq!(supervisor.start().await, ServiceStatus::Started);
        let pid = supervisor.daemon_pid().await.expect("owned pid");

        supervisor.stop().await;
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn dropping_the_supervisor_kills_the_daemon() {
        let supervisor =
            ServiceSupervisor::new(ScriptedProbe::alive_after(1), settings("sleep", &["30"]));
        assert_eq!(supervisor.start().await, ServiceStatus::Started);
        let pid = supervisor.daemon_pid().await.expect("owned pid");

        drop(supervisor);
        wait_for_death(pid).await;
    }

    /// Probe that hangs for its whole timeout and then reports dead.
    struct SilentProbe;

    #[async_trait::async_trait]
    impl LivenessProbe for SilentProbe {
        async fn probe(&self, timeout: Duration) -> bool {
            tokio::time::sleep(timeout).await;
            false
        }
    }

    #[tokio::test]
    async fn startup_window_bounds_slow_readiness_probes() {
        let settings = SupervisorSettings {
            probe_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(200),
            startup_window: Duration::from_secs(1),
            ..settings("sleep", &["30"])
        };
        let supervisor = ServiceSupervisor::new(Arc::new(SilentProbe), settings);

        let started = std::time::Instant::now();
        assert_eq!(supervisor.start().await, ServiceStatus::FailedToStart);
        let elapsed = started.elapsed();
        // Initial probe (200ms) plus the 1s window, with slack for terminating the child.
        assert!(elapsed < Duration::from_millis(1700), "startup took {elapsed:?}");
    }

    #[tokio::test]
    async fn abandoned_startup_kills_the_spawned_daemon() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("daemon.pid");
        let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());
        let settings = SupervisorSettings {
            startup_window: Duration::from_secs(30),
            ..settings("sh", &["-c", script.as_str()])
        };
        let supervisor =
            ServiceSupervisor::new(Arc::new(FixedProbe(AtomicBool::new(false))), settings);

        let pid = tokio::select! {
            status = supervisor.start() => panic!("startup settled early: {status}"),
            pid = read_pid(&pid_file) => pid,
        };
        assert!(!supervisor.owns_daemon().await);
        wait_for_death(pid).await;
    }

    async fn read_pid(path: &std::path::Path) -> u32 {
        loop {
            if let Ok(pid) = std::fs::read_to_string(path).unwrap_or_default().trim().parse() {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_death(pid: u32) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            // Zombie until tokio's orphan reaper collects it; /proc state tells us it died.
            let state = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap_or_default();
            if state.is_empty() || state.contains(") Z") {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "daemon {pid} survived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
