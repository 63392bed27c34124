//! Process supervisor
//!
//! Tracks at most one process per logical name. A process moves through
//! `Starting -> Running` once its assigned port accepts a TCP connection, or
//! `Starting -> Failed` when it exits early or the readiness probe gives up.
//! A running process that exits is dropped from the map, so the next request
//! for that name starts from idle, and whatever is left of its process group
//! is terminated.
//!
//! Each process gets three background tasks: two output readers feeding its
//! [`LogBuffer`], a readiness probe, and a reaper that owns the child handle
//! and is the only task that removes an entry on natural exit. None of them
//! hold the supervisor lock while doing I/O.

use crate::config::{LaunchSpec, SupervisorConfig};
use crate::error::SupervisorError;
use crate::logbuf::LogBuffer;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the state change channel
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// How often a stop checks whether the process group has emptied
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lifecycle state of a logical process name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Not tracked
    Idle,
    /// Launched, port not yet accepting connections
    Starting,
    /// Port confirmed reachable
    Running,
    /// Exited before becoming ready, or never became ready in time
    Failed { reason: String },
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Idle => "idle",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Failed { .. } => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            ProcessState::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Published on every state transition
#[derive(Debug, Clone)]
pub struct StateChange {
    pub name: String,
    pub state: ProcessState,
}

/// One launched instance of a logical process
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    launch: LaunchSpec,
    port: u16,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    state: watch::Sender<ProcessState>,
    exited: watch::Sender<bool>,
    logs: Arc<LogBuffer>,
    cancel: CancellationToken,
}

impl ManagedProcess {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    /// Port assigned at launch, owned by this instance for its lifetime
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state transition of this instance
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    fn set_state(&self, state: ProcessState) {
        self.state.send_replace(state);
    }
}

/// Owns every managed process, keyed by logical name.
///
/// Like the proxy's other shared components this is built behind an `Arc`;
/// methods that spawn background tasks take `self: &Arc<Self>`.
pub struct ProcessSupervisor {
    processes: RwLock<HashMap<String, Arc<ManagedProcess>>>,
    /// Offset of the next port to try within the configured range
    port_cursor: Mutex<u16>,
    config: SupervisorConfig,
    changes: broadcast::Sender<StateChange>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            processes: RwLock::new(HashMap::new()),
            port_cursor: Mutex::new(0),
            config,
            changes,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Subscribe to state transitions of all processes
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.read().get(name).cloned()
    }

    /// Current state; names that are not tracked are idle
    pub fn state(&self, name: &str) -> ProcessState {
        self.get(name)
            .map(|p| p.state())
            .unwrap_or(ProcessState::Idle)
    }

    /// All tracked processes, sorted by name
    pub fn all(&self) -> Vec<Arc<ManagedProcess>> {
        let mut all: Vec<_> = self.processes.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Buffered output lines of a tracked process
    pub fn logs(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).map(|p| p.logs.lines())
    }

    /// Launch `name` without waiting for readiness.
    ///
    /// Returns the existing instance if one is already starting or running.
    /// A failed instance is replaced by a fresh one and its process group is
    /// terminated in the background.
    pub fn start_async(
        self: &Arc<Self>,
        name: &str,
        launch: &LaunchSpec,
    ) -> Result<Arc<ManagedProcess>, SupervisorError> {
        let mut processes = self.processes.write();

        if let Some(old) = processes.get(name).cloned() {
            if old.state().is_active() {
                debug!(name, "Process already starting or running");
                return Ok(old);
            }
            processes.remove(name);
            info!(name, port = old.port, "Replacing failed process");
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                supervisor.terminate(&old).await;
            });
        }

        if let Some(dir) = &launch.dir {
            if !dir.is_dir() {
                let reason = format!("directory {} does not exist", dir.display());
                error!(name, %reason, "Cannot launch process");
                return Err(SupervisorError::LaunchFailure {
                    name: name.to_string(),
                    reason,
                });
            }
        }

        // Port probing and the spawn stay under the write lock so concurrent
        // starts of one name launch once. A probe is one bind per candidate
        // port and the spawn is a single fork/exec, neither waits on the child.
        let port = self.allocate_port(&processes)?;

        let mut cmd = self.build_command(launch, port);
        let mut child = cmd.spawn().map_err(|e| {
            error!(name, command = %launch.command, error = %e, "Failed to spawn process");
            SupervisorError::LaunchFailure {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        let pid = child.id();
        info!(name, port, pid, command = %launch.command, "Process launched");

        let (state, _) = watch::channel(ProcessState::Starting);
        let (exited, _) = watch::channel(false);
        let process = Arc::new(ManagedProcess {
            name: name.to_string(),
            launch: launch.clone(),
            port,
            pid,
            started_at: Utc::now(),
            state,
            exited,
            logs: Arc::new(LogBuffer::new(self.config.log_capacity)),
            cancel: CancellationToken::new(),
        });
        processes.insert(name.to_string(), Arc::clone(&process));
        drop(processes);

        if let Some(stdout) = child.stdout.take() {
            spawn_output_reader(name.to_string(), stdout, Arc::clone(&process.logs));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_reader(name.to_string(), stderr, Arc::clone(&process.logs));
        }

        let supervisor = Arc::clone(self);
        let reaped = Arc::clone(&process);
        tokio::spawn(async move {
            supervisor.reap(reaped, child).await;
        });

        let supervisor = Arc::clone(self);
        let probed = Arc::clone(&process);
        tokio::spawn(async move {
            supervisor.probe_readiness(probed).await;
        });

        self.publish(name, ProcessState::Starting);
        Ok(process)
    }

    /// Launch `name` and wait until it is running or has failed
    pub async fn start(
        self: &Arc<Self>,
        name: &str,
        launch: &LaunchSpec,
    ) -> Result<Arc<ManagedProcess>, SupervisorError> {
        let process = self.start_async(name, launch)?;
        let mut rx = process.subscribe_state();
        let outcome = rx
            .wait_for(|state| *state != ProcessState::Starting)
            .await
            .map(|state| (*state).clone())
            .unwrap_or(ProcessState::Idle);

        match outcome {
            ProcessState::Running => Ok(process),
            ProcessState::Failed { reason } if process.has_exited() => {
                Err(SupervisorError::Exited {
                    name: name.to_string(),
                    reason,
                })
            }
            ProcessState::Failed { .. } => Err(SupervisorError::ReadinessTimeout {
                name: name.to_string(),
                port: process.port,
                timeout: self.config.readiness_timeout(),
            }),
            ProcessState::Idle | ProcessState::Starting => Err(SupervisorError::Exited {
                name: name.to_string(),
                reason: "stopped before becoming ready".to_string(),
            }),
        }
    }

    /// Stop a tracked process and its whole process group.
    ///
    /// The entry is removed before any signal is sent, so a concurrent stop
    /// gets `NotFound` and a late readiness result cannot bring it back.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let process = self
            .processes
            .write()
            .remove(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        process.set_state(ProcessState::Idle);
        self.publish(name, ProcessState::Idle);
        self.terminate(&process).await;
        Ok(())
    }

    /// Stop, pause, then start again with the same launch settings
    pub async fn restart(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<Arc<ManagedProcess>, SupervisorError> {
        let launch = self
            .get(name)
            .map(|p| p.launch.clone())
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        self.stop(name).await?;
        tokio::time::sleep(self.config.restart_delay()).await;
        self.start_async(name, &launch)
    }

    /// Stop every tracked process. Failures are logged, not returned.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.processes.read().keys().cloned().collect();
        if names.is_empty() {
            return;
        }
        info!(count = names.len(), "Stopping all processes");

        let stops = names.iter().map(|name| async move {
            if let Err(e) = self.stop(name).await {
                debug!(name = %name, error = %e, "Process already gone during shutdown");
            }
        });
        futures::future::join_all(stops).await;
    }

    fn build_command(&self, launch: &LaunchSpec, port: u16) -> Command {
        let mut cmd = Command::new(self.config.shell_program());
        cmd.args(&self.config.shell_args);
        cmd.arg(&launch.command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let Some(dir) = &launch.dir {
            cmd.current_dir(dir);
        }

        // Overrides win over PORT and the inherited environment
        cmd.env("PORT", port.to_string());
        cmd.envs(&launch.env);

        // New session so the whole descendant tree can be signalled at once
        #[cfg(unix)]
        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd
    }

    /// Find a bindable port that no tracked process owns.
    ///
    /// Called with the write lock held so two launches never share a port.
    fn allocate_port(
        &self,
        processes: &HashMap<String, Arc<ManagedProcess>>,
    ) -> Result<u16, SupervisorError> {
        let start = self.config.port_range_start;
        let end = self.config.port_range_end;
        let span = end.saturating_sub(start);

        let mut cursor = self.port_cursor.lock();
        for _ in 0..span {
            let port = start + *cursor % span;
            *cursor = (*cursor + 1) % span;

            if processes.values().any(|p| p.port == port) {
                continue;
            }
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return Ok(port);
            }
        }

        warn!(start, end, "No free port in range");
        Err(SupervisorError::PortExhaustion { start, end })
    }

    async fn probe_readiness(&self, process: Arc<ManagedProcess>) {
        let timeout = self.config.readiness_timeout();
        let interval = self.config.probe_interval();
        let deadline = Instant::now() + timeout;
        let name = process.name.as_str();

        debug!(name, port = process.port, "Starting readiness probe");

        loop {
            if process.cancel.is_cancelled() || process.has_exited() {
                return;
            }

            let attempt = tokio::time::timeout(
                interval.max(Duration::from_millis(50)),
                tokio::net::TcpStream::connect(("127.0.0.1", process.port)),
            )
            .await;
            if let Ok(Ok(_)) = attempt {
                self.transition(&process, ProcessState::Running);
                return;
            }

            if Instant::now() >= deadline {
                let reason = SupervisorError::ReadinessTimeout {
                    name: name.to_string(),
                    port: process.port,
                    timeout,
                }
                .to_string();
                warn!(name, port = process.port, "Readiness timeout, leaving process running");
                self.transition(&process, ProcessState::Failed { reason });
                return;
            }

            tokio::time::sleep(interval).await;
        }
    }

    async fn reap(&self, process: Arc<ManagedProcess>, mut child: Child) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = process.cancel.cancelled() => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let description = describe_exit(&status);

        process.exited.send_replace(true);
        process.cancel.cancel();

        let name = process.name.as_str();
        let next = {
            let mut processes = self.processes.write();
            let is_current = processes
                .get(name)
                .is_some_and(|current| Arc::ptr_eq(current, &process));
            if !is_current {
                debug!(name, status = %description, "Stopped process reaped");
                return;
            }

            match process.state() {
                ProcessState::Starting => {
                    let reason =
                        format!("process exited before becoming ready ({})", description);
                    warn!(name, status = %description, "Process exited during startup");
                    let failed = ProcessState::Failed { reason };
                    process.set_state(failed.clone());
                    failed
                }
                ProcessState::Running => {
                    info!(name, status = %description, "Process exited");
                    processes.remove(name);
                    process.set_state(ProcessState::Idle);
                    ProcessState::Idle
                }
                ProcessState::Failed { .. } | ProcessState::Idle => {
                    info!(name, status = %description, "Failed process exited");
                    return;
                }
            }
        };

        let dropped = next == ProcessState::Idle;
        self.publish(name, next);
        if dropped {
            // Descendants of the leader may still be running
            self.terminate(&process).await;
        }
    }

    /// Apply a probe result, but only to the instance still registered
    fn transition(&self, process: &Arc<ManagedProcess>, state: ProcessState) {
        let processes = self.processes.read();
        let is_current = processes
            .get(&process.name)
            .is_some_and(|current| Arc::ptr_eq(current, process));
        if !is_current || process.state() != ProcessState::Starting {
            debug!(name = %process.name, "Discarding stale readiness result");
            return;
        }
        if state == ProcessState::Running {
            info!(name = %process.name, port = process.port, "Process is ready");
        }
        process.set_state(state.clone());
        drop(processes);
        self.publish(&process.name, state);
    }

    /// SIGTERM the process group, wait out the grace period, then SIGKILL.
    ///
    /// The group is signalled even when the leader has already exited:
    /// wrapper scripts often leave a server behind that still holds the port.
    async fn terminate(&self, process: &ManagedProcess) {
        let name = process.name.as_str();
        let grace_period = self.config.shutdown_grace_period();

        if let Some(pid) = process.pid {
            info!(name, pid, "Sending SIGTERM to process group");
            signal_group(pid, Signal::Term);

            let graceful = tokio::time::timeout(grace_period, wait_for_group_exit(process))
                .await
                .is_ok();

            if graceful {
                info!(name, "Process group exited gracefully");
            } else {
                warn!(
                    name,
                    grace_period_ms = grace_period.as_millis() as u64,
                    "Grace period exceeded, sending SIGKILL"
                );
                signal_group(pid, Signal::Kill);
            }
        }

        process.cancel.cancel();
    }

    fn publish(&self, name: &str, state: ProcessState) {
        // No receivers is fine
        let _ = self.changes.send(StateChange {
            name: name.to_string(),
            state,
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signal a process group by its leader's pid
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let signal = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc == -1 {
        debug!(pid, error = %std::io::Error::last_os_error(), "Signal not delivered");
    }
}

/// Without process groups the reaper kills the direct child on cancellation
#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

/// Whether any member of the process group led by `pid` still exists
#[cfg(unix)]
fn group_alive(pid: u32) -> bool {
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), 0) };
    if rc == 0 {
        return true;
    }
    // EPERM still means the group exists
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn group_alive(_pid: u32) -> bool {
    false
}

/// Resolve once the leader has been reaped and the rest of its group is gone
async fn wait_for_group_exit(process: &ManagedProcess) {
    let mut exited = process.exited.subscribe();
    let _ = exited.wait_for(|done| *done).await;

    if let Some(pid) = process.pid {
        while group_alive(pid) {
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
    }
}

fn spawn_output_reader<R>(name: String, reader: R, logs: Arc<LogBuffer>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    logs.write(&line);
                    trace!(process = %name, line = %String::from_utf8_lossy(&line).trim_end());
                }
                Err(e) => {
                    debug!(process = %name, error = %e, "Output stream closed");
                    break;
                }
            }
        }
    });
}

fn describe_exit(status: &std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {}", e),
    }
}
