//! Process supervision for the proxy engine and the packet forwarder
//!
//! The supervisor launches the two cooperating child processes, drains their
//! output into the daemon log, and watches for exits. Intentional
//! termination (part of `stop()`) is distinguished from a crash via an
//! expected-exit flag set before signaling. Unexpected exits are retried on
//! a fixed delay up to a bounded number of consecutive restarts inside a
//! time window; exceeding the budget surfaces `ProcessEvent::Unstable` and
//! it is the controller's job to tear the session down.
//!
//! At most one live handle exists per role: a new process for a role is
//! refused until the previous one has been reaped.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;

/// Role of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessRole {
    /// Local proxy engine (protocol implementation, stats endpoint)
    ProxyEngine,
    /// TUN-to-socket packet forwarder
    Forwarder,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProxyEngine => write!(f, "proxy-engine"),
            Self::Forwarder => write!(f, "forwarder"),
        }
    }
}

/// Snapshot of a supervised process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessHandle {
    /// Process role
    pub role: ProcessRole,
    /// OS process identifier
    pub pid: u32,
    /// Consecutive restarts performed for this role
    pub restarts: u32,
    /// Exit code of the most recent exit, if any
    pub last_exit_code: Option<i32>,
}

/// Launch description for a supervised process
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    /// Binary path
    pub program: PathBuf,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub envs: Vec<(String, String)>,
}

impl ProcessCommand {
    /// Create a command with no extra environment
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }
}

/// Events reported upward to the session controller
///
/// The supervisor never mutates session state itself; it only reports.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// A child exited (expected or not)
    Exited {
        /// Process role
        role: ProcessRole,
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Whether the exit was requested via `terminate`
        expected: bool,
    },
    /// A crashed child was relaunched
    Restarted {
        /// Process role
        role: ProcessRole,
        /// New process identifier
        pid: u32,
        /// Restart count inside the current window
        attempt: u32,
    },
    /// Restart budget exhausted; the role stays down
    Unstable {
        /// Process role
        role: ProcessRole,
    },
}

struct RoleSlot {
    pid: u32,
    restarts: u32,
    last_exit_code: Option<i32>,
    expected_exit: Arc<AtomicBool>,
    command: ProcessCommand,
}

struct Shared {
    config: SupervisorConfig,
    slots: Mutex<HashMap<ProcessRole, RoleSlot>>,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    /// Crash restarts only apply while the session is connected
    restart_enabled: AtomicBool,
}

/// Supervisor for the proxy-engine and forwarder processes
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    /// Create a supervisor and the event channel the controller consumes
    #[must_use]
    pub fn new(config: SupervisorConfig) -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            slots: Mutex::new(HashMap::new()),
            events_tx,
            restart_enabled: AtomicBool::new(false),
        });
        (Self { shared }, events_rx)
    }

    /// Enable or disable automatic crash restarts
    ///
    /// Enabled by the controller on `Connected`, disabled during teardown so
    /// an exiting child is not raced back to life.
    pub fn set_restart_enabled(&self, enabled: bool) {
        self.shared.restart_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Launch a process for a role
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::AlreadyRunning` if a live handle exists for
    /// the role, or `SpawnFailed` if the OS refuses the spawn.
    pub fn launch(
        &self,
        role: ProcessRole,
        command: ProcessCommand,
    ) -> Result<ProcessHandle, SupervisorError> {
        {
            let slots = self.shared.slots.lock();
            if let Some(slot) = slots.get(&role) {
                return Err(SupervisorError::AlreadyRunning {
                    role,
                    pid: slot.pid,
                });
            }
        }

        let child = spawn_child(role, &command)?;
        let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
            role,
            reason: "process exited before pid could be read".into(),
        })?;

        info!(%role, pid, program = %command.program.display(), "process launched");

        let expected_exit = Arc::new(AtomicBool::new(false));
        let handle = ProcessHandle {
            role,
            pid,
            restarts: 0,
            last_exit_code: None,
        };

        {
            let mut slots = self.shared.slots.lock();
            slots.insert(
                role,
                RoleSlot {
                    pid,
                    restarts: 0,
                    last_exit_code: None,
                    expected_exit: Arc::clone(&expected_exit),
                    command,
                },
            );
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            monitor_role(shared, role, child).await;
        });

        Ok(handle)
    }

    /// Whether a live process exists for the role
    #[must_use]
    pub fn is_running(&self, role: ProcessRole) -> bool {
        self.shared.slots.lock().contains_key(&role)
    }

    /// Snapshot the handle for a role, if live
    #[must_use]
    pub fn handle(&self, role: ProcessRole) -> Option<ProcessHandle> {
        self.shared.slots.lock().get(&role).map(|slot| ProcessHandle {
            role,
            pid: slot.pid,
            restarts: slot.restarts,
            last_exit_code: slot.last_exit_code,
        })
    }

    /// Terminate the process for a role: SIGTERM, bounded grace, SIGKILL
    ///
    /// Idempotent; returns immediately if the role is not running. Safe to
    /// call while the monitor task is mid-restart: the expected-exit flag is
    /// checked again after the restart delay.
    pub async fn terminate(&self, role: ProcessRole) {
        let pid = {
            let slots = self.shared.slots.lock();
            match slots.get(&role) {
                Some(slot) => {
                    slot.expected_exit.store(true, Ordering::SeqCst);
                    slot.pid
                }
                None => return,
            }
        };

        info!(%role, pid, "terminating process");
        send_signal(pid, libc::SIGTERM);

        let grace = self.shared.config.term_grace();
        if !self.wait_for_exit(role, grace).await {
            warn!(%role, pid, "process ignored SIGTERM, sending SIGKILL");
            send_signal(pid, libc::SIGKILL);
            self.wait_for_exit(role, Duration::from_secs(2)).await;
        }
    }

    /// Terminate both roles, forwarder first so the engine's sockets stay
    /// up until the packet path is gone
    pub async fn terminate_all(&self) {
        self.terminate(ProcessRole::Forwarder).await;
        self.terminate(ProcessRole::ProxyEngine).await;
    }

    async fn wait_for_exit(&self, role: ProcessRole, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if !self.is_running(role) {
                return true;
            }
            sleep(Duration::from_millis(100)).await;
        }
        !self.is_running(role)
    }
}

fn spawn_child(role: ProcessRole, command: &ProcessCommand) -> Result<Child, SupervisorError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
        role,
        reason: e.to_string(),
    })?;

    // Drain both streams on dedicated tasks so a chatty child never blocks
    // on a full pipe.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SupervisorError::StdioUnavailable {
            role,
            reason: "stdout not captured".into(),
        })?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SupervisorError::StdioUnavailable {
            role,
            reason: "stderr not captured".into(),
        })?;

    tokio::spawn(drain_lines(role, "stdout", stdout));
    tokio::spawn(drain_lines(role, "stderr", stderr));

    Ok(child)
}

async fn drain_lines<R>(role: ProcessRole, stream: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(%role, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(%role, stream, "output drain ended: {}", e);
                break;
            }
        }
    }
}

fn send_signal(pid: u32, signal: libc::c_int) {
    // Best effort: the pid may already be reaped.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

/// Own the child, reap exits, and apply the restart budget
async fn monitor_role(shared: Arc<Shared>, role: ProcessRole, mut child: Child) {
    let mut restart_times: Vec<Instant> = Vec::new();

    loop {
        let status = child.wait().await;
        let code = match &status {
            Ok(s) => s.code(),
            Err(e) => {
                error!(%role, "failed to reap process: {}", e);
                None
            }
        };

        let expected = {
            let mut slots = shared.slots.lock();
            match slots.get_mut(&role) {
                Some(slot) => {
                    slot.last_exit_code = code;
                    slot.expected_exit.load(Ordering::SeqCst)
                }
                None => true,
            }
        };

        let _ = shared.events_tx.send(ProcessEvent::Exited {
            role,
            code,
            expected,
        });

        if expected {
            debug!(%role, ?code, "process exited as requested");
            shared.slots.lock().remove(&role);
            return;
        }

        if !shared.restart_enabled.load(Ordering::SeqCst) {
            warn!(%role, ?code, "process exited outside a connected session");
            shared.slots.lock().remove(&role);
            return;
        }

        warn!(%role, ?code, "process exited unexpectedly");

        let now = Instant::now();
        let window = shared.config.restart_window();
        restart_times.retain(|t| now.duration_since(*t) < window);

        if restart_times.len() >= shared.config.max_restarts as usize {
            error!(
                %role,
                restarts = restart_times.len(),
                "restart budget exhausted, giving up"
            );
            shared.slots.lock().remove(&role);
            let _ = shared.events_tx.send(ProcessEvent::Unstable { role });
            return;
        }

        sleep(shared.config.restart_delay()).await;

        // A teardown may have started during the delay.
        let command = {
            let slots = shared.slots.lock();
            match slots.get(&role) {
                Some(slot) if !slot.expected_exit.load(Ordering::SeqCst) => {
                    Some(slot.command.clone())
                }
                _ => None,
            }
        };
        let Some(command) = command else {
            shared.slots.lock().remove(&role);
            return;
        };
        if !shared.restart_enabled.load(Ordering::SeqCst) {
            shared.slots.lock().remove(&role);
            return;
        }

        match spawn_child(role, &command) {
            Ok(new_child) => {
                let pid = new_child.id().unwrap_or(0);
                restart_times.push(now);
                let attempt = restart_times.len() as u32;
                {
                    let mut slots = shared.slots.lock();
                    if let Some(slot) = slots.get_mut(&role) {
                        slot.pid = pid;
                        slot.restarts += 1;
                    }
                }
                info!(%role, pid, attempt, "process relaunched after crash");
                let _ = shared.events_tx.send(ProcessEvent::Restarted { role, pid, attempt });
                child = new_child;
            }
            Err(e) => {
                error!(%role, "relaunch failed: {}", e);
                shared.slots.lock().remove(&role);
                let _ = shared.events_tx.send(ProcessEvent::Unstable { role });
                return;
            }
        }
    }
}
