//! Session lifecycle orchestration
//!
//! The controller owns every state transition and all session resources:
//! the child processes, the interface descriptor, the auto-disconnect
//! timer, and the stats ticker. Commands arrive from the IPC layer; events
//! arrive from the supervisor and the timer over channels and are handled
//! by a single event loop so teardown never races itself.
//!
//! Concurrency model: one async operation lock guards start/stop/expiry.
//! `start` takes it with `try_lock` and reports `Busy` on contention;
//! `stop` and expiry wait for it. A per-start cancel flag lets `stop`
//! interrupt an in-flight start at its blocking point (the descriptor
//! transfer retry loop) instead of waiting out the full retry budget.

use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::autodisconnect::{
    AutoDisconnectTimer, ExpiryFlagStore, TimerEvent, NOT_ACTIVE,
};
use crate::config::{DaemonConfig, SessionConfig};
use crate::error::{PlatformError, SessionError, TransferError};
use crate::platform::{InterfaceSpec, TunPlatform};
use crate::routing::{plan_tunnel_routes, RoutePlan};
use crate::session::state::SessionState;
use crate::session::status::{SessionNotification, SessionStatus, SessionStatusEvent};
use crate::stats::{self, StatsCollector, TrafficSample};
use crate::supervisor::{ProcessCommand, ProcessEvent, ProcessRole, ProcessSupervisor};
use crate::transfer::{send_descriptor, CancelFlag};

/// Address the interface is configured with. The subnet is private to the
/// tunnel; only this one host exists on it.
const TUN_ADDRESS: std::net::Ipv4Addr = std::net::Ipv4Addr::new(10, 255, 0, 2);
const TUN_PREFIX: u8 = 30;

/// Timeout for delay probes issued over IPC
const DELAY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffered status events before slow subscribers start missing entries
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Mutable session resources, guarded by a sync mutex that is never held
/// across an await point.
struct Inner {
    state: SessionState,
    config: Option<SessionConfig>,
    tun_fd: Option<OwnedFd>,
    connected_at: Option<Instant>,
    timer: Option<Arc<AutoDisconnectTimer>>,
    stats: Option<Arc<StatsCollector>>,
    ticker: Option<JoinHandle<()>>,
}

/// Orchestrates one VPN session at a time
pub struct SessionController {
    daemon: DaemonConfig,
    platform: Arc<dyn TunPlatform>,
    supervisor: Arc<ProcessSupervisor>,
    expiry_store: Arc<ExpiryFlagStore>,
    inner: Mutex<Inner>,
    /// Single-flight guard for start/stop/expiry
    op_lock: AsyncMutex<()>,
    /// Cancel flag for the in-flight start, replaced on every start
    cancel: Mutex<CancelFlag>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    state_tx: watch::Sender<SessionState>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    notify_tx: broadcast::Sender<SessionNotification>,
}

impl SessionController {
    /// Build a controller and spawn its event loop
    #[must_use]
    pub fn new(daemon: DaemonConfig, platform: Arc<dyn TunPlatform>) -> Arc<Self> {
        let (supervisor, proc_rx) = ProcessSupervisor::new(daemon.supervisor.clone());
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (notify_tx, _) = broadcast::channel(8);

        let expiry_store = Arc::new(ExpiryFlagStore::new(daemon.expiry_flag_path.clone()));

        let controller = Arc::new(Self {
            daemon,
            platform,
            supervisor: Arc::new(supervisor),
            expiry_store,
            inner: Mutex::new(Inner {
                state: SessionState::Disconnected,
                config: None,
                tun_fd: None,
                connected_at: None,
                timer: None,
                stats: None,
                ticker: None,
            }),
            op_lock: AsyncMutex::new(()),
            cancel: Mutex::new(CancelFlag::new()),
            timer_tx,
            state_tx,
            status_tx,
            notify_tx,
        });

        tokio::spawn(Arc::clone(&controller).event_loop(proc_rx, timer_rx));
        controller
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Watch channel for state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to the 1 Hz status stream
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to auto-disconnect notifications
    #[must_use]
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<SessionNotification> {
        self.notify_tx.subscribe()
    }

    /// Start a session
    ///
    /// The sequence is ordered so every step's preconditions were created
    /// by an earlier step; on any failure the completed steps are rolled
    /// back and the state returns to `Disconnected`.
    ///
    /// # Errors
    ///
    /// `Busy` if another operation holds the lock or a session already
    /// exists, otherwise the error of whichever step failed.
    pub async fn start(self: &Arc<Self>, config: SessionConfig) -> Result<(), SessionError> {
        let _guard = self.op_lock.try_lock().map_err(|_| SessionError::Busy)?;

        match self.state() {
            SessionState::Disconnected => {}
            // An acknowledged-by-starting auto-disconnect; the flag file
            // stays until explicitly cleared.
            SessionState::AutoDisconnected => self.set_state(SessionState::Disconnected),
            _ => return Err(SessionError::Busy),
        }

        config.validate()?;

        // Re-check the grant now rather than failing halfway through
        self.platform.check_permission().map_err(|e| match e {
            PlatformError::PermissionDenied(_) => SessionError::PermissionDenied,
            other => SessionError::InterfaceEstablishFailed(other.to_string()),
        })?;

        let cancel = CancelFlag::new();
        *self.cancel.lock() = cancel.clone();

        info!(display_name = %config.display_name, proxy_only = config.proxy_only, "session starting");
        self.set_state(SessionState::Connecting);
        {
            let mut inner = self.inner.lock();
            inner.config = Some(config.clone());
            // The status stream runs for the whole non-terminal lifetime;
            // before the session tasks exist it carries zeroed samples.
            inner.ticker = Some(tokio::spawn(Arc::clone(self).run_ticker()));
        }

        match self.bring_up(&config, &cancel).await {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                self.inner.lock().connected_at = Some(Instant::now());
                self.arm_session_tasks(&config);
                info!("session connected");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "start failed, rolling back");
                self.teardown(SessionState::Disconnected).await;
                Err(err)
            }
        }
    }

    /// Stop the session
    ///
    /// Idempotent: stopping an already terminal session is a successful
    /// no-op. If a start is in flight its cancel flag is raised first, so
    /// the start unwinds promptly and this call observes the rollback.
    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        let _guard = self.op_lock.lock().await;

        if self.state().is_terminal() {
            debug!("stop on terminal state, nothing to do");
            return;
        }

        info!("session stopping");
        self.set_state(SessionState::Disconnecting);
        self.teardown(SessionState::Disconnected).await;
    }

    /// Point-in-time status snapshot
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let inner = self.inner.lock();
        SessionStatus {
            state: inner.state,
            elapsed_secs: inner
                .connected_at
                .map_or(0, |t| t.elapsed().as_secs()),
            traffic: inner
                .stats
                .as_ref()
                .map(|s| s.last_sample())
                .unwrap_or_default(),
            remaining_secs: inner
                .timer
                .as_ref()
                .map(|t| t.remaining())
                .filter(|r| *r != NOT_ACTIVE),
            display_name: inner.config.as_ref().map(|c| c.display_name.clone()),
        }
    }

    /// Adjust the running countdown by `delta_secs`, returning the new
    /// remaining value or `NOT_ACTIVE` when no timer is running
    pub fn update_auto_disconnect_time(&self, delta_secs: i64) -> i64 {
        let timer = self.inner.lock().timer.clone();
        timer.map_or(NOT_ACTIVE, |t| t.update_time(delta_secs))
    }

    /// Remaining countdown seconds, `NOT_ACTIVE` when no timer is running
    #[must_use]
    pub fn remaining_auto_disconnect_time(&self) -> i64 {
        let timer = self.inner.lock().timer.clone();
        timer.map_or(NOT_ACTIVE, |t| t.remaining())
    }

    /// Cancel the countdown for the rest of this session
    pub fn cancel_auto_disconnect(&self) {
        let timer = self.inner.lock().timer.clone();
        if let Some(timer) = timer {
            timer.cancel();
        }
    }

    /// Whether a past session ended by auto-disconnect and was never
    /// acknowledged. Survives daemon restarts.
    #[must_use]
    pub fn was_auto_disconnected(&self) -> bool {
        self.expiry_store.is_set()
    }

    /// Acknowledge the auto-disconnect flag
    ///
    /// Also normalizes a lingering `AutoDisconnected` state back to
    /// `Disconnected`.
    ///
    /// # Errors
    ///
    /// IO errors from removing the flag file.
    pub fn clear_auto_disconnect_flag(&self) -> Result<(), SessionError> {
        self.expiry_store
            .clear()
            .map_err(|e| SessionError::Internal(format!("clearing expiry flag: {e}")))?;
        let mut inner = self.inner.lock();
        if inner.state == SessionState::AutoDisconnected {
            inner.state = SessionState::Disconnected;
            let _ = self.state_tx.send(SessionState::Disconnected);
        }
        Ok(())
    }

    /// Measure TCP connect latency to `target` over the physical network
    ///
    /// # Errors
    ///
    /// `SessionError::Internal` wrapping the probe failure.
    pub async fn get_delay(&self, target: &str) -> Result<u64, SessionError> {
        stats::measure_delay(target, DELAY_PROBE_TIMEOUT)
            .await
            .map_err(|e| SessionError::Internal(e.to_string()))
    }

    /// Measure latency to `target` through the running tunnel
    ///
    /// The probe is delegated to the proxy engine, which measures against
    /// the currently active configuration.
    ///
    /// # Errors
    ///
    /// `NotConnected` when no session is up.
    pub async fn get_connected_delay(&self, target: &str) -> Result<u64, SessionError> {
        let stats_port = {
            let inner = self.inner.lock();
            if inner.state != SessionState::Connected {
                return Err(SessionError::NotConnected);
            }
            inner
                .config
                .as_ref()
                .map(|c| c.stats_port)
                .ok_or(SessionError::NotConnected)?
        };
        stats::query_connected_delay(stats_port, target, DELAY_PROBE_TIMEOUT)
            .await
            .map_err(|e| SessionError::Internal(e.to_string()))
    }

    /// Tear everything down on daemon shutdown
    pub async fn shutdown(&self) {
        self.stop().await;
    }

    fn set_state(&self, next: SessionState) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.state.can_transition_to(next),
            "illegal transition {} -> {}",
            inner.state,
            next
        );
        debug!(from = %inner.state, to = %next, "state transition");
        inner.state = next;
        let _ = self.state_tx.send(next);
    }

    /// Middle of the start sequence: processes, route plan, interface,
    /// descriptor handoff. The interface descriptor stays local until the
    /// handoff succeeds; either this function releases it on failure or it
    /// lands in `inner` for teardown to release later.
    async fn bring_up(
        &self,
        config: &SessionConfig,
        cancel: &CancelFlag,
    ) -> Result<(), SessionError> {
        self.supervisor.set_restart_enabled(false);

        self.supervisor
            .launch(ProcessRole::ProxyEngine, self.engine_command(config))
            .map_err(|e| SessionError::ProcessLaunchFailed {
                role: ProcessRole::ProxyEngine,
                reason: e.to_string(),
            })?;

        if cancel.is_cancelled() {
            return Err(SessionError::Internal("start cancelled by stop".into()));
        }

        let plan = plan_tunnel_routes(config);
        info!(
            included = plan.included.len(),
            bypassed = plan.bypassed.len(),
            degraded = plan.degraded,
            "route plan computed"
        );

        if config.proxy_only {
            debug!("proxy-only session, skipping interface and forwarder");
            return Ok(());
        }

        let spec = self.interface_spec(config, &plan);
        let fd = self.platform.establish(&spec).map_err(|e| match e {
            PlatformError::PermissionDenied(_) => SessionError::PermissionDenied,
            other => SessionError::InterfaceEstablishFailed(other.to_string()),
        })?;

        if let Err(e) = self
            .supervisor
            .launch(ProcessRole::Forwarder, self.forwarder_command(config))
        {
            self.platform.release(fd);
            return Err(SessionError::ProcessLaunchFailed {
                role: ProcessRole::Forwarder,
                reason: e.to_string(),
            });
        }

        // The forwarder needs a moment to bind its socket; the retry loop
        // inside send_descriptor absorbs that.
        let transfer = send_descriptor(
            &self.daemon.transfer_socket,
            fd.as_fd(),
            &self.daemon.transfer,
            cancel,
        )
        .await;

        match transfer {
            Ok(()) => {
                self.inner.lock().tun_fd = Some(fd);
                Ok(())
            }
            Err(TransferError::Cancelled) => {
                self.platform.release(fd);
                Err(SessionError::Internal("start cancelled by stop".into()))
            }
            Err(err) => {
                self.platform.release(fd);
                Err(SessionError::DescriptorTransferFailed(err))
            }
        }
    }

    /// Arm the per-session timer and stats collector once the state is
    /// `Connected`; the ticker picks them up on its next pass.
    fn arm_session_tasks(&self, config: &SessionConfig) {
        let stats = Arc::new(StatsCollector::new(config.stats_port));
        let timer = Arc::new(AutoDisconnectTimer::new(
            config.auto_disconnect.clone(),
            Arc::clone(&self.expiry_store),
            self.timer_tx.clone(),
        ));
        timer.start();
        self.supervisor.set_restart_enabled(true);

        let mut inner = self.inner.lock();
        inner.stats = Some(stats);
        inner.timer = Some(timer);
    }

    /// 1 Hz driver for every non-terminal state: sample traffic, advance
    /// the countdown, publish a status event
    ///
    /// Spawned at `Connecting` so stream consumers hear from the session
    /// while it is still being brought up; until `arm_session_tasks` runs
    /// the events carry zeroed samples.
    async fn run_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if self.state().is_terminal() {
                break;
            }

            let (stats, timer) = {
                let inner = self.inner.lock();
                (inner.stats.clone(), inner.timer.clone())
            };

            let sample = match &stats {
                Some(stats) => stats.sample().await,
                None => TrafficSample::default(),
            };
            if let Some(timer) = &timer {
                timer.tick();
            }
            self.publish_status(&sample, timer.as_deref());
        }
    }

    fn publish_status(&self, sample: &TrafficSample, timer: Option<&AutoDisconnectTimer>) {
        let (state, elapsed) = {
            let inner = self.inner.lock();
            (
                inner.state,
                inner.connected_at.map_or(0, |t| t.elapsed().as_secs()),
            )
        };
        let remaining = timer.and_then(|t| match t.remaining() {
            NOT_ACTIVE => None,
            // The policy can opt out of publishing remaining time
            r if t.show_remaining() => Some(r),
            _ => None,
        });
        let event = SessionStatusEvent::from_sample(state, elapsed, sample, remaining);
        let _ = self.status_tx.send(event);
    }

    /// Release every session resource and settle in `final_state`
    ///
    /// Callers hold the operation lock. Safe to run from any intermediate
    /// state; missing resources are skipped.
    async fn teardown(&self, final_state: SessionState) {
        let (ticker, fd, last_sample) = {
            let mut inner = self.inner.lock();
            let last = inner.stats.as_ref().map(|s| s.last_sample());
            inner.timer = None;
            inner.stats = None;
            inner.connected_at = None;
            inner.config = None;
            (inner.ticker.take(), inner.tun_fd.take(), last)
        };

        if let Some(ticker) = ticker {
            ticker.abort();
        }

        self.supervisor.set_restart_enabled(false);
        self.supervisor.terminate_all().await;

        if let Some(fd) = fd {
            self.platform.release(fd);
        }

        self.set_state(final_state);

        // Final status event so stream consumers learn the session ended
        // without polling
        let sample = last_sample.unwrap_or_default();
        let event = SessionStatusEvent::from_sample(final_state, 0, &sample, None);
        let _ = self.status_tx.send(event);

        info!(state = %final_state, "session torn down");
    }

    /// Handles supervisor and timer events for the controller's lifetime
    async fn event_loop(
        self: Arc<Self>,
        mut proc_rx: mpsc::UnboundedReceiver<ProcessEvent>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    ) {
        loop {
            tokio::select! {
                event = proc_rx.recv() => match event {
                    Some(ProcessEvent::Exited { role, code, expected }) => {
                        if !expected {
                            warn!(%role, code, "process exited unexpectedly");
                        }
                    }
                    Some(ProcessEvent::Restarted { role, pid, attempt }) => {
                        info!(%role, pid, attempt, "process restarted");
                        if role == ProcessRole::Forwarder {
                            self.handle_forwarder_restart().await;
                        }
                    }
                    Some(ProcessEvent::Unstable { role }) => {
                        error!(%role, "restart budget exhausted, ending session");
                        self.handle_unstable().await;
                    }
                    None => break,
                },
                event = timer_rx.recv() => match event {
                    Some(TimerEvent::Expired { notify, message }) => {
                        self.handle_expiry(notify, message).await;
                    }
                    None => break,
                },
            }
        }
    }

    /// A relaunched forwarder binds a fresh transfer socket and waits for
    /// the descriptor again; without a re-send the session would sit
    /// `Connected` with a dead packet path.
    async fn handle_forwarder_restart(&self) {
        let dup = {
            let inner = self.inner.lock();
            if inner.state != SessionState::Connected {
                return;
            }
            inner.tun_fd.as_ref().map(OwnedFd::try_clone)
        };
        let fd = match dup {
            Some(Ok(dup)) => dup,
            Some(Err(e)) => {
                error!(error = %e, "could not duplicate interface descriptor");
                self.stop_for_dead_forwarder().await;
                return;
            }
            // Proxy-only sessions have no descriptor to hand over.
            None => return,
        };

        let cancel = self.cancel.lock().clone();
        match send_descriptor(
            &self.daemon.transfer_socket,
            fd.as_fd(),
            &self.daemon.transfer,
            &cancel,
        )
        .await
        {
            Ok(()) => info!("descriptor re-sent to restarted forwarder"),
            Err(TransferError::Cancelled) => {
                debug!("descriptor re-send cancelled by stop");
            }
            Err(err) => {
                error!(error = %err, "descriptor re-send failed, ending session");
                self.stop_for_dead_forwarder().await;
            }
        }
    }

    /// The forwarder came back but the packet path could not be restored
    async fn stop_for_dead_forwarder(&self) {
        let _guard = self.op_lock.lock().await;
        if self.state() != SessionState::Connected {
            return;
        }
        self.set_state(SessionState::Disconnecting);
        self.teardown(SessionState::Disconnected).await;
    }

    /// A supervised process burned through its restart budget
    async fn handle_unstable(&self) {
        let _guard = self.op_lock.lock().await;
        if self.state() != SessionState::Connected {
            return;
        }
        self.set_state(SessionState::Disconnecting);
        self.teardown(SessionState::Disconnected).await;
    }

    /// The countdown expired; the flag file is already persisted
    ///
    /// If a user stop won the race for the lock the session is already
    /// terminal and this is a no-op; the flag stays set either way.
    async fn handle_expiry(&self, notify: bool, message: String) {
        let _guard = self.op_lock.lock().await;
        if self.state() != SessionState::Connected {
            debug!("expiry raced a stop, session already down");
            return;
        }

        info!("auto-disconnect timer expired, ending session");
        if notify {
            let _ = self.notify_tx.send(SessionNotification { message });
        }
        self.set_state(SessionState::Disconnecting);
        self.teardown(SessionState::AutoDisconnected).await;
    }

    fn engine_command(&self, config: &SessionConfig) -> ProcessCommand {
        let mut args = vec![
            "--server".into(),
            config.server_addr.clone(),
            "--proxy-port".into(),
            config.proxy_port.to_string(),
            "--stats-port".into(),
            config.stats_port.to_string(),
        ];
        for dns in &config.dns_servers {
            args.push("--dns".into());
            args.push(dns.to_string());
        }
        ProcessCommand::new(&self.daemon.proxy_engine_bin, args)
    }

    fn forwarder_command(&self, config: &SessionConfig) -> ProcessCommand {
        ProcessCommand::new(
            &self.daemon.forwarder_bin,
            vec![
                "-listen-socket-path".into(),
                self.daemon.transfer_socket.display().to_string(),
                "-proxy-target".into(),
                format!("127.0.0.1:{}", config.proxy_port),
                "-mtu".into(),
                config.mtu.to_string(),
            ],
        )
    }

    fn interface_spec(&self, config: &SessionConfig, plan: &RoutePlan) -> InterfaceSpec {
        InterfaceSpec {
            name: self.daemon.tun_name.clone(),
            address: TUN_ADDRESS,
            prefix: TUN_PREFIX,
            mtu: config.mtu,
            dns: config.dns_servers.clone(),
            included_routes: plan.included.clone(),
            blocked_apps: config.blocked_apps.clone(),
        }
    }
}
