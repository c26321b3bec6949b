//! Auto-disconnect timer
//!
//! Counts down a configured session duration and tears the session down on
//! expiry. The timer itself never mutates session state: it persists the
//! durable expiry flag, then reports `TimerEvent::Expired` upward and the
//! controller performs the teardown. Persisting strictly before reporting
//! matters: if the process dies right after expiry, the next app launch can
//! still observe that auto-disconnect fired.

mod store;

pub use store::ExpiryFlagStore;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::{AutoDisconnectPolicy, ExpireBehavior};

/// Sentinel returned by time queries while the timer is not running
pub const NOT_ACTIVE: i64 = -1;

/// Timer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Policy inactive or timer not yet armed
    Inactive,
    /// Counting down
    Running,
    /// Reached zero; flag persisted; terminal
    Expired,
    /// Cancelled by explicit user action; terminal
    Cancelled,
}

/// Events reported to the session controller
#[derive(Debug, Clone)]
pub enum TimerEvent {
    /// The countdown reached zero and the flag was persisted
    Expired {
        /// Whether a user-facing notification should accompany teardown
        notify: bool,
        /// Message for the notification, when `notify` is set
        message: String,
    },
}

struct TimerInner {
    state: TimerState,
    remaining_secs: i64,
}

/// Crash-surviving session countdown
///
/// Driven by the controller's shared 1 Hz tick; see [`tick`](Self::tick).
pub struct AutoDisconnectTimer {
    policy: AutoDisconnectPolicy,
    store: Arc<ExpiryFlagStore>,
    inner: Mutex<TimerInner>,
    events_tx: mpsc::UnboundedSender<TimerEvent>,
}

impl AutoDisconnectTimer {
    /// Create a timer for a session's policy
    ///
    /// The timer starts `Inactive`; arm it with [`start`](Self::start).
    #[must_use]
    pub fn new(
        policy: AutoDisconnectPolicy,
        store: Arc<ExpiryFlagStore>,
        events_tx: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        Self {
            policy,
            store,
            inner: Mutex::new(TimerInner {
                state: TimerState::Inactive,
                remaining_secs: 0,
            }),
            events_tx,
        }
    }

    /// Arm the countdown if the policy is active
    ///
    /// A policy with `duration_secs <= 0` leaves the timer `Inactive`.
    pub fn start(&self) {
        if !self.policy.is_active() {
            debug!("auto-disconnect policy inactive, timer not armed");
            return;
        }
        let mut inner = self.inner.lock();
        inner.state = TimerState::Running;
        inner.remaining_secs = self.policy.duration_secs;
        info!(
            duration_secs = self.policy.duration_secs,
            "auto-disconnect timer armed"
        );
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TimerState {
        self.inner.lock().state
    }

    /// Remaining seconds, or [`NOT_ACTIVE`] when not running
    #[must_use]
    pub fn remaining(&self) -> i64 {
        let inner = self.inner.lock();
        match inner.state {
            TimerState::Running => inner.remaining_secs,
            _ => NOT_ACTIVE,
        }
    }

    /// Adjust remaining time by `delta_secs`, floored at zero
    ///
    /// Only valid while `Running`; otherwise a no-op returning
    /// [`NOT_ACTIVE`]. Returns the new remaining time. A floor-to-zero
    /// adjustment expires on the next tick rather than immediately, keeping
    /// expiry on the single tick path.
    pub fn update_time(&self, delta_secs: i64) -> i64 {
        let mut inner = self.inner.lock();
        if inner.state != TimerState::Running {
            return NOT_ACTIVE;
        }
        inner.remaining_secs = inner.remaining_secs.saturating_add(delta_secs).max(0);
        debug!(
            delta_secs,
            remaining_secs = inner.remaining_secs,
            "auto-disconnect time adjusted"
        );
        inner.remaining_secs
    }

    /// Cancel the countdown; terminal
    ///
    /// Clears periodic remaining-time publication (the controller stops
    /// including remaining time once the state is no longer `Running`).
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.state == TimerState::Running {
            inner.state = TimerState::Cancelled;
            info!("auto-disconnect timer cancelled");
        }
    }

    /// Advance the countdown by one second
    ///
    /// Called from the controller's 1 Hz tick task. On reaching zero the
    /// expiry flag is durably persisted *before* the expiry event is sent;
    /// a persist failure is logged and the event is sent anyway, because an
    /// un-torn-down session is worse than an unpersisted flag.
    pub fn tick(&self) {
        let fire = {
            let mut inner = self.inner.lock();
            if inner.state != TimerState::Running {
                return;
            }
            inner.remaining_secs -= 1;
            if inner.remaining_secs > 0 {
                return;
            }
            inner.remaining_secs = 0;
            inner.state = TimerState::Expired;
            true
        };

        if fire {
            info!("auto-disconnect timer expired");
            if let Err(e) = self.store.mark_expired() {
                error!("failed to persist expiry flag: {}", e);
            }
            let notify = self.policy.on_expire == ExpireBehavior::Notify;
            let _ = self.events_tx.send(TimerEvent::Expired {
                notify,
                message: self.policy.notification_message.clone(),
            });
        }
    }

    /// Whether remaining time should appear in status events
    #[must_use]
    pub fn show_remaining(&self) -> bool {
        self.policy.show_remaining_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_timer(
        duration_secs: i64,
    ) -> (
        AutoDisconnectTimer,
        mpsc::UnboundedReceiver<TimerEvent>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ExpiryFlagStore::new(dir.path().join("flag")));
        let (tx, rx) = mpsc::unbounded_channel();
        let policy = AutoDisconnectPolicy {
            duration_secs,
            ..AutoDisconnectPolicy::default()
        };
        (AutoDisconnectTimer::new(policy, store, tx), rx, dir)
    }

    #[test]
    fn test_inactive_policy_never_arms() {
        let (timer, _rx, _dir) = make_timer(0);
        timer.start();
        assert_eq!(timer.state(), TimerState::Inactive);
        assert_eq!(timer.remaining(), NOT_ACTIVE);
        timer.tick();
        assert_eq!(timer.state(), TimerState::Inactive);
    }

    #[test]
    fn test_expires_after_duration_ticks() {
        let (timer, mut rx, _dir) = make_timer(5);
        timer.start();
        assert_eq!(timer.remaining(), 5);

        for _ in 0..4 {
            timer.tick();
        }
        assert_eq!(timer.state(), TimerState::Running);
        assert_eq!(timer.remaining(), 1);

        timer.tick();
        assert_eq!(timer.state(), TimerState::Expired);
        assert!(timer.store.is_set());
        assert!(matches!(
            rx.try_recv().unwrap(),
            TimerEvent::Expired { notify: false, .. }
        ));

        // Further ticks are no-ops on a terminal state.
        timer.tick();
        assert_eq!(timer.state(), TimerState::Expired);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_update_time_adds_and_floors() {
        let (timer, _rx, _dir) = make_timer(10);
        timer.start();

        for _ in 0..8 {
            timer.tick();
        }
        assert_eq!(timer.remaining(), 2);

        assert_eq!(timer.update_time(10), 12);
        assert_eq!(timer.update_time(-100), 0);
        assert_eq!(timer.remaining(), 0);
        assert_eq!(timer.state(), TimerState::Running);
    }

    #[test]
    fn test_update_time_inactive_sentinel() {
        let (timer, _rx, _dir) = make_timer(10);
        assert_eq!(timer.update_time(30), NOT_ACTIVE);

        timer.start();
        timer.cancel();
        assert_eq!(timer.update_time(30), NOT_ACTIVE);
    }

    #[test]
    fn test_cancel_is_terminal() {
        let (timer, mut rx, _dir) = make_timer(3);
        timer.start();
        timer.cancel();
        assert_eq!(timer.state(), TimerState::Cancelled);
        assert_eq!(timer.remaining(), NOT_ACTIVE);

        for _ in 0..5 {
            timer.tick();
        }
        assert_eq!(timer.state(), TimerState::Cancelled);
        assert!(rx.try_recv().is_err());
        assert!(!timer.store.is_set());
    }

    #[test]
    fn test_notify_behavior_carried_in_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ExpiryFlagStore::new(dir.path().join("flag")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let policy = AutoDisconnectPolicy {
            duration_secs: 1,
            on_expire: ExpireBehavior::Notify,
            notification_message: "time is up".into(),
            ..AutoDisconnectPolicy::default()
        };
        let timer = AutoDisconnectTimer::new(policy, store, tx);
        timer.start();
        timer.tick();

        match rx.try_recv().unwrap() {
            TimerEvent::Expired { notify, message } => {
                assert!(notify);
                assert_eq!(message, "time is up");
            }
        }
    }
}
