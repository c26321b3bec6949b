//! Session state machine
//!
//! Transitions are owned exclusively by the `SessionController`; everything
//! else observes them through the state watch channel. The `Connecting`
//! intermediate is mandatory: collapsing `Disconnected -> Connected` hides
//! the window in which the interface exists but no traffic path does, and
//! that false-connected window has broken routing before.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session resources exist
    Disconnected,
    /// Start sequence in progress
    Connecting,
    /// Interface live, descriptor transferred, traffic path up
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Torn down by the auto-disconnect timer; terminal until acknowledged
    AutoDisconnected,
}

impl SessionState {
    /// Whether a direct transition to `next` is allowed
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{
            AutoDisconnected, Connected, Connecting, Disconnected, Disconnecting,
        };
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                // Rollback on a mid-sequence start failure
                | (Connecting, Disconnected)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
                | (Disconnecting, AutoDisconnected)
                // Acknowledging an auto-disconnect normalizes the state
                | (AutoDisconnected, Disconnected)
        )
    }

    /// Whether the session holds no resources in this state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::AutoDisconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::AutoDisconnected => "auto_disconnected",
        };
        f.write_str(s)
    }
}
