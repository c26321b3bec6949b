//! Status snapshots and the periodic status stream

use serde::{Deserialize, Serialize};

use crate::session::state::SessionState;
use crate::stats::TrafficSample;

/// Point-in-time snapshot returned by the status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Current session state
    pub state: SessionState,
    /// Seconds since the session entered `Connected`, 0 otherwise
    pub elapsed_secs: u64,
    /// Last traffic sample taken by the ticker
    pub traffic: TrafficSample,
    /// Remaining auto-disconnect seconds, absent when no timer is armed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<i64>,
    /// Display name of the active session config, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl SessionStatus {
    /// Snapshot for a session that holds no resources
    #[must_use]
    pub fn idle(state: SessionState) -> Self {
        Self {
            state,
            elapsed_secs: 0,
            traffic: TrafficSample::default(),
            remaining_secs: None,
            display_name: None,
        }
    }
}

/// One entry in the 1 Hz status stream published while connected.
///
/// A final event carrying the terminal state is published when the session
/// leaves `Connected`, so stream consumers never have to poll to learn the
/// session ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusEvent {
    /// State at the time the event was built
    pub state: SessionState,
    /// Seconds the session has been connected
    pub elapsed_secs: u64,
    /// Instantaneous upload speed, bytes per second
    pub upload_speed: u64,
    /// Instantaneous download speed, bytes per second
    pub download_speed: u64,
    /// Cumulative uploaded bytes for this session
    pub total_upload: u64,
    /// Cumulative downloaded bytes for this session
    pub total_download: u64,
    /// Remaining auto-disconnect seconds, absent when no timer is armed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<i64>,
}

impl SessionStatusEvent {
    #[must_use]
    pub fn from_sample(
        state: SessionState,
        elapsed_secs: u64,
        sample: &TrafficSample,
        remaining_secs: Option<i64>,
    ) -> Self {
        Self {
            state,
            elapsed_secs,
            upload_speed: sample.up_speed,
            download_speed: sample.down_speed,
            total_upload: sample.total_up,
            total_download: sample.total_down,
            remaining_secs,
        }
    }
}

/// User-facing notification emitted when an expiring timer asks for one.
///
/// The daemon only publishes the event; rendering is the subscriber's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionNotification {
    pub message: String,
}
