//! IPC protocol definitions
//!
//! Command and response types exchanged with clients over the control
//! socket. Messages are length-prefixed JSON; the framing constants and
//! helpers at the bottom are shared with the stats link to the proxy
//! engine, which speaks the same envelope.

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::session::SessionStatus;

/// IPC command types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcCommand {
    /// Ping to check if the daemon is alive
    Ping,

    /// Start a session with the given configuration
    Start {
        /// Per-session configuration
        config: SessionConfig,
    },

    /// Stop the current session
    Stop,

    /// Get the current session status
    Status,

    /// Measure TCP connect latency over the physical network
    GetDelay {
        /// Probe target: `host:port`, or an http(s) URL
        target: String,
    },

    /// Measure latency to a URL through the connected session's tunnel
    GetConnectedDelay {
        /// Probe target URL, measured by the engine through the tunnel
        target: String,
    },

    /// Adjust the running auto-disconnect countdown
    UpdateAutoDisconnectTime {
        /// Seconds to add (negative subtracts)
        delta_secs: i64,
    },

    /// Get remaining auto-disconnect seconds
    GetRemainingAutoDisconnectTime,

    /// Cancel the auto-disconnect countdown for this session
    CancelAutoDisconnect,

    /// Check whether a past session ended by auto-disconnect
    WasAutoDisconnected,

    /// Acknowledge and clear the auto-disconnect flag
    ClearAutoDisconnectFlag,

    /// Initiate graceful daemon shutdown
    Shutdown,
}

/// IPC response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Ping response
    Pong,

    /// Session status snapshot
    Status(SessionStatus),

    /// Delay measurement result
    Delay {
        /// Measured latency in milliseconds
        delay_ms: u64,
    },

    /// Remaining auto-disconnect time
    Remaining {
        /// Seconds left, -1 when no timer is running
        remaining_secs: i64,
    },

    /// Boolean flag result (WasAutoDisconnected)
    Flag {
        /// Whether the flag is set
        set: bool,
    },

    /// Success response for commands that return no data
    Success {
        /// Optional message
        message: Option<String>,
    },

    /// Error response
    Error(IpcFailure),
}

impl IpcResponse {
    /// Create a success response with no message
    #[must_use]
    pub const fn success() -> Self {
        Self::Success { message: None }
    }

    /// Create an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(IpcFailure {
            code,
            message: message.into(),
        })
    }

    /// Check if this is an error response
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Error payload carried in an [`IpcResponse::Error`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcFailure {
    /// Error code
    pub code: ErrorCode,
    /// Error message
    pub message: String,
}

impl std::fmt::Display for IpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for IpcFailure {}

/// Error codes for IPC responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Unknown error
    Unknown,
    /// Invalid command
    InvalidCommand,
    /// Another session operation is in flight
    Busy,
    /// Session configuration rejected
    InvalidConfig,
    /// Tunnel permission denied
    PermissionDenied,
    /// Operation requires a connected session
    NotConnected,
    /// Operation failed
    OperationFailed,
    /// Daemon is shutting down
    ShuttingDown,
    /// Internal error
    InternalError,
}

/// Message framing for IPC
///
/// Messages are length-prefixed:
/// - 4 bytes: message length (big-endian u32)
/// - N bytes: JSON message
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1 MB
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a message with length prefix
///
/// # Errors
///
/// Serialization errors from `serde_json`.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode the body of a length-prefixed message
///
/// # Errors
///
/// Deserialization errors from `serde_json`.
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}
