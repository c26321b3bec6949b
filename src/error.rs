//! Error types for vpn-sessiond
//!
//! This module defines the error hierarchy for the session orchestrator.
//! Errors are categorized by subsystem and include recovery hints.

use std::io;

use thiserror::Error;

use crate::supervisor::ProcessRole;

/// Top-level error type for vpn-sessiond
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Session lifecycle errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Process supervision errors
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Descriptor transfer errors
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Platform (virtual interface) errors
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// IPC communication errors
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// Stats collection errors
    #[error("Stats error: {0}")]
    Stats(#[from] StatsError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl OrchestratorError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Session(e) => e.is_recoverable(),
            Self::Supervisor(e) => e.is_recoverable(),
            Self::Transfer(e) => e.is_recoverable(),
            Self::Platform(e) => e.is_recoverable(),
            Self::Ipc(e) => e.is_recoverable(),
            Self::Stats(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Session lifecycle errors
///
/// These are the errors the controlling application sees. Configuration and
/// permission failures are surfaced synchronously with no state change;
/// mid-sequence failures are surfaced only after full rollback to
/// `Disconnected`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A start or stop is already in flight (single-flight guard)
    #[error("Session operation already in progress")]
    Busy,

    /// Session configuration is invalid
    #[error("Invalid session configuration: {0}")]
    ConfigInvalid(#[from] ConfigError),

    /// Platform declined to grant tunnel capability
    #[error("Tunnel permission denied")]
    PermissionDenied,

    /// Platform refused to create the virtual interface
    #[error("Failed to establish virtual interface: {0}")]
    InterfaceEstablishFailed(String),

    /// A managed process failed to launch
    #[error("Failed to launch {role} process: {reason}")]
    ProcessLaunchFailed { role: ProcessRole, reason: String },

    /// Descriptor transfer retries exhausted
    #[error("Descriptor transfer failed: {0}")]
    DescriptorTransferFailed(#[from] TransferError),

    /// Restart budget exhausted for a managed process
    #[error("{role} process is unstable: restart budget exhausted")]
    ProcessUnstable { role: ProcessRole },

    /// Operation requires a connected session
    #[error("Session is not connected")]
    NotConnected,

    /// Internal error that does not fit the taxonomy
    #[error("Internal session error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Busy => true,
            Self::ConfigInvalid(_) => false,
            Self::PermissionDenied => false,
            Self::InterfaceEstablishFailed(_) => true,
            Self::ProcessLaunchFailed { .. } => true,
            Self::DescriptorTransferFailed(e) => e.is_recoverable(),
            Self::ProcessUnstable { .. } => false,
            Self::NotConnected => true,
            Self::Internal(_) => false,
        }
    }
}

/// Process supervision errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Failed to spawn a child process
    #[error("Failed to spawn {role}: {reason}")]
    SpawnFailed { role: ProcessRole, reason: String },

    /// A live handle for this role already exists
    #[error("A {role} process is already running (pid {pid})")]
    AlreadyRunning { role: ProcessRole, pid: u32 },

    /// Child process stdio could not be captured
    #[error("Failed to capture {role} output: {reason}")]
    StdioUnavailable { role: ProcessRole, reason: String },

    /// I/O error
    #[error("Supervisor I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl SupervisorError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SpawnFailed { .. } => true,
            Self::AlreadyRunning { .. } => false,
            Self::StdioUnavailable { .. } => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Descriptor transfer errors
#[derive(Debug, Error)]
pub enum TransferError {
    /// Connect retries to the forwarder socket exhausted
    #[error("Forwarder socket {path} not reachable after {attempts} attempts")]
    RetriesExhausted { path: String, attempts: u32 },

    /// sendmsg/recvmsg failed
    #[error("Ancillary message error: {0}")]
    AncillaryError(String),

    /// Peer closed the socket before the transfer completed
    #[error("Transfer socket closed prematurely")]
    PeerClosed,

    /// Transfer cancelled by session teardown
    #[error("Transfer cancelled")]
    Cancelled,

    /// I/O error
    #[error("Transfer I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TransferError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::RetriesExhausted { .. } => true,
            Self::AncillaryError(_) => false,
            Self::PeerClosed => true,
            Self::Cancelled => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::ConnectionRefused
            ),
        }
    }
}

/// Platform (virtual interface) errors
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Tunnel capability not granted
    #[error("Tunnel permission denied: {0}")]
    PermissionDenied(String),

    /// Interface creation failed (e.g., conflicting tunnel already active)
    #[error("Failed to establish interface {name}: {reason}")]
    EstablishFailed { name: String, reason: String },

    /// Interface name rejected by the platform
    #[error("Invalid interface name: {0}")]
    InvalidName(String),

    /// I/O error
    #[error("Platform I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl PlatformError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::PermissionDenied(_) => false,
            Self::EstablishFailed { .. } => true,
            Self::InvalidName(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create an establish error
    pub fn establish(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EstablishFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// IPC communication errors
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to create Unix socket
    #[error("Failed to create IPC socket at {path}: {reason}")]
    SocketCreation { path: String, reason: String },

    /// Failed to bind Unix socket
    #[error("Failed to bind IPC socket to {path}: {reason}")]
    BindError { path: String, reason: String },

    /// Connection error
    #[error("IPC connection error: {0}")]
    ConnectionError(String),

    /// Protocol error (invalid message format)
    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    /// Serialization error
    #[error("IPC serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("IPC I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl IpcError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation { .. } => false,
            Self::BindError { .. } => false,
            Self::ConnectionError(_) => true,
            Self::ProtocolError(_) => true,
            Self::SerializationError(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }
}

/// Stats collection errors
///
/// Stats failures are non-fatal by design: the collector holds the previous
/// totals and reports zero throughput for the failed interval.
#[derive(Debug, Error)]
pub enum StatsError {
    /// Engine control port not reachable
    #[error("Stats endpoint unreachable: {0}")]
    Unreachable(String),

    /// Engine returned a malformed reply
    #[error("Malformed stats reply: {0}")]
    MalformedReply(String),

    /// Query timed out
    #[error("Stats query timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Delay probe target could not be parsed
    #[error("Invalid probe target: {0}")]
    InvalidTarget(String),

    /// I/O error
    #[error("Stats I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// Type alias for Result with OrchestratorError
pub type Result<T> = std::result::Result<T, OrchestratorError>;
