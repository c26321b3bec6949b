//! vpn-sessiond: VPN session orchestration daemon
//!
//! This crate manages the full lifecycle of a device-wide VPN session: it
//! supervises the external proxy engine and packet forwarder processes,
//! establishes the virtual interface, hands its file descriptor to the
//! forwarder over a Unix socket, and exposes a control surface over IPC.
//!
//! # Architecture
//!
//! ```text
//! Client (IPC) → SessionController → ProcessSupervisor → proxy engine
//!                       ↓                              → forwarder
//!                 TunPlatform (TUN fd) ─ SCM_RIGHTS ──→ forwarder
//!                       ↓
//!                 AutoDisconnectTimer / StatsCollector
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vpn_sessiond::config::load_config;
//! use vpn_sessiond::platform::linux::LinuxTun;
//! use vpn_sessiond::session::SessionController;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let daemon = load_config("/etc/vpn-sessiond/config.json")?;
//! let controller = SessionController::new(daemon, Arc::new(LinuxTun::new()));
//!
//! // Wire up the IPC server and start serving commands...
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`autodisconnect`]: crash-surviving session countdown
//! - [`config`]: configuration types and loading
//! - [`error`]: error types
//! - [`ipc`]: IPC server and protocol
//! - [`platform`]: virtual interface platform abstraction
//! - [`routing`]: CIDR exclusion route planning
//! - [`session`]: session state machine and controller
//! - [`stats`]: traffic sampling and delay probes
//! - [`supervisor`]: managed process supervision
//! - [`transfer`]: descriptor handoff over Unix sockets

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod autodisconnect;
pub mod config;
pub mod error;
pub mod ipc;
pub mod platform;
pub mod routing;
pub mod session;
pub mod stats;
pub mod supervisor;
pub mod transfer;

// Re-export commonly used types at the crate root
pub use config::{DaemonConfig, SessionConfig};
pub use error::{
    ConfigError, IpcError, OrchestratorError, PlatformError, SessionError, StatsError,
    SupervisorError, TransferError,
};
pub use ipc::{IpcClient, IpcCommand, IpcResponse, IpcServer};
pub use session::{SessionController, SessionState, SessionStatus};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::VERSION;

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
