//! Integration tests for vpn-sessiond
//!
//! These tests exercise the daemon's components together in realistic
//! scenarios, using the scriptable mock platform and `/bin/sleep` as a
//! stand-in for the external engine binaries.
//!
//! # Test Organization
//!
//! - `lifecycle`: session start/stop sequencing and state machine behavior
//! - `ipc_roundtrip`: full client-server IPC exchanges
//! - `descriptor_transfer`: SCM_RIGHTS handoff between real sockets
//! - `autodisconnect_flow`: countdown, persistence, and acknowledgement

pub mod autodisconnect_flow;
pub mod descriptor_transfer;
pub mod ipc_roundtrip;
pub mod lifecycle;

use std::path::Path;
use std::sync::Arc;

use vpn_sessiond::config::{DaemonConfig, SessionConfig};
use vpn_sessiond::platform::mock::MockTun;
use vpn_sessiond::session::SessionController;

/// Daemon config pointing all paths into a temp dir and both engine
/// binaries at `/bin/sleep`
pub fn test_daemon_config(dir: &Path) -> DaemonConfig {
    let mut daemon = DaemonConfig::default_config();
    daemon.proxy_engine_bin = "/bin/sleep".into();
    daemon.forwarder_bin = "/bin/sleep".into();
    daemon.transfer_socket = dir.join("transfer.sock");
    daemon.ipc_socket = dir.join("ipc.sock");
    daemon.expiry_flag_path = dir.join("expired");
    daemon.transfer.max_attempts = 5;
    daemon.transfer.retry_interval_ms = 50;
    daemon
}

/// A proxy-only session config; no interface or forwarder involved
pub fn proxy_only_session() -> SessionConfig {
    serde_json::from_str(
        r#"{
            "server_addr": "203.0.113.10:443",
            "proxy_port": 28086,
            "stats_port": 29091,
            "display_name": "integration",
            "proxy_only": true
        }"#,
    )
    .expect("static config is valid")
}

/// Controller wired to a fresh mock platform
pub fn test_controller(dir: &Path) -> (Arc<SessionController>, Arc<MockTun>) {
    let platform = MockTun::new();
    let controller = SessionController::new(test_daemon_config(dir), platform.clone());
    (controller, platform)
}
