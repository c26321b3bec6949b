//! Configuration types for vpn-sessiond
//!
//! Two layers of configuration exist: `DaemonConfig` is loaded once from a
//! JSON file at startup and describes the daemon environment (binary paths,
//! socket paths, supervision tuning). `SessionConfig` arrives with each
//! `Start` command and describes a single tunnel session; it is immutable
//! once a start begins and discarded on stop.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Minimum MTU accepted for the virtual interface (RFC 791 floor)
pub const MIN_MTU: u16 = 576;

/// Per-session configuration, supplied with each start request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Remote endpoint as host:port; a literal IPv4 host enables the
    /// exclusion-route optimization, anything else falls back to the
    /// default route
    pub server_addr: String,

    /// Local port the proxy engine listens on (forwarder target)
    pub proxy_port: u16,

    /// Local port the proxy engine answers stats queries on
    pub stats_port: u16,

    /// DNS servers pushed to the virtual interface
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,

    /// Additional CIDR routes forced through the physical network
    #[serde(default)]
    pub bypass_routes: Vec<String>,

    /// Application identifiers excluded from the tunnel
    #[serde(default)]
    pub blocked_apps: Vec<String>,

    /// Human-readable session name (notifications, logs)
    #[serde(default)]
    pub display_name: String,

    /// Run the proxy engine only, without a virtual interface or forwarder
    #[serde(default)]
    pub proxy_only: bool,

    /// Virtual interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Auto-disconnect policy for this session
    #[serde(default)]
    pub auto_disconnect: AutoDisconnectPolicy,
}

impl SessionConfig {
    /// Validate session parameters
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on the first invalid field.
    /// Validation has no side effects; a failed start leaves no state behind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (host, port) = self
            .server_addr
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::validation("server_addr must be host:port"))?;
        if host.is_empty() {
            return Err(ConfigError::validation("server_addr host is empty"));
        }
        port.parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                ConfigError::validation(format!("server_addr has invalid port: {port}"))
            })?;

        if self.proxy_port == 0 {
            return Err(ConfigError::validation("proxy_port must be non-zero"));
        }
        if self.stats_port == 0 {
            return Err(ConfigError::validation("stats_port must be non-zero"));
        }
        if self.proxy_port == self.stats_port {
            return Err(ConfigError::validation(
                "proxy_port and stats_port must differ",
            ));
        }

        if self.mtu < MIN_MTU {
            return Err(ConfigError::validation(format!(
                "mtu {} below minimum {MIN_MTU}",
                self.mtu
            )));
        }

        for route in &self.bypass_routes {
            route.parse::<Ipv4Net>().map_err(|e| {
                ConfigError::validation(format!("bypass route '{route}': {e}"))
            })?;
        }

        Ok(())
    }

    /// Remote host portion of `server_addr`
    #[must_use]
    pub fn server_host(&self) -> &str {
        self.server_addr
            .rsplit_once(':')
            .map_or(self.server_addr.as_str(), |(host, _)| host)
    }
}

/// Behavior when the auto-disconnect timer expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpireBehavior {
    /// Tear the session down without user-visible output
    #[default]
    Silent,
    /// Emit a notification event alongside the teardown
    Notify,
}

/// Auto-disconnect policy for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoDisconnectPolicy {
    /// Countdown duration in seconds; values <= 0 disable the timer
    #[serde(default)]
    pub duration_secs: i64,

    /// What to do when the timer fires
    #[serde(default)]
    pub on_expire: ExpireBehavior,

    /// Message attached to the expiry notification event
    #[serde(default)]
    pub notification_message: String,

    /// Publish remaining time in periodic status events
    #[serde(default = "default_true")]
    pub show_remaining_time: bool,

    /// Display format hint for remaining time (passed through to clients)
    #[serde(default = "default_time_format")]
    pub time_format: String,
}

impl AutoDisconnectPolicy {
    /// Whether this policy arms the timer
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.duration_secs > 0
    }
}

impl Default for AutoDisconnectPolicy {
    fn default() -> Self {
        Self {
            duration_secs: 0,
            on_expire: ExpireBehavior::Silent,
            notification_message: String::new(),
            show_remaining_time: true,
            time_format: default_time_format(),
        }
    }
}

/// Daemon-wide configuration, loaded from a JSON file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Path to the proxy-engine binary
    pub proxy_engine_bin: PathBuf,

    /// Path to the packet-forwarder binary
    pub forwarder_bin: PathBuf,

    /// Unix socket path used for the descriptor handoff to the forwarder
    #[serde(default = "default_transfer_socket")]
    pub transfer_socket: PathBuf,

    /// Unix socket path for the command surface
    #[serde(default = "default_ipc_socket")]
    pub ipc_socket: PathBuf,

    /// Durable expiry-flag location (shared with the controlling app)
    #[serde(default = "default_expiry_flag")]
    pub expiry_flag_path: PathBuf,

    /// Virtual interface name
    #[serde(default = "default_tun_name")]
    pub tun_name: String,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Process supervision tuning
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Descriptor transfer tuning
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl DaemonConfig {
    /// Validate daemon configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_engine_bin.as_os_str().is_empty() {
            return Err(ConfigError::validation("proxy_engine_bin is empty"));
        }
        if self.forwarder_bin.as_os_str().is_empty() {
            return Err(ConfigError::validation("forwarder_bin is empty"));
        }
        if self.tun_name.is_empty() || self.tun_name.len() >= 16 {
            return Err(ConfigError::validation(format!(
                "tun_name must be 1..16 characters, got '{}'",
                self.tun_name
            )));
        }
        self.supervisor.validate()?;
        self.transfer.validate()?;
        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            proxy_engine_bin: PathBuf::from("/usr/local/bin/proxy-engine"),
            forwarder_bin: PathBuf::from("/usr/local/bin/tun-forwarder"),
            transfer_socket: default_transfer_socket(),
            ipc_socket: default_ipc_socket(),
            expiry_flag_path: default_expiry_flag(),
            tun_name: default_tun_name(),
            log: LogConfig::default(),
            supervisor: SupervisorConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include the emitting module target in log lines
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

/// Process supervision tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Grace period between SIGTERM and SIGKILL, in milliseconds
    #[serde(default = "default_term_grace_ms")]
    pub term_grace_ms: u64,

    /// Delay before relaunching a crashed process, in milliseconds
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Maximum consecutive restarts inside the restart window
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Window over which consecutive restarts are counted, in seconds
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,
}

impl SupervisorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_restarts == 0 {
            return Err(ConfigError::validation("max_restarts must be >= 1"));
        }
        if self.restart_window_secs == 0 {
            return Err(ConfigError::validation("restart_window_secs must be >= 1"));
        }
        Ok(())
    }

    /// Grace period as a `Duration`
    #[must_use]
    pub const fn term_grace(&self) -> Duration {
        Duration::from_millis(self.term_grace_ms)
    }

    /// Restart delay as a `Duration`
    #[must_use]
    pub const fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Restart window as a `Duration`
    #[must_use]
    pub const fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            term_grace_ms: default_term_grace_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window_secs(),
        }
    }
}

/// Descriptor transfer tuning
///
/// The forwarder binds its listening socket asynchronously after spawn, so
/// the connect step is retried on a fixed cadence up to a bound.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    /// Delay between connect attempts, in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Maximum connect attempts before the transfer fails
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl TransferConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::validation("transfer max_attempts must be >= 1"));
        }
        Ok(())
    }

    /// Retry interval as a `Duration`
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_mtu() -> u16 {
    1500
}

fn default_time_format() -> String {
    "mm:ss".into()
}

fn default_transfer_socket() -> PathBuf {
    PathBuf::from("/var/run/vpn-sessiond/forwarder.sock")
}

fn default_ipc_socket() -> PathBuf {
    PathBuf::from("/var/run/vpn-sessiond/control.sock")
}

fn default_expiry_flag() -> PathBuf {
    PathBuf::from("/var/run/vpn-sessiond/auto-disconnect.flag")
}

fn default_tun_name() -> String {
    "tun-session0".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_term_grace_ms() -> u64 {
    5000
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_window_secs() -> u64 {
    60
}

fn default_retry_interval_ms() -> u64 {
    200
}

fn default_max_attempts() -> u32 {
    25
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_session() -> SessionConfig {
        SessionConfig {
            server_addr: "203.0.113.7:443".into(),
            proxy_port: 1080,
            stats_port: 1081,
            dns_servers: vec!["1.1.1.1".parse().unwrap()],
            bypass_routes: vec!["10.0.0.0/8".into()],
            blocked_apps: vec![],
            display_name: "test".into(),
            proxy_only: false,
            mtu: 1500,
            auto_disconnect: AutoDisconnectPolicy::default(),
        }
    }

    #[test]
    fn test_valid_session_config() {
        assert!(valid_session().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_server_addr() {
        let mut cfg = valid_session();
        cfg.server_addr = "no-port-here".into();
        assert!(cfg.validate().is_err());

        cfg.server_addr = "host:0".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_ports() {
        let mut cfg = valid_session();
        cfg.stats_port = cfg.proxy_port;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_small_mtu() {
        let mut cfg = valid_session();
        cfg.mtu = 400;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_bypass_route() {
        let mut cfg = valid_session();
        cfg.bypass_routes = vec!["not-a-cidr".into()];
        assert!(cfg.validate().is_err());

        cfg.bypass_routes = vec!["10.0.0.0/40".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_server_host() {
        let cfg = valid_session();
        assert_eq!(cfg.server_host(), "203.0.113.7");
    }

    #[test]
    fn test_policy_activation() {
        let mut policy = AutoDisconnectPolicy::default();
        assert!(!policy.is_active());
        policy.duration_secs = 300;
        assert!(policy.is_active());
        policy.duration_secs = -5;
        assert!(!policy.is_active());
    }

    #[test]
    fn test_daemon_defaults_valid() {
        assert!(DaemonConfig::default_config().validate().is_ok());
    }

    #[test]
    fn test_session_config_json_defaults() {
        let json = r#"{
            "server_addr": "198.51.100.2:8443",
            "proxy_port": 1080,
            "stats_port": 9090
        }"#;
        let cfg: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mtu, 1500);
        assert!(!cfg.proxy_only);
        assert!(!cfg.auto_disconnect.is_active());
        assert!(cfg.validate().is_ok());
    }
}
