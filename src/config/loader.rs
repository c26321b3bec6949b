//! Configuration loading and management
//!
//! Loads the daemon configuration from a JSON file with optional
//! environment-variable overrides.

use std::path::Path;

use tracing::{debug, info};

use super::types::DaemonConfig;
use crate::error::ConfigError;

/// Load daemon configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<DaemonConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: DaemonConfig = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(
        "Configuration loaded: engine={:?}, forwarder={:?}, ipc={:?}",
        config.proxy_engine_bin, config.forwarder_bin, config.ipc_socket
    );

    Ok(config)
}

/// Load daemon configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<DaemonConfig, ConfigError> {
    let config: DaemonConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `VPN_SESSIOND_LOG_LEVEL`: Override log level
/// - `VPN_SESSIOND_IPC_SOCKET`: Override IPC socket path
/// - `VPN_SESSIOND_PROXY_BIN`: Override proxy-engine binary path
/// - `VPN_SESSIOND_FORWARDER_BIN`: Override forwarder binary path
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<DaemonConfig, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(level) = std::env::var("VPN_SESSIOND_LOG_LEVEL") {
        match level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {
                config.log.level = level.to_lowercase();
                debug!("Log level overridden to {}", config.log.level);
            }
            other => {
                return Err(ConfigError::EnvError {
                    name: "VPN_SESSIOND_LOG_LEVEL".into(),
                    reason: format!("Invalid log level: {other}"),
                })
            }
        }
    }

    if let Ok(path) = std::env::var("VPN_SESSIOND_IPC_SOCKET") {
        config.ipc_socket = path.into();
        debug!("IPC socket overridden to {:?}", config.ipc_socket);
    }

    if let Ok(path) = std::env::var("VPN_SESSIOND_PROXY_BIN") {
        config.proxy_engine_bin = path.into();
        debug!("Proxy engine binary overridden to {:?}", config.proxy_engine_bin);
    }

    if let Ok(path) = std::env::var("VPN_SESSIOND_FORWARDER_BIN") {
        config.forwarder_bin = path.into();
        debug!("Forwarder binary overridden to {:?}", config.forwarder_bin);
    }

    config.validate()?;

    Ok(config)
}

/// Write a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if serialization or the write fails.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let config = DaemonConfig::default_config();

    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    std::fs::write(path, json)?;
    info!("Default configuration written to {:?}", path);

    Ok(())
}
