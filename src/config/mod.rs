//! Configuration module
//!
//! Session and daemon configuration types, validation, and loading.

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    AutoDisconnectPolicy, DaemonConfig, ExpireBehavior, LogConfig, SessionConfig,
    SupervisorConfig, TransferConfig,
};
