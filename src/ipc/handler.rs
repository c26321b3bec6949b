//! IPC command handler
//!
//! Maps protocol commands onto the session controller. Every command a
//! client can send terminates in exactly one response; handler methods
//! never panic and never block on session work longer than the operation
//! itself takes.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use super::protocol::{ErrorCode, IpcCommand, IpcResponse};
use crate::error::SessionError;
use crate::session::SessionController;

/// Handles IPC commands against the session controller
pub struct IpcHandler {
    controller: Arc<SessionController>,
    /// Raised when a client asks the daemon to shut down
    shutdown_tx: broadcast::Sender<()>,
}

impl IpcHandler {
    pub fn new(controller: Arc<SessionController>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            controller,
            shutdown_tx,
        }
    }

    /// Handle a single command
    pub async fn handle(&self, command: IpcCommand) -> IpcResponse {
        match command {
            IpcCommand::Ping => IpcResponse::Pong,

            IpcCommand::Start { config } => match self.controller.start(config).await {
                Ok(()) => IpcResponse::success(),
                Err(e) => session_error_response(&e),
            },

            IpcCommand::Stop => {
                self.controller.stop().await;
                IpcResponse::success()
            }

            IpcCommand::Status => IpcResponse::Status(self.controller.status()),

            IpcCommand::GetDelay { target } => match self.controller.get_delay(&target).await {
                Ok(delay_ms) => IpcResponse::Delay { delay_ms },
                Err(e) => {
                    warn!(target, error = %e, "delay probe failed");
                    session_error_response(&e)
                }
            },

            IpcCommand::GetConnectedDelay { target } => {
                match self.controller.get_connected_delay(&target).await {
                    Ok(delay_ms) => IpcResponse::Delay { delay_ms },
                    Err(e) => session_error_response(&e),
                }
            }

            IpcCommand::UpdateAutoDisconnectTime { delta_secs } => IpcResponse::Remaining {
                remaining_secs: self.controller.update_auto_disconnect_time(delta_secs),
            },

            IpcCommand::GetRemainingAutoDisconnectTime => IpcResponse::Remaining {
                remaining_secs: self.controller.remaining_auto_disconnect_time(),
            },

            IpcCommand::CancelAutoDisconnect => {
                self.controller.cancel_auto_disconnect();
                IpcResponse::success()
            }

            IpcCommand::WasAutoDisconnected => IpcResponse::Flag {
                set: self.controller.was_auto_disconnected(),
            },

            IpcCommand::ClearAutoDisconnectFlag => {
                match self.controller.clear_auto_disconnect_flag() {
                    Ok(()) => IpcResponse::success(),
                    Err(e) => session_error_response(&e),
                }
            }

            IpcCommand::Shutdown => {
                info!("shutdown requested over IPC");
                let _ = self.shutdown_tx.send(());
                IpcResponse::success()
            }
        }
    }
}

/// Map a session error onto the wire error taxonomy
fn session_error_response(err: &SessionError) -> IpcResponse {
    let code = match err {
        SessionError::Busy => ErrorCode::Busy,
        SessionError::ConfigInvalid(_) => ErrorCode::InvalidConfig,
        SessionError::PermissionDenied => ErrorCode::PermissionDenied,
        SessionError::NotConnected => ErrorCode::NotConnected,
        SessionError::InterfaceEstablishFailed(_)
        | SessionError::ProcessLaunchFailed { .. }
        | SessionError::DescriptorTransferFailed(_)
        | SessionError::ProcessUnstable { .. } => ErrorCode::OperationFailed,
        SessionError::Internal(_) => ErrorCode::InternalError,
    };
    IpcResponse::error(code, err.to_string())
}
