//! IPC server
//!
//! Unix socket server for the daemon's control surface, plus the matching
//! client used by tests and control tooling.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::handler::IpcHandler;
use super::protocol::{
    decode_message, encode_message, ErrorCode, IpcCommand, IpcResponse, LENGTH_PREFIX_SIZE,
    MAX_MESSAGE_SIZE,
};
use crate::error::IpcError;

/// IPC server for handling control commands
pub struct IpcServer {
    socket_path: std::path::PathBuf,
    handler: Arc<IpcHandler>,
    /// Stops the accept loop
    shutdown_tx: broadcast::Sender<()>,
}

impl IpcServer {
    pub fn new(socket_path: impl AsRef<Path>, handler: Arc<IpcHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            handler,
            shutdown_tx,
        }
    }

    /// Run the accept loop until shut down
    ///
    /// # Errors
    ///
    /// Socket creation and bind failures; per-connection errors are logged
    /// and do not end the loop.
    pub async fn run(&self) -> Result<(), IpcError> {
        let socket_path = &self.socket_path;

        // A stale socket file from a previous run blocks the bind
        if socket_path.exists() {
            std::fs::remove_file(socket_path).map_err(|e| IpcError::SocketCreation {
                path: socket_path.display().to_string(),
                reason: format!("failed to remove existing socket: {e}"),
            })?;
        }

        if let Some(parent) = socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| IpcError::SocketCreation {
                    path: socket_path.display().to_string(),
                    reason: format!("failed to create parent directory: {e}"),
                })?;
            }
        }

        let listener = UnixListener::bind(socket_path).map_err(|e| IpcError::BindError {
            path: socket_path.display().to_string(),
            reason: e.to_string(),
        })?;

        info!(path = %socket_path.display(), "IPC server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler).await {
                                    debug!(error = %e, "IPC connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "IPC accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("IPC server shutting down");
                    break;
                }
            }
        }

        if socket_path.exists() {
            let _ = std::fs::remove_file(socket_path);
        }

        Ok(())
    }

    /// Get a shutdown signal sender
    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Stop the accept loop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Handle a single IPC connection
///
/// Clients may pipeline multiple commands over one connection; the loop
/// runs until the peer disconnects or sends Shutdown.
async fn handle_connection(
    mut stream: UnixStream,
    handler: Arc<IpcHandler>,
) -> Result<(), IpcError> {
    debug!("new IPC connection");

    loop {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("IPC client disconnected");
                return Ok(());
            }
            Err(e) => return Err(IpcError::from(e)),
        }

        let msg_len = u32::from_be_bytes(len_buf) as usize;

        if msg_len > MAX_MESSAGE_SIZE {
            warn!(msg_len, "IPC message too large");
            let response = IpcResponse::error(
                ErrorCode::InvalidCommand,
                format!("message too large: {msg_len} bytes"),
            );
            send_response(&mut stream, &response).await?;
            // The advertised body was never read; the stream cannot be
            // re-framed, so the connection ends here.
            return Err(IpcError::protocol(format!(
                "oversized frame: {msg_len} bytes"
            )));
        }

        let mut msg_buf = vec![0u8; msg_len];
        stream.read_exact(&mut msg_buf).await?;

        let command: IpcCommand = match decode_message(&msg_buf) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(error = %e, "invalid IPC command");
                let response = IpcResponse::error(
                    ErrorCode::InvalidCommand,
                    format!("invalid command format: {e}"),
                );
                send_response(&mut stream, &response).await?;
                continue;
            }
        };

        debug!(?command, "received IPC command");

        let is_shutdown = matches!(command, IpcCommand::Shutdown);

        let response = handler.handle(command).await;
        send_response(&mut stream, &response).await?;

        if is_shutdown {
            debug!("shutdown command received, closing connection");
            break;
        }
    }

    Ok(())
}

async fn send_response(stream: &mut UnixStream, response: &IpcResponse) -> Result<(), IpcError> {
    let encoded = encode_message(response).map_err(|e| IpcError::serialization(e.to_string()))?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

/// IPC client for connecting to the daemon
pub struct IpcClient {
    socket_path: std::path::PathBuf,
}

impl IpcClient {
    #[must_use]
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Send a command and receive a response
    ///
    /// # Errors
    ///
    /// Connection, framing, and serialization errors.
    pub async fn send(&self, command: IpcCommand) -> Result<IpcResponse, IpcError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| IpcError::ConnectionError(e.to_string()))?;

        let encoded =
            encode_message(&command).map_err(|e| IpcError::serialization(e.to_string()))?;
        stream.write_all(&encoded).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        stream.read_exact(&mut len_buf).await?;
        let msg_len = u32::from_be_bytes(len_buf) as usize;

        if msg_len > MAX_MESSAGE_SIZE {
            return Err(IpcError::protocol(format!(
                "response too large: {msg_len} bytes"
            )));
        }

        let mut msg_buf = vec![0u8; msg_len];
        stream.read_exact(&mut msg_buf).await?;

        decode_message(&msg_buf).map_err(|e| IpcError::protocol(e.to_string()))
    }

    /// Send a ping command
    ///
    /// # Errors
    ///
    /// Transport errors; an unexpected response type yields `Ok(false)`.
    pub async fn ping(&self) -> Result<bool, IpcError> {
        let response = self.send(IpcCommand::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }
}
