//! End-to-end IPC tests: real Unix socket, real server, real client

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use vpn_sessiond::ipc::{ErrorCode, IpcClient, IpcCommand, IpcHandler, IpcResponse, IpcServer};
use vpn_sessiond::session::SessionState;

use super::{proxy_only_session, test_controller};

struct TestDaemon {
    client: IpcClient,
    shutdown_tx: broadcast::Sender<()>,
    server_handle: JoinHandle<()>,
}

impl TestDaemon {
    async fn spawn(dir: &Path) -> Self {
        let socket_path = dir.join("control.sock");
        let (controller, _platform) = test_controller(dir);

        let (daemon_shutdown_tx, _) = broadcast::channel(1);
        let handler = Arc::new(IpcHandler::new(controller, daemon_shutdown_tx));

        let server = IpcServer::new(&socket_path, handler);
        let shutdown_tx = server.shutdown_sender();
        let server_handle = tokio::spawn(async move {
            let _ = server.run().await;
        });

        for _ in 0..100 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Self {
            client: IpcClient::new(&socket_path),
            shutdown_tx,
            server_handle,
        }
    }

    async fn finish(self) {
        let _ = self.shutdown_tx.send(());
        let _ = tokio::time::timeout(Duration::from_secs(2), self.server_handle).await;
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::spawn(dir.path()).await;

    assert!(daemon.client.ping().await.unwrap());

    daemon.finish().await;
}

#[tokio::test]
async fn test_start_status_stop_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::spawn(dir.path()).await;

    let resp = daemon
        .client
        .send(IpcCommand::Start {
            config: proxy_only_session(),
        })
        .await
        .unwrap();
    assert!(!resp.is_error(), "start failed: {resp:?}");

    match daemon.client.send(IpcCommand::Status).await.unwrap() {
        IpcResponse::Status(status) => {
            assert_eq!(status.state, SessionState::Connected);
            assert_eq!(status.display_name.as_deref(), Some("integration"));
        }
        other => panic!("expected status, got {other:?}"),
    }

    let resp = daemon.client.send(IpcCommand::Stop).await.unwrap();
    assert!(!resp.is_error());

    match daemon.client.send(IpcCommand::Status).await.unwrap() {
        IpcResponse::Status(status) => assert_eq!(status.state, SessionState::Disconnected),
        other => panic!("expected status, got {other:?}"),
    }

    daemon.finish().await;
}

#[tokio::test]
async fn test_stop_idempotent_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::spawn(dir.path()).await;

    for _ in 0..3 {
        let resp = daemon.client.send(IpcCommand::Stop).await.unwrap();
        assert!(!resp.is_error());
    }

    daemon.finish().await;
}

#[tokio::test]
async fn test_timer_surface_without_timer() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::spawn(dir.path()).await;

    match daemon
        .client
        .send(IpcCommand::GetRemainingAutoDisconnectTime)
        .await
        .unwrap()
    {
        IpcResponse::Remaining { remaining_secs } => assert_eq!(remaining_secs, -1),
        other => panic!("expected remaining, got {other:?}"),
    }

    match daemon
        .client
        .send(IpcCommand::UpdateAutoDisconnectTime { delta_secs: 600 })
        .await
        .unwrap()
    {
        IpcResponse::Remaining { remaining_secs } => assert_eq!(remaining_secs, -1),
        other => panic!("expected remaining, got {other:?}"),
    }

    match daemon
        .client
        .send(IpcCommand::WasAutoDisconnected)
        .await
        .unwrap()
    {
        IpcResponse::Flag { set } => assert!(!set),
        other => panic!("expected flag, got {other:?}"),
    }

    daemon.finish().await;
}

#[tokio::test]
async fn test_connected_delay_reports_not_connected() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::spawn(dir.path()).await;

    match daemon
        .client
        .send(IpcCommand::GetConnectedDelay {
            target: "https://example.com/gen_204".into(),
        })
        .await
        .unwrap()
    {
        IpcResponse::Error(failure) => assert_eq!(failure.code, ErrorCode::NotConnected),
        other => panic!("expected error, got {other:?}"),
    }

    daemon.finish().await;
}

#[tokio::test]
async fn test_invalid_config_rejected_with_code() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::spawn(dir.path()).await;

    let mut config = proxy_only_session();
    config.server_addr = "no-port-here".into();

    match daemon
        .client
        .send(IpcCommand::Start { config })
        .await
        .unwrap()
    {
        IpcResponse::Error(failure) => assert_eq!(failure.code, ErrorCode::InvalidConfig),
        other => panic!("expected error, got {other:?}"),
    }

    daemon.finish().await;
}

#[tokio::test]
async fn test_pipelined_commands_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::spawn(dir.path()).await;

    // IpcClient opens one connection per send; this verifies the server
    // survives several back-to-back short connections without dropping any.
    for _ in 0..10 {
        assert!(daemon.client.ping().await.unwrap());
    }

    daemon.finish().await;
}
