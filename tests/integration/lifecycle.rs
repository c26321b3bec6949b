//! Session lifecycle integration tests
//!
//! Exercises the start/stop sequencing, rollback on failure, and the
//! single-flight guard against the mock platform.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use vpn_sessiond::error::SessionError;
use vpn_sessiond::platform::mock::MockTun;
use vpn_sessiond::session::{SessionController, SessionState};

use super::{proxy_only_session, test_controller, test_daemon_config};

/// Controller whose transfer socket is never bound and whose retry budget
/// holds an in-flight start in `Connecting` for several seconds
fn slow_transfer_controller(dir: &Path) -> (Arc<SessionController>, Arc<MockTun>) {
    let mut daemon = test_daemon_config(dir);
    daemon.transfer.max_attempts = 100;
    daemon.transfer.retry_interval_ms = 50;
    let platform = MockTun::new();
    let controller = SessionController::new(daemon, platform.clone());
    (controller, platform)
}

#[tokio::test]
async fn test_full_lifecycle_proxy_only() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, platform) = test_controller(dir.path());

    assert_eq!(controller.state(), SessionState::Disconnected);

    controller.start(proxy_only_session()).await.unwrap();
    assert_eq!(controller.state(), SessionState::Connected);
    assert_eq!(platform.establish_count(), 0);

    let status = controller.status();
    assert_eq!(status.state, SessionState::Connected);
    assert_eq!(status.display_name.as_deref(), Some("integration"));

    controller.stop().await;
    assert_eq!(controller.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_stop_without_session_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _platform) = test_controller(dir.path());

    controller.stop().await;
    controller.stop().await;
    assert_eq!(controller.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_concurrent_stops_both_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _platform) = test_controller(dir.path());

    controller.start(proxy_only_session()).await.unwrap();

    let c1 = controller.clone();
    let c2 = controller.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { c1.stop().await }),
        tokio::spawn(async move { c2.stop().await }),
    );
    r1.unwrap();
    r2.unwrap();

    assert_eq!(controller.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_start_while_session_exists_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _platform) = test_controller(dir.path());

    controller.start(proxy_only_session()).await.unwrap();
    let err = controller.start(proxy_only_session()).await.unwrap_err();
    assert!(matches!(err, SessionError::Busy));

    controller.stop().await;
}

#[tokio::test]
async fn test_failed_establish_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, platform) = test_controller(dir.path());
    platform.fail_establish(true);

    let mut config = proxy_only_session();
    config.proxy_only = false;

    let err = controller.start(config).await.unwrap_err();
    assert!(matches!(err, SessionError::InterfaceEstablishFailed(_)));
    assert_eq!(controller.state(), SessionState::Disconnected);

    // A later start with the fault cleared works
    platform.fail_establish(false);
    controller.start(proxy_only_session()).await.unwrap();
    assert_eq!(controller.state(), SessionState::Connected);
    controller.stop().await;
}

#[tokio::test]
async fn test_transfer_failure_releases_interface() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, platform) = test_controller(dir.path());

    // Nothing ever binds the transfer socket, so the handoff retries out.
    // The /bin/sleep forwarder exits immediately as well, which only
    // shortens the wait.
    let mut config = proxy_only_session();
    config.proxy_only = false;

    let err = controller.start(config).await.unwrap_err();
    assert!(matches!(err, SessionError::DescriptorTransferFailed(_)));
    assert_eq!(controller.state(), SessionState::Disconnected);
    assert_eq!(platform.establish_count(), 1);
    assert_eq!(platform.release_count(), 1);
}

#[tokio::test]
async fn test_state_watch_sees_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _platform) = test_controller(dir.path());

    let mut state_rx = controller.subscribe_state();
    let watcher = tokio::spawn(async move {
        state_rx
            .wait_for(|s| *s == SessionState::Connecting)
            .await
            .map(|_| ())
    });

    controller.start(proxy_only_session()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), watcher)
        .await
        .expect("connecting state was never observed")
        .unwrap()
        .unwrap();

    controller.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_inflight_start() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, platform) = slow_transfer_controller(dir.path());

    let mut config = proxy_only_session();
    config.proxy_only = false;

    let mut state_rx = controller.subscribe_state();
    let starter = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start(config).await })
    };

    // Let the start reach the transfer retry loop before pulling the plug.
    tokio::time::timeout(
        Duration::from_secs(2),
        state_rx.wait_for(|s| *s == SessionState::Connecting),
    )
    .await
    .expect("start never reached connecting")
    .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    controller.stop().await;

    let err = tokio::time::timeout(Duration::from_secs(2), starter)
        .await
        .expect("start did not unwind after stop")
        .unwrap()
        .unwrap_err();
    match err {
        SessionError::Internal(msg) => assert_eq!(msg, "start cancelled by stop"),
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(controller.state(), SessionState::Disconnected);
    // The interface that was established during the aborted start is gone.
    assert_eq!(platform.establish_count(), 1);
    assert_eq!(platform.release_count(), 1);
}

#[tokio::test]
async fn test_status_stream_active_while_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _platform) = slow_transfer_controller(dir.path());
    let mut status_rx = controller.subscribe_status();

    let mut config = proxy_only_session();
    config.proxy_only = false;

    let starter = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start(config).await })
    };

    // The stream must carry periodic events while the session is still
    // being brought up, not only after it reaches Connected.
    let mut connecting_events = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(2500);
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, status_rx.recv()).await {
        if event.state == SessionState::Connecting {
            connecting_events += 1;
        }
    }
    assert!(
        connecting_events >= 2,
        "expected periodic status events while connecting, got {connecting_events}"
    );

    controller.stop().await;
    assert!(starter.await.unwrap().is_err());
}

#[tokio::test]
async fn test_status_stream_ends_with_terminal_event() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _platform) = test_controller(dir.path());

    controller.start(proxy_only_session()).await.unwrap();
    let mut status_rx = controller.subscribe_status();
    controller.stop().await;

    // Drain until the terminal event shows up
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let event = tokio::time::timeout_at(deadline, status_rx.recv())
            .await
            .expect("no terminal status event")
            .expect("status stream closed");
        if event.state == SessionState::Disconnected {
            break;
        }
    }
}
