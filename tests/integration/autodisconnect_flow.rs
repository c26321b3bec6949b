//! Auto-disconnect flow: countdown expiry, flag persistence across
//! controller instances, and acknowledgement

use std::time::Duration;

use vpn_sessiond::session::SessionState;

use super::{proxy_only_session, test_controller};

#[tokio::test]
async fn test_expiry_ends_session_and_sets_flag() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _platform) = test_controller(dir.path());

    let mut config = proxy_only_session();
    config.auto_disconnect.duration_secs = 2;
    controller.start(config).await.unwrap();

    let mut state_rx = controller.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(10),
        state_rx.wait_for(|s| *s == SessionState::AutoDisconnected),
    )
    .await
    .expect("countdown never expired")
    .unwrap();

    assert!(controller.was_auto_disconnected());

    // Remaining time queries go inactive once the session is down
    assert_eq!(controller.remaining_auto_disconnect_time(), -1);
}

#[tokio::test]
async fn test_flag_survives_controller_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let (controller, _platform) = test_controller(dir.path());
        let mut config = proxy_only_session();
        config.auto_disconnect.duration_secs = 1;
        controller.start(config).await.unwrap();

        let mut state_rx = controller.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(10),
            state_rx.wait_for(|s| *s == SessionState::AutoDisconnected),
        )
        .await
        .expect("countdown never expired")
        .unwrap();
    }

    // A fresh controller over the same paths still sees the flag
    let (controller, _platform) = test_controller(dir.path());
    assert!(controller.was_auto_disconnected());

    controller.clear_auto_disconnect_flag().unwrap();
    assert!(!controller.was_auto_disconnected());
}

#[tokio::test]
async fn test_cancel_prevents_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _platform) = test_controller(dir.path());

    let mut config = proxy_only_session();
    config.auto_disconnect.duration_secs = 2;
    controller.start(config).await.unwrap();

    controller.cancel_auto_disconnect();

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(controller.state(), SessionState::Connected);
    assert!(!controller.was_auto_disconnected());

    controller.stop().await;
    assert_eq!(controller.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_extend_countdown_defers_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _platform) = test_controller(dir.path());

    let mut config = proxy_only_session();
    config.auto_disconnect.duration_secs = 600;
    controller.start(config).await.unwrap();

    let before = controller.remaining_auto_disconnect_time();
    assert!(before > 0 && before <= 600);

    let after = controller.update_auto_disconnect_time(300);
    assert!(after > before);

    controller.stop().await;
}

#[tokio::test]
async fn test_user_stop_does_not_set_flag() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _platform) = test_controller(dir.path());

    let mut config = proxy_only_session();
    config.auto_disconnect.duration_secs = 600;
    controller.start(config).await.unwrap();

    controller.stop().await;
    assert_eq!(controller.state(), SessionState::Disconnected);
    assert!(!controller.was_auto_disconnected());
}

#[tokio::test]
async fn test_restart_after_auto_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _platform) = test_controller(dir.path());

    let mut config = proxy_only_session();
    config.auto_disconnect.duration_secs = 1;
    controller.start(config).await.unwrap();

    let mut state_rx = controller.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(10),
        state_rx.wait_for(|s| *s == SessionState::AutoDisconnected),
    )
    .await
    .expect("countdown never expired")
    .unwrap();

    // Starting again is allowed without clearing the flag first
    controller.start(proxy_only_session()).await.unwrap();
    assert_eq!(controller.state(), SessionState::Connected);
    assert!(controller.was_auto_disconnected());

    controller.stop().await;
}
