//! Descriptor handoff over a real Unix socket, sender and receiver driven
//! from one test process

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, IntoRawFd, FromRawFd};
use std::os::unix::net::UnixListener;
use std::time::Duration;

use vpn_sessiond::config::TransferConfig;
use vpn_sessiond::error::TransferError;
use vpn_sessiond::transfer::{recv_descriptor, send_descriptor, CancelFlag};

fn fast_transfer_config() -> TransferConfig {
    let mut config = TransferConfig::default();
    config.retry_interval_ms = 20;
    config.max_attempts = 10;
    config
}

#[tokio::test]
async fn test_descriptor_survives_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("transfer.sock");

    // The transported descriptor is a real file with known content
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"tunnel descriptor payload").unwrap();
    file.flush().unwrap();

    let listener = UnixListener::bind(&socket_path).unwrap();
    let receiver = tokio::task::spawn_blocking(move || recv_descriptor(&listener));

    send_descriptor(
        &socket_path,
        file.as_fd(),
        &fast_transfer_config(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();

    let received = receiver.await.unwrap().unwrap();

    // The received fd addresses the same open file description
    let mut reopened = unsafe { std::fs::File::from_raw_fd(received.into_raw_fd()) };
    reopened.seek(SeekFrom::Start(0)).unwrap();
    let mut contents = String::new();
    reopened.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "tunnel descriptor payload");
}

#[tokio::test]
async fn test_send_retries_until_receiver_binds() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("transfer.sock");

    let file = tempfile::tempfile().unwrap();

    // Bind only after a few retry intervals have passed
    let bind_path = socket_path.clone();
    let receiver = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        let listener = UnixListener::bind(&bind_path).unwrap();
        tokio::task::spawn_blocking(move || recv_descriptor(&listener))
            .await
            .unwrap()
    });

    send_descriptor(
        &socket_path,
        file.as_fd(),
        &fast_transfer_config(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();

    receiver.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_send_gives_up_after_budget() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("nobody-home.sock");

    let file = tempfile::tempfile().unwrap();

    let err = send_descriptor(
        &socket_path,
        file.as_fd(),
        &fast_transfer_config(),
        &CancelFlag::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, TransferError::RetriesExhausted { .. }));
}

#[tokio::test]
async fn test_cancel_interrupts_retry_loop() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("nobody-home.sock");

    let file = tempfile::tempfile().unwrap();
    let cancel = CancelFlag::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        canceller.cancel();
    });

    let mut config = fast_transfer_config();
    config.max_attempts = 1000;

    let started = std::time::Instant::now();
    let err = send_descriptor(&socket_path, file.as_fd(), &config, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Cancelled));
    // Cancellation cut the loop well before the 20 second retry budget
    assert!(started.elapsed() < Duration::from_secs(5));
}
