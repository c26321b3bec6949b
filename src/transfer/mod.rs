//! Live descriptor handoff to the forwarder process
//!
//! The forwarder is spawned as a separate process and cannot inherit the
//! virtual interface descriptor, so the descriptor is passed over a Unix
//! domain socket as `SCM_RIGHTS` ancillary data. The forwarder binds a
//! listening socket at a well-known path on startup; the orchestrator
//! connects as a client, sends a single marker byte carrying the
//! descriptor, and shuts down its write side.
//!
//! The forwarder binds asynchronously after spawn, so the connect step is
//! retried on a fixed cadence up to a bound before the transfer is declared
//! failed. The descriptor stays open in the orchestrator until `sendmsg`
//! has returned.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::TransferError;

/// Marker byte accompanying the descriptor
pub const TRANSFER_MARKER: u8 = 0x01;

/// Cooperative cancellation flag shared with the session controller
///
/// `stop()` raises the flag; the retry loop observes it between attempts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unraised flag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been raised
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Send a live descriptor to the forwarder's socket
///
/// Retries the connect every `config.retry_interval()` up to
/// `config.max_attempts` while the socket is not yet bound. The fd is
/// borrowed: the caller keeps ownership and must hold it open until this
/// returns.
///
/// # Errors
///
/// `RetriesExhausted` once the bound is hit, `Cancelled` if the session is
/// torn down mid-retry, or an ancillary/IO error from the send itself.
pub async fn send_descriptor(
    socket_path: &Path,
    fd: BorrowedFd<'_>,
    config: &TransferConfig,
    cancel: &CancelFlag,
) -> Result<(), TransferError> {
    let mut last_err: Option<std::io::Error> = None;

    for attempt in 1..=config.max_attempts {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        match tokio::net::UnixStream::connect(socket_path).await {
            Ok(stream) => {
                debug!(
                    path = %socket_path.display(),
                    attempt,
                    "connected to forwarder socket"
                );
                let std_stream = stream.into_std().map_err(TransferError::IoError)?;
                std_stream
                    .set_nonblocking(false)
                    .map_err(TransferError::IoError)?;

                let raw = fd.as_raw_fd();
                let result = tokio::task::spawn_blocking(move || {
                    let r = send_fd_blocking(&std_stream, raw);
                    let _ = std_stream.shutdown(std::net::Shutdown::Write);
                    r
                })
                .await
                .map_err(|e| TransferError::AncillaryError(e.to_string()))??;

                info!(
                    path = %socket_path.display(),
                    attempt,
                    "descriptor transferred to forwarder"
                );
                return Ok(result);
            }
            Err(e) => {
                debug!(
                    path = %socket_path.display(),
                    attempt,
                    max = config.max_attempts,
                    "forwarder socket not ready: {}",
                    e
                );
                last_err = Some(e);
            }
        }

        sleep(config.retry_interval()).await;
    }

    warn!(
        path = %socket_path.display(),
        attempts = config.max_attempts,
        last_error = ?last_err,
        "descriptor transfer retries exhausted"
    );
    Err(TransferError::RetriesExhausted {
        path: socket_path.display().to_string(),
        attempts: config.max_attempts,
    })
}

/// Send one marker byte with `fd` attached as `SCM_RIGHTS`
fn send_fd_blocking(stream: &UnixStream, fd: RawFd) -> Result<(), TransferError> {
    let mut marker = [TRANSFER_MARKER];
    let mut iov = libc::iovec {
        iov_base: marker.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: 1,
    };

    // u64-aligned buffer large enough for CMSG_SPACE(sizeof(int)).
    let mut cmsg_buf = [0u64; 8];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen =
        unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as libc::c_uint) } as _;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(TransferError::AncillaryError(
            "CMSG_FIRSTHDR returned null".into(),
        ));
    }
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len =
            libc::CMSG_LEN(std::mem::size_of::<RawFd>() as libc::c_uint) as _;
        std::ptr::copy_nonoverlapping(
            std::ptr::addr_of!(fd).cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            std::mem::size_of::<RawFd>(),
        );
    }

    let sent = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
    if sent < 0 {
        return Err(TransferError::IoError(std::io::Error::last_os_error()));
    }
    if sent == 0 {
        return Err(TransferError::PeerClosed);
    }
    Ok(())
}

/// Receive a descriptor from a transfer socket connection
///
/// Counterpart of [`send_descriptor`], used by the integration tests and by
/// forwarder stubs. Blocks on the accepted stream; call from a blocking
/// context.
///
/// # Errors
///
/// `PeerClosed` if the sender disconnected before the marker arrived, or an
/// ancillary error if no descriptor was attached.
pub fn recv_descriptor(listener: &UnixListener) -> Result<OwnedFd, TransferError> {
    let (stream, _addr) = listener.accept().map_err(TransferError::IoError)?;
    recv_fd_blocking(&stream)
}

fn recv_fd_blocking(stream: &UnixStream) -> Result<OwnedFd, TransferError> {
    let mut marker = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: marker.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: 1,
    };

    let mut cmsg_buf = [0u64; 8];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen =
        unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as libc::c_uint) } as _;

    let received = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, 0) };
    if received < 0 {
        return Err(TransferError::IoError(std::io::Error::last_os_error()));
    }
    if received == 0 {
        return Err(TransferError::PeerClosed);
    }

    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
            let mut fd: RawFd = -1;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    std::ptr::addr_of_mut!(fd).cast::<u8>(),
                    std::mem::size_of::<RawFd>(),
                );
            }
            if fd < 0 {
                return Err(TransferError::AncillaryError(
                    "received negative descriptor".into(),
                ));
            }
            debug!(fd, marker = marker[0], "descriptor received");
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    Err(TransferError::AncillaryError(
        "no SCM_RIGHTS message attached".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;

    fn fast_config(max_attempts: u32) -> TransferConfig {
        TransferConfig {
            retry_interval_ms: 20,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_transfer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("fw.sock");

        // A real file as the payload descriptor; the receiver reads back
        // through the duplicated fd.
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"tunnel").unwrap();
        file.flush().unwrap();

        let listener = UnixListener::bind(&socket_path).unwrap();
        let receiver = tokio::task::spawn_blocking(move || recv_descriptor(&listener));

        send_descriptor(
            &socket_path,
            file.as_fd(),
            &fast_config(5),
            &CancelFlag::new(),
        )
        .await
        .unwrap();

        let received = receiver.await.unwrap().unwrap();
        let mut readback = std::fs::File::from(received);
        readback.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = String::new();
        readback.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "tunnel");
    }

    #[tokio::test]
    async fn test_retries_then_success() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("fw.sock");

        let file = tempfile::tempfile().unwrap();

        // Bind the listener only after a few retry intervals have elapsed.
        let bind_path = socket_path.clone();
        let receiver = tokio::task::spawn_blocking(move || {
            std::thread::sleep(std::time::Duration::from_millis(80));
            let listener = UnixListener::bind(&bind_path).unwrap();
            recv_descriptor(&listener)
        });

        send_descriptor(
            &socket_path,
            file.as_fd(),
            &fast_config(25),
            &CancelFlag::new(),
        )
        .await
        .unwrap();

        receiver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("never-bound.sock");
        let file = tempfile::tempfile().unwrap();

        let err = send_descriptor(
            &socket_path,
            file.as_fd(),
            &fast_config(3),
            &CancelFlag::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            TransferError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_mid_retry() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("never-bound.sock");
        let file = tempfile::tempfile().unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = send_descriptor(&socket_path, file.as_fd(), &fast_config(100), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }
}
