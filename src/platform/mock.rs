//! Scriptable platform double for the test suite
//!
//! Hands out one end of a Unix socketpair instead of a real TUN
//! descriptor, so tests can exercise establishment, transfer, and teardown
//! without privileges. Either step can be scripted to fail.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{InterfaceSpec, TunPlatform};
use crate::error::PlatformError;

/// In-memory platform double
#[derive(Debug, Default)]
pub struct MockTun {
    deny_permission: AtomicBool,
    fail_establish: AtomicBool,
    establish_count: AtomicUsize,
    release_count: AtomicUsize,
    last_spec: Mutex<Option<InterfaceSpec>>,
}

impl MockTun {
    /// Create a mock that grants permission and establishes successfully
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the permission check to fail
    pub fn deny_permission(&self, deny: bool) {
        self.deny_permission.store(deny, Ordering::SeqCst);
    }

    /// Script establishment to fail
    pub fn fail_establish(&self, fail: bool) {
        self.fail_establish.store(fail, Ordering::SeqCst);
    }

    /// Number of successful establishments
    #[must_use]
    pub fn establish_count(&self) -> usize {
        self.establish_count.load(Ordering::SeqCst)
    }

    /// Number of released descriptors
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.release_count.load(Ordering::SeqCst)
    }

    /// The spec from the most recent establish call
    #[must_use]
    pub fn last_spec(&self) -> Option<InterfaceSpec> {
        self.last_spec.lock().clone()
    }
}

impl TunPlatform for MockTun {
    fn check_permission(&self) -> Result<(), PlatformError> {
        if self.deny_permission.load(Ordering::SeqCst) {
            return Err(PlatformError::PermissionDenied("scripted denial".into()));
        }
        Ok(())
    }

    fn establish(&self, spec: &InterfaceSpec) -> Result<OwnedFd, PlatformError> {
        *self.last_spec.lock() = Some(spec.clone());
        if self.fail_establish.load(Ordering::SeqCst) {
            return Err(PlatformError::establish(&spec.name, "scripted failure"));
        }
        let (ours, _theirs) = std::os::unix::net::UnixStream::pair()
            .map_err(PlatformError::IoError)?;
        self.establish_count.fetch_add(1, Ordering::SeqCst);
        Ok(OwnedFd::from(ours))
    }

    fn release(&self, fd: OwnedFd) {
        self.release_count.fetch_add(1, Ordering::SeqCst);
        drop(fd);
    }
}
