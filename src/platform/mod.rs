//! Host-platform virtual interface abstraction
//!
//! The session controller talks to the host through `TunPlatform`: a
//! permission check, interface establishment returning an owned
//! descriptor, and release. The Linux implementation opens `/dev/net/tun`
//! directly; test builds use [`MockTun`], which hands out one end of a
//! socketpair and can be scripted to fail either step.

pub mod linux;
pub mod mock;

pub use linux::LinuxTun;
pub use mock::MockTun;

use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;

use ipnet::Ipv4Net;

use crate::error::PlatformError;

/// Description of the interface a session wants established
#[derive(Debug, Clone)]
pub struct InterfaceSpec {
    /// Interface name (must fit the platform's name length limit)
    pub name: String,
    /// Interface address
    pub address: Ipv4Addr,
    /// Netmask prefix length
    pub prefix: u8,
    /// MTU
    pub mtu: u16,
    /// DNS servers to associate with the interface
    pub dns: Vec<std::net::IpAddr>,
    /// Routes directed into the tunnel
    pub included_routes: Vec<Ipv4Net>,
    /// Application identifiers excluded from the tunnel. Enforced by the
    /// platform where supported; ignored otherwise.
    pub blocked_apps: Vec<String>,
}

/// Host platform operations for the virtual interface
///
/// `check_permission` is separate from `establish` so the controller can
/// re-check the grant immediately before establishing; grants can be
/// revoked between a start request and the establish step.
pub trait TunPlatform: Send + Sync {
    /// Verify the tunnel capability is currently granted
    ///
    /// # Errors
    ///
    /// `PlatformError::PermissionDenied` when the grant is absent or stale.
    fn check_permission(&self) -> Result<(), PlatformError>;

    /// Create the virtual interface and return its descriptor
    ///
    /// # Errors
    ///
    /// `PlatformError::EstablishFailed` when the platform refuses (for
    /// example, a conflicting tunnel is already active).
    fn establish(&self, spec: &InterfaceSpec) -> Result<OwnedFd, PlatformError>;

    /// Release an interface previously returned by `establish`
    ///
    /// Dropping the descriptor tears the interface down on every supported
    /// platform; implementations may do extra cleanup.
    fn release(&self, fd: OwnedFd) {
        drop(fd);
    }
}
