//! Linux TUN implementation
//!
//! Opens `/dev/net/tun` and attaches a TUN interface with `TUNSETIFF`
//! (IFF_TUN | IFF_NO_PI, raw IP packets without the packet-info header).
//! Address, MTU, and link state are applied with the `ip` tool; route
//! installation is left to the host, which receives the included routes in
//! the [`InterfaceSpec`](super::InterfaceSpec).

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Command;

use tracing::{debug, info, warn};

use super::{InterfaceSpec, TunPlatform};
use crate::error::PlatformError;

const IFNAMSIZ: usize = 16;

const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

type IoctlRequest = libc::c_ulong;
const TUNSETIFF: IoctlRequest = 0x4004_54ca;

#[repr(C)]
struct IfReq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> Result<Self, PlatformError> {
        if name.is_empty() || name.len() >= IFNAMSIZ {
            return Err(PlatformError::InvalidName(name.to_string()));
        }
        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: flags,
            _pad: [0; 22],
        };
        ifr.ifr_name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(ifr)
    }
}

/// TUN platform backed by `/dev/net/tun`
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxTun;

impl LinuxTun {
    /// Create the Linux platform
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn configure_link(spec: &InterfaceSpec) {
        // Best effort: a missing `ip` tool or insufficient rights degrade
        // to an unconfigured link, which the establish caller will notice
        // when traffic fails, not a hard error here.
        let addr = format!("{}/{}", spec.address, spec.prefix);
        run_ip(&["addr", "add", &addr, "dev", &spec.name]);
        run_ip(&["link", "set", "dev", &spec.name, "mtu", &spec.mtu.to_string()]);
        run_ip(&["link", "set", "dev", &spec.name, "up"]);
    }
}

fn run_ip(args: &[&str]) {
    match Command::new("ip").args(args).output() {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            let err = String::from_utf8_lossy(&output.stderr);
            if !err.contains("File exists") {
                warn!("ip {:?} failed: {}", args, err.trim());
            }
        }
        Err(e) => warn!("ip {:?} could not run: {}", args, e),
    }
}

impl TunPlatform for LinuxTun {
    fn check_permission(&self) -> Result<(), PlatformError> {
        // Opening the clone device is the authoritative check; uid alone
        // misses CAP_NET_ADMIN grants.
        match OpenOptions::new().read(true).write(true).open("/dev/net/tun") {
            Ok(_) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
                ) =>
            {
                Err(PlatformError::PermissionDenied(e.to_string()))
            }
            Err(e) => Err(PlatformError::IoError(e)),
        }
    }

    fn establish(&self, spec: &InterfaceSpec) -> Result<OwnedFd, PlatformError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    PlatformError::PermissionDenied(e.to_string())
                }
                _ => PlatformError::establish(&spec.name, e.to_string()),
            })?;

        let ifr = IfReq::new(&spec.name, IFF_TUN | IFF_NO_PI)?;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return Err(PlatformError::establish(&spec.name, err.to_string()));
        }

        Self::configure_link(spec);

        info!(
            name = %spec.name,
            address = %spec.address,
            mtu = spec.mtu,
            routes = spec.included_routes.len(),
            "virtual interface established"
        );

        Ok(OwnedFd::from(file))
    }

    fn release(&self, fd: OwnedFd) {
        debug!(fd = fd.as_raw_fd(), "releasing virtual interface");
        drop(fd);
    }
}
