//! VM management for vmscreen.
//!
//! Provides port allocation, qcow2 disk provisioning, QEMU command-line
//! construction and launch, the QMP/monitor control channels, and the
//! [`supervisor::VmSupervisor`] that composes them into per-screen
//! start/stop/save/delete operations.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::TcpStream;

pub mod backend;
pub mod control;
pub mod disk;
pub mod hypervisor;
pub mod launcher;
pub mod ports;
pub mod supervisor;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Stable key for one logical screen.
///
/// The key doubles as the name of the VM's state directory, so it is limited
/// to ASCII alphanumerics plus `-`, `_` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmIdentity(String);

/// Rejected [`VmIdentity`] key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid VM identity {0:?} (allowed: alphanumeric, '-', '_', '.'; not '.' or '..')")]
pub struct InvalidIdentity(pub String);

impl VmIdentity {
    pub fn new(key: impl Into<String>) -> Result<Self, InvalidIdentity> {
        let key = key.into();
        if is_safe_token(&key) && key != "." && key != ".." {
            Ok(Self(key))
        } else {
            Err(InvalidIdentity(key))
        }
    }

    /// Identity for a screen placed at a world coordinate.
    pub fn from_coords(x: i32, y: i32, z: i32) -> Self {
        Self(format!("{x}_{y}_{z}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Snapshot name used when the host has not persisted one of its own.
    pub fn default_snapshot_name(&self) -> String {
        format!("state_{}", self.0)
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VmIdentity {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// `true` if `s` is 1..=128 chars of `[A-Za-z0-9_.-]`.
pub(crate) fn is_safe_token(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Install instructions appended to "QEMU not found" errors.
pub const QEMU_INSTALL_HINT: &str = "You can install QEMU via:\n  \
     macOS: brew install qemu\n  \
     Linux: sudo apt-get install qemu-system-x86 qemu-utils\n  \
     Windows: download from https://www.qemu.org/download/";

/// Returns `true` if something accepts a TCP connection on `127.0.0.1:port`
/// within `timeout`.
///
/// This is the liveness definition for a VM: the launcher's process handle
/// does not survive `-daemonize`, the display server does.
pub async fn probe_port(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use backend::{QemuBackend, VmBackend};
pub use ports::{PortAllocator, PortTriple};
pub use supervisor::{StartError, VmPhase, VmRecord, VmSupervisor};
