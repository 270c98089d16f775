//! Display/control port allocation.
//!
//! Every VM instance gets three consecutive TCP ports: the RFB display port,
//! the QMP port (channel A) and the HMP monitor port (channel B). Ports are
//! handed out from a monotonically increasing counter and never reused, even
//! after the VM that held them stops, so a freshly launched process never
//! races a dying one that is still unbinding its sockets.

use std::sync::atomic::{AtomicU32, Ordering};

/// The conventional RFB base port (`-vnc :0` listens here).
pub const VNC_BASE_PORT: u16 = 5900;

/// Ports consumed per VM instance.
const PORTS_PER_VM: u32 = 3;

/// The three ports owned by one VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortTriple {
    /// RFB display server.
    pub display: u16,
    /// QMP (structured JSON) control channel.
    pub control_a: u16,
    /// HMP (line-oriented monitor) control channel.
    pub control_b: u16,
}

impl PortTriple {
    /// Triple starting at `display`, or `None` if it would run past `u16::MAX`.
    pub fn starting_at(display: u16) -> Option<Self> {
        Some(Self {
            display,
            control_a: display.checked_add(1)?,
            control_b: display.checked_add(2)?,
        })
    }

    /// QEMU display index (`-vnc :N`) for this triple's display port.
    pub fn display_index(&self) -> Option<u16> {
        self.display.checked_sub(VNC_BASE_PORT)
    }
}

/// Hands out non-overlapping [`PortTriple`]s.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    next: AtomicU32,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            next: AtomicU32::new(u32::from(base)),
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Reserve the next triple. Returns `None` once the port space is used up.
    pub fn allocate(&self) -> Option<PortTriple> {
        let start = self.next.fetch_add(PORTS_PER_VM, Ordering::Relaxed);
        u16::try_from(start).ok().and_then(PortTriple::starting_at)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(VNC_BASE_PORT)
    }
}
