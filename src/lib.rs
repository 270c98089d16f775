//! vmscreen: a QEMU virtual machine per screen, shown and driven over RFB.
//!
//! The [`vm`] module launches, supervises, snapshots and tears down one QEMU
//! process per [`vm::VmIdentity`]; the [`rfb`] module connects to the display
//! port a VM exposes, keeps a decoded [`rfb::FrameBuffer`] up to date and
//! relays keyboard and pointer input.

pub mod config;
pub mod logging;
pub mod paths;
pub mod rfb;
pub mod state_machine;
pub mod vm;
