//! Runtime settings for vmscreen.
//!
//! All tunables (VM sizing, launch timing, control timeouts, display pacing)
//! are gathered into a single `Settings` struct that is read from TOML. Every
//! section is `#[serde(default)]`, so a partial file or no file at all yields
//! the built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::rfb::{ReconnectBackoff, RfbOptions};
use crate::vm::launcher::LaunchOptions;
use crate::vm::ports::VNC_BASE_PORT;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Settings {
    pub vm: VmSettings,
    pub launch: LaunchSettings,
    pub control: ControlSettings,
    pub display: DisplaySettings,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct VmSettings {
    pub ram_mb: u32,
    pub disk_size_gib: u32,
    /// Machine type passed as `-machine`; empty means QEMU's default.
    pub machine: String,
    pub base_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hypervisor_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_tool_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct LaunchSettings {
    pub settle_ms: u64,
    pub retry_ms: u64,
    pub probe_timeout_ms: u64,
    pub daemonize: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ControlSettings {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct DisplaySettings {
    pub frame_rate: u32,
    pub handshake_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            ram_mb: 512,
            disk_size_gib: 10,
            machine: "q35".to_string(),
            base_port: VNC_BASE_PORT,
            hypervisor_path: None,
            image_tool_path: None,
        }
    }
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            settle_ms: 2500,
            retry_ms: 1000,
            probe_timeout_ms: 100,
            daemonize: true,
        }
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            frame_rate: 60,
            handshake_timeout_ms: 10_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl Settings {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)
                .with_context(|| format!("failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            ram_mb: self.vm.ram_mb,
            machine: Some(self.vm.machine.clone()).filter(|m| !m.is_empty()),
            settle: Duration::from_millis(self.launch.settle_ms),
            retry: Duration::from_millis(self.launch.retry_ms),
            probe_timeout: Duration::from_millis(self.launch.probe_timeout_ms),
            daemonize: self.launch.daemonize,
        }
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control.timeout_ms)
    }

    pub fn rfb_options(&self) -> RfbOptions {
        RfbOptions {
            handshake_timeout: Duration::from_millis(self.display.handshake_timeout_ms),
            frame_interval: frame_interval(self.display.frame_rate),
        }
    }

    pub fn reconnect_backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff::new(
            Duration::from_millis(self.display.reconnect_base_ms),
            Duration::from_millis(self.display.reconnect_max_ms),
        )
    }
}

/// Interval between frame emissions for `rate` frames per second.
fn frame_interval(rate: u32) -> Duration {
    Duration::from_secs(1) / rate.max(1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
