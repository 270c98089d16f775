//! Directory structure for vmscreen.
//!
//! `ScreenPaths` resolves every directory the crate touches. Follows macOS
//! conventions on macOS:
//!
//! - Config:    `~/.config/vmscreen/`  (human-editable, XDG-style)
//! - Data:      `~/Library/Application Support/dev.vmscreen/`
//! - Logs:      `~/Library/Logs/vmscreen/`
//!
//! On other platforms, falls back to XDG paths.

use std::path::{Path, PathBuf};
use tracing::debug;
#[cfg(target_os = "macos")]
use tracing::warn;

use crate::vm::VmIdentity;
use crate::vm::disk::DISK_FILE_NAME;

#[cfg(target_os = "macos")]
const BUNDLE_ID: &str = "dev.vmscreen";
const APP_NAME: &str = "vmscreen";

/// All resolved directory paths.
#[derive(Debug, Clone)]
pub struct ScreenPaths {
    /// Human-editable config: `~/.config/vmscreen/`
    pub config: PathBuf,
    /// Machine-managed data root
    pub data: PathBuf,
    /// Per-identity VM state directories
    pub vms: PathBuf,
    /// Bundled QEMU binaries, one subdirectory per platform
    pub bundled: PathBuf,
    pub logs: PathBuf,
}

impl ScreenPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::under(
            resolve_config_dir(&home),
            resolve_data_dir(&home),
            resolve_log_dir(&home),
        ))
    }

    /// Lay out the derived directories beneath explicit roots.
    pub fn under(config: PathBuf, data: PathBuf, logs: PathBuf) -> Self {
        Self {
            config,
            vms: data.join("vms"),
            bundled: data.join("qemu"),
            data,
            logs,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs.join("vmscreen.log")
    }

    /// State directory for one identity.
    pub fn state_dir(&self, identity: &VmIdentity) -> PathBuf {
        self.vms.join(identity.as_str())
    }

    pub fn disk_image(&self, identity: &VmIdentity) -> PathBuf {
        self.state_dir(identity).join(DISK_FILE_NAME)
    }

    /// Create the directories that don't already exist. The bundled
    /// directory is optional and left alone.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.vms, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!("ensured directory: {}", dir.display());
        }

        #[cfg(target_os = "macos")]
        exclude_from_time_machine(&self.vms);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    resolve_data_dir(home).join("logs")
}

// ---------------------------------------------------------------------------
// Time Machine exclusion (macOS only)
// ---------------------------------------------------------------------------

/// Disk images are large and regenerable; keep them out of backups.
#[cfg(target_os = "macos")]
fn exclude_from_time_machine(path: &Path) {
    use std::process::Command;
    match Command::new("tmutil")
        .args(["addexclusion", &path.to_string_lossy()])
        .output()
    {
        Ok(output) if output.status.success() => {
            debug!("TM-excluded: {}", path.display());
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("tmutil addexclusion failed for {}: {}", path.display(), stderr.trim());
        }
        Err(e) => {
            warn!("failed to run tmutil for {}: {e}", path.display());
        }
    }
}
