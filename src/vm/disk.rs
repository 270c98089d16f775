//! qcow2 disk images and their internal snapshots.
//!
//! ## Design
//!
//! Each screen owns one copy-on-write disk image inside its state directory.
//! The image is created once with `qemu-img create` and from then on is only
//! touched by the QEMU process itself (writes, `savevm`, `delvm`) and by the
//! offline snapshot helpers here.
//!
//! ```text
//! <vms>/<identity>/
//!     disk.qcow2        (snapshots live inside this file)
//!     OVMF_VARS.fd      (per-VM UEFI variable store, optional)
//! ```
//!
//! An existing image is never recreated or overwritten.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::NaiveDateTime;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::QEMU_INSTALL_HINT;

/// File name of the disk image inside a VM state directory.
pub const DISK_FILE_NAME: &str = "disk.qcow2";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Disk provisioning or offline snapshot manipulation failed.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("`{program}` not found.\n{hint}")]
    ToolNotFound { program: String, hint: &'static str },
    #[error("`{command}` failed (exit {code:?}): {stderr}")]
    ToolFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ---------------------------------------------------------------------------
// Snapshot listing
// ---------------------------------------------------------------------------

/// One row of `qemu-img snapshot -l` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub id: String,
    pub tag: String,
    /// Creation time, when the row carries a parseable `YYYY-MM-DD HH:MM:SS`.
    pub created: Option<NaiveDateTime>,
}

/// Parse `qemu-img snapshot -l` output.
///
/// ```text
/// Snapshot list:
/// ID        TAG               VM SIZE                DATE     VM CLOCK     ICOUNT
/// 1         state_0_64_0      212 MiB 2024-01-01 12:00:00 00:00:05.120          0
/// ```
///
/// Only rows after the header line count; the tag is the second
/// whitespace-delimited column.
pub fn parse_snapshot_list(output: &str) -> Vec<SnapshotEntry> {
    let mut rows = Vec::new();
    let mut past_header = false;

    for line in output.lines() {
        let mut columns = line.split_whitespace();
        let (Some(first), Some(second)) = (columns.next(), columns.next()) else {
            continue;
        };

        if !past_header {
            past_header = first == "ID" && second == "TAG";
            continue;
        }

        let rest: Vec<&str> = columns.collect();
        let created = rest.windows(2).find_map(|pair| {
            NaiveDateTime::parse_from_str(&format!("{} {}", pair[0], pair[1]), "%Y-%m-%d %H:%M:%S")
                .ok()
        });

        rows.push(SnapshotEntry {
            id: first.to_string(),
            tag: second.to_string(),
            created,
        });
    }

    rows
}

// ---------------------------------------------------------------------------
// qemu-img wrapper
// ---------------------------------------------------------------------------

/// Wrapper around the `qemu-img` executable.
#[derive(Debug, Clone)]
pub struct ImageTool {
    program: PathBuf,
}

impl ImageTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// `qemu-img create -f qcow2 <path> <size>G`
    pub async fn create_qcow2(&self, path: &Path, size_gib: u32) -> Result<(), ProvisionError> {
        let size = format!("{size_gib}G");
        let args: [&OsStr; 5] = [
            "create".as_ref(),
            "-f".as_ref(),
            "qcow2".as_ref(),
            path.as_os_str(),
            size.as_ref(),
        ];
        self.run(&args).await.map(drop)
    }

    /// `qemu-img snapshot -l <path>`, parsed.
    pub async fn list_snapshots(&self, path: &Path) -> Result<Vec<SnapshotEntry>, ProvisionError> {
        let stdout = self
            .run(&["snapshot".as_ref(), "-l".as_ref(), path.as_os_str()])
            .await?;
        Ok(parse_snapshot_list(&stdout))
    }

    /// Whether `name` is a snapshot inside the image at `path`.
    ///
    /// Any failure to check counts as "does not exist": booting fresh is
    /// recoverable, `-loadvm` with a missing tag is not.
    pub async fn snapshot_exists(&self, path: &Path, name: &str) -> bool {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return false;
        }
        match self.list_snapshots(path).await {
            Ok(rows) => rows.iter().any(|row| row.tag == name),
            Err(e) => {
                warn!(disk = %path.display(), snapshot = name, error = %e, "could not list snapshots");
                false
            }
        }
    }

    /// `qemu-img snapshot -d <name> <path>`; only valid while no QEMU process
    /// holds the image open.
    pub async fn delete_snapshot(&self, path: &Path, name: &str) -> Result<(), ProvisionError> {
        self.run(&[
            "snapshot".as_ref(),
            "-d".as_ref(),
            name.as_ref(),
            path.as_os_str(),
        ])
        .await
        .map(drop)
    }

    /// Run the tool to completion, returning stdout on exit status 0.
    async fn run(&self, args: &[&OsStr]) -> Result<String, ProvisionError> {
        let command_line = std::iter::once(self.program.as_os_str())
            .chain(args.iter().copied())
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        debug!(command = %command_line, "running image tool");

        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ProvisionError::ToolNotFound {
                    program: self.program.display().to_string(),
                    hint: QEMU_INSTALL_HINT,
                },
                _ => ProvisionError::Io {
                    path: self.program.clone(),
                    source: e,
                },
            })?;

        if !output.status.success() {
            return Err(ProvisionError::ToolFailed {
                command: command_line,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

/// Ensure a qcow2 image exists at `path`, creating it with `size_gib` if not.
///
/// Returns `Ok(true)` if the image was created by this call, `Ok(false)` if
/// it already existed.
pub async fn ensure_disk_image(
    tool: &ImageTool,
    path: &Path,
    size_gib: u32,
) -> Result<bool, ProvisionError> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|source| ProvisionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if exists {
        debug!(disk = %path.display(), "disk image already present");
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ProvisionError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    tool.create_qcow2(path, size_gib).await?;
    info!(disk = %path.display(), size_gib, "created disk image");
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
