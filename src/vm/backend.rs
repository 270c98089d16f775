//! The seam between the supervisor and the outside world.
//!
//! [`VmSupervisor`](super::VmSupervisor) decides *when* to provision, launch,
//! quit and snapshot; a [`VmBackend`] decides *how*. [`QemuBackend`] does it
//! with real processes and sockets; tests plug in an in-process fake.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::control::{self, ControlError};
use super::disk::{self, DISK_FILE_NAME, ImageTool, ProvisionError, SnapshotEntry};
use super::hypervisor::{HypervisorTools, firmware_search_dirs};
use super::launcher::{LaunchError, LaunchRequest, LaunchedVm, Launcher};
use super::ports::PortTriple;
use super::probe_port;
use crate::config::Settings;
use crate::paths::ScreenPaths;

/// Operations the supervisor performs against a VM.
pub trait VmBackend: Send + Sync + 'static {
    /// Make sure the disk image in `state_dir` exists; returns its path.
    fn prepare_disk(
        &self,
        state_dir: &Path,
    ) -> impl Future<Output = Result<PathBuf, ProvisionError>> + Send;

    /// Start a VM and wait until its display is reachable.
    fn launch(
        &self,
        request: LaunchRequest,
    ) -> impl Future<Output = Result<LaunchedVm, LaunchError>> + Send;

    /// Whether the display port accepts connections.
    fn display_reachable(&self, port: u16) -> impl Future<Output = bool> + Send;

    /// Graceful shutdown over channel A.
    fn quit(&self, ports: PortTriple) -> impl Future<Output = Result<(), ControlError>> + Send;

    /// `savevm` over channel B.
    fn save_snapshot(
        &self,
        ports: PortTriple,
        name: &str,
    ) -> impl Future<Output = Result<(), ControlError>> + Send;

    /// `delvm` over channel B.
    fn delete_snapshot(
        &self,
        ports: PortTriple,
        name: &str,
    ) -> impl Future<Output = Result<(), ControlError>> + Send;

    /// Remove a snapshot straight from the image file (VM not running).
    fn delete_snapshot_offline(
        &self,
        disk: &Path,
        name: &str,
    ) -> impl Future<Output = Result<(), ProvisionError>> + Send;

    fn list_snapshots(
        &self,
        disk: &Path,
    ) -> impl Future<Output = Result<Vec<SnapshotEntry>, ProvisionError>> + Send;
}

// ---------------------------------------------------------------------------
// QEMU
// ---------------------------------------------------------------------------

/// Backend driving real `qemu-system-x86_64` / `qemu-img` processes.
#[derive(Debug, Clone)]
pub struct QemuBackend {
    launcher: Launcher,
    image_tool: ImageTool,
    disk_size_gib: u32,
    control_timeout: Duration,
    probe_timeout: Duration,
}

impl QemuBackend {
    pub fn new(
        launcher: Launcher,
        image_tool: ImageTool,
        disk_size_gib: u32,
        control_timeout: Duration,
    ) -> Self {
        let probe_timeout = launcher.options().probe_timeout;
        Self {
            launcher,
            image_tool,
            disk_size_gib,
            control_timeout,
            probe_timeout,
        }
    }

    /// Resolve binaries and firmware, then wire everything from `settings`.
    pub fn from_settings(settings: &Settings, paths: &ScreenPaths) -> Self {
        let tools = HypervisorTools::resolve(
            Some(&paths.bundled),
            settings.vm.hypervisor_path.as_deref(),
            settings.vm.image_tool_path.as_deref(),
        );
        let image_tool = ImageTool::new(tools.image_tool);
        let launcher = Launcher::new(
            tools.hypervisor,
            image_tool.clone(),
            firmware_search_dirs(),
            settings.launch_options(),
        );
        Self::new(
            launcher,
            image_tool,
            settings.vm.disk_size_gib,
            settings.control_timeout(),
        )
    }

    pub fn image_tool(&self) -> &ImageTool {
        &self.image_tool
    }
}

impl VmBackend for QemuBackend {
    async fn prepare_disk(&self, state_dir: &Path) -> Result<PathBuf, ProvisionError> {
        let path = state_dir.join(DISK_FILE_NAME);
        disk::ensure_disk_image(&self.image_tool, &path, self.disk_size_gib).await?;
        Ok(path)
    }

    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedVm, LaunchError> {
        self.launcher.launch(request).await
    }

    async fn display_reachable(&self, port: u16) -> bool {
        probe_port(port, self.probe_timeout).await
    }

    async fn quit(&self, ports: PortTriple) -> Result<(), ControlError> {
        control::qmp_quit(ports.control_a, self.control_timeout).await
    }

    async fn save_snapshot(&self, ports: PortTriple, name: &str) -> Result<(), ControlError> {
        control::save_snapshot(ports.control_b, name, self.control_timeout).await
    }

    async fn delete_snapshot(&self, ports: PortTriple, name: &str) -> Result<(), ControlError> {
        control::delete_snapshot(ports.control_b, name, self.control_timeout).await
    }

    async fn delete_snapshot_offline(&self, disk: &Path, name: &str) -> Result<(), ProvisionError> {
        self.image_tool.delete_snapshot(disk, name).await
    }

    async fn list_snapshots(&self, disk: &Path) -> Result<Vec<SnapshotEntry>, ProvisionError> {
        self.image_tool.list_snapshots(disk).await
    }
}
