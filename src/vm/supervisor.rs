//! Per-identity VM orchestration.
//!
//! ## Architecture
//!
//! ```text
//! VmSupervisor
//!     entries: Mutex<HashMap<VmIdentity, Arc<VmEntry>>>   (never held across .await)
//!         └─► VmEntry
//!                 op:    Arc<tokio::Mutex<()>>   serialises start/stop/save/delete per identity
//!                 state: Mutex<EntryState>       phase + record + launcher handle
//!
//! Absent ─► Starting ─► Running ─► Stopping ─► Absent
//!                ▲          │
//!                └──────────┘  display port unreachable on start()
//! ```
//!
//! Different identities never share an `op` lock, so their operations run in
//! parallel. Two `start` calls for the same identity queue on `op`; the second
//! finds the VM `Running` and returns the port the first one launched.
//!
//! An entry leaves the map only while its `op` is held. Anyone who was queued
//! on that lock re-reads the map after acquiring it and starts over on the
//! replacement entry, so no operation ever acts on a detached entry.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::process::Child;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use super::backend::{QemuBackend, VmBackend};
use super::control::validate_snapshot_name;
use super::disk::{DISK_FILE_NAME, ProvisionError, SnapshotEntry};
use super::launcher::{LaunchError, LaunchRequest};
use super::ports::{PortAllocator, PortTriple};
use super::VmIdentity;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle phase of one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPhase {
    Absent,
    Starting,
    Running,
    Stopping,
}

/// Last known facts about one VM. Kept with `running = false` after a stop
/// so the last ports remain visible for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub identity: VmIdentity,
    pub ports: PortTriple,
    pub running: bool,
    /// Pid of the launcher process, if a handle is held.
    pub pid: Option<u32>,
}

/// `start` failed.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("no free display ports left above {base}")]
    PortsExhausted { base: u16 },
    #[error("VM is {phase:?}, cannot start it")]
    Conflict { phase: VmPhase },
    #[error("cannot create state directory {}: {source}", path.display())]
    StateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct EntryState {
    phase: VmPhase,
    record: Option<VmRecord>,
    child: Option<Child>,
}

#[derive(Debug)]
struct VmEntry {
    op: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<EntryState>,
}

impl VmEntry {
    fn new() -> Self {
        Self {
            op: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(EntryState {
                phase: VmPhase::Absent,
                record: None,
                child: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn phase(&self) -> VmPhase {
        self.lock().phase
    }

    /// Move `from → to`; returns `false` (and changes nothing) if the current
    /// phase is not `from`.
    fn transition(&self, from: VmPhase, to: VmPhase) -> bool {
        let mut state = self.lock();
        if state.phase != from {
            return false;
        }
        state.phase = to;
        true
    }

    /// Absent with nothing worth remembering.
    fn is_idle(&self) -> bool {
        let state = self.lock();
        state.phase == VmPhase::Absent && state.record.is_none()
    }

    /// Ports of the running VM, if any.
    fn running_ports(&self) -> Option<PortTriple> {
        let state = self.lock();
        match (&state.phase, &state.record) {
            (VmPhase::Running, Some(record)) => Some(record.ports),
            _ => None,
        }
    }
}

/// Puts an entry back to `Absent` when a `start` future is dropped before it
/// finishes. Once ports are allocated it also asks the backend to quit
/// whatever may already be listening on them.
struct StartGuard<B: VmBackend> {
    identity: VmIdentity,
    entry: Arc<VmEntry>,
    backend: Arc<B>,
    ports: Option<PortTriple>,
    armed: bool,
}

impl<B: VmBackend> StartGuard<B> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<B: VmBackend> Drop for StartGuard<B> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.entry.lock();
            state.phase = VmPhase::Absent;
            if let Some(record) = state.record.as_mut() {
                record.running = false;
                record.pid = None;
            }
        }
        warn!(identity = %self.identity, "start abandoned before the VM came up");

        let Some(ports) = self.ports else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(identity = %self.identity, "no runtime left to quit an abandoned VM");
            return;
        };
        let backend = Arc::clone(&self.backend);
        let identity = self.identity.clone();
        handle.spawn(async move {
            if let Err(e) = backend.quit(ports).await {
                debug!(identity = %identity, error = %e, "abandoned VM was not listening");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns every VM this process started, keyed by identity.
pub struct VmSupervisor<B: VmBackend = QemuBackend> {
    backend: Arc<B>,
    ports: PortAllocator,
    vms_dir: PathBuf,
    entries: Mutex<HashMap<VmIdentity, Arc<VmEntry>>>,
}

impl<B: VmBackend> VmSupervisor<B> {
    pub fn new(backend: B, ports: PortAllocator, vms_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: Arc::new(backend),
            ports,
            vms_dir: vms_dir.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state_dir(&self, identity: &VmIdentity) -> PathBuf {
        self.vms_dir.join(identity.as_str())
    }

    pub fn disk_path(&self, identity: &VmIdentity) -> PathBuf {
        self.state_dir(identity).join(DISK_FILE_NAME)
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<VmIdentity, Arc<VmEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, identity: &VmIdentity) -> Arc<VmEntry> {
        self.entries()
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(VmEntry::new()))
            .clone()
    }

    fn existing(&self, identity: &VmIdentity) -> Option<Arc<VmEntry>> {
        self.entries().get(identity).cloned()
    }

    fn is_current(&self, identity: &VmIdentity, entry: &Arc<VmEntry>) -> bool {
        self.entries()
            .get(identity)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }

    /// Take `entry.op`; `None` if the entry left the map while we waited.
    async fn lock_if_current(
        &self,
        identity: &VmIdentity,
        entry: Arc<VmEntry>,
    ) -> Option<(Arc<VmEntry>, OwnedMutexGuard<()>)> {
        let op = Arc::clone(&entry.op).lock_owned().await;
        if self.is_current(identity, &entry) {
            Some((entry, op))
        } else {
            debug!(identity = %identity, "entry replaced while waiting, retrying");
            None
        }
    }

    /// Lock the identity's entry, creating it if needed.
    async fn lock_or_insert(&self, identity: &VmIdentity) -> (Arc<VmEntry>, OwnedMutexGuard<()>) {
        loop {
            if let Some(locked) = self.lock_if_current(identity, self.entry(identity)).await {
                return locked;
            }
        }
    }

    /// Lock the identity's entry if it has one.
    async fn lock_existing(&self, identity: &VmIdentity) -> Option<(Arc<VmEntry>, OwnedMutexGuard<()>)> {
        loop {
            let entry = self.existing(identity)?;
            if let Some(locked) = self.lock_if_current(identity, entry).await {
                return Some(locked);
            }
        }
    }

    /// Drop the entry if it holds nothing. Call with its `op` held.
    fn prune_if_idle(&self, identity: &VmIdentity, entry: &Arc<VmEntry>) {
        let mut entries = self.entries();
        if entries
            .get(identity)
            .is_some_and(|current| Arc::ptr_eq(current, entry) && entry.is_idle())
        {
            entries.remove(identity);
        }
    }

    /// Number of identities the supervisor currently keeps an entry for.
    pub fn tracked(&self) -> usize {
        self.entries().len()
    }

    pub fn phase(&self, identity: &VmIdentity) -> VmPhase {
        self.existing(identity)
            .map_or(VmPhase::Absent, |entry| entry.phase())
    }

    pub fn record(&self, identity: &VmIdentity) -> Option<VmRecord> {
        self.existing(identity)?.lock().record.clone()
    }

    /// Every identity whose record says it is running.
    pub fn running(&self) -> Vec<VmIdentity> {
        self.entries()
            .iter()
            .filter(|(_, entry)| entry.phase() == VmPhase::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    /// Ensure a VM is running for `identity`; returns its display port.
    ///
    /// `snapshot` is loaded at boot only if it exists in the disk image.
    pub async fn start(
        &self,
        identity: &VmIdentity,
        snapshot: Option<&str>,
    ) -> Result<u16, StartError> {
        let (entry, _op) = self.lock_or_insert(identity).await;

        let from = match entry.running_ports() {
            Some(ports) => {
                if self.backend.display_reachable(ports.display).await {
                    debug!(identity = %identity, port = ports.display, "VM already running");
                    return Ok(ports.display);
                }
                warn!(
                    identity = %identity,
                    port = ports.display,
                    "recorded display port unreachable, relaunching"
                );
                VmPhase::Running
            }
            None => VmPhase::Absent,
        };
        if !entry.transition(from, VmPhase::Starting) {
            let phase = entry.phase();
            error!(identity = %identity, phase = ?phase, "VM in unexpected phase for start");
            return Err(StartError::Conflict { phase });
        }
        if from == VmPhase::Running {
            self.discard_stale_child(&entry);
        }

        let mut guard = StartGuard {
            identity: identity.clone(),
            entry: Arc::clone(&entry),
            backend: Arc::clone(&self.backend),
            ports: None,
            armed: true,
        };
        let result = self.launch_fresh(identity, snapshot, &mut guard).await;
        guard.disarm();

        match result {
            Ok(port) => Ok(port),
            Err(e) => {
                {
                    let mut state = entry.lock();
                    state.phase = VmPhase::Absent;
                    if let Some(record) = state.record.as_mut() {
                        record.running = false;
                        record.pid = None;
                    }
                }
                self.prune_if_idle(identity, &entry);
                error!(identity = %identity, error = %e, "VM failed to start");
                Err(e)
            }
        }
    }

    async fn launch_fresh(
        &self,
        identity: &VmIdentity,
        snapshot: Option<&str>,
        guard: &mut StartGuard<B>,
    ) -> Result<u16, StartError> {
        let state_dir = self.state_dir(identity);
        tokio::fs::create_dir_all(&state_dir)
            .await
            .map_err(|source| StartError::StateDir {
                path: state_dir.clone(),
                source,
            })?;

        let disk = self.backend.prepare_disk(&state_dir).await?;
        let ports = self.ports.allocate().ok_or(StartError::PortsExhausted {
            base: self.ports.base(),
        })?;
        guard.ports = Some(ports);

        let launched = self
            .backend
            .launch(LaunchRequest {
                identity: identity.clone(),
                ports,
                state_dir,
                disk,
                snapshot: snapshot.map(str::to_string),
            })
            .await?;

        let pid = launched.process.as_ref().and_then(Child::id);
        let mut state = guard.entry.lock();
        state.record = Some(VmRecord {
            identity: identity.clone(),
            ports,
            running: true,
            pid,
        });
        state.child = launched.process;
        state.phase = VmPhase::Running;
        info!(identity = %identity, port = launched.display_port, "VM running");
        Ok(launched.display_port)
    }

    fn discard_stale_child(&self, entry: &VmEntry) {
        if let Some(mut child) = entry.lock().child.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "stale launcher process already gone");
            }
        }
    }

    // -----------------------------------------------------------------------
    // stop
    // -----------------------------------------------------------------------

    /// Stop the VM for `identity`. Best effort; never fails.
    pub async fn stop(&self, identity: &VmIdentity) {
        let Some((entry, _op)) = self.lock_existing(identity).await else {
            return;
        };
        self.stop_locked(identity, &entry).await;
    }

    async fn stop_locked(&self, identity: &VmIdentity, entry: &VmEntry) {
        let Some(ports) = entry.running_ports() else {
            return;
        };
        if !entry.transition(VmPhase::Running, VmPhase::Stopping) {
            debug!(identity = %identity, phase = ?entry.phase(), "VM no longer running, nothing to stop");
            return;
        }
        let child = entry.lock().child.take();

        match self.backend.quit(ports).await {
            Ok(()) => info!(identity = %identity, "VM stopped via QMP"),
            Err(e) => {
                warn!(identity = %identity, error = %e, "QMP quit failed, killing process");
                match child {
                    Some(mut child) => {
                        if let Err(e) = child.kill().await {
                            warn!(identity = %identity, error = %e, "failed to kill VM process");
                        }
                    }
                    None => debug!(identity = %identity, "no local process handle to kill"),
                }
            }
        }

        let mut state = entry.lock();
        state.phase = VmPhase::Absent;
        if let Some(record) = state.record.as_mut() {
            record.running = false;
            record.pid = None;
        }
    }

    /// Stop every running VM.
    pub async fn shutdown_all(&self) {
        for identity in self.running() {
            self.stop(&identity).await;
        }
    }

    // -----------------------------------------------------------------------
    // status
    // -----------------------------------------------------------------------

    /// `true` if the VM's display port currently accepts connections.
    pub async fn is_running(&self, identity: &VmIdentity) -> bool {
        let Some(ports) = self.existing(identity).and_then(|e| e.running_ports()) else {
            return false;
        };
        self.backend.display_reachable(ports.display).await
    }

    // -----------------------------------------------------------------------
    // snapshots
    // -----------------------------------------------------------------------

    /// Save the running VM's state as `name`. Returns whether it was saved.
    pub async fn save_state(&self, identity: &VmIdentity, name: &str) -> bool {
        if let Err(e) = validate_snapshot_name(name) {
            warn!(identity = %identity, error = %e, "refusing to save snapshot");
            return false;
        }
        let Some((entry, _op)) = self.lock_existing(identity).await else {
            warn!(identity = %identity, "cannot save state: VM not known");
            return false;
        };
        let Some(ports) = entry.running_ports() else {
            warn!(identity = %identity, "cannot save state: VM not running");
            return false;
        };

        match self.backend.save_snapshot(ports, name).await {
            Ok(()) => {
                info!(identity = %identity, snapshot = name, "saved VM state");
                true
            }
            Err(e) => {
                warn!(identity = %identity, snapshot = name, error = %e, "failed to save VM state");
                false
            }
        }
    }

    /// Remove snapshot `name`: through the monitor while running, else (or
    /// if that fails) straight from the image. Returns whether it was removed.
    pub async fn delete_snapshot(&self, identity: &VmIdentity, name: &str) -> bool {
        if let Err(e) = validate_snapshot_name(name) {
            warn!(identity = %identity, error = %e, "refusing to delete snapshot");
            return false;
        }
        let (entry, _op) = self.lock_or_insert(identity).await;
        let removed = self.delete_snapshot_locked(identity, &entry, name).await;
        self.prune_if_idle(identity, &entry);
        removed
    }

    async fn delete_snapshot_locked(&self, identity: &VmIdentity, entry: &VmEntry, name: &str) -> bool {
        if let Some(ports) = entry.running_ports() {
            match self.backend.delete_snapshot(ports, name).await {
                Ok(()) => {
                    info!(identity = %identity, snapshot = name, "deleted snapshot via monitor");
                    return true;
                }
                Err(e) => {
                    warn!(identity = %identity, snapshot = name, error = %e, "monitor delete failed, trying image tool");
                }
            }
        }

        let disk = self.disk_path(identity);
        if !tokio::fs::try_exists(&disk).await.unwrap_or(false) {
            debug!(identity = %identity, "no disk image, nothing to delete");
            return false;
        }
        match self.backend.delete_snapshot_offline(&disk, name).await {
            Ok(()) => {
                info!(identity = %identity, snapshot = name, "deleted snapshot from image");
                true
            }
            Err(e) => {
                warn!(identity = %identity, snapshot = name, error = %e, "failed to delete snapshot");
                false
            }
        }
    }

    /// Snapshots stored in the identity's disk image; empty if there is none.
    pub async fn list_snapshots(
        &self,
        identity: &VmIdentity,
    ) -> Result<Vec<SnapshotEntry>, ProvisionError> {
        let disk = self.disk_path(identity);
        if !tokio::fs::try_exists(&disk).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        self.backend.list_snapshots(&disk).await
    }

    // -----------------------------------------------------------------------
    // delete
    // -----------------------------------------------------------------------

    /// Stop the VM and remove all of its on-disk state. Idempotent; failures
    /// to remove individual files are logged, never returned.
    pub async fn delete(&self, identity: &VmIdentity) {
        // Held until the tree is gone and the entry is out of the map.
        let (entry, _op) = self.lock_or_insert(identity).await;
        self.stop_locked(identity, &entry).await;
        self.remove_state(identity).await;

        let mut entries = self.entries();
        if entries
            .get(identity)
            .is_some_and(|current| Arc::ptr_eq(current, &entry))
        {
            entries.remove(identity);
        }
    }

    async fn remove_state(&self, identity: &VmIdentity) {
        let dir = self.state_dir(identity);
        let failures = match tokio::task::spawn_blocking({
            let dir = dir.clone();
            move || remove_tree_best_effort(&dir)
        })
        .await
        {
            Ok(failures) => failures,
            Err(e) => {
                error!(identity = %identity, error = %e, "state cleanup task failed");
                return;
            }
        };

        for (path, e) in &failures {
            warn!(identity = %identity, path = %path.display(), error = %e, "could not delete");
        }
        info!(
            identity = %identity,
            dir = %dir.display(),
            failures = failures.len(),
            "deleted VM state"
        );
    }
}

// ---------------------------------------------------------------------------
// Filesystem cleanup
// ---------------------------------------------------------------------------

/// Delete `root` and everything below it, deepest entries first. Every
/// failure is collected and the walk continues. A missing `root` is fine.
pub fn remove_tree_best_effort(root: &Path) -> Vec<(PathBuf, io::Error)> {
    let mut failures = Vec::new();
    let mut files = Vec::new();
    let mut dirs = Vec::new();

    match std::fs::symlink_metadata(root) {
        Ok(meta) if meta.is_dir() => dirs.push(root.to_path_buf()),
        Ok(_) => files.push(root.to_path_buf()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return failures,
        Err(e) => {
            failures.push((root.to_path_buf(), e));
            return failures;
        }
    }

    let mut index = 0;
    while index < dirs.len() {
        match std::fs::read_dir(&dirs[index]) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    match entry.file_type() {
                        Ok(kind) if kind.is_dir() => dirs.push(path),
                        _ => files.push(path),
                    }
                }
            }
            Err(e) => failures.push((dirs[index].clone(), e)),
        }
        index += 1;
    }

    for file in files {
        if let Err(e) = std::fs::remove_file(&file) {
            failures.push((file, e));
        }
    }
    // Breadth-first discovery order reversed puts children before parents.
    for dir in dirs.into_iter().rev() {
        if let Err(e) = std::fs::remove_dir(&dir) {
            failures.push((dir, e));
        }
    }

    failures
}
