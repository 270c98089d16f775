//! Supervisor behaviour against an in-process backend.
//!
//! `FakeBackend` stands in for QEMU: launching marks the display port as
//! reachable, quitting clears it, and snapshots live in a map keyed by disk
//! path. No processes or sockets are involved.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use vmscreen::vm::control::ControlError;
use vmscreen::vm::disk::{DISK_FILE_NAME, ProvisionError, SnapshotEntry};
use vmscreen::vm::launcher::{LaunchDiagnostics, LaunchError, LaunchRequest, LaunchedVm};
use vmscreen::vm::supervisor::remove_tree_best_effort;
use vmscreen::vm::{PortAllocator, PortTriple, StartError, VmBackend, VmIdentity, VmPhase, VmSupervisor};

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeBackend {
    launch_delay: Duration,
    launches: AtomicUsize,
    fail_launch: AtomicBool,
    fail_quit: AtomicBool,
    quits: AtomicUsize,
    reachable: Mutex<HashSet<u16>>,
    disks: Mutex<HashMap<u16, PathBuf>>,
    snapshots: Mutex<HashMap<PathBuf, Vec<String>>>,
    /// Snapshot each launch actually booted from.
    booted_from: Mutex<Vec<Option<String>>>,
}

impl FakeBackend {
    fn slow(delay: Duration) -> Self {
        Self {
            launch_delay: delay,
            ..Self::default()
        }
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Display ports of VMs that are up right now.
    fn live_vms(&self) -> usize {
        self.reachable.lock().unwrap().len()
    }

    /// Simulate the VM dying behind the supervisor's back.
    fn crash(&self, port: u16) {
        self.reachable.lock().unwrap().remove(&port);
    }

    fn snapshots_on(&self, disk: &Path) -> Vec<String> {
        self.snapshots.lock().unwrap().get(disk).cloned().unwrap_or_default()
    }

    fn disk_for(&self, ports: PortTriple) -> Result<PathBuf, ControlError> {
        self.disks
            .lock()
            .unwrap()
            .get(&ports.display)
            .cloned()
            .ok_or(ControlError::Closed { port: ports.control_b })
    }
}

impl VmBackend for FakeBackend {
    async fn prepare_disk(&self, state_dir: &Path) -> Result<PathBuf, ProvisionError> {
        let disk = state_dir.join(DISK_FILE_NAME);
        if !disk.exists() {
            std::fs::write(&disk, b"qcow2").map_err(|source| ProvisionError::Io {
                path: disk.clone(),
                source,
            })?;
        }
        Ok(disk)
    }

    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedVm, LaunchError> {
        tokio::time::sleep(self.launch_delay).await;
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(LaunchError::ProcessExitedImmediately(LaunchDiagnostics {
                command_line: "fake-qemu".into(),
                exit_code: Some(1),
                output: "boom".into(),
            }));
        }

        let booted = request
            .snapshot
            .filter(|name| self.snapshots_on(&request.disk).contains(name));
        self.booted_from.lock().unwrap().push(booted);
        self.disks.lock().unwrap().insert(request.ports.display, request.disk);
        self.reachable.lock().unwrap().insert(request.ports.display);
        Ok(LaunchedVm {
            display_port: request.ports.display,
            process: None,
            command_line: "fake-qemu".into(),
        })
    }

    async fn display_reachable(&self, port: u16) -> bool {
        self.reachable.lock().unwrap().contains(&port)
    }

    async fn quit(&self, ports: PortTriple) -> Result<(), ControlError> {
        self.quits.fetch_add(1, Ordering::SeqCst);
        if self.fail_quit.load(Ordering::SeqCst) {
            return Err(ControlError::Closed { port: ports.control_a });
        }
        self.reachable.lock().unwrap().remove(&ports.display);
        Ok(())
    }

    async fn save_snapshot(&self, ports: PortTriple, name: &str) -> Result<(), ControlError> {
        let disk = self.disk_for(ports)?;
        let mut snapshots = self.snapshots.lock().unwrap();
        let tags = snapshots.entry(disk).or_default();
        if !tags.iter().any(|t| t == name) {
            tags.push(name.to_string());
        }
        Ok(())
    }

    async fn delete_snapshot(&self, ports: PortTriple, name: &str) -> Result<(), ControlError> {
        let disk = self.disk_for(ports)?;
        if let Some(tags) = self.snapshots.lock().unwrap().get_mut(&disk) {
            tags.retain(|t| t != name);
        }
        Ok(())
    }

    async fn delete_snapshot_offline(&self, disk: &Path, name: &str) -> Result<(), ProvisionError> {
        if let Some(tags) = self.snapshots.lock().unwrap().get_mut(disk) {
            tags.retain(|t| t != name);
        }
        Ok(())
    }

    async fn list_snapshots(&self, disk: &Path) -> Result<Vec<SnapshotEntry>, ProvisionError> {
        Ok(self
            .snapshots_on(disk)
            .into_iter()
            .enumerate()
            .map(|(i, tag)| SnapshotEntry {
                id: (i + 1).to_string(),
                tag,
                created: None,
            })
            .collect())
    }
}

fn supervisor(backend: FakeBackend) -> (VmSupervisor<FakeBackend>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let sup = VmSupervisor::new(backend, PortAllocator::new(5900), dir.path().join("vms"));
    (sup, dir)
}

fn id(key: &str) -> VmIdentity {
    VmIdentity::new(key).unwrap()
}

// ---------------------------------------------------------------------------
// start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn distinct_identities_get_disjoint_port_triples() {
    let (sup, _dir) = supervisor(FakeBackend::slow(Duration::from_millis(20)));
    let sup = Arc::new(sup);
    let ids: Vec<VmIdentity> = (0..6).map(|i| VmIdentity::from_coords(i, 64, -i)).collect();

    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|identity| {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.start(&identity, None).await.unwrap() })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let mut seen = HashSet::new();
    for identity in &ids {
        let record = sup.record(identity).unwrap();
        assert!(record.running);
        for port in [record.ports.display, record.ports.control_a, record.ports.control_b] {
            assert!(seen.insert(port), "port {port} handed out twice");
        }
    }
    assert_eq!(sup.backend().launches(), 6);
    assert_eq!(sup.running().len(), 6);
}

#[tokio::test]
async fn concurrent_start_of_one_identity_launches_once() {
    let (sup, _dir) = supervisor(FakeBackend::slow(Duration::from_millis(100)));
    let sup = Arc::new(sup);
    let screen = id("screen-a");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let sup = Arc::clone(&sup);
            let screen = screen.clone();
            tokio::spawn(async move { sup.start(&screen, None).await.unwrap() })
        })
        .collect();

    let mut ports = HashSet::new();
    for handle in handles {
        ports.insert(handle.await.unwrap());
    }
    assert_eq!(ports.len(), 1, "all callers see the same display port");
    assert_eq!(sup.backend().launches(), 1);
    assert_eq!(sup.phase(&screen), VmPhase::Running);
}

#[tokio::test]
async fn start_on_running_vm_returns_existing_port() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    let screen = id("screen-a");
    let first = sup.start(&screen, None).await.unwrap();
    let second = sup.start(&screen, None).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(sup.backend().launches(), 1);
}

#[tokio::test]
async fn unreachable_display_triggers_relaunch() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    let screen = id("screen-a");
    let first = sup.start(&screen, None).await.unwrap();

    sup.backend().crash(first);
    assert!(!sup.is_running(&screen).await);

    let second = sup.start(&screen, None).await.unwrap();
    assert_ne!(first, second, "relaunch gets a fresh triple");
    assert_eq!(sup.backend().launches(), 2);
    assert!(sup.is_running(&screen).await);
}

#[tokio::test]
async fn failed_launch_leaves_identity_absent() {
    let backend = FakeBackend::default();
    backend.fail_launch.store(true, Ordering::SeqCst);
    let (sup, _dir) = supervisor(backend);
    let screen = id("screen-a");

    let err = sup.start(&screen, None).await.unwrap_err();
    assert!(matches!(err, StartError::Launch(LaunchError::ProcessExitedImmediately(_))));
    assert!(err.to_string().contains("boom"), "{err}");
    assert_eq!(sup.phase(&screen), VmPhase::Absent);
    assert!(!sup.is_running(&screen).await);
    assert_eq!(sup.tracked(), 0, "nothing worth keeping after a first failed start");
}

#[tokio::test]
async fn cancelled_start_returns_identity_to_absent() {
    let (sup, _dir) = supervisor(FakeBackend::slow(Duration::from_millis(200)));
    let screen = id("screen-a");

    let abandoned = tokio::time::timeout(Duration::from_millis(50), sup.start(&screen, None)).await;
    assert!(abandoned.is_err(), "start should still be launching");
    assert_eq!(sup.phase(&screen), VmPhase::Absent);
    assert_eq!(sup.backend().launches(), 0);

    let port = sup.start(&screen, None).await.unwrap();
    assert_eq!(sup.phase(&screen), VmPhase::Running);
    assert_eq!(sup.backend().launches(), 1);
    assert!(sup.is_running(&screen).await);
    assert_eq!(sup.record(&screen).unwrap().ports.display, port);
}

#[tokio::test]
async fn cancelled_relaunch_does_not_leave_vm_marked_running() {
    let (sup, _dir) = supervisor(FakeBackend::slow(Duration::from_millis(100)));
    let screen = id("screen-a");
    let first = sup.start(&screen, None).await.unwrap();
    sup.backend().crash(first);

    let abandoned = tokio::time::timeout(Duration::from_millis(30), sup.start(&screen, None)).await;
    assert!(abandoned.is_err());
    assert_eq!(sup.phase(&screen), VmPhase::Absent);
    assert!(!sup.record(&screen).unwrap().running);
    assert!(sup.running().is_empty());
}

#[tokio::test]
async fn exhausted_port_space_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let sup = VmSupervisor::new(FakeBackend::default(), PortAllocator::new(65534), dir.path());
    let err = sup.start(&id("screen-a"), None).await.unwrap_err();
    assert!(matches!(err, StartError::PortsExhausted { base: 65534 }));
    assert_eq!(sup.backend().launches(), 0);
}

// ---------------------------------------------------------------------------
// stop / status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn is_running_false_before_start_and_after_stop() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    let screen = id("screen-a");
    assert!(!sup.is_running(&screen).await);

    sup.start(&screen, None).await.unwrap();
    assert!(sup.is_running(&screen).await);

    sup.stop(&screen).await;
    assert!(!sup.is_running(&screen).await);
    assert_eq!(sup.phase(&screen), VmPhase::Absent);

    let record = sup.record(&screen).expect("record kept after stop");
    assert!(!record.running);
    assert_eq!(record.pid, None);
}

#[tokio::test]
async fn stop_completes_when_quit_fails() {
    let backend = FakeBackend::default();
    backend.fail_quit.store(true, Ordering::SeqCst);
    let (sup, _dir) = supervisor(backend);
    let screen = id("screen-a");
    sup.start(&screen, None).await.unwrap();

    sup.stop(&screen).await;
    assert_eq!(sup.phase(&screen), VmPhase::Absent);
    assert_eq!(sup.backend().quits.load(Ordering::SeqCst), 1);
    assert!(!sup.record(&screen).unwrap().running);
}

#[tokio::test]
async fn stop_unknown_identity_is_a_no_op() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    sup.stop(&id("never-started")).await;
    assert_eq!(sup.backend().quits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn shutdown_all_stops_every_vm() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    for key in ["a", "b", "c"] {
        sup.start(&id(key), None).await.unwrap();
    }
    sup.shutdown_all().await;
    assert!(sup.running().is_empty());
    assert_eq!(sup.backend().quits.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn saved_state_is_restored_on_next_start() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    let screen = id("screen-a");
    let snapshot = screen.default_snapshot_name();

    sup.start(&screen, Some(&snapshot)).await.unwrap();
    assert!(sup.save_state(&screen, &snapshot).await);
    sup.stop(&screen).await;

    sup.start(&screen, Some(&snapshot)).await.unwrap();
    let booted = sup.backend().booted_from.lock().unwrap().clone();
    assert_eq!(booted, vec![None, Some(snapshot.clone())]);

    let listed = sup.list_snapshots(&screen).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].tag, snapshot);
}

#[tokio::test]
async fn save_state_requires_running_vm_and_valid_name() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    let screen = id("screen-a");
    assert!(!sup.save_state(&screen, "s1").await, "unknown identity");

    sup.start(&screen, None).await.unwrap();
    assert!(!sup.save_state(&screen, "bad name").await);
    assert!(!sup.save_state(&screen, "").await);
    assert!(sup.save_state(&screen, "s1").await);

    sup.stop(&screen).await;
    assert!(!sup.save_state(&screen, "s2").await, "stopped VM");
}

#[tokio::test]
async fn delete_snapshot_uses_monitor_or_image() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    let screen = id("screen-a");
    sup.start(&screen, None).await.unwrap();
    assert!(sup.save_state(&screen, "live").await);
    assert!(sup.save_state(&screen, "offline").await);

    assert!(sup.delete_snapshot(&screen, "live").await);
    sup.stop(&screen).await;
    assert!(sup.delete_snapshot(&screen, "offline").await);

    assert!(sup.list_snapshots(&screen).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_snapshot_without_disk_reports_false() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    assert!(!sup.delete_snapshot(&id("screen-a"), "s1").await);
}

#[tokio::test]
async fn snapshot_calls_for_unknown_identities_leave_no_entries() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    for i in 0..50 {
        let screen = VmIdentity::from_coords(i, 64, 0);
        assert!(!sup.delete_snapshot(&screen, "s1").await);
        assert!(!sup.save_state(&screen, "s1").await);
    }
    assert_eq!(sup.tracked(), 0);

    let screen = id("screen-a");
    sup.start(&screen, None).await.unwrap();
    sup.stop(&screen).await;
    assert!(!sup.delete_snapshot(&screen, "s1").await);
    assert_eq!(sup.tracked(), 1, "a stopped VM keeps its record");
}

#[tokio::test]
async fn list_snapshots_without_disk_is_empty() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    assert!(sup.list_snapshots(&id("screen-a")).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_stops_vm_and_removes_state_dir() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    let screen = id("screen-a");
    sup.start(&screen, None).await.unwrap();
    let state_dir = sup.state_dir(&screen);
    std::fs::create_dir_all(state_dir.join("nested/deeper")).unwrap();
    std::fs::write(state_dir.join("nested/deeper/file"), b"x").unwrap();
    assert!(state_dir.exists());

    sup.delete(&screen).await;
    assert!(!state_dir.exists());
    assert_eq!(sup.phase(&screen), VmPhase::Absent);
    assert!(sup.record(&screen).is_none());
    assert!(!sup.is_running(&screen).await);
    assert_eq!(sup.tracked(), 0);
}

#[tokio::test]
async fn start_queued_behind_delete_is_tracked_and_stoppable() {
    let (sup, _dir) = supervisor(FakeBackend::slow(Duration::from_millis(200)));
    let sup = Arc::new(sup);
    let screen = id("screen-a");

    let first = tokio::spawn({
        let (sup, screen) = (Arc::clone(&sup), screen.clone());
        async move { sup.start(&screen, None).await.unwrap() }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let delete = tokio::spawn({
        let (sup, screen) = (Arc::clone(&sup), screen.clone());
        async move { sup.delete(&screen).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = tokio::spawn({
        let (sup, screen) = (Arc::clone(&sup), screen.clone());
        async move { sup.start(&screen, None).await.unwrap() }
    });

    first.await.unwrap();
    delete.await.unwrap();
    let port = second.await.unwrap();

    assert_eq!(sup.backend().launches(), 2);
    assert_eq!(sup.phase(&screen), VmPhase::Running);
    assert!(sup.is_running(&screen).await);
    assert_eq!(sup.record(&screen).unwrap().ports.display, port);
    assert_eq!(sup.backend().live_vms(), 1, "the deleted VM is gone, the new one is tracked");
    assert!(sup.disk_path(&screen).exists(), "state of the second start survives");

    sup.shutdown_all().await;
    assert_eq!(sup.backend().live_vms(), 0);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (sup, _dir) = supervisor(FakeBackend::default());
    let screen = id("screen-a");
    sup.delete(&screen).await;
    sup.delete(&screen).await;
    assert!(!sup.state_dir(&screen).exists());

    sup.start(&screen, None).await.unwrap();
    sup.delete(&screen).await;
    sup.delete(&screen).await;
    assert!(!sup.state_dir(&screen).exists());
}

#[test]
fn remove_tree_handles_missing_and_plain_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(remove_tree_best_effort(&dir.path().join("missing")).is_empty());

    let file = dir.path().join("lone");
    std::fs::write(&file, b"x").unwrap();
    assert!(remove_tree_best_effort(&file).is_empty());
    assert!(!file.exists());
}
