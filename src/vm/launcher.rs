//! Launching one QEMU process and waiting for its display to come up.
//!
//! ## Architecture
//!
//! ```text
//! launch(LaunchRequest)
//!     ├─► resolve firmware (warn on default)
//!     ├─► snapshot_exists?  → -loadvm only when confirmed
//!     ├─► build_qemu_command  →  tokio::process::Command  (-daemonize)
//!     │       └─► stdout/stderr reader tasks  →  OutputLog + debug!
//!     └─► settle → probe display port → wait → probe once more
//!             ├─► reachable       → LaunchedVm
//!             ├─► exited non-zero → classify_exit(...)
//!             └─► otherwise       → LaunchError::StartupTimeout
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::disk::ImageTool;
use super::hypervisor::{self, Firmware, MachineSpec};
use super::ports::PortTriple;
use super::{QEMU_INSTALL_HINT, VmIdentity, probe_port};

/// How long to keep draining output after the launcher process exits.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// What was run and what it printed; attached to every launch failure.
#[derive(Debug, Clone, Default)]
pub struct LaunchDiagnostics {
    pub command_line: String,
    pub exit_code: Option<i32>,
    pub output: String,
}

impl fmt::Display for LaunchDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => writeln!(f, "Exit code: {code}")?,
            None => writeln!(f, "Exit code: (still running)")?,
        }
        writeln!(f, "Output: {}", self.output.trim_end())?;
        write!(f, "Command: {}", self.command_line)
    }
}

/// A VM failed to start.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(
        "QEMU VNC support error. This QEMU build may not have VNC enabled \
         (standard builds include it).\n{0}"
    )]
    VncUnsupported(LaunchDiagnostics),
    #[error("QEMU snapshot restore failed. Snapshot: {snapshot}\n{diagnostics}")]
    SnapshotRestoreFailed {
        snapshot: String,
        diagnostics: LaunchDiagnostics,
    },
    #[error("QEMU not found. Attempted to run: {program}\n{hint}")]
    ExecutableNotFound { program: String, hint: &'static str },
    #[error("QEMU process exited immediately.\n{0}")]
    ProcessExitedImmediately(LaunchDiagnostics),
    #[error("QEMU display port {port} is not listening; QEMU may have failed to start.\n{diagnostics}")]
    StartupTimeout {
        port: u16,
        diagnostics: LaunchDiagnostics,
    },
    #[error("display port {0} is below the VNC base port")]
    InvalidDisplayPort(u16),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Map a launcher process that exited with `exit_code` to a classified error.
///
/// VNC problems are checked first because a build without VNC fails on the
/// `-vnc` argument regardless of any snapshot request.
pub fn classify_exit(snapshot: Option<&str>, diagnostics: LaunchDiagnostics) -> LaunchError {
    let output = diagnostics.output.to_lowercase();

    if output.contains("vnc") || output.contains("invalid option") {
        return LaunchError::VncUnsupported(diagnostics);
    }

    if let Some(snapshot) = snapshot {
        let snapshot_related = ["snapshot", "loadvm", "does not exist"]
            .iter()
            .any(|needle| output.contains(needle));
        if snapshot_related {
            return LaunchError::SnapshotRestoreFailed {
                snapshot: snapshot.to_string(),
                diagnostics,
            };
        }
    }

    LaunchError::ProcessExitedImmediately(diagnostics)
}

// ---------------------------------------------------------------------------
// Output capture
// ---------------------------------------------------------------------------

/// Combined stdout/stderr of the launcher process.
#[derive(Debug, Clone, Default)]
pub struct OutputLog(Arc<Mutex<String>>);

impl OutputLog {
    fn push_line(&self, line: &str) {
        let mut buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        buf.push_str(line);
        buf.push('\n');
    }

    pub fn contents(&self) -> String {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

fn capture<R>(stream: R, log: OutputLog, identity: VmIdentity) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(identity = %identity, line = %line, "QEMU output");
            log.push_line(&line);
        }
    })
}

// ---------------------------------------------------------------------------
// Launch
// ---------------------------------------------------------------------------

/// Timing and sizing knobs for a launch.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub ram_mb: u32,
    pub machine: Option<String>,
    /// Wait after spawning before the first display probe.
    pub settle: Duration,
    /// Extra wait before the single retry probe.
    pub retry: Duration,
    /// Connect timeout for each probe.
    pub probe_timeout: Duration,
    pub daemonize: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            ram_mb: 512,
            machine: Some("q35".to_string()),
            settle: Duration::from_millis(2500),
            retry: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(100),
            daemonize: true,
        }
    }
}

/// One VM to launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub identity: VmIdentity,
    pub ports: PortTriple,
    pub state_dir: PathBuf,
    pub disk: PathBuf,
    pub snapshot: Option<String>,
}

/// A launched VM whose display port accepted a connection.
#[derive(Debug)]
pub struct LaunchedVm {
    pub display_port: u16,
    /// Launcher process. With `-daemonize` this exits almost at once while
    /// the real server lives on, so it may already be reaped.
    pub process: Option<Child>,
    pub command_line: String,
}

/// Kills the spawned process on drop unless it was handed over, so a
/// cancelled or failed launch leaves nothing behind.
struct SpawnedChild(Option<Child>);

impl SpawnedChild {
    fn hand_over(mut self) -> Option<Child> {
        self.0.take()
    }

    fn exit_status(&mut self) -> Option<std::process::ExitStatus> {
        self.0.as_mut().and_then(|child| child.try_wait().ok().flatten())
    }
}

impl Drop for SpawnedChild {
    fn drop(&mut self) {
        if let Some(child) = self.0.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "launcher process already gone");
            }
        }
    }
}

/// Spawns QEMU processes.
#[derive(Debug, Clone)]
pub struct Launcher {
    hypervisor: PathBuf,
    image_tool: ImageTool,
    firmware_dirs: Vec<PathBuf>,
    options: LaunchOptions,
}

impl Launcher {
    pub fn new(
        hypervisor: PathBuf,
        image_tool: ImageTool,
        firmware_dirs: Vec<PathBuf>,
        options: LaunchOptions,
    ) -> Self {
        Self {
            hypervisor,
            image_tool,
            firmware_dirs,
            options,
        }
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    /// Launch `request` and wait until its display port is reachable.
    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchedVm, LaunchError> {
        let display_index = request
            .ports
            .display_index()
            .ok_or(LaunchError::InvalidDisplayPort(request.ports.display))?;

        let firmware = self.firmware_for(&request.state_dir).await;

        let load_snapshot = match &request.snapshot {
            Some(name) if self.image_tool.snapshot_exists(&request.disk, name).await => {
                info!(identity = %request.identity, snapshot = %name, "loading snapshot");
                Some(name.clone())
            }
            Some(name) => {
                info!(identity = %request.identity, snapshot = %name, "snapshot does not exist, starting fresh");
                None
            }
            None => None,
        };

        let command = hypervisor::build_qemu_command(&MachineSpec {
            hypervisor: self.hypervisor.clone(),
            ram_mb: self.options.ram_mb,
            machine: self.options.machine.clone(),
            firmware,
            disk: request.disk.clone(),
            ports: request.ports,
            display_index,
            load_snapshot: load_snapshot.clone(),
            daemonize: self.options.daemonize,
        });
        let command_line = command.command_line();
        info!(
            identity = %request.identity,
            display_port = request.ports.display,
            display_index,
            command = %command_line,
            "starting QEMU"
        );

        let mut cmd = command.to_tokio_command();
        cmd.current_dir(&request.state_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LaunchError::ExecutableNotFound {
                program: self.hypervisor.display().to_string(),
                hint: QEMU_INSTALL_HINT,
            },
            _ => LaunchError::Spawn {
                program: self.hypervisor.display().to_string(),
                source: e,
            },
        })?;

        let log = OutputLog::default();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(capture(stdout, log.clone(), request.identity.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(capture(stderr, log.clone(), request.identity.clone()));
        }
        let mut spawned = SpawnedChild(Some(child));

        let port = request.ports.display;
        if self.wait_for_display(port).await {
            info!(identity = %request.identity, port, "VM display is listening");
            return Ok(LaunchedVm {
                display_port: port,
                process: spawned.hand_over(),
                command_line,
            });
        }

        let status = spawned.exit_status();
        for reader in readers {
            let _ = tokio::time::timeout(OUTPUT_DRAIN, reader).await;
        }
        let diagnostics = LaunchDiagnostics {
            command_line,
            exit_code: status.and_then(|s| s.code()),
            output: log.contents(),
        };

        Err(match status {
            Some(status) if !status.success() => {
                warn!(identity = %request.identity, exit = ?status, "QEMU exited during startup");
                classify_exit(load_snapshot.as_deref(), diagnostics)
            }
            _ => {
                warn!(identity = %request.identity, port, "QEMU display never became reachable");
                LaunchError::StartupTimeout { port, diagnostics }
            }
        })
    }

    /// Settle, probe, wait, probe once more.
    async fn wait_for_display(&self, port: u16) -> bool {
        tokio::time::sleep(self.options.settle).await;
        if probe_port(port, self.options.probe_timeout).await {
            return true;
        }
        debug!(port, "display not ready, retrying once");
        tokio::time::sleep(self.options.retry).await;
        probe_port(port, self.options.probe_timeout).await
    }

    /// Resolve firmware; UEFI variable stores are copied into the state
    /// directory once so each VM has its own writable copy.
    async fn firmware_for(&self, state_dir: &Path) -> Firmware {
        match hypervisor::resolve_firmware(&self.firmware_dirs) {
            Firmware::Uefi { code, vars } => {
                let local_vars = state_dir.join("OVMF_VARS.fd");
                if !tokio::fs::try_exists(&local_vars).await.unwrap_or(false) {
                    if let Err(e) = tokio::fs::copy(&vars, &local_vars).await {
                        warn!(
                            from = %vars.display(),
                            to = %local_vars.display(),
                            error = %e,
                            "could not copy UEFI variable store, using default firmware"
                        );
                        return Firmware::Default;
                    }
                }
                info!(code = %code.display(), "using UEFI firmware");
                Firmware::Uefi {
                    code,
                    vars: local_vars,
                }
            }
            Firmware::Bios(path) => {
                info!(bios = %path.display(), "using BIOS firmware");
                Firmware::Bios(path)
            }
            Firmware::Default => {
                warn!("no UEFI firmware found, using QEMU default BIOS");
                Firmware::Default
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn diagnostics(output: &str) -> LaunchDiagnostics {
        LaunchDiagnostics {
            command_line: "qemu-system-x86_64 -m 512M".to_string(),
            exit_code: Some(1),
            output: output.to_string(),
        }
    }

    #[test]
    fn classify_vnc_failure() {
        let err = classify_exit(None, diagnostics("qemu: -vnc 127.0.0.1:0: invalid option"));
        assert!(matches!(err, LaunchError::VncUnsupported(_)));
    }

    #[test]
    fn classify_snapshot_failure_only_when_snapshot_requested() {
        let out = "qemu: Snapshot 'state_1' does not exist in one or more devices";
        assert!(matches!(
            classify_exit(Some("state_1"), diagnostics(out)),
            LaunchError::SnapshotRestoreFailed { ref snapshot, .. } if snapshot == "state_1"
        ));
        assert!(matches!(
            classify_exit(None, diagnostics(out)),
            LaunchError::ProcessExitedImmediately(_)
        ));
    }

    #[test]
    fn classify_generic_failure() {
        let err = classify_exit(Some("s1"), diagnostics("qemu: could not open disk image"));
        assert!(matches!(err, LaunchError::ProcessExitedImmediately(_)));
    }

    #[test]
    fn error_message_carries_command_line_and_output() {
        let err = classify_exit(None, diagnostics("boom"));
        let msg = err.to_string();
        assert!(msg.contains("qemu-system-x86_64 -m 512M"));
        assert!(msg.contains("boom"));
        assert!(msg.contains("Exit code: 1"));
    }

    #[tokio::test]
    async fn missing_executable_is_classified_with_install_hint() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(
            PathBuf::from("/nonexistent/qemu-system-x86_64"),
            ImageTool::new("/nonexistent/qemu-img"),
            vec![],
            LaunchOptions::default(),
        );
        let request = LaunchRequest {
            identity: VmIdentity::from_coords(0, 0, 0),
            ports: PortTriple::starting_at(5990).unwrap(),
            state_dir: dir.path().to_path_buf(),
            disk: dir.path().join("disk.qcow2"),
            snapshot: Some("state_0_0_0".to_string()),
        };

        let err = launcher.launch(request).await.unwrap_err();
        match err {
            LaunchError::ExecutableNotFound { hint, .. } => {
                assert!(hint.contains("brew install qemu"));
                assert!(hint.contains("apt-get"));
                assert!(hint.contains("qemu.org"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn display_port_below_base_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(
            PathBuf::from("qemu-system-x86_64"),
            ImageTool::new("qemu-img"),
            vec![],
            LaunchOptions::default(),
        );
        let request = LaunchRequest {
            identity: VmIdentity::from_coords(0, 0, 0),
            ports: PortTriple::starting_at(100).unwrap(),
            state_dir: dir.path().to_path_buf(),
            disk: dir.path().join("disk.qcow2"),
            snapshot: None,
        };
        assert!(matches!(
            launcher.launch(request).await,
            Err(LaunchError::InvalidDisplayPort(100))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launcher_that_exits_non_zero_is_diagnosed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-qemu");
        std::fs::write(&script, "#!/bin/sh\necho \"qemu: could not load kernel\" >&2\nexit 1\n")
            .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let launcher = Launcher::new(
            script,
            ImageTool::new("/nonexistent/qemu-img"),
            vec![],
            LaunchOptions {
                settle: Duration::from_millis(100),
                retry: Duration::from_millis(100),
                ..LaunchOptions::default()
            },
        );
        let request = LaunchRequest {
            identity: VmIdentity::from_coords(1, 2, 3),
            // Display 65000 is far from anything a test host listens on.
            ports: PortTriple::starting_at(65000).unwrap(),
            state_dir: dir.path().to_path_buf(),
            disk: dir.path().join("disk.qcow2"),
            snapshot: None,
        };

        match launcher.launch(request).await.unwrap_err() {
            LaunchError::ProcessExitedImmediately(diag) => {
                assert_eq!(diag.exit_code, Some(1));
                assert!(diag.output.contains("could not load kernel"));
                assert!(diag.command_line.contains("-daemonize"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    fn executable(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        std::fs::write(path, body).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    fn quick_options() -> LaunchOptions {
        LaunchOptions {
            settle: Duration::from_millis(50),
            retry: Duration::from_millis(50),
            ..LaunchOptions::default()
        }
    }

    /// Command line of a launch against a hypervisor that always exits 1.
    #[cfg(unix)]
    async fn failed_command_line(launcher: &Launcher, dir: &Path, snapshot: Option<&str>) -> String {
        let request = LaunchRequest {
            identity: VmIdentity::from_coords(1, 2, 3),
            ports: PortTriple::starting_at(65010).unwrap(),
            state_dir: dir.to_path_buf(),
            disk: dir.join("disk.qcow2"),
            snapshot: snapshot.map(str::to_string),
        };
        match launcher.launch(request).await.unwrap_err() {
            LaunchError::ProcessExitedImmediately(diag)
            | LaunchError::SnapshotRestoreFailed {
                diagnostics: diag, ..
            } => diag.command_line,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn loadvm_is_passed_only_for_an_exact_existing_tag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("disk.qcow2"), b"qcow2").unwrap();

        let image_tool = dir.path().join("fake-qemu-img");
        executable(
            &image_tool,
            "#!/bin/sh\n\
             echo 'Snapshot list:'\n\
             echo 'ID        TAG               VM SIZE                DATE     VM CLOCK     ICOUNT'\n\
             echo '1         state_1x          0 B 2024-02-03 04:05:06 00:00:00.000 0'\n",
        );
        let hypervisor = dir.path().join("fake-qemu");
        executable(&hypervisor, "#!/bin/sh\necho 'qemu: boom' >&2\nexit 1\n");

        let launcher = Launcher::new(hypervisor, ImageTool::new(image_tool), vec![], quick_options());

        let missing = failed_command_line(&launcher, dir.path(), Some("state_9")).await;
        assert!(!missing.contains("-loadvm"), "{missing}");

        let prefix = failed_command_line(&launcher, dir.path(), Some("state_1")).await;
        assert!(!prefix.contains("-loadvm"), "{prefix}");

        let exact = failed_command_line(&launcher, dir.path(), Some("state_1x")).await;
        assert!(exact.contains("-loadvm state_1x"), "{exact}");

        let none = failed_command_line(&launcher, dir.path(), None).await;
        assert!(!none.contains("-loadvm"), "{none}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn loadvm_is_skipped_when_image_tool_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("disk.qcow2"), b"qcow2").unwrap();

        let image_tool = dir.path().join("fake-qemu-img");
        executable(&image_tool, "#!/bin/sh\necho 'qemu-img: locked' >&2\nexit 1\n");
        let hypervisor = dir.path().join("fake-qemu");
        executable(&hypervisor, "#!/bin/sh\nexit 1\n");

        let launcher = Launcher::new(hypervisor, ImageTool::new(image_tool), vec![], quick_options());
        let line = failed_command_line(&launcher, dir.path(), Some("state_1x")).await;
        assert!(!line.contains("-loadvm"), "{line}");
    }

    /// Linux only: relies on /proc to see whether the process is gone.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancelled_launch_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let hypervisor = dir.path().join("fake-qemu");
        executable(&hypervisor, "#!/bin/sh\necho $$ > launcher.pid\nexec sleep 30\n");

        let launcher = Launcher::new(
            hypervisor,
            ImageTool::new("/nonexistent/qemu-img"),
            vec![],
            LaunchOptions {
                settle: Duration::from_secs(10),
                ..LaunchOptions::default()
            },
        );
        let request = LaunchRequest {
            identity: VmIdentity::from_coords(4, 5, 6),
            ports: PortTriple::starting_at(65020).unwrap(),
            state_dir: dir.path().to_path_buf(),
            disk: dir.path().join("disk.qcow2"),
            snapshot: None,
        };

        let pid_file = dir.path().join("launcher.pid");
        let mut launch = Box::pin(launcher.launch(request));
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                tokio::select! {
                    _ = &mut launch => panic!("launch finished before it was cancelled"),
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
                if std::fs::read_to_string(&pid_file).is_ok_and(|s| !s.trim().is_empty()) {
                    break;
                }
            }
        })
        .await;
        assert!(waited.is_ok(), "fake hypervisor never wrote its pid");
        drop(launch);

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let stat = PathBuf::from(format!("/proc/{pid}/stat"));
        let gone = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                // Field 3 of /proc/<pid>/stat is the state; Z means exited, not yet reaped.
                match std::fs::read_to_string(&stat) {
                    Err(_) => break,
                    Ok(s) if s.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z')) => break,
                    Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        })
        .await;
        assert!(gone.is_ok(), "process {pid} outlived its cancelled launch");
    }
}
