//! QEMU executable/firmware discovery and command-line construction.
//!
//! ## Architecture
//!
//! ```text
//! HypervisorTools::resolve(bundled_dir, overrides)
//!     ├─► qemu-system-x86_64  (bundled → system paths → bare name via PATH)
//!     └─► qemu-img            (sibling of the resolved hypervisor, or PATH)
//!
//! resolve_firmware()  →  Firmware::Uefi | Firmware::Bios | Firmware::Default
//!
//! build_qemu_command(&MachineSpec)  →  HypervisorCommand { program, args }
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::ports::PortTriple;

#[cfg(target_os = "windows")]
const QEMU_BINARY: &str = "qemu-system-x86_64.exe";
#[cfg(not(target_os = "windows"))]
const QEMU_BINARY: &str = "qemu-system-x86_64";

#[cfg(target_os = "windows")]
const QEMU_IMG_BINARY: &str = "qemu-img.exe";
#[cfg(not(target_os = "windows"))]
const QEMU_IMG_BINARY: &str = "qemu-img";

// ---------------------------------------------------------------------------
// Executable discovery
// ---------------------------------------------------------------------------

/// Resolved paths of the QEMU binaries used by the launcher and provisioner.
#[derive(Debug, Clone)]
pub struct HypervisorTools {
    pub hypervisor: PathBuf,
    pub image_tool: PathBuf,
}

impl HypervisorTools {
    /// Resolve both binaries. Explicit overrides win; otherwise see
    /// [`find_hypervisor`] and [`image_tool_for`].
    pub fn resolve(
        bundled_dir: Option<&Path>,
        hypervisor_override: Option<&Path>,
        image_tool_override: Option<&Path>,
    ) -> Self {
        let hypervisor = hypervisor_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| find_hypervisor(bundled_dir));
        let image_tool = image_tool_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| image_tool_for(&hypervisor));
        Self {
            hypervisor,
            image_tool,
        }
    }
}

/// Directory name for bundled binaries of the current platform.
pub fn bundled_platform_dir() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "macos-arm64"
    } else if cfg!(target_os = "macos") {
        "macos-x86_64"
    } else {
        "linux"
    }
}

/// Well-known system install locations for the hypervisor binary.
fn system_hypervisor_paths() -> Vec<PathBuf> {
    let dirs: &[&str] = if cfg!(target_os = "macos") {
        &["/opt/homebrew/bin", "/usr/local/bin"]
    } else if cfg!(target_os = "windows") {
        &["C:\\Program Files\\qemu"]
    } else {
        &["/usr/bin", "/usr/local/bin"]
    };
    dirs.iter().map(|d| Path::new(d).join(QEMU_BINARY)).collect()
}

/// Find the QEMU system emulator.
///
/// Order: `<bundled_dir>/<platform>/qemu-system-x86_64`, then the platform's
/// system install paths, then the bare executable name (resolved through
/// `PATH` when spawned). Never fails; a missing binary surfaces as
/// `LaunchError::ExecutableNotFound` at spawn time.
pub fn find_hypervisor(bundled_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = bundled_dir {
        let candidate = dir.join(bundled_platform_dir()).join(QEMU_BINARY);
        if is_executable(&candidate) {
            info!(path = %candidate.display(), "using bundled QEMU");
            return candidate;
        }
    }

    for candidate in system_hypervisor_paths() {
        if is_executable(&candidate) {
            info!(path = %candidate.display(), "using system QEMU");
            return candidate;
        }
    }

    info!("using QEMU from PATH");
    PathBuf::from(QEMU_BINARY)
}

/// `qemu-img` next to `hypervisor` if present there, else the bare name.
pub fn image_tool_for(hypervisor: &Path) -> PathBuf {
    match hypervisor.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            let sibling = dir.join(QEMU_IMG_BINARY);
            if sibling.is_file() {
                return sibling;
            }
            PathBuf::from(QEMU_IMG_BINARY)
        }
        _ => PathBuf::from(QEMU_IMG_BINARY),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ---------------------------------------------------------------------------
// Firmware discovery
// ---------------------------------------------------------------------------

/// Boot firmware selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Firmware {
    /// OVMF split into read-only code and a writable variable store.
    Uefi { code: PathBuf, vars: PathBuf },
    /// Single-file firmware passed with `-bios`.
    Bios(PathBuf),
    /// QEMU's built-in default (SeaBIOS).
    Default,
}

/// Directories searched for OVMF/BIOS images.
pub fn firmware_search_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = if cfg!(target_os = "macos") {
        vec!["/opt/homebrew/share/qemu".into(), "/usr/local/share/qemu".into()]
    } else if cfg!(target_os = "windows") {
        vec!["C:\\Program Files\\qemu".into(), "C:\\qemu".into()]
    } else {
        vec![
            "/usr/share/qemu".into(),
            "/usr/share/OVMF".into(),
            "/usr/local/share/qemu".into(),
        ]
    };

    // Homebrew keeps versioned copies under the Cellar.
    if cfg!(target_os = "macos") {
        if let Ok(entries) = std::fs::read_dir("/opt/homebrew/Cellar/qemu") {
            dirs.extend(
                entries
                    .flatten()
                    .filter(|e| e.path().is_dir())
                    .map(|e| e.path().join("share").join("qemu")),
            );
        }
    }

    dirs
}

/// First `dir/name` that is a file, trying names in order of preference.
pub fn find_firmware_file(dirs: &[PathBuf], names: &[&str]) -> Option<PathBuf> {
    names
        .iter()
        .flat_map(|name| dirs.iter().map(move |dir| dir.join(name)))
        .find(|path| path.is_file())
}

/// Pick UEFI code+vars if both exist, else a single BIOS image, else default.
pub fn resolve_firmware(dirs: &[PathBuf]) -> Firmware {
    let code = find_firmware_file(dirs, &["OVMF_CODE.fd", "OVMF_CODE.secboot.fd"]);
    let vars = find_firmware_file(dirs, &["OVMF_VARS.fd", "OVMF_VARS.secboot.fd"]);
    if let (Some(code), Some(vars)) = (code, vars) {
        return Firmware::Uefi { code, vars };
    }
    match find_firmware_file(dirs, &["OVMF.fd", "bios.bin"]) {
        Some(bios) => Firmware::Bios(bios),
        None => Firmware::Default,
    }
}

// ---------------------------------------------------------------------------
// Command construction
// ---------------------------------------------------------------------------

/// Everything needed to build one QEMU invocation.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    pub hypervisor: PathBuf,
    pub ram_mb: u32,
    /// `-machine` type; `None` leaves QEMU's default.
    pub machine: Option<String>,
    pub firmware: Firmware,
    pub disk: PathBuf,
    pub ports: PortTriple,
    /// QEMU display index (`-vnc 127.0.0.1:<index>`).
    pub display_index: u16,
    /// Snapshot to restore at boot. Callers must only set this after
    /// confirming the snapshot exists.
    pub load_snapshot: Option<String>,
    pub daemonize: bool,
}

/// A fully-built hypervisor command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl HypervisorCommand {
    /// Space-joined command line for logs and error messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn to_tokio_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Build the `qemu-system-x86_64` command for `spec`.
///
/// Control channels use TCP listeners rather than Unix sockets so that deep
/// state directories never hit the 104-byte `sun_path` limit.
pub fn build_qemu_command(spec: &MachineSpec) -> HypervisorCommand {
    let mut args: Vec<String> = Vec::new();
    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    push("-m", format!("{}M", spec.ram_mb));

    if let Some(machine) = &spec.machine {
        push("-machine", machine.clone());
    }

    match &spec.firmware {
        Firmware::Uefi { code, vars } => {
            push(
                "-drive",
                format!(
                    "file={},format=raw,if=pflash,unit=0,readonly=on",
                    code.display()
                ),
            );
            push(
                "-drive",
                format!("file={},format=raw,if=pflash,unit=1", vars.display()),
            );
        }
        Firmware::Bios(path) => push("-bios", path.display().to_string()),
        Firmware::Default => {}
    }

    push("-drive", format!("file={},format=qcow2", spec.disk.display()));
    push("-vnc", format!("127.0.0.1:{}", spec.display_index));
    push("-vga", "std".to_string());
    push(
        "-qmp",
        format!("tcp:127.0.0.1:{},server,nowait", spec.ports.control_a),
    );
    push(
        "-monitor",
        format!("tcp:127.0.0.1:{},server,nowait", spec.ports.control_b),
    );

    if let Some(snapshot) = &spec.load_snapshot {
        push("-loadvm", snapshot.clone());
    }

    if spec.daemonize {
        args.push("-daemonize".to_string());
    }

    let command = HypervisorCommand {
        program: spec.hypervisor.clone(),
        args,
    };
    debug!(command = %command.command_line(), "built QEMU command");
    command
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> MachineSpec {
        MachineSpec {
            hypervisor: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            ram_mb: 512,
            machine: Some("q35".to_string()),
            firmware: Firmware::Default,
            disk: PathBuf::from("/vms/0_64_0/disk.qcow2"),
            ports: PortTriple::starting_at(5903).unwrap(),
            display_index: 3,
            load_snapshot: None,
            daemonize: true,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn command_has_display_and_control_channels() {
        let cmd = build_qemu_command(&spec());

        assert_eq!(value_after(&cmd.args, "-m"), Some("512M"));
        assert_eq!(value_after(&cmd.args, "-machine"), Some("q35"));
        assert_eq!(value_after(&cmd.args, "-vnc"), Some("127.0.0.1:3"));
        assert_eq!(value_after(&cmd.args, "-vga"), Some("std"));
        assert_eq!(
            value_after(&cmd.args, "-qmp"),
            Some("tcp:127.0.0.1:5904,server,nowait")
        );
        assert_eq!(
            value_after(&cmd.args, "-monitor"),
            Some("tcp:127.0.0.1:5905,server,nowait")
        );
        assert_eq!(
            value_after(&cmd.args, "-drive"),
            Some("file=/vms/0_64_0/disk.qcow2,format=qcow2")
        );
        assert_eq!(cmd.args.last().map(String::as_str), Some("-daemonize"));
    }

    #[test]
    fn loadvm_only_when_requested() {
        let cmd = build_qemu_command(&spec());
        assert!(!cmd.args.iter().any(|a| a == "-loadvm"));

        let mut with_snapshot = spec();
        with_snapshot.load_snapshot = Some("state_0_64_0".to_string());
        let cmd = build_qemu_command(&with_snapshot);
        assert_eq!(value_after(&cmd.args, "-loadvm"), Some("state_0_64_0"));
    }

    #[test]
    fn uefi_firmware_adds_two_pflash_drives_before_disk() {
        let mut uefi = spec();
        uefi.firmware = Firmware::Uefi {
            code: PathBuf::from("/fw/OVMF_CODE.fd"),
            vars: PathBuf::from("/vm/OVMF_VARS.fd"),
        };
        let cmd = build_qemu_command(&uefi);
        let drives: Vec<&String> = cmd
            .args
            .windows(2)
            .filter(|w| w[0] == "-drive")
            .map(|w| &w[1])
            .collect();

        assert_eq!(drives.len(), 3);
        assert!(drives[0].contains("unit=0,readonly=on"));
        assert!(drives[1].starts_with("file=/vm/OVMF_VARS.fd"));
        assert!(drives[2].ends_with("format=qcow2"));
    }

    #[test]
    fn bios_firmware_uses_bios_flag() {
        let mut bios = spec();
        bios.firmware = Firmware::Bios(PathBuf::from("/fw/bios.bin"));
        let cmd = build_qemu_command(&bios);
        assert_eq!(value_after(&cmd.args, "-bios"), Some("/fw/bios.bin"));
    }

    #[test]
    fn command_line_joins_program_and_args() {
        let cmd = HypervisorCommand {
            program: PathBuf::from("qemu"),
            args: vec!["-m".to_string(), "512M".to_string()],
        };
        assert_eq!(cmd.command_line(), "qemu -m 512M");
    }

    #[test]
    fn firmware_prefers_uefi_pair_then_bios() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = vec![dir.path().to_path_buf()];
        assert_eq!(resolve_firmware(&dirs), Firmware::Default);

        std::fs::write(dir.path().join("bios.bin"), b"").unwrap();
        assert_eq!(
            resolve_firmware(&dirs),
            Firmware::Bios(dir.path().join("bios.bin"))
        );

        // Code alone is not enough for UEFI.
        std::fs::write(dir.path().join("OVMF_CODE.fd"), b"").unwrap();
        assert!(matches!(resolve_firmware(&dirs), Firmware::Bios(_)));

        std::fs::write(dir.path().join("OVMF_VARS.fd"), b"").unwrap();
        assert_eq!(
            resolve_firmware(&dirs),
            Firmware::Uefi {
                code: dir.path().join("OVMF_CODE.fd"),
                vars: dir.path().join("OVMF_VARS.fd"),
            }
        );
    }

    #[test]
    fn image_tool_falls_back_to_bare_name() {
        assert_eq!(
            image_tool_for(Path::new(QEMU_BINARY)),
            PathBuf::from(QEMU_IMG_BINARY)
        );
        assert_eq!(
            image_tool_for(Path::new("/nonexistent/bin/qemu-system-x86_64")),
            PathBuf::from(QEMU_IMG_BINARY)
        );
    }

    #[cfg(unix)]
    #[test]
    fn bundled_binary_wins_when_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let platform = dir.path().join(bundled_platform_dir());
        std::fs::create_dir_all(&platform).unwrap();
        let binary = platform.join(QEMU_BINARY);
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(find_hypervisor(Some(dir.path())), binary);
    }
}
