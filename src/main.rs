//! vmscreen: run a QEMU VM per screen and watch its console over RFB.
//!
//! A reference host for the `vmscreen` library: starts (or restores) a VM
//! for an identity, connects the RFB client with capped exponential backoff,
//! paces frames at the configured rate, and on Ctrl-C saves the VM's state
//! and stops it.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vmscreen::config::Settings;
use vmscreen::logging;
use vmscreen::paths::ScreenPaths;
use vmscreen::rfb::{FrameBuffer, RfbClient};
use vmscreen::state_machine::connection_sm::ConnectionState;
use vmscreen::vm::{PortAllocator, QemuBackend, VmIdentity, VmSupervisor};

/// How often `run`/`view` print a frame-rate line.
const REPORT_EVERY: Duration = Duration::from_secs(5);

/// VM-backed screens over RFB
#[derive(Parser, Debug)]
#[command(name = "vmscreen", version, about = "VM-backed screens over RFB")]
struct Args {
    /// Config file (default: <config dir>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start (or restore) the VM for IDENTITY and watch its display
    Run {
        identity: VmIdentity,
        /// Snapshot to restore and save into (default: state_<identity>)
        #[arg(long)]
        snapshot: Option<String>,
        /// Do not save a snapshot on exit
        #[arg(long)]
        no_save: bool,
        /// Write the last frame to PATH (binary PPM) on exit
        #[arg(long)]
        screenshot: Option<PathBuf>,
    },
    /// Attach to any RFB server on PORT
    View {
        port: u16,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Write the last frame to PATH (binary PPM) on exit
        #[arg(long)]
        screenshot: Option<PathBuf>,
    },
    /// List snapshots stored in IDENTITY's disk image
    Snapshots { identity: VmIdentity },
    /// Stop IDENTITY's VM and remove all of its state
    Delete { identity: VmIdentity },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let paths = ScreenPaths::resolve().context("HOME is not set")?;
    let _log_guard = logging::init(Some(&paths.logs));
    if logging::file_logging_requested() {
        info!(path = %paths.log_file().display(), "file logging enabled");
    }

    let config_path = args.config.clone().unwrap_or_else(|| paths.config_file());
    let settings = Settings::load(&config_path)?;
    paths
        .ensure()
        .context("failed to create application directories")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    let result = runtime.block_on(dispatch(args.command, settings, paths));

    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn dispatch(command: Command, settings: Settings, paths: ScreenPaths) -> Result<()> {
    let supervisor = || {
        VmSupervisor::new(
            QemuBackend::from_settings(&settings, &paths),
            PortAllocator::new(settings.vm.base_port),
            &paths.vms,
        )
    };

    match command {
        Command::Run {
            identity,
            snapshot,
            no_save,
            screenshot,
        } => {
            let supervisor = supervisor();
            let snapshot = snapshot.unwrap_or_else(|| identity.default_snapshot_name());
            let target = Target::Vm {
                supervisor: &supervisor,
                identity: &identity,
                snapshot: &snapshot,
            };
            let outcome = watch(target, &settings, screenshot.as_deref()).await;

            if !no_save {
                if supervisor.save_state(&identity, &snapshot).await {
                    println!("{identity}: saved snapshot {snapshot}");
                } else {
                    eprintln!("{identity}: could not save snapshot {snapshot}");
                }
            }
            supervisor.shutdown_all().await;
            outcome
        }
        Command::View {
            port,
            host,
            screenshot,
        } => watch(Target::Fixed(format!("{host}:{port}")), &settings, screenshot.as_deref()).await,
        Command::Snapshots { identity } => {
            let snapshots = supervisor()
                .list_snapshots(&identity)
                .await
                .with_context(|| format!("failed to list snapshots for {identity}"))?;
            if snapshots.is_empty() {
                println!("{identity}: no snapshots");
            }
            for s in snapshots {
                let created = s
                    .created
                    .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:>4}  {:<32}  {created}", s.id, s.tag);
            }
            Ok(())
        }
        Command::Delete { identity } => {
            supervisor().delete(&identity).await;
            println!("{identity}: state removed");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Display loop
// ---------------------------------------------------------------------------

/// Where the RFB client connects.
enum Target<'a> {
    Fixed(String),
    Vm {
        supervisor: &'a VmSupervisor,
        identity: &'a VmIdentity,
        snapshot: &'a str,
    },
}

impl Target<'_> {
    /// Address to connect to, (re)starting the VM if it is not running.
    async fn address(&self) -> Result<String> {
        match self {
            Target::Fixed(addr) => Ok(addr.clone()),
            Target::Vm {
                supervisor,
                identity,
                snapshot,
            } => {
                let port = supervisor.start(identity, Some(*snapshot)).await?;
                Ok(format!("127.0.0.1:{port}"))
            }
        }
    }
}

/// Keep a client connected until Ctrl-C, reporting frame throughput.
async fn watch(target: Target<'_>, settings: &Settings, screenshot: Option<&Path>) -> Result<()> {
    let options = settings.rfb_options();
    let mut backoff = settings.reconnect_backoff();
    let mut tick = tokio::time::interval(options.frame_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut client: Option<RfbClient> = None;
    let mut last_frame: Option<FrameBuffer> = None;
    let mut frames = 0u64;
    let mut last_report = Instant::now();

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = tick.tick() => {}
        }

        if let Some(c) = client.as_ref().filter(|c| c.state() == ConnectionState::Disconnected) {
            warn!(reason = ?c.close_reason(), "display connection lost");
            last_frame = Some(c.snapshot());
            client = None;
            backoff.record_failure(Instant::now());
        }

        let Some(c) = &client else {
            if !backoff.ready(Instant::now()) {
                continue;
            }
            let attempt = async {
                let addr = target.address().await?;
                let client = RfbClient::connect(addr.clone(), options.clone()).await?;
                anyhow::Ok((addr, client))
            };
            tokio::select! {
                _ = &mut ctrl_c => break,
                result = attempt => match result {
                    Ok((addr, c)) => {
                        println!("connected to {addr}: {}x{} {:?}", c.width(), c.height(), c.server().name);
                        backoff.record_success();
                        client = Some(c);
                    }
                    Err(e) => {
                        backoff.record_failure(Instant::now());
                        warn!(
                            attempts = backoff.attempts(),
                            retry_in = ?backoff.current_delay(),
                            error = %format!("{e:#}"),
                            "display connection failed"
                        );
                    }
                },
            }
            continue;
        };

        if c.poll(|_| {}) {
            frames += 1;
        }
        if last_report.elapsed() >= REPORT_EVERY {
            let secs = last_report.elapsed().as_secs_f64();
            println!("{:.1} fps ({} updates decoded)", frames as f64 / secs, c.frames_decoded());
            frames = 0;
            last_report = Instant::now();
        }
    }

    if let Some(c) = client {
        last_frame = Some(c.snapshot());
        c.disconnect();
    }

    if let Some(path) = screenshot {
        match last_frame {
            Some(frame) => {
                let file = File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                frame
                    .write_ppm(BufWriter::new(file))
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("wrote {}", path.display());
            }
            None => eprintln!("no frame received; {} not written", path.display()),
        }
    }

    Ok(())
}
