//! Short-lived control sessions against a running QEMU.
//!
//! QEMU exposes two TCP control channels per VM:
//!
//! * **QMP** (channel A): newline-delimited JSON. On connect the server sends
//!   a greeting, the client negotiates capabilities, then issues commands.
//!   Used here only for `quit`.
//! * **HMP monitor** (channel B): plain text lines. Used for `savevm` and
//!   `delvm`.
//!
//! Every session is open → one command → close, bounded by a single timeout.
//! Failures are returned to the caller, which decides whether to escalate
//! (e.g. force-kill on a failed `quit`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace};

use super::is_safe_token;

/// Default bound on one control session (connect + exchange).
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Async events QEMU may interleave before a command's reply.
const MAX_SKIPPED_EVENTS: usize = 16;

/// A control-channel session failed.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("failed to connect to control port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("control session on port {port} timed out after {after:?}")]
    Timeout { port: u16, after: Duration },
    #[error("I/O error on control port {port}: {source}")]
    Io {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("control port {port} closed the connection")]
    Closed { port: u16 },
    #[error("unexpected reply on control port {port}: {detail}")]
    Protocol { port: u16, detail: String },
    #[error("QMP command '{command}' failed: {desc} ({class})")]
    Rejected {
        command: String,
        class: String,
        desc: String,
    },
    #[error("invalid snapshot name {0:?} (allowed: alphanumeric, '-', '_', '.', max 128 chars)")]
    InvalidSnapshotName(String),
}

/// Validate a snapshot name before it is spliced into a monitor command.
///
/// The monitor parses free-form text, so anything outside a conservative
/// character set could smuggle in a second command.
pub fn validate_snapshot_name(name: &str) -> Result<(), ControlError> {
    if is_safe_token(name) {
        Ok(())
    } else {
        Err(ControlError::InvalidSnapshotName(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Line transport
// ---------------------------------------------------------------------------

struct LineSession {
    port: u16,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LineSession {
    async fn connect(port: u16) -> Result<Self, ControlError> {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|source| ControlError::Connect { port, source })?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            port,
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    async fn read_line(&mut self) -> Result<String, ControlError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|source| ControlError::Io {
                port: self.port,
                source,
            })?;
        if n == 0 {
            return Err(ControlError::Closed { port: self.port });
        }
        Ok(line.trim().to_string())
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ControlError> {
        let port = self.port;
        let io = |source| ControlError::Io { port, source };
        self.writer.write_all(line.as_bytes()).await.map_err(io)?;
        self.writer.write_all(b"\n").await.map_err(io)?;
        self.writer.flush().await.map_err(io)
    }
}

async fn bounded<T>(
    port: u16,
    timeout: Duration,
    fut: impl Future<Output = Result<T, ControlError>>,
) -> Result<T, ControlError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ControlError::Timeout {
            port,
            after: timeout,
        })?
}

// ---------------------------------------------------------------------------
// Channel A: QMP
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct QmpCommand<'a> {
    execute: &'a str,
}

#[derive(Debug, Deserialize)]
struct QmpGreeting {
    #[serde(rename = "QMP")]
    #[allow(dead_code)]
    qmp: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct QmpErrorBody {
    class: String,
    desc: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QmpReply {
    Return {
        #[serde(rename = "return")]
        ret: serde_json::Value,
    },
    Error {
        error: QmpErrorBody,
    },
    Event {
        event: String,
    },
}

/// Run one QMP command: greeting → `qmp_capabilities` → `command` → reply.
pub async fn qmp_execute(
    port: u16,
    command: &str,
    timeout: Duration,
) -> Result<serde_json::Value, ControlError> {
    bounded(port, timeout, async {
        let mut session = LineSession::connect(port).await?;

        let greeting = session.read_line().await?;
        serde_json::from_str::<QmpGreeting>(&greeting).map_err(|e| ControlError::Protocol {
            port,
            detail: format!("bad QMP greeting {greeting:?}: {e}"),
        })?;
        debug!(port, "QMP greeting received");

        qmp_round_trip(&mut session, "qmp_capabilities").await?;
        qmp_round_trip(&mut session, command).await
    })
    .await
}

async fn qmp_round_trip(
    session: &mut LineSession,
    command: &str,
) -> Result<serde_json::Value, ControlError> {
    let port = session.port;
    let json = serde_json::to_string(&QmpCommand { execute: command }).map_err(|e| {
        ControlError::Protocol {
            port,
            detail: e.to_string(),
        }
    })?;
    trace!(port, json = %json, "sending QMP command");
    session.write_line(&json).await?;

    for _ in 0..=MAX_SKIPPED_EVENTS {
        let line = session.read_line().await?;
        let reply: QmpReply = serde_json::from_str(&line).map_err(|e| ControlError::Protocol {
            port,
            detail: format!("unparseable QMP reply {line:?}: {e}"),
        })?;
        match reply {
            QmpReply::Return { ret } => return Ok(ret),
            QmpReply::Error { error } => {
                return Err(ControlError::Rejected {
                    command: command.to_string(),
                    class: error.class,
                    desc: error.desc,
                });
            }
            QmpReply::Event { event } => {
                debug!(port, event, "QMP event before reply (skipping)");
            }
        }
    }

    Err(ControlError::Protocol {
        port,
        detail: format!("no reply to '{command}' after {MAX_SKIPPED_EVENTS} events"),
    })
}

/// Ask QEMU to exit via QMP `quit`.
///
/// QEMU may drop the socket before its reply reaches us; a close after the
/// command was sent counts as success.
pub async fn qmp_quit(port: u16, timeout: Duration) -> Result<(), ControlError> {
    match qmp_execute(port, "quit", timeout).await {
        Ok(_) | Err(ControlError::Closed { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Channel B: HMP monitor
// ---------------------------------------------------------------------------

/// Send one monitor command line and read (and return) at most one line back.
///
/// The returned line is usually the monitor banner or the echo; callers only
/// log it.
pub async fn monitor_command(
    port: u16,
    command: &str,
    timeout: Duration,
) -> Result<Option<String>, ControlError> {
    bounded(port, timeout, async {
        let mut session = LineSession::connect(port).await?;
        session.write_line(command).await?;
        debug!(port, command, "monitor command sent");

        match session.read_line().await {
            Ok(line) => Ok(Some(line)),
            Err(ControlError::Closed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    })
    .await
}

/// `savevm <name>` on the monitor port.
pub async fn save_snapshot(port: u16, name: &str, timeout: Duration) -> Result<(), ControlError> {
    validate_snapshot_name(name)?;
    monitor_command(port, &format!("savevm {name}"), timeout)
        .await
        .map(drop)
}

/// `delvm <name>` on the monitor port.
pub async fn delete_snapshot(port: u16, name: &str, timeout: Duration) -> Result<(), ControlError> {
    validate_snapshot_name(name)?;
    monitor_command(port, &format!("delvm {name}"), timeout)
        .await
        .map(drop)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
