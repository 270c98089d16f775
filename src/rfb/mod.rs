//! Remote-framebuffer (RFB / VNC) client.
//!
//! Runs two Tokio tasks per connection and shares the decoded frame with the
//! host through a mutex.
//!
//! ## Architecture
//!
//! ```text
//! RfbClient::connect(addr)
//!     ├─► wire::handshake  (each step bounded by handshake_timeout)
//!     ├─► SetPixelFormat, SetEncodings [CopyRect, Raw], update request (incremental)
//!     ├─► read task:  read_server_message → read_rectangle × n, each applied
//!     │               to FrameBuffer as it arrives → generation += 1
//!     │                                   → enqueue next update request (waits for room)
//!     └─► write task: drains the outbound queue (update requests + input events)
//!
//! host ──poll(f)──► FrameThrottle ──► f(&FrameBuffer)   (under the frame lock)
//! host ──send_key / send_pointer_*──► outbound queue (dropped when full)
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use statig::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::state_machine::connection_sm::{ConnectionEvent, ConnectionMachine, ConnectionState};

pub mod backoff;
pub mod framebuffer;
pub mod throttle;
pub mod wire;

pub use backoff::ReconnectBackoff;
pub use framebuffer::FrameBuffer;
pub use throttle::FrameThrottle;
pub use wire::{PixelFormat, ServerInit};

/// Messages the write task may have queued before input is dropped.
pub const OUTBOUND_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Errors and options
// ---------------------------------------------------------------------------

/// An RFB connection failed or ended.
#[derive(Debug, thiserror::Error)]
pub enum RfbError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out during {step} after {after:?}")]
    Timeout { step: &'static str, after: Duration },
    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(String),
    #[error("server rejected connection: {0}")]
    SecurityRejected(String),
    #[error("no supported security type offered (server offered {0:?})")]
    UnsupportedSecurity(Vec<u8>),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),
    #[error("connection closed")]
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct RfbOptions {
    /// Bound on the TCP connect and on each handshake read/write.
    pub handshake_timeout: Duration,
    /// Minimum spacing between frames handed out by [`RfbClient::poll`].
    pub frame_interval: Duration,
}

impl Default for RfbOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            frame_interval: Duration::from_secs(1) / 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Pointer state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
    WheelUp,
    WheelDown,
}

impl MouseButton {
    pub fn mask(self) -> u8 {
        match self {
            MouseButton::Left => 1,
            MouseButton::Middle => 1 << 1,
            MouseButton::Right => 1 << 2,
            MouseButton::WheelUp => 1 << 3,
            MouseButton::WheelDown => 1 << 4,
        }
    }
}

/// Last pointer position and held buttons, so each event carries both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerState {
    pub x: u16,
    pub y: u16,
    pub buttons: u8,
}

impl PointerState {
    pub fn set_button(&mut self, button: MouseButton, pressed: bool) {
        if pressed {
            self.buttons |= button.mask();
        } else {
            self.buttons &= !button.mask();
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Shared {
    frame: Mutex<FrameBuffer>,
    generation: AtomicU64,
    connection: Mutex<StateMachine<ConnectionMachine>>,
}

impl Shared {
    fn connection(&self) -> std::sync::MutexGuard<'_, StateMachine<ConnectionMachine>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self, reason: impl Into<String>) {
        self.connection().handle(&ConnectionEvent::Closed(reason.into()));
    }
}

/// One connection to an RFB server. Single-shot: after it disconnects, drop
/// it and connect a new one.
pub struct RfbClient {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Vec<u8>>,
    pointer: Mutex<PointerState>,
    throttle: Mutex<FrameThrottle>,
    server: ServerInit,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RfbClient {
    /// Connect over TCP and complete the handshake.
    pub async fn connect<A>(addr: A, options: RfbOptions) -> Result<Self, RfbError>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let peer = addr.to_string();
        let stream = match tokio::time::timeout(options.handshake_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RfbError::Timeout {
                    step: "connect",
                    after: options.handshake_timeout,
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "could not set TCP_NODELAY");
        }
        Self::from_stream(stream, peer, options).await
    }

    /// Run the handshake over an already-connected stream and start the
    /// read and write tasks.
    pub async fn from_stream<S>(mut stream: S, peer: String, options: RfbOptions) -> Result<Self, RfbError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut connection = ConnectionMachine::new(peer.clone()).state_machine();
        connection.handle(&ConnectionEvent::Connected);

        let server = match wire::handshake(&mut stream, options.handshake_timeout).await {
            Ok(server) => server,
            Err(e) => {
                connection.handle(&ConnectionEvent::Closed(e.to_string()));
                warn!(peer = %peer, error = %e, "RFB handshake failed");
                return Err(e);
            }
        };
        connection.handle(&ConnectionEvent::HandshakeComplete);
        info!(
            peer = %peer,
            width = server.width,
            height = server.height,
            name = %server.name,
            version = ?server.version,
            "RFB handshake complete"
        );
        debug!(peer = %peer, format = ?server.pixel_format, "server pixel format");

        let setup = [
            wire::set_pixel_format(&PixelFormat::PREFERRED),
            wire::set_encodings(&wire::SUPPORTED_ENCODINGS),
            wire::framebuffer_update_request(true, 0, 0, server.width, server.height),
        ]
        .concat();
        if let Err(e) = write_bounded(&mut stream, &setup, options.handshake_timeout).await {
            connection.handle(&ConnectionEvent::Closed(e.to_string()));
            return Err(e);
        }
        connection.handle(&ConnectionEvent::StreamStarted);

        let shared = Arc::new(Shared {
            frame: Mutex::new(FrameBuffer::new(server.width, server.height)),
            generation: AtomicU64::new(0),
            connection: Mutex::new(connection),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_CAPACITY);
        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&shared),
            outbound.clone(),
            server.width,
            server.height,
        ));
        let writer = tokio::spawn(write_loop(write_half, outbound_rx, peer));

        Ok(Self {
            shared,
            outbound,
            pointer: Mutex::new(PointerState::default()),
            throttle: Mutex::new(FrameThrottle::new(options.frame_interval)),
            server,
            reader,
            writer,
        })
    }

    pub fn server(&self) -> &ServerInit {
        &self.server
    }

    pub fn width(&self) -> u16 {
        self.server.width
    }

    pub fn height(&self) -> u16 {
        self.server.height
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionMachine::public_state(self.shared.connection().state())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        ConnectionMachine::close_reason(self.shared.connection().state()).map(str::to_string)
    }

    /// Number of framebuffer updates decoded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Hand the current frame to `f` if one has been decoded since the last
    /// call and the frame interval has elapsed. Returns whether `f` ran.
    pub fn poll<F: FnOnce(&FrameBuffer)>(&self, f: F) -> bool {
        let generation = self.frames_decoded();
        let due = self
            .throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .should_emit(Instant::now(), generation);
        if !due {
            return false;
        }
        let frame = self.shared.frame.lock().unwrap_or_else(PoisonError::into_inner);
        f(&frame);
        true
    }

    /// Copy of the current frame, regardless of pacing.
    pub fn snapshot(&self) -> FrameBuffer {
        self.shared
            .frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // -----------------------------------------------------------------------
    // Input
    // -----------------------------------------------------------------------

    fn send(&self, msg: Vec<u8>) {
        match self.outbound.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => debug!("RFB outbound queue full, input dropped"),
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("RFB writer gone, input dropped"),
        }
    }

    /// Press or release the key with X11 keysym `keysym`.
    pub fn send_key(&self, keysym: u32, pressed: bool) {
        trace!(keysym, pressed, "key event");
        self.send(wire::key_event(pressed, keysym));
    }

    /// Move the pointer to `(x, y)` (clamped to the frame), keeping held buttons.
    pub fn send_pointer_move(&self, x: u16, y: u16) {
        let pointer = {
            let mut p = self.pointer.lock().unwrap_or_else(PoisonError::into_inner);
            p.x = x.min(self.server.width.saturating_sub(1));
            p.y = y.min(self.server.height.saturating_sub(1));
            *p
        };
        self.send(wire::pointer_event(pointer.buttons, pointer.x, pointer.y));
    }

    /// Press or release `button` at the current pointer position.
    pub fn send_pointer_button(&self, button: MouseButton, pressed: bool) {
        let pointer = {
            let mut p = self.pointer.lock().unwrap_or_else(PoisonError::into_inner);
            p.set_button(button, pressed);
            *p
        };
        self.send(wire::pointer_event(pointer.buttons, pointer.x, pointer.y));
    }

    /// One wheel notch: press and release of the wheel button.
    pub fn send_scroll(&self, up: bool) {
        let button = if up { MouseButton::WheelUp } else { MouseButton::WheelDown };
        self.send_pointer_button(button, true);
        self.send_pointer_button(button, false);
    }

    pub fn pointer(&self) -> PointerState {
        *self.pointer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the connection and stop both tasks.
    pub fn disconnect(&self) {
        self.reader.abort();
        self.writer.abort();
        self.shared.close("disconnected locally");
    }
}

impl Drop for RfbClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn write_bounded<W>(stream: &mut W, bytes: &[u8], limit: Duration) -> Result<(), RfbError>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(limit, stream.write_all(bytes)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RfbError::Timeout {
            step: "stream setup",
            after: limit,
        }),
    }
}

async fn read_loop<R>(
    mut reader: R,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Vec<u8>>,
    width: u16,
    height: u16,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let message = match wire::read_server_message(&mut reader).await {
            Ok(message) => message,
            Err(e) => break e,
        };

        match message {
            wire::ServerMessage::FramebufferUpdate { rects } => {
                if let Err(e) = apply_update(&mut reader, &shared, rects, width, height).await {
                    break e;
                }
                shared.generation.fetch_add(1, Ordering::Release);
                trace!(rects, "framebuffer update applied");

                let request = wire::framebuffer_update_request(false, 0, 0, width, height);
                if outbound.send(request).await.is_err() {
                    break RfbError::Disconnected;
                }
            }
            wire::ServerMessage::Bell => debug!("bell"),
            other => trace!(message = ?other, "ignored server message"),
        }
    };

    match &reason {
        RfbError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            info!("RFB server closed the connection")
        }
        e => warn!(error = %e, "RFB read loop ended"),
    }
    shared.close(reason.to_string());
}

/// Read `rects` rectangles, applying each before the next is read.
async fn apply_update<R>(reader: &mut R, shared: &Shared, rects: u16, width: u16, height: u16) -> Result<(), RfbError>
where
    R: AsyncRead + Unpin,
{
    for _ in 0..rects {
        let rect = wire::read_rectangle(reader, width, height).await?;
        shared
            .frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(&rect)
            .map_err(|e| RfbError::ProtocolDesync(e.to_string()))?;
    }
    Ok(())
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<Vec<u8>>, peer: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = outbound.recv().await {
        if let Err(e) = writer.write_all(&msg).await {
            warn!(peer = %peer, error = %e, "RFB write failed, dropping further input");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
