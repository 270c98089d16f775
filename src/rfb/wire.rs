//! RFB 3.8 wire format: handshake, client messages, server messages.
//!
//! All multi-byte integers are big-endian. Layouts follow RFC 6143.
//!
//! ```text
//! server                              client
//!   "RFB 003.008\n"  ───────────────►
//!                    ◄───────────────  "RFB 003.008\n"
//!   n, [types; n]    ───────────────►
//!                    ◄───────────────  chosen type (1 = None)
//!   u32 result       ───────────────►
//!                    ◄───────────────  shared flag (1)
//!   ServerInit       ───────────────►
//! ```

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::RfbError;

pub const CLIENT_VERSION: &[u8; 12] = b"RFB 003.008\n";

pub const SECURITY_NONE: u8 = 1;

pub const ENCODING_RAW: i32 = 0;
pub const ENCODING_COPY_RECT: i32 = 1;
/// The only encodings this client decodes, in order of preference.
pub const SUPPORTED_ENCODINGS: [i32; 2] = [ENCODING_COPY_RECT, ENCODING_RAW];

// Client → server message types.
const SET_PIXEL_FORMAT: u8 = 0;
const SET_ENCODINGS: u8 = 2;
const FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
const KEY_EVENT: u8 = 4;
const POINTER_EVENT: u8 = 5;

// Server → client message types.
const FRAMEBUFFER_UPDATE: u8 = 0;
const SET_COLOUR_MAP_ENTRIES: u8 = 1;
const BELL: u8 = 2;
const SERVER_CUT_TEXT: u8 = 3;

/// Longest failure reason or desktop name accepted from a server.
const MAX_TEXT_LEN: u32 = 64 * 1024;

// ---------------------------------------------------------------------------
// Pixel format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// 32 bpp little-endian packed `0x00RRGGBB`: raw pixels arrive as
    /// (blue, green, red, unused).
    pub const PREFERRED: Self = Self {
        bits_per_pixel: 32,
        depth: 24,
        big_endian: false,
        true_colour: true,
        red_max: 255,
        green_max: 255,
        blue_max: 255,
        red_shift: 16,
        green_shift: 8,
        blue_shift: 0,
    };

    pub fn parse(b: &[u8; 16]) -> Self {
        Self {
            bits_per_pixel: b[0],
            depth: b[1],
            big_endian: b[2] != 0,
            true_colour: b[3] != 0,
            red_max: u16::from_be_bytes([b[4], b[5]]),
            green_max: u16::from_be_bytes([b[6], b[7]]),
            blue_max: u16::from_be_bytes([b[8], b[9]]),
            red_shift: b[10],
            green_shift: b[11],
            blue_shift: b[12],
        }
    }

    pub fn encode(&self) -> [u8; 16] {
        let [rh, rl] = self.red_max.to_be_bytes();
        let [gh, gl] = self.green_max.to_be_bytes();
        let [bh, bl] = self.blue_max.to_be_bytes();
        [
            self.bits_per_pixel,
            self.depth,
            u8::from(self.big_endian),
            u8::from(self.true_colour),
            rh,
            rl,
            gh,
            gl,
            bh,
            bl,
            self.red_shift,
            self.green_shift,
            self.blue_shift,
            0,
            0,
            0,
        ]
    }
}

/// Server parameters from the end of the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub version: (u16, u16),
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Parse a 12-byte `RFB xxx.yyy\n` version. Servers older than 3.7 use a
/// different security exchange and are rejected.
pub fn parse_version(raw: &[u8; 12]) -> Result<(u16, u16), RfbError> {
    let unsupported = || RfbError::UnsupportedVersion(String::from_utf8_lossy(raw).trim_end().to_string());
    if &raw[..4] != b"RFB " || raw[7] != b'.' || raw[11] != b'\n' {
        return Err(unsupported());
    }
    let number = |digits: &[u8]| -> Option<u16> { std::str::from_utf8(digits).ok()?.parse().ok() };
    let (Some(major), Some(minor)) = (number(&raw[4..7]), number(&raw[8..11])) else {
        return Err(unsupported());
    };
    if major < 3 || (major == 3 && minor < 7) {
        return Err(unsupported());
    }
    Ok((major, minor))
}

/// Bound one handshake step.
async fn step<T>(
    name: &'static str,
    limit: Duration,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, RfbError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(RfbError::from),
        Err(_) => Err(RfbError::Timeout {
            step: name,
            after: limit,
        }),
    }
}

/// Length-prefixed (u32) text such as a failure reason or desktop name.
async fn read_text<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<String> {
    let len = r.read_u32().await?;
    if len > MAX_TEXT_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("server text of {len} bytes exceeds {MAX_TEXT_LEN}"),
        ));
    }
    let mut buf = vec![0; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Run the client side of the handshake up to and including ServerInit.
///
/// Every read or write is bounded by `step_timeout`.
pub async fn handshake<S>(stream: &mut S, step_timeout: Duration) -> Result<ServerInit, RfbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut raw_version = [0u8; 12];
    step("version", step_timeout, stream.read_exact(&mut raw_version)).await?;
    let version = parse_version(&raw_version)?;
    step("version", step_timeout, stream.write_all(CLIENT_VERSION)).await?;

    let count = step("security", step_timeout, stream.read_u8()).await?;
    if count == 0 {
        let reason = step("security", step_timeout, read_text(stream)).await?;
        return Err(RfbError::SecurityRejected(reason));
    }
    let mut types = vec![0u8; usize::from(count)];
    step("security", step_timeout, stream.read_exact(&mut types)).await?;
    let chosen = if types.contains(&SECURITY_NONE) {
        SECURITY_NONE
    } else {
        types[0]
    };
    step("security", step_timeout, stream.write_all(&[chosen])).await?;
    if chosen != SECURITY_NONE {
        return Err(RfbError::UnsupportedSecurity(types));
    }

    let result = step("security result", step_timeout, stream.read_u32()).await?;
    if result != 0 {
        let reason = step("security result", step_timeout, read_text(stream)).await?;
        return Err(RfbError::AuthFailed(reason));
    }

    step("client init", step_timeout, stream.write_all(&[1])).await?;

    let width = step("server init", step_timeout, stream.read_u16()).await?;
    let height = step("server init", step_timeout, stream.read_u16()).await?;
    let mut format = [0u8; 16];
    step("server init", step_timeout, stream.read_exact(&mut format)).await?;
    let name = step("server init", step_timeout, read_text(stream)).await?;

    Ok(ServerInit {
        version,
        width,
        height,
        pixel_format: PixelFormat::parse(&format),
        name,
    })
}

// ---------------------------------------------------------------------------
// Client → server messages
// ---------------------------------------------------------------------------

pub fn set_pixel_format(format: &PixelFormat) -> Vec<u8> {
    let mut msg = vec![SET_PIXEL_FORMAT, 0, 0, 0];
    msg.extend_from_slice(&format.encode());
    msg
}

pub fn set_encodings(encodings: &[i32]) -> Vec<u8> {
    let mut msg = vec![SET_ENCODINGS, 0];
    msg.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
    for encoding in encodings {
        msg.extend_from_slice(&encoding.to_be_bytes());
    }
    msg
}

pub fn framebuffer_update_request(incremental: bool, x: u16, y: u16, w: u16, h: u16) -> Vec<u8> {
    let mut msg = vec![FRAMEBUFFER_UPDATE_REQUEST, u8::from(incremental)];
    for v in [x, y, w, h] {
        msg.extend_from_slice(&v.to_be_bytes());
    }
    msg
}

pub fn key_event(pressed: bool, keysym: u32) -> Vec<u8> {
    let mut msg = vec![KEY_EVENT, u8::from(pressed), 0, 0];
    msg.extend_from_slice(&keysym.to_be_bytes());
    msg
}

pub fn pointer_event(button_mask: u8, x: u16, y: u16) -> Vec<u8> {
    let mut msg = vec![POINTER_EVENT, button_mask];
    msg.extend_from_slice(&x.to_be_bytes());
    msg.extend_from_slice(&y.to_be_bytes());
    msg
}

// ---------------------------------------------------------------------------
// Server → client messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RectPayload {
    /// `width * height * 4` bytes of (blue, green, red, unused).
    Raw(Vec<u8>),
    CopyRect { src_x: u16, src_y: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rectangle {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub payload: RectPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Header only; the caller reads `rects` rectangles with
    /// [`read_rectangle`] so at most one payload is held at a time.
    FramebufferUpdate { rects: u16 },
    SetColourMapEntries { first: u16, count: u16 },
    Bell,
    ServerCutText { len: u32 },
}

fn within(x: u16, y: u16, w: u16, h: u16, frame_w: u16, frame_h: u16) -> bool {
    u32::from(x) + u32::from(w) <= u32::from(frame_w) && u32::from(y) + u32::from(h) <= u32::from(frame_h)
}

async fn discard<R: AsyncRead + Unpin>(r: &mut R, len: u64) -> io::Result<()> {
    let copied = tokio::io::copy(&mut r.take(len), &mut tokio::io::sink()).await?;
    if copied < len {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

/// Read one rectangle of a framebuffer update, checking it against the
/// `frame_w` x `frame_h` frame before its payload is read.
pub async fn read_rectangle<R: AsyncRead + Unpin>(
    r: &mut R,
    frame_w: u16,
    frame_h: u16,
) -> Result<Rectangle, RfbError> {
    let x = r.read_u16().await?;
    let y = r.read_u16().await?;
    let width = r.read_u16().await?;
    let height = r.read_u16().await?;
    let encoding = r.read_i32().await?;

    if !within(x, y, width, height, frame_w, frame_h) {
        return Err(RfbError::ProtocolDesync(format!(
            "rectangle {width}x{height}+{x}+{y} outside {frame_w}x{frame_h} frame"
        )));
    }

    let payload = match encoding {
        ENCODING_RAW => {
            let mut data = vec![0u8; usize::from(width) * usize::from(height) * 4];
            r.read_exact(&mut data).await?;
            RectPayload::Raw(data)
        }
        ENCODING_COPY_RECT => {
            let src_x = r.read_u16().await?;
            let src_y = r.read_u16().await?;
            if !within(src_x, src_y, width, height, frame_w, frame_h) {
                return Err(RfbError::ProtocolDesync(format!(
                    "copy source {width}x{height}+{src_x}+{src_y} outside {frame_w}x{frame_h} frame"
                )));
            }
            RectPayload::CopyRect { src_x, src_y }
        }
        other => {
            return Err(RfbError::ProtocolDesync(format!(
                "server sent unadvertised encoding {other}"
            )));
        }
    };

    Ok(Rectangle {
        x,
        y,
        width,
        height,
        payload,
    })
}

/// Read one server message. For a framebuffer update only the header is
/// consumed; everything else is read to its end.
pub async fn read_server_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<ServerMessage, RfbError> {
    match r.read_u8().await? {
        FRAMEBUFFER_UPDATE => {
            let _padding = r.read_u8().await?;
            let rects = r.read_u16().await?;
            Ok(ServerMessage::FramebufferUpdate { rects })
        }
        SET_COLOUR_MAP_ENTRIES => {
            let _padding = r.read_u8().await?;
            let first = r.read_u16().await?;
            let count = r.read_u16().await?;
            discard(r, u64::from(count) * 6).await?;
            Ok(ServerMessage::SetColourMapEntries { first, count })
        }
        BELL => Ok(ServerMessage::Bell),
        SERVER_CUT_TEXT => {
            let mut padding = [0u8; 3];
            r.read_exact(&mut padding).await?;
            let len = r.read_u32().await?;
            discard(r, u64::from(len)).await?;
            Ok(ServerMessage::ServerCutText { len })
        }
        other => Err(RfbError::ProtocolDesync(format!(
            "unknown server message type {other}"
        ))),
    }
}
