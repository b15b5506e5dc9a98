//! RFB wire messages used by the update pipeline.
//!
//! Covers the framing around encoded rects (FramebufferUpdate, rect
//! headers, LastRect), the Fence extension used for congestion pings,
//! and the client messages a server needs to drive updates.
//!
//! ```text
//! FramebufferUpdate   u8 type=0 | u8 pad | u16 nRects
//! rect header         u16 x | u16 y | u16 w | u16 h | s32 encoding
//! Fence               u8 type=248 | 3 pad | u32 flags | u8 len | payload
//! ```
//!
//! Every reader here is incremental: it sets a restore point on the
//! [`InStream`] and returns `Ok(None)` / `Ok(false)` with the stream
//! rewound when a message is not complete yet.

use std::fmt;

use bitflags::bitflags;
use tracing::{trace, warn};

use crate::error::RfbError;
use crate::geometry::Rect;
use crate::pixel::PixelFormat;
use crate::stream::{ByteSource, InStream, OutStream};

/// Encoding numbers.
pub mod encoding {
    pub const RAW: i32 = 0;
    pub const COPY_RECT: i32 = 1;
    pub const RRE: i32 = 2;
    pub const HEXTILE: i32 = 5;
    pub const TIGHT: i32 = 7;
    pub const ZRLE: i32 = 16;

    // Pseudo-encodings
    pub const QUALITY_LEVEL_0: i32 = -32;
    pub const QUALITY_LEVEL_9: i32 = -23;
    pub const DESKTOP_SIZE: i32 = -223;
    pub const LAST_RECT: i32 = -224;
    pub const CURSOR: i32 = -239;
    pub const COMPRESS_LEVEL_0: i32 = -256;
    pub const COMPRESS_LEVEL_9: i32 = -247;
    pub const FENCE: i32 = -312;
    pub const CONTINUOUS_UPDATES: i32 = -313;

    /// Human-readable name for logs.
    pub fn name(enc: i32) -> &'static str {
        match enc {
            RAW => "Raw",
            COPY_RECT => "CopyRect",
            RRE => "RRE",
            HEXTILE => "Hextile",
            TIGHT => "Tight",
            ZRLE => "ZRLE",
            LAST_RECT => "LastRect",
            DESKTOP_SIZE => "DesktopSize",
            FENCE => "Fence",
            _ => "Unknown",
        }
    }
}

/// Longest Fence payload the protocol allows.
pub const MAX_FENCE_PAYLOAD: usize = 64;

bitflags! {
    /// Fence message flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FenceFlags: u32 {
        const BLOCK_BEFORE = 1 << 0;
        const BLOCK_AFTER  = 1 << 1;
        const SYNC_NEXT    = 1 << 2;
        const REQUEST      = 1 << 31;
    }
}

// ── Message types ────────────────────────────────────────────────

/// Server → client message types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMsgType {
    FramebufferUpdate = 0,
    SetColourMapEntries = 1,
    Bell = 2,
    ServerCutText = 3,
    Fence = 248,
}

impl TryFrom<u8> for ServerMsgType {
    type Error = RfbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ServerMsgType::FramebufferUpdate),
            1 => Ok(ServerMsgType::SetColourMapEntries),
            2 => Ok(ServerMsgType::Bell),
            3 => Ok(ServerMsgType::ServerCutText),
            248 => Ok(ServerMsgType::Fence),
            _ => Err(RfbError::UnknownMessage(value)),
        }
    }
}

/// Client → server message types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientMsgType {
    SetPixelFormat = 0,
    SetEncodings = 2,
    FramebufferUpdateRequest = 3,
    KeyEvent = 4,
    PointerEvent = 5,
    ClientCutText = 6,
    Fence = 248,
}

impl TryFrom<u8> for ClientMsgType {
    type Error = RfbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ClientMsgType::SetPixelFormat),
            2 => Ok(ClientMsgType::SetEncodings),
            3 => Ok(ClientMsgType::FramebufferUpdateRequest),
            4 => Ok(ClientMsgType::KeyEvent),
            5 => Ok(ClientMsgType::PointerEvent),
            6 => Ok(ClientMsgType::ClientCutText),
            248 => Ok(ClientMsgType::Fence),
            _ => Err(RfbError::UnknownMessage(value)),
        }
    }
}

impl fmt::Display for ClientMsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Writers ──────────────────────────────────────────────────────

/// FramebufferUpdate header. `0xFFFF` rects means "until LastRect".
pub fn write_framebuffer_update_start(os: &mut OutStream, n_rects: u16) {
    os.write_u8(ServerMsgType::FramebufferUpdate as u8);
    os.pad(1);
    os.write_u16(n_rects);
}

pub fn write_rect_header(os: &mut OutStream, r: &Rect, enc: i32) {
    os.write_u16(r.tl.x as u16);
    os.write_u16(r.tl.y as u16);
    os.write_u16(r.width() as u16);
    os.write_u16(r.height() as u16);
    os.write_s32(enc);
}

pub fn write_copy_rect(os: &mut OutStream, r: &Rect, src_x: i32, src_y: i32) {
    write_rect_header(os, r, encoding::COPY_RECT);
    os.write_u16(src_x as u16);
    os.write_u16(src_y as u16);
}

/// Terminates a FramebufferUpdate started with `0xFFFF` rects.
pub fn write_last_rect(os: &mut OutStream) {
    write_rect_header(os, &Rect::default(), encoding::LAST_RECT);
}

/// Fence in either direction; payloads over 64 bytes are truncated.
pub fn write_fence(os: &mut OutStream, flags: FenceFlags, payload: &[u8]) {
    let payload = if payload.len() > MAX_FENCE_PAYLOAD {
        warn!(len = payload.len(), "fence payload too long, truncating");
        &payload[..MAX_FENCE_PAYLOAD]
    } else {
        payload
    };
    os.write_u8(ServerMsgType::Fence as u8);
    os.pad(3);
    os.write_u32(flags.bits());
    os.write_u8(payload.len() as u8);
    os.write_bytes(payload);
}

pub fn write_set_pixel_format(os: &mut OutStream, pf: &PixelFormat) {
    os.write_u8(ClientMsgType::SetPixelFormat as u8);
    os.pad(3);
    pf.write(os);
}

pub fn write_set_encodings(os: &mut OutStream, encodings: &[i32]) {
    os.write_u8(ClientMsgType::SetEncodings as u8);
    os.pad(1);
    os.write_u16(encodings.len() as u16);
    for &e in encodings {
        os.write_s32(e);
    }
}

pub fn write_framebuffer_update_request(os: &mut OutStream, r: &Rect, incremental: bool) {
    os.write_u8(ClientMsgType::FramebufferUpdateRequest as u8);
    os.write_u8(incremental as u8);
    os.write_u16(r.tl.x as u16);
    os.write_u16(r.tl.y as u16);
    os.write_u16(r.width() as u16);
    os.write_u16(r.height() as u16);
}

/// Body of a Fence after the type byte, or `None` if incomplete.
fn read_fence_body(is: &mut InStream) -> Result<Option<(FenceFlags, Vec<u8>)>, RfbError> {
    if !is.has_data_or_restore(3 + 4 + 1) {
        return Ok(None);
    }
    is.skip(3)?;
    let flags = FenceFlags::from_bits_retain(is.read_u32()?);
    let len = is.read_u8()? as usize;
    if !is.has_data_or_restore(len) {
        return Ok(None);
    }
    if len > MAX_FENCE_PAYLOAD {
        return Err(RfbError::ProtocolViolation("fence payload too long"));
    }
    let payload = is.take(len)?.to_vec();
    Ok(Some((flags, payload)))
}

// ── Client messages (server side) ────────────────────────────────

/// A complete message from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SetPixelFormat(PixelFormat),
    SetEncodings(Vec<i32>),
    UpdateRequest { incremental: bool, rect: Rect },
    KeyEvent { down: bool, key: u32 },
    PointerEvent { mask: u8, x: u16, y: u16 },
    CutText(Vec<u8>),
    Fence { flags: FenceFlags, payload: Vec<u8> },
}

/// Read one client message, or `None` if it has not fully arrived.
pub fn read_client_message(is: &mut InStream) -> Result<Option<ClientMessage>, RfbError> {
    is.set_restore_point();
    let msg = read_client_message_inner(is);
    match msg {
        Ok(Some(_)) => is.clear_restore_point(),
        Ok(None) => {}
        Err(_) => is.clear_restore_point(),
    }
    msg
}

fn read_client_message_inner(is: &mut InStream) -> Result<Option<ClientMessage>, RfbError> {
    if !is.has_data_or_restore(1) {
        return Ok(None);
    }
    let msg_type = ClientMsgType::try_from(is.read_u8()?)?;
    let msg = match msg_type {
        ClientMsgType::SetPixelFormat => {
            if !is.has_data_or_restore(3 + 16) {
                return Ok(None);
            }
            is.skip(3)?;
            ClientMessage::SetPixelFormat(PixelFormat::read(is)?)
        }
        ClientMsgType::SetEncodings => {
            if !is.has_data_or_restore(3) {
                return Ok(None);
            }
            is.skip(1)?;
            let n = is.read_u16()? as usize;
            if !is.has_data_or_restore(n * 4) {
                return Ok(None);
            }
            let mut encs = Vec::with_capacity(n);
            for _ in 0..n {
                encs.push(is.read_s32()?);
            }
            ClientMessage::SetEncodings(encs)
        }
        ClientMsgType::FramebufferUpdateRequest => {
            if !is.has_data_or_restore(9) {
                return Ok(None);
            }
            let incremental = is.read_u8()? != 0;
            let x = is.read_u16()? as i32;
            let y = is.read_u16()? as i32;
            let w = is.read_u16()? as i32;
            let h = is.read_u16()? as i32;
            ClientMessage::UpdateRequest {
                incremental,
                rect: Rect::from_xywh(x, y, w, h),
            }
        }
        ClientMsgType::KeyEvent => {
            if !is.has_data_or_restore(7) {
                return Ok(None);
            }
            let down = is.read_u8()? != 0;
            is.skip(2)?;
            ClientMessage::KeyEvent {
                down,
                key: is.read_u32()?,
            }
        }
        ClientMsgType::PointerEvent => {
            if !is.has_data_or_restore(5) {
                return Ok(None);
            }
            ClientMessage::PointerEvent {
                mask: is.read_u8()?,
                x: is.read_u16()?,
                y: is.read_u16()?,
            }
        }
        ClientMsgType::ClientCutText => {
            if !is.has_data_or_restore(7) {
                return Ok(None);
            }
            is.skip(3)?;
            let len = is.read_u32()? as usize;
            if !is.has_data_or_restore(len) {
                return Ok(None);
            }
            ClientMessage::CutText(is.take(len)?.to_vec())
        }
        ClientMsgType::Fence => match read_fence_body(is)? {
            Some((flags, payload)) => ClientMessage::Fence { flags, payload },
            None => return Ok(None),
        },
    };
    trace!(?msg_type, "client message");
    Ok(Some(msg))
}

// ── Server messages (client side) ────────────────────────────────

/// Callbacks for [`MsgReader`].
pub trait MsgHandler {
    fn framebuffer_update_start(&mut self) -> Result<(), RfbError> {
        Ok(())
    }

    fn framebuffer_update_end(&mut self) -> Result<(), RfbError> {
        Ok(())
    }

    /// Consume the body of one rect from `is`.
    ///
    /// Returns `Ok(false)` with `is` rewound if the body is incomplete;
    /// the reader calls again with the same rect once more data arrived.
    fn data_rect(&mut self, rect: &Rect, encoding: i32, is: &mut InStream)
    -> Result<bool, RfbError>;

    fn fence(&mut self, flags: FenceFlags, payload: &[u8]) -> Result<(), RfbError>;

    fn bell(&mut self) {}

    fn server_cut_text(&mut self, _text: &[u8]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Idle,
    /// Inside a FramebufferUpdate; `None` means until LastRect.
    Update { remaining: Option<u16> },
    /// Header read, body pending.
    Rect {
        rect: Rect,
        encoding: i32,
        remaining: Option<u16>,
    },
}

/// Incremental reader for the server → client stream.
#[derive(Debug)]
pub struct MsgReader {
    state: ReaderState,
}

impl Default for MsgReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgReader {
    pub fn new() -> Self {
        Self {
            state: ReaderState::Idle,
        }
    }

    /// Whether the reader is between messages.
    pub fn is_idle(&self) -> bool {
        self.state == ReaderState::Idle
    }

    /// Process at most one message step. Returns `Ok(false)` when more
    /// data is needed.
    pub fn read_msg(
        &mut self,
        is: &mut InStream,
        handler: &mut dyn MsgHandler,
    ) -> Result<bool, RfbError> {
        match self.state {
            ReaderState::Idle => self.read_msg_start(is, handler),
            ReaderState::Update { remaining } => self.read_rect_header(is, handler, remaining),
            ReaderState::Rect {
                rect,
                encoding,
                remaining,
            } => {
                if !handler.data_rect(&rect, encoding, is)? {
                    return Ok(false);
                }
                let remaining = remaining.map(|n| n - 1);
                self.state = ReaderState::Update { remaining };
                Ok(true)
            }
        }
    }

    fn read_msg_start(
        &mut self,
        is: &mut InStream,
        handler: &mut dyn MsgHandler,
    ) -> Result<bool, RfbError> {
        is.set_restore_point();
        if !is.has_data_or_restore(1) {
            return Ok(false);
        }
        let msg_type = ServerMsgType::try_from(is.read_u8()?)?;
        match msg_type {
            ServerMsgType::FramebufferUpdate => {
                if !is.has_data_or_restore(3) {
                    return Ok(false);
                }
                is.skip(1)?;
                let n = is.read_u16()?;
                is.clear_restore_point();
                handler.framebuffer_update_start()?;
                self.state = ReaderState::Update {
                    remaining: (n != 0xFFFF).then_some(n),
                };
            }
            ServerMsgType::Bell => {
                is.clear_restore_point();
                handler.bell();
            }
            ServerMsgType::ServerCutText => {
                if !is.has_data_or_restore(7) {
                    return Ok(false);
                }
                is.skip(3)?;
                let len = is.read_u32()? as usize;
                if !is.has_data_or_restore(len) {
                    return Ok(false);
                }
                let text = is.take(len)?.to_vec();
                is.clear_restore_point();
                handler.server_cut_text(&text);
            }
            ServerMsgType::SetColourMapEntries => {
                if !is.has_data_or_restore(5) {
                    return Ok(false);
                }
                is.skip(3)?;
                let n = is.read_u16()? as usize;
                if !is.has_data_or_restore(n * 6) {
                    return Ok(false);
                }
                // colour maps are never used, skip the entries
                is.skip(n * 6)?;
                is.clear_restore_point();
            }
            ServerMsgType::Fence => {
                let Some((flags, payload)) = read_fence_body(is)? else {
                    return Ok(false);
                };
                is.clear_restore_point();
                handler.fence(flags, &payload)?;
            }
        }
        Ok(true)
    }

    fn read_rect_header(
        &mut self,
        is: &mut InStream,
        handler: &mut dyn MsgHandler,
        remaining: Option<u16>,
    ) -> Result<bool, RfbError> {
        if remaining == Some(0) {
            self.state = ReaderState::Idle;
            handler.framebuffer_update_end()?;
            return Ok(true);
        }

        is.set_restore_point();
        if !is.has_data_or_restore(12) {
            return Ok(false);
        }
        let x = is.read_u16()? as i32;
        let y = is.read_u16()? as i32;
        let w = is.read_u16()? as i32;
        let h = is.read_u16()? as i32;
        let enc = is.read_s32()?;
        is.clear_restore_point();

        if enc == encoding::LAST_RECT {
            self.state = ReaderState::Idle;
            handler.framebuffer_update_end()?;
            return Ok(true);
        }

        self.state = ReaderState::Rect {
            rect: Rect::from_xywh(x, y, w, h),
            encoding: enc,
            remaining,
        };
        Ok(true)
    }
}

// ── Tests ────────────────────────────────────────────────────────
