//! Wire protocol and compression codec for rtach.
//!
//! Client → server packet:
//! ```text
//! [1B type][1B length][length bytes payload]
//! ```
//! Max payload 255 bytes.
//!
//! Server → client frame:
//! ```text
//! [1B type][4B length LE][length bytes payload]
//! ```
//! The high bit (0x80) of the type byte marks `terminal_data` as
//! raw-DEFLATE compressed; the real type is `type & 0x7F`.
//!
//! All multibyte integers are little-endian.

pub mod codec;

use std::io::{self, IoSlice, Write};

/// 8-byte handshake payload: magic "RTCH", ver_major, ver_minor, flags.
pub const HANDSHAKE_MAGIC: u32 = 0x48435452; // "RTCH" little-endian
pub const PROTOCOL_VER_MAJOR: u8 = 2;
pub const PROTOCOL_VER_MINOR: u8 = 0;

const COMPRESSED_BIT: u8 = 0x80;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),
    #[error("unknown response type: 0x{0:02x}")]
    UnknownResponseType(u8),
    #[error("payload too large for client packet: {0} bytes (max 255)")]
    PacketPayloadTooLarge(usize),
    #[error("compression failed: {0}")]
    CompressionFailed(String),
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

// ── Client → server packets ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Push(Vec<u8>),
    Attach(Option<[u8; 16]>),
    Detach,
    Winch { rows: u16, cols: u16, xpixel: u16, ypixel: u16 },
    Redraw,
    RequestScrollback,
    RequestScrollbackPage { offset: u32, limit: u32 },
    Upgrade(Option<u8>),
    Pause,
    Resume,
    ClaimActive,
}

impl Packet {
    fn type_byte(&self) -> u8 {
        match self {
            Packet::Push(_) => 0,
            Packet::Attach(_) => 1,
            Packet::Detach => 2,
            Packet::Winch { .. } => 3,
            Packet::Redraw => 4,
            Packet::RequestScrollback => 5,
            Packet::RequestScrollbackPage { .. } => 6,
            Packet::Upgrade(_) => 7,
            Packet::Pause => 8,
            Packet::Resume => 9,
            Packet::ClaimActive => 10,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Packet::Push(data) => data.clone(),
            Packet::Attach(id) => id.map(|b| b.to_vec()).unwrap_or_default(),
            Packet::Detach => Vec::new(),
            Packet::Winch { rows, cols, xpixel, ypixel } => {
                let mut buf = Vec::with_capacity(8);
                buf.extend_from_slice(&rows.to_le_bytes());
                buf.extend_from_slice(&cols.to_le_bytes());
                buf.extend_from_slice(&xpixel.to_le_bytes());
                buf.extend_from_slice(&ypixel.to_le_bytes());
                buf
            }
            Packet::Redraw | Packet::RequestScrollback => Vec::new(),
            Packet::RequestScrollbackPage { offset, limit } => {
                let mut buf = Vec::with_capacity(8);
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&limit.to_le_bytes());
                buf
            }
            Packet::Upgrade(compression) => {
                compression.map(|c| vec![c]).unwrap_or_default()
            }
            Packet::Pause | Packet::Resume | Packet::ClaimActive => Vec::new(),
        }
    }

    /// Encode this packet into its client→server wire form. Used by tests
    /// and by any future in-process client harness.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let payload = self.payload();
        if payload.len() > 255 {
            return Err(WireError::PacketPayloadTooLarge(payload.len()));
        }
        let mut buf = Vec::with_capacity(2 + payload.len());
        buf.push(self.type_byte());
        buf.push(payload.len() as u8);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    fn parse(type_byte: u8, payload: &[u8]) -> Result<Self, WireError> {
        Ok(match type_byte {
            0 => Packet::Push(payload.to_vec()),
            1 => {
                if payload.is_empty() {
                    Packet::Attach(None)
                } else if payload.len() == 16 {
                    let mut id = [0u8; 16];
                    id.copy_from_slice(payload);
                    Packet::Attach(Some(id))
                } else {
                    Packet::Attach(None)
                }
            }
            2 => Packet::Detach,
            3 => {
                if payload.len() < 8 {
                    Packet::Winch { rows: 0, cols: 0, xpixel: 0, ypixel: 0 }
                } else {
                    Packet::Winch {
                        rows: u16::from_le_bytes([payload[0], payload[1]]),
                        cols: u16::from_le_bytes([payload[2], payload[3]]),
                        xpixel: u16::from_le_bytes([payload[4], payload[5]]),
                        ypixel: u16::from_le_bytes([payload[6], payload[7]]),
                    }
                }
            }
            4 => Packet::Redraw,
            5 => Packet::RequestScrollback,
            6 => {
                if payload.len() < 8 {
                    Packet::RequestScrollbackPage { offset: 0, limit: 0 }
                } else {
                    Packet::RequestScrollbackPage {
                        offset: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
                        limit: u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]),
                    }
                }
            }
            7 => Packet::Upgrade(payload.first().copied()),
            8 => Packet::Pause,
            9 => Packet::Resume,
            10 => Packet::ClaimActive,
            other => return Err(WireError::UnknownPacketType(other)),
        })
    }
}

/// Tiny per-client state machine: accumulates bytes and yields complete
/// packets. Payload length is a single byte, so a packet is at most
/// 2 + 255 = 257 bytes; partial packets accumulate across `feed` calls.
#[derive(Debug, Default)]
pub struct PacketReader {
    buf: Vec<u8>,
}

impl PacketReader {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed raw bytes read from the client socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Try to decode the next complete packet buffered so far. Returns
    /// `Ok(None)` if more bytes are needed. Call repeatedly after `feed`
    /// until it returns `None` — a single read can contain several packets.
    pub fn decode_next(&mut self) -> Result<Option<Packet>, WireError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let len = self.buf[1] as usize;
        let total = 2 + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let type_byte = self.buf[0];
        let payload = self.buf[2..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(Packet::parse(type_byte, &payload)?))
    }
}

// ── Server → client frames ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response<'a> {
    TerminalData(&'a [u8]),
    Scrollback(&'a [u8]),
    Command(&'a [u8]),
    ScrollbackPage { total_len: u32, offset: u32, data: &'a [u8] },
    Idle,
    Handshake { ver_major: u8, ver_minor: u8, flags: u16 },
}

impl<'a> Response<'a> {
    fn type_byte(&self) -> u8 {
        match self {
            Response::TerminalData(_) => 0,
            Response::Scrollback(_) => 1,
            Response::Command(_) => 2,
            Response::ScrollbackPage { .. } => 3,
            Response::Idle => 4,
            Response::Handshake { .. } => 255,
        }
    }

    /// Write this frame to `w` as a single vectored write: header iovec
    /// followed by the payload iovec(s). Guarantees the frame cannot be
    /// interleaved with another frame from the same writer at the kernel
    /// level. `compress` is only consulted for `TerminalData`.
    pub fn write_to<W: Write>(&self, w: &mut W, compress: bool) -> Result<(), WireError> {
        match self {
            Response::TerminalData(data) => {
                let compressed = if compress {
                    codec::compress_if_smaller(data)
                } else {
                    None
                };
                let (type_byte, payload): (u8, &[u8]) = match &compressed {
                    Some(c) => (self.type_byte() | COMPRESSED_BIT, c),
                    None => (self.type_byte(), data),
                };
                write_header_and_payload(w, type_byte, payload)
            }
            Response::Scrollback(data) | Response::Command(data) => {
                write_header_and_payload(w, self.type_byte(), data)
            }
            Response::ScrollbackPage { total_len, offset, data } => {
                let mut meta = [0u8; 8];
                meta[..4].copy_from_slice(&total_len.to_le_bytes());
                meta[4..].copy_from_slice(&offset.to_le_bytes());
                write_header_and_two_payloads(w, self.type_byte(), &meta, data)
            }
            Response::Idle => write_header_and_payload(w, self.type_byte(), &[]),
            Response::Handshake { ver_major, ver_minor, flags } => {
                let mut payload = [0u8; 8];
                payload[..4].copy_from_slice(&HANDSHAKE_MAGIC.to_le_bytes());
                payload[4] = *ver_major;
                payload[5] = *ver_minor;
                payload[6..].copy_from_slice(&flags.to_le_bytes());
                write_header_and_payload(w, self.type_byte(), &payload)
            }
        }
    }

}

fn write_header_and_payload<W: Write>(w: &mut W, type_byte: u8, payload: &[u8]) -> Result<(), WireError> {
    let mut header = [0u8; 5];
    header[0] = type_byte;
    header[1..].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    let slices = [IoSlice::new(&header), IoSlice::new(payload)];
    write_vectored_all(w, &slices)
}

fn write_header_and_two_payloads<W: Write>(
    w: &mut W,
    type_byte: u8,
    payload_a: &[u8],
    payload_b: &[u8],
) -> Result<(), WireError> {
    let total_len = (payload_a.len() + payload_b.len()) as u32;
    let mut header = [0u8; 5];
    header[0] = type_byte;
    header[1..].copy_from_slice(&total_len.to_le_bytes());
    let slices = [
        IoSlice::new(&header),
        IoSlice::new(payload_a),
        IoSlice::new(payload_b),
    ];
    write_vectored_all(w, &slices)
}

/// A plain `Write::write` loop that never interleaves: we build one
/// contiguous buffer from the iovecs and hand it to a single `write_all`,
/// so a frame's header and payload can never be torn apart by an
/// intervening write from elsewhere.
fn write_vectored_all<W: Write>(w: &mut W, slices: &[IoSlice<'_>]) -> Result<(), WireError> {
    let mut combined = Vec::with_capacity(slices.iter().map(|s| s.len()).sum());
    for s in slices {
        combined.extend_from_slice(s);
    }
    w.write_all(&combined)?;
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────
