//! Client Session (C): per-connection protocol state, and Session: the
//! process-wide singleton tying scrollback, mode flags, and clients
//! together.
//!
//! This module is pure logic — no sockets, no PTY fd, no tokio. Every
//! method takes bytes in and returns an [`Action`] list describing what
//! the event loop (`mux`) must do (write to the PTY, send framed bytes to
//! a client, close a client, resize/signal the child). Keeping I/O out of
//! here makes the protocol state machine directly unit-testable.

use std::collections::HashMap;

use rtach_wire::{Packet, Response};

use crate::ring::Ring;
use crate::scanner;

pub type ClientHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Raw,
    Framed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionPref {
    None,
    Deflate,
}

/// Side effects the event loop must carry out after a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write a fully-framed response to one client's socket.
    Send { to: ClientHandle, frame: Vec<u8> },
    /// Close and forget a client (peer EOF, error, or duplicate-id eviction).
    Close { to: ClientHandle },
    /// Write raw bytes to the PTY master (looping on short writes is the
    /// event loop's job, not this module's).
    WritePty(Vec<u8>),
    /// Apply a new PTY window size.
    ResizePty { rows: u16, cols: u16, xpixel: u16, ypixel: u16 },
    /// Send SIGWINCH to the child's process group, if a child exists.
    SignalWinch,
}

#[derive(Debug, Clone)]
enum RawState {
    /// Buffering the first bytes of the stream until enough are in hand
    /// to decide whether this is the upgrade prefix or plain raw input.
    AwaitingDecision(Vec<u8>),
    /// Decision made: forward every subsequent byte to the PTY untouched.
    FullyRaw,
}

struct ClientState {
    phase: Phase,
    attached: bool,
    paused: bool,
    client_id: Option<[u8; 16]>,
    paused_since_offset: u64,
    compression: CompressionPref,
    reader: rtach_wire::PacketReader,
    raw_state: RawState,
}

impl ClientState {
    fn new() -> Self {
        Self {
            phase: Phase::Raw,
            attached: false,
            paused: false,
            client_id: None,
            paused_since_offset: 0,
            compression: CompressionPref::None,
            reader: rtach_wire::PacketReader::new(),
            raw_state: RawState::AwaitingDecision(Vec::new()),
        }
    }
}

/// Outcome of feeding bytes to a client still in the raw phase.
enum RawOutcome {
    /// Not enough bytes yet to decide; nothing to forward.
    StillRaw,
    /// Decided: these bytes (and all future ones) go straight to the PTY.
    Forward(Vec<u8>),
    /// The stream opened with an `upgrade` packet; the client is now
    /// framed, and `leftover` is whatever followed that packet in the
    /// same read, still needing to go through the packet parser.
    UpgradedTo { leftover: Vec<u8> },
}

/// The raw-to-framed prefix detector (design note: fused with the packet
/// parser, not a separate negotiation). An `upgrade` packet is exactly
/// `[0x07][len][len bytes payload]`, so detecting it is just: is the
/// first byte 0x07? If not, the client is plain raw-forwarding forever.
fn resolve_raw_phase(client: &mut ClientState, data: &[u8]) -> RawOutcome {
    let RawState::AwaitingDecision(buf) = &mut client.raw_state else {
        return RawOutcome::Forward(data.to_vec());
    };
    buf.extend_from_slice(data);
    if buf.is_empty() {
        return RawOutcome::StillRaw;
    }
    if buf[0] != 0x07 {
        let flushed = std::mem::take(buf);
        client.raw_state = RawState::FullyRaw;
        return RawOutcome::Forward(flushed);
    }
    if buf.len() < 2 {
        return RawOutcome::StillRaw;
    }
    let len = buf[1] as usize;
    let total = 2 + len;
    if buf.len() < total {
        return RawOutcome::StillRaw;
    }
    let payload = buf[2..total].to_vec();
    let leftover = buf[total..].to_vec();
    client.phase = Phase::Framed;
    client.compression = match payload.first() {
        Some(1) => CompressionPref::Deflate,
        _ => CompressionPref::None,
    };
    client.raw_state = RawState::FullyRaw;
    RawOutcome::UpgradedTo { leftover }
}

fn build_frame(resp: Response<'_>, compress: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    resp.write_to(&mut buf, compress).expect("writing a frame to a Vec is infallible");
    buf
}

fn ring_replay_actions(handle: ClientHandle, first: &[u8], second: &[u8], compress: bool) -> Vec<Action> {
    let mut actions = Vec::new();
    if !first.is_empty() {
        actions.push(Action::Send { to: handle, frame: build_frame(Response::TerminalData(first), compress) });
    }
    if !second.is_empty() {
        actions.push(Action::Send { to: handle, frame: build_frame(Response::TerminalData(second), compress) });
    }
    actions
}

/// How much of the tail of scrollback is replayed on attach, and how much
/// of the head is considered "old" for the legacy `request_scrollback`.
const ATTACH_REPLAY_BYTES: usize = 16 * 1024;

pub struct Session {
    ring: Ring,
    alt_screen: bool,
    cursor_visible: bool,
    winsize: (u16, u16, u16, u16),
    clients: HashMap<ClientHandle, ClientState>,
    next_handle: ClientHandle,
    active_client: Option<ClientHandle>,
    title: Option<Vec<u8>>,
}

impl Session {
    pub fn new(scrollback_bytes: usize, rows: u16, cols: u16) -> Self {
        Self {
            ring: Ring::new(scrollback_bytes),
            alt_screen: false,
            cursor_visible: true,
            winsize: (rows, cols, 0, 0),
            clients: HashMap::new(),
            next_handle: 0,
            active_client: None,
            title: None,
        }
    }

    pub fn title(&self) -> Option<&[u8]> {
        self.title.as_deref()
    }

    pub fn winsize(&self) -> (u16, u16, u16, u16) {
        self.winsize
    }

    pub fn active_client(&self) -> Option<ClientHandle> {
        self.active_client
    }

    /// Register a new accepted connection. Returns its handle and the
    /// handshake frame that must be written immediately.
    pub fn add_client(&mut self) -> (ClientHandle, Vec<u8>) {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.clients.insert(handle, ClientState::new());
        let frame = build_frame(
            Response::Handshake {
                ver_major: rtach_wire::PROTOCOL_VER_MAJOR,
                ver_minor: rtach_wire::PROTOCOL_VER_MINOR,
                flags: 0,
            },
            false,
        );
        (handle, frame)
    }

    pub fn remove_client(&mut self, handle: ClientHandle) {
        self.clients.remove(&handle);
        if self.active_client == Some(handle) {
            self.active_client = None;
        }
    }

    fn client_compress(&self, handle: ClientHandle) -> bool {
        matches!(self.clients.get(&handle).map(|c| c.compression), Some(CompressionPref::Deflate))
    }

    /// Bytes read from a client's socket. Dispatches raw forwarding or
    /// framed packet handling depending on phase, handling the in-band
    /// raw→framed transition transparently.
    pub fn on_client_bytes(&mut self, handle: ClientHandle, data: &[u8]) -> Vec<Action> {
        let leftover_for_framed = {
            let client = match self.clients.get_mut(&handle) {
                Some(c) => c,
                None => return Vec::new(),
            };
            if client.phase == Phase::Framed {
                None
            } else {
                match resolve_raw_phase(client, data) {
                    RawOutcome::StillRaw => return Vec::new(),
                    RawOutcome::Forward(bytes) => return vec![Action::WritePty(bytes)],
                    RawOutcome::UpgradedTo { leftover } => Some(leftover),
                }
            }
        };

        let mut actions = Vec::new();
        let mut packets = Vec::new();
        {
            let client = self.clients.get_mut(&handle).expect("checked above");
            let feed: &[u8] = leftover_for_framed.as_deref().unwrap_or(data);
            client.reader.feed(feed);
            loop {
                match client.reader.decode_next() {
                    Ok(Some(packet)) => packets.push(packet),
                    Ok(None) => break,
                    Err(_) => {
                        actions.push(Action::Close { to: handle });
                        return actions;
                    }
                }
            }
        }
        for packet in packets {
            actions.extend(self.handle_packet(handle, packet));
        }
        actions
    }

    fn handle_packet(&mut self, handle: ClientHandle, packet: Packet) -> Vec<Action> {
        match packet {
            Packet::Push(data) => vec![Action::WritePty(data)],
            Packet::Attach(client_id) => self.handle_attach(handle, client_id),
            Packet::Detach => {
                if let Some(c) = self.clients.get_mut(&handle) {
                    c.attached = false;
                }
                Vec::new()
            }
            Packet::Winch { rows, cols, xpixel, ypixel } => self.handle_winch(rows, cols, xpixel, ypixel),
            Packet::Redraw => self.handle_redraw(handle),
            Packet::RequestScrollback => self.handle_request_scrollback(handle),
            Packet::RequestScrollbackPage { offset, limit } => {
                self.handle_request_scrollback_page(handle, offset, limit)
            }
            Packet::Upgrade(compression) => {
                if let Some(c) = self.clients.get_mut(&handle) {
                    c.phase = Phase::Framed;
                    c.compression = match compression {
                        Some(1) => CompressionPref::Deflate,
                        _ => CompressionPref::None,
                    };
                }
                Vec::new()
            }
            Packet::Pause => {
                let total_written = self.ring.total_written();
                if let Some(c) = self.clients.get_mut(&handle) {
                    c.paused = true;
                    c.paused_since_offset = total_written;
                }
                Vec::new()
            }
            Packet::Resume => self.handle_resume(handle),
            Packet::ClaimActive => {
                self.active_client = Some(handle);
                Vec::new()
            }
        }
    }

    fn handle_attach(&mut self, handle: ClientHandle, client_id: Option<[u8; 16]>) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(id) = client_id {
            let duplicates: Vec<ClientHandle> = self
                .clients
                .iter()
                .filter(|(&h, c)| h != handle && c.client_id == Some(id))
                .map(|(&h, _)| h)
                .collect();
            for dup in duplicates {
                actions.push(Action::Close { to: dup });
                self.clients.remove(&dup);
            }
        }

        let client = match self.clients.get_mut(&handle) {
            Some(c) => c,
            None => return actions,
        };
        client.client_id = client_id;
        client.attached = true;
        let compress = matches!(client.compression, CompressionPref::Deflate);

        if self.alt_screen {
            let mut payload = b"\x1b[?1049h".to_vec();
            if !self.cursor_visible {
                payload.extend_from_slice(b"\x1b[?25l");
            }
            actions.push(Action::Send { to: handle, frame: build_frame(Response::TerminalData(&payload), compress) });
        } else {
            let total = self.ring.size();
            let start = total.saturating_sub(ATTACH_REPLAY_BYTES);
            let (first, second) = self.ring.slice_range(start, total - start);
            actions.extend(ring_replay_actions(handle, first, second, compress));
            if !self.cursor_visible {
                actions.push(Action::Send {
                    to: handle,
                    frame: build_frame(Response::TerminalData(b"\x1b[?25l"), compress),
                });
            }
        }
        actions
    }

    fn handle_winch(&mut self, rows: u16, cols: u16, xpixel: u16, ypixel: u16) -> Vec<Action> {
        let changed = self.winsize != (rows, cols, xpixel, ypixel);
        self.winsize = (rows, cols, xpixel, ypixel);
        let mut actions = vec![Action::ResizePty { rows, cols, xpixel, ypixel }];
        if changed {
            actions.push(Action::SignalWinch);
        }
        actions
    }

    fn handle_redraw(&mut self, handle: ClientHandle) -> Vec<Action> {
        let compress = self.client_compress(handle);
        let (first, second) = self.ring.slices();
        ring_replay_actions(handle, first, second, compress)
    }

    fn handle_request_scrollback(&mut self, handle: ClientHandle) -> Vec<Action> {
        let compress = self.client_compress(handle);
        if self.alt_screen {
            return vec![Action::Send { to: handle, frame: build_frame(Response::Scrollback(&[]), compress) }];
        }
        let total = self.ring.size();
        let old_len = total.saturating_sub(ATTACH_REPLAY_BYTES);
        let (first, second) = self.ring.slice_range(0, old_len);
        let mut data = Vec::with_capacity(first.len() + second.len());
        data.extend_from_slice(first);
        data.extend_from_slice(second);
        vec![Action::Send { to: handle, frame: build_frame(Response::Scrollback(&data), compress) }]
    }

    fn handle_request_scrollback_page(&mut self, handle: ClientHandle, offset: u32, limit: u32) -> Vec<Action> {
        let compress = self.client_compress(handle);
        if self.alt_screen {
            let frame = build_frame(Response::ScrollbackPage { total_len: 0, offset: 0, data: &[] }, compress);
            return vec![Action::Send { to: handle, frame }];
        }
        let total = self.ring.size();
        let start = (offset as usize).min(total);
        let n = (limit as usize).min(total - start);
        let (first, second) = self.ring.slice_range(start, n);
        let mut data = Vec::with_capacity(first.len() + second.len());
        data.extend_from_slice(first);
        data.extend_from_slice(second);
        let frame = build_frame(
            Response::ScrollbackPage { total_len: total as u32, offset: start as u32, data: &data },
            compress,
        );
        vec![Action::Send { to: handle, frame }]
    }

    fn handle_resume(&mut self, handle: ClientHandle) -> Vec<Action> {
        let (since, compress) = match self.clients.get_mut(&handle) {
            Some(c) => {
                let since = c.paused_since_offset;
                c.paused = false;
                (since, matches!(c.compression, CompressionPref::Deflate))
            }
            None => return Vec::new(),
        };
        let (first, second) = self.ring.read_since(since);
        let mut actions = ring_replay_actions(handle, first, second, compress);
        actions.push(Action::SignalWinch);
        actions
    }

    /// Bytes read from the PTY master. Updates mode/title state, appends
    /// to the ring, and fans the data out to every attached, unpaused
    /// client.
    pub fn on_pty_bytes(&mut self, data: &[u8]) -> Vec<Action> {
        let mode_changes = scanner::scan_modes(data);
        scanner::apply_mode_changes(&mode_changes, &mut self.alt_screen, &mut self.cursor_visible);
        if let Some(title) = scanner::scan_title(data) {
            self.title = Some(title);
        }
        self.ring.write(data);

        let targets: Vec<ClientHandle> = self
            .clients
            .iter()
            .filter(|(_, c)| c.attached && !c.paused)
            .map(|(&h, _)| h)
            .collect();
        targets
            .into_iter()
            .map(|handle| {
                let compress = self.client_compress(handle);
                Action::Send { to: handle, frame: build_frame(Response::TerminalData(data), compress) }
            })
            .collect()
    }

    /// Called by the idle timer on expiration: an `idle` frame for every
    /// attached, unpaused client.
    pub fn idle_frame_actions(&self) -> Vec<Action> {
        self.clients
            .iter()
            .filter(|(_, c)| c.attached && !c.paused)
            .map(|(&h, _)| Action::Send { to: h, frame: build_frame(Response::Idle, false) })
            .collect()
    }

    /// Called by the FIFO line reader: a `command` frame to every
    /// attached client, paused or not.
    pub fn command_frame_actions(&self, line: &[u8]) -> Vec<Action> {
        self.clients
            .iter()
            .filter(|(_, c)| c.attached)
            .map(|(&h, _)| Action::Send { to: h, frame: build_frame(Response::Command(line), false) })
            .collect()
    }
}
