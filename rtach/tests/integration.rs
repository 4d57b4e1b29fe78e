//! Black-box integration tests: drive the daemon over a real Unix socket
//! with a real PTY running `cat`, exercising the scenarios spec.md §8
//! names as testable properties end to end.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;

const HANDSHAKE_MAGIC: u32 = 0x48435452;

/// A decoded server→client frame, with the compression bit already
/// stripped out of `kind` and the payload already inflated if it was set.
struct Frame {
    kind: u8,
    payload: Vec<u8>,
}

async fn read_frame(stream: &mut UnixStream) -> Result<Frame> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await.context("read frame header")?;
    let raw_kind = header[0];
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await.context("read frame payload")?;
    }
    let compressed = raw_kind & 0x80 != 0;
    let kind = raw_kind & 0x7f;
    let payload = if compressed { rtach_wire::codec::decompress(&payload)? } else { payload };
    Ok(Frame { kind, payload })
}

async fn read_frame_skipping(stream: &mut UnixStream, skip_kind: u8) -> Result<Frame> {
    loop {
        let frame = read_frame(stream).await?;
        if frame.kind != skip_kind {
            return Ok(frame);
        }
    }
}

struct Daemon {
    socket_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
    task: tokio::task::JoinHandle<()>,
}

impl Daemon {
    async fn spawn(command: &[&str]) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("rtach.sock");
        let fifo_path = dir.path().join("rtach.sock.cmd");

        let (fifo_file, cmd_fd) = rtach::pty::open_command_fifo(&fifo_path)?;
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        let (pty, pty_reader) = rtach::pty::Pty::spawn(24, 80, &command, cmd_fd)?;

        let std_listener = std::os::unix::net::UnixListener::bind(&socket_path)?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        let session = rtach::session::Session::new(64 * 1024, 24, 80);
        let socket_path_for_task = socket_path.clone();
        let task = tokio::spawn(async move {
            let _ = rtach::mux::run(session, pty, pty_reader, listener, fifo_file, 3600, socket_path_for_task).await;
        });

        // Give the accept loop a moment to start listening.
        tokio::time::sleep(Duration::from_millis(50)).await;

        Ok(Self { socket_path, _dir: dir, task })
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path).await.context("connect to daemon socket")
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn upgrade_packet() -> Vec<u8> {
    rtach_wire::Packet::Upgrade(None).encode().unwrap()
}

fn attach_packet(id: Option<[u8; 16]>) -> Vec<u8> {
    rtach_wire::Packet::Attach(id).encode().unwrap()
}

fn push_packet(data: &[u8]) -> Vec<u8> {
    rtach_wire::Packet::Push(data.to_vec()).encode().unwrap()
}

#[tokio::test]
async fn handshake_matches_protocol_version() -> Result<()> {
    let daemon = Daemon::spawn(&["cat"]).await?;
    let mut client = daemon.connect().await?;
    client.write_all(&upgrade_packet()).await?;

    let frame = timeout(Duration::from_secs(2), read_frame(&mut client)).await??;
    assert_eq!(frame.kind, 255, "first frame after upgrade must be the handshake");
    assert_eq!(u32::from_le_bytes(frame.payload[0..4].try_into().unwrap()), HANDSHAKE_MAGIC);
    assert_eq!(frame.payload[4], rtach_wire::PROTOCOL_VER_MAJOR);
    assert_eq!(frame.payload[5], rtach_wire::PROTOCOL_VER_MINOR);
    Ok(())
}

#[tokio::test]
async fn attached_client_sees_its_own_pty_output() -> Result<()> {
    let daemon = Daemon::spawn(&["cat"]).await?;
    let mut client = daemon.connect().await?;
    client.write_all(&upgrade_packet()).await?;
    let _handshake = timeout(Duration::from_secs(2), read_frame(&mut client)).await??;

    client.write_all(&attach_packet(None)).await?;
    client.write_all(&push_packet(b"hello rtach\n")).await?;

    let frame = timeout(Duration::from_secs(2), read_frame_skipping(&mut client, 4)).await??;
    assert_eq!(frame.kind, 0, "expected a terminal_data frame");
    assert!(frame.payload.windows(b"hello rtach".len()).any(|w| w == b"hello rtach"));
    Ok(())
}

#[tokio::test]
async fn paginated_scrollback_reports_total_len_and_offset() -> Result<()> {
    let daemon = Daemon::spawn(&["cat"]).await?;
    let mut client = daemon.connect().await?;
    client.write_all(&upgrade_packet()).await?;
    let _handshake = timeout(Duration::from_secs(2), read_frame(&mut client)).await??;

    client.write_all(&attach_packet(None)).await?;
    client.write_all(&push_packet(b"0123456789\n")).await?;
    // Drain the echoed terminal_data frame before asking for a page.
    let _ = timeout(Duration::from_secs(2), read_frame_skipping(&mut client, 4)).await??;

    let page_packet = rtach_wire::Packet::RequestScrollbackPage { offset: 0, limit: 4 }.encode()?;
    client.write_all(&page_packet).await?;

    let frame = timeout(Duration::from_secs(2), read_frame_skipping(&mut client, 4)).await??;
    assert_eq!(frame.kind, 3, "expected a scrollback_page frame");
    let total_len = u32::from_le_bytes(frame.payload[0..4].try_into().unwrap());
    let offset = u32::from_le_bytes(frame.payload[4..8].try_into().unwrap());
    assert_eq!(offset, 0);
    assert!(total_len >= 11);
    assert_eq!(frame.payload[8..].len(), 4);
    Ok(())
}

#[tokio::test]
async fn duplicate_client_id_evicts_previous_holder() -> Result<()> {
    let daemon = Daemon::spawn(&["cat"]).await?;

    let id = [7u8; 16];
    let mut first = daemon.connect().await?;
    first.write_all(&upgrade_packet()).await?;
    let _ = timeout(Duration::from_secs(2), read_frame(&mut first)).await??;
    first.write_all(&attach_packet(Some(id))).await?;

    let mut second = daemon.connect().await?;
    second.write_all(&upgrade_packet()).await?;
    let _ = timeout(Duration::from_secs(2), read_frame(&mut second)).await??;
    second.write_all(&attach_packet(Some(id))).await?;

    // The first connection should observe EOF (its socket was closed).
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), first.read(&mut buf)).await??;
    assert_eq!(n, 0, "evicted client's socket should be closed");
    Ok(())
}

#[tokio::test]
async fn pause_then_resume_flushes_buffered_output() -> Result<()> {
    let daemon = Daemon::spawn(&["cat"]).await?;
    let mut client = daemon.connect().await?;
    client.write_all(&upgrade_packet()).await?;
    let _ = timeout(Duration::from_secs(2), read_frame(&mut client)).await??;
    client.write_all(&attach_packet(None)).await?;

    let pause_packet = rtach_wire::Packet::Pause.encode()?;
    client.write_all(&pause_packet).await?;
    client.write_all(&push_packet(b"buffered while paused\n")).await?;

    // While paused the client must not receive terminal_data frames; give
    // the daemon a moment to process the push before resuming.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let resume_packet = rtach_wire::Packet::Resume.encode()?;
    client.write_all(&resume_packet).await?;

    let frame = timeout(Duration::from_secs(2), read_frame_skipping(&mut client, 4)).await??;
    assert_eq!(frame.kind, 0);
    assert!(frame.payload.windows(b"buffered while paused".len()).any(|w| w == b"buffered while paused"));
    Ok(())
}
