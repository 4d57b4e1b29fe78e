//! Multiplexer / Event Loop (X): owns the PTY, the listening socket, the
//! command FIFO, and every client connection; dispatches events to the
//! [`Session`] and carries out the [`Action`]s it returns.
//!
//! Implemented as a single-consumer actor: independent tokio tasks (the
//! PTY's blocking reader, the accept loop, one reader task per client,
//! the FIFO line reader) all feed one `mpsc` channel drained by a single
//! task that owns `Session` and `Pty`. Nothing in the core is ever
//! touched from two tasks at once, so there is no lock to take.

use std::collections::HashMap;
use std::io::{BufRead, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::pty::{self, Pty};
use crate::session::{Action, ClientHandle, Session};

enum Event {
    PtyData(Vec<u8>),
    PtyClosed,
    Accepted { writer: mpsc::UnboundedSender<Vec<u8>>, reply: oneshot::Sender<ClientHandle> },
    ClientData { handle: ClientHandle, data: Vec<u8> },
    ClientClosed { handle: ClientHandle },
    FifoLine(Vec<u8>),
}

/// Run the event loop until PTY EOF or a fatal loop error. Performs
/// best-effort shutdown (signal the child, unlink socket + FIFO) before
/// returning.
pub async fn run(
    mut session: Session,
    mut pty: Pty,
    pty_reader: Box<dyn Read + Send>,
    listener: UnixListener,
    fifo_file: std::fs::File,
    idle_secs: u64,
    socket_path: PathBuf,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let mut client_writers: HashMap<ClientHandle, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();

    spawn_pty_reader(pty_reader, tx.clone());
    spawn_accept_loop(listener, tx.clone());
    spawn_fifo_reader(fifo_file, tx.clone());

    let idle_duration = Duration::from_secs(idle_secs.max(1));
    let mut idle_deadline = tokio::time::Instant::now() + idle_duration;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    Event::PtyData(data) => {
                        idle_deadline = tokio::time::Instant::now() + idle_duration;
                        let actions = session.on_pty_bytes(&data);
                        apply_actions(&mut session, &mut pty, &mut client_writers, actions);
                    }
                    Event::PtyClosed => {
                        info!("pty closed, shutting down");
                        break;
                    }
                    Event::Accepted { writer, reply } => {
                        let (handle, handshake) = session.add_client();
                        let _ = writer.send(handshake);
                        client_writers.insert(handle, writer);
                        let _ = reply.send(handle);
                    }
                    Event::ClientData { handle, data } => {
                        let actions = session.on_client_bytes(handle, &data);
                        apply_actions(&mut session, &mut pty, &mut client_writers, actions);
                    }
                    Event::ClientClosed { handle } => {
                        session.remove_client(handle);
                        client_writers.remove(&handle);
                    }
                    Event::FifoLine(line) => {
                        let actions = session.command_frame_actions(&line);
                        apply_actions(&mut session, &mut pty, &mut client_writers, actions);
                    }
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                idle_deadline = tokio::time::Instant::now() + idle_duration;
                let actions = session.idle_frame_actions();
                apply_actions(&mut session, &mut pty, &mut client_writers, actions);
                if let Some(title) = session.title() {
                    if let Err(e) = crate::idle::persist_title(&socket_path, title) {
                        warn!("failed to persist title: {e}");
                    }
                }
            }
        }
    }

    shutdown(&mut pty, &socket_path);
    Ok(())
}

fn apply_actions(
    session: &mut Session,
    pty: &mut Pty,
    client_writers: &mut HashMap<ClientHandle, mpsc::UnboundedSender<Vec<u8>>>,
    actions: Vec<Action>,
) {
    for action in actions {
        match action {
            Action::Send { to, frame } => {
                let dead = match client_writers.get(&to) {
                    Some(tx) => tx.send(frame).is_err(),
                    None => false,
                };
                if dead {
                    client_writers.remove(&to);
                    session.remove_client(to);
                }
            }
            Action::Close { to } => {
                // Dropping the sender closes the writer task's channel,
                // which drains and exits, closing the socket.
                client_writers.remove(&to);
                session.remove_client(to);
            }
            Action::WritePty(data) => {
                if let Err(e) = pty.write_all(&data) {
                    warn!("pty write error: {e}");
                }
            }
            Action::ResizePty { rows, cols, xpixel, ypixel } => {
                if let Err(e) = pty.resize(rows, cols, xpixel, ypixel) {
                    warn!("pty resize error: {e}");
                }
            }
            Action::SignalWinch => {
                if let Some(pid) = pty.process_id() {
                    pty::signal_process_group(pid, libc::SIGWINCH);
                }
            }
        }
    }
}

fn spawn_pty_reader(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<Event>) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.send(Event::PtyClosed);
                    break;
                }
                Ok(n) => {
                    if tx.send(Event::PtyData(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("pty read error: {e}");
                    let _ = tx.send(Event::PtyClosed);
                    break;
                }
            }
        }
    });
}

fn spawn_accept_loop(listener: UnixListener, tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        loop {
            let (stream, _addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    break;
                }
            };
            let (read_half, write_half) = stream.into_split();
            let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            tokio::spawn(client_writer_task(write_half, writer_rx));

            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(Event::Accepted { writer: writer_tx, reply: reply_tx }).is_err() {
                break;
            }
            let main_tx = tx.clone();
            tokio::spawn(async move {
                let Ok(handle) = reply_rx.await else { return };
                client_reader_task(handle, read_half, main_tx).await;
            });
        }
    });
}

async fn client_writer_task(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            return;
        }
    }
    // The actor dropped our sender (Close action, or the client was
    // evicted) — shut down our write direction so the peer's next read
    // observes EOF instead of hanging forever.
    let _ = write_half.shutdown().await;
}

async fn client_reader_task(handle: ClientHandle, mut read_half: OwnedReadHalf, tx: mpsc::UnboundedSender<Event>) {
    let mut buf = [0u8; 4096];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Event::ClientData { handle, data: buf[..n].to_vec() }).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = tx.send(Event::ClientClosed { handle });
}

fn spawn_fifo_reader(file: std::fs::File, tx: mpsc::UnboundedSender<Event>) {
    tokio::task::spawn_blocking(move || {
        let mut reader = std::io::BufReader::new(file);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if tx.send(Event::FifoLine(trimmed.as_bytes().to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("command fifo read error: {e}");
                    break;
                }
            }
        }
    });
}

fn shutdown(pty: &mut Pty, socket_path: &Path) {
    if let Some(pid) = pty.process_id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    let _ = std::fs::remove_file(socket_path);
    let mut fifo_path = socket_path.as_os_str().to_owned();
    fifo_path.push(".cmd");
    let _ = std::fs::remove_file(fifo_path);
}
