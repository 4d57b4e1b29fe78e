use anyhow::{Context, Result};
use clap::Parser;
use rtach::config::{Cli, DaemonConfig};
use rtach::session::Session;
use rtach::{mux, pty};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use tokio::net::UnixListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("rtach failed: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = DaemonConfig::load(&cli.socket);
    let scrollback_bytes = cli.scrollback_bytes.unwrap_or_else(|| config.scrollback_bytes());
    let idle_secs = cli.idle_secs.unwrap_or_else(|| config.idle_secs());

    let fifo_path = {
        let mut p = cli.socket.as_os_str().to_owned();
        p.push(".cmd");
        std::path::PathBuf::from(p)
    };
    let (fifo_file, cmd_fd) = pty::open_command_fifo(&fifo_path).context("open command fifo")?;

    let (pty_handle, pty_reader) = pty::Pty::spawn(cli.rows, cli.cols, &cli.command, cmd_fd)
        .context("spawn pty command")?;

    if cli.socket.exists() {
        warn!("removing stale socket at {}", cli.socket.display());
        std::fs::remove_file(&cli.socket).context("remove stale socket")?;
    }
    let listener = bind_socket(&cli.socket).context("bind listening socket")?;

    let session = Session::new(scrollback_bytes, cli.rows, cli.cols);

    info!(
        socket = %cli.socket.display(),
        rows = cli.rows,
        cols = cli.cols,
        scrollback_bytes,
        idle_secs,
        "rtach daemon starting"
    );

    mux::run(session, pty_handle, pty_reader, listener, fifo_file, idle_secs, cli.socket).await
}

fn bind_socket(path: &std::path::Path) -> Result<UnixListener> {
    let std_listener = StdUnixListener::bind(path).context("bind unix socket")?;
    std_listener.set_nonblocking(true).context("set socket nonblocking")?;

    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms).context("chmod socket 0600")?;

    UnixListener::from_std(std_listener).context("adopt std unix listener into tokio runtime")
}
