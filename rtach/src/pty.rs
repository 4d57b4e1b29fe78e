//! PTY ownership and the command FIFO the child's `RTACH_CMD_FD` points at.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, ExitStatus, MasterPty, PtySize};

pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl Pty {
    /// Allocate a PTY sized `rows`x`cols` and spawn `command` on its slave,
    /// with `RTACH_CMD_FD` set to the writable end of the command FIFO.
    /// Returns the `Pty` handle plus the master's reader, kept separate so
    /// the caller can drive it from a dedicated blocking-read task.
    pub fn spawn(rows: u16, cols: u16, command: &[String], cmd_fd: RawFd) -> Result<(Self, Box<dyn Read + Send>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .context("openpty")?;

        let (prog, args) = command.split_first().context("command must not be empty")?;
        let mut cmd = CommandBuilder::new(prog);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");
        cmd.env("RTACH_CMD_FD", cmd_fd.to_string());

        let child = pair.slave.spawn_command(cmd).context("spawn command on pty slave")?;
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().context("clone pty reader")?;
        let writer = pair.master.take_writer().context("take pty writer")?;

        Ok((Self { master: pair.master, writer, child }, reader))
    }

    pub fn resize(&self, rows: u16, cols: u16, pixel_width: u16, pixel_height: u16) -> Result<()> {
        self.master
            .resize(PtySize { rows, cols, pixel_width, pixel_height })
            .context("resize pty")
    }

    /// Loop until every byte is accepted. A short write here would
    /// silently truncate a large paste.
    pub fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        write_all_retrying(&mut self.writer, data)
    }

    pub fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    pub fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill()
    }
}

fn write_all_retrying<W: Write>(writer: &mut W, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        let n = writer.write(data)?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "write returned 0 bytes"));
        }
        data = &data[n..];
    }
    Ok(())
}

/// Send `signal` to the process group of `pid` (negative-pid signaling),
/// so foreground TUIs in the job see the resize/repaint kick.
pub fn signal_process_group(pid: u32, signal: i32) {
    unsafe {
        libc::killpg(pid as i32, signal);
    }
}

/// Create (if absent) and open the command FIFO at `path`, mode 0600.
/// Returns the file the master reads lines from, plus a duplicated raw fd
/// — with `FD_CLOEXEC` cleared — to hand to the child as `RTACH_CMD_FD`.
/// Opened read-write so neither end blocks waiting for a peer to open it.
pub fn open_command_fifo(path: &Path) -> Result<(File, RawFd)> {
    if !path.exists() {
        let c_path = CString::new(path.as_os_str().as_bytes()).context("fifo path contains NUL")?;
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("mkfifo");
        }
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open command fifo {}", path.display()))?;

    let child_fd = unsafe { libc::dup(file.as_raw_fd()) };
    if child_fd < 0 {
        return Err(std::io::Error::last_os_error()).context("dup command fifo fd for child");
    }
    // std opens with O_CLOEXEC by default; the duplicated fd must survive
    // exec so the child process can write commands back through it.
    unsafe {
        libc::fcntl(child_fd, libc::F_SETFD, 0);
    }

    Ok((file, child_fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    struct ChunkyWriter {
        out: Vec<u8>,
        chunk: usize,
    }

    impl Write for ChunkyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_all_retrying_handles_short_writes() {
        let mut w = ChunkyWriter { out: Vec::new(), chunk: 3 };
        write_all_retrying(&mut w, b"hello world").unwrap();
        assert_eq!(w.out, b"hello world");
    }

    #[test]
    fn open_command_fifo_creates_mode_0600_fifo() {
        use std::os::unix::fs::FileTypeExt;

        let dir = tempfile::tempdir().unwrap();
        let fifo_path = dir.path().join("rtach.sock.cmd");
        let (file, child_fd) = open_command_fifo(&fifo_path).unwrap();

        let meta = std::fs::metadata(&fifo_path).unwrap();
        assert!(meta.file_type().is_fifo());
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        let flags = unsafe { libc::fcntl(child_fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0, "child fd must survive exec");

        drop(file);
        unsafe {
            libc::close(child_fd);
        }
    }
}
