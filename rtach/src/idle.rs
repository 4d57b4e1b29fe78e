//! Title persistence for the Idle/Title timer (T).
//!
//! The timer itself (re-armed on every PTY byte, firing an `idle` frame
//! after a quiet interval) is driven by the event loop with
//! `tokio::time::Instant`/`sleep_until`; this module only owns the
//! filesystem side-effect: atomically writing the most recently observed
//! window title to `{socket_path}.title`.

use std::path::{Path, PathBuf};

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut owned = path.as_os_str().to_owned();
    owned.push(suffix);
    PathBuf::from(owned)
}

/// Atomically persist `title` to `{socket_path}.title` via a temp-file +
/// rename in the same directory, so a reader never observes a partial
/// write. Uses only relative path operations — never assumes an absolute
/// `socket_path`.
pub fn persist_title(socket_path: &Path, title: &[u8]) -> std::io::Result<()> {
    let tmp_path = with_suffix(socket_path, ".title.tmp");
    let final_path = with_suffix(socket_path, ".title");
    std::fs::write(&tmp_path, title)?;
    std::fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_title_to_sibling_file() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("rtach.sock");
        persist_title(&socket_path, b"my shell").unwrap();
        let contents = std::fs::read(dir.path().join("rtach.sock.title")).unwrap();
        assert_eq!(contents, b"my shell");
        assert!(!dir.path().join("rtach.sock.title.tmp").exists());
    }

    #[test]
    fn overwrites_previous_title() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("rtach.sock");
        persist_title(&socket_path, b"first").unwrap();
        persist_title(&socket_path, b"second").unwrap();
        let contents = std::fs::read(dir.path().join("rtach.sock.title")).unwrap();
        assert_eq!(contents, b"second");
    }

    #[test]
    fn relative_path_works_from_current_directory() {
        let dir = tempfile::tempdir().unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let result = persist_title(Path::new("rtach.sock"), b"relative");
        std::env::set_current_dir(prev).unwrap();
        result.unwrap();
        assert_eq!(std::fs::read(dir.path().join("rtach.sock.title")).unwrap(), b"relative");
    }
}
