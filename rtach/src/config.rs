use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// rtach — terminal-session persistence daemon.
#[derive(Parser, Debug)]
#[command(name = "rtach")]
pub struct Cli {
    /// Path of the Unix stream socket to listen on
    #[arg(long)]
    pub socket: PathBuf,

    /// Initial PTY row count
    #[arg(long, default_value_t = 24)]
    pub rows: u16,

    /// Initial PTY column count
    #[arg(long, default_value_t = 80)]
    pub cols: u16,

    /// Scrollback ring capacity in bytes (overrides config file)
    #[arg(long)]
    pub scrollback_bytes: Option<usize>,

    /// Idle-timer quiet interval in seconds (overrides config file)
    #[arg(long)]
    pub idle_secs: Option<u64>,

    /// Command to run on the PTY, plus its arguments
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Sibling config file at `{socket_path}.toml`.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub scrollback_bytes: Option<usize>,
    pub idle_secs: Option<u64>,
}

impl DaemonConfig {
    pub const DEFAULT_SCROLLBACK_BYTES: usize = 1024 * 1024;
    pub const DEFAULT_IDLE_SECS: u64 = 2;

    /// Load `{socket_path}.toml` if present, falling back to defaults on
    /// any read or parse error.
    pub fn load(socket_path: &Path) -> Self {
        let mut config_path = socket_path.as_os_str().to_owned();
        config_path.push(".toml");
        let config_path = PathBuf::from(config_path);

        if !config_path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn scrollback_bytes(&self) -> usize {
        self.scrollback_bytes.unwrap_or(Self::DEFAULT_SCROLLBACK_BYTES)
    }

    pub fn idle_secs(&self) -> u64 {
        self.idle_secs.unwrap_or(Self::DEFAULT_IDLE_SECS)
    }
}
