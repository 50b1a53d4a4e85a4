//! Daemon configuration, parsed from flags and environment.

use std::path::PathBuf;

use clap::Parser;

/// devnetd: provision and supervise local blockchain devnets.
#[derive(Clone, Debug, Parser)]
#[command(name = "devnetd", version, about)]
pub struct Config {
    /// Root directory for the resource store, credentials, node homes and logs
    #[arg(long, env = "DEVNETD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// TCP listen address for the remote API
    #[arg(long, env = "DEVNETD_LISTEN", default_value = "127.0.0.1:7070")]
    pub listen: String,

    /// Unix socket path for the local API; local connections bypass
    /// authentication
    #[arg(long, env = "DEVNETD_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Maximum size of one node log file before rotation, in bytes
    #[arg(long, default_value_t = 100 * 1024 * 1024)]
    pub log_max_size: u64,

    /// Number of rotated log files kept per node
    #[arg(long, default_value_t = 5)]
    pub log_max_files: usize,
}

impl Config {
    /// Resolved data directory, defaulting to `~/.devnet-builder`.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".devnet-builder")
        })
    }

    /// Resolved local socket path, defaulting to `<data_dir>/devnetd.sock`.
    pub fn socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| self.data_dir().join("devnetd.sock"))
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir().join("state.redb")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir().join("api-keys.yaml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }
}
