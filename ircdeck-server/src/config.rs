//! Command-line configuration and the persisted server list.
//!
//! The server list lives at `~/.config/ircdeck/servers.toml` unless
//! `--config-dir` says otherwise.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use ircdeck_core::backend::AddServer;
use ircdeck_core::stream::StreamConfig;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug, Clone)]
#[command(name = "ircdeck-server", about = "Multi-server IRC client with a live web view")]
pub struct ServerConfig {
    /// HTTP listen address.
    #[arg(long, env = "IRCDECK_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Directory holding servers.toml. Default: ~/.config/ircdeck
    #[arg(long, env = "IRCDECK_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Nick for servers added without one.
    #[arg(long, env = "IRCDECK_NICK", default_value = "ircdeck")]
    pub nick: String,

    /// Milliseconds between periodic pushes to each client.
    #[arg(long, default_value_t = 1000)]
    pub tick_ms: u64,

    /// Pending notifications held before producers start waiting.
    #[arg(long, default_value_t = 256)]
    pub notification_capacity: usize,

    /// How long a producer waits for queue room before dropping (ms).
    #[arg(long, default_value_t = 100)]
    pub enqueue_timeout_ms: u64,

    /// Bound on a single write to a client stream (ms).
    #[arg(long, default_value_t = 5000)]
    pub push_timeout_ms: u64,

    /// Input history entries kept per session (0 = unlimited).
    #[arg(long, default_value_t = 500)]
    pub history_limit: usize,

    /// Serve static web client files from this directory.
    #[arg(long, env = "IRCDECK_WEB_STATIC_DIR")]
    pub web_static_dir: Option<String>,

    /// Don't read or write servers.toml.
    #[arg(long)]
    pub no_persist: bool,
}

impl ServerConfig {
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("ircdeck")
        })
    }

    pub fn servers_path(&self) -> Option<PathBuf> {
        (!self.no_persist).then(|| self.config_dir().join("servers.toml"))
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            tick: Duration::from_millis(self.tick_ms.max(10)),
            history_limit: (self.history_limit > 0).then_some(self.history_limit),
            default_nick: self.nick.clone(),
        }
    }
}

/// Servers added at runtime, reconnected on start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedServers {
    #[serde(default)]
    pub servers: Vec<AddServer>,
}

impl SavedServers {
    /// Load the list; a missing or unreadable file gives an empty list.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(saved) => return saved,
                    Err(e) => tracing::warn!("Bad server list {}: {e}", path.display()),
                },
                Err(e) => tracing::warn!("Can't read {}: {e}", path.display()),
            }
        }
        Self::default()
    }

    /// Best-effort save; failures are logged.
    pub fn save(&self, path: &Path) {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        match toml::to_string_pretty(self) {
            Ok(s) => {
                if let Err(e) = std::fs::write(path, s) {
                    tracing::warn!("Can't save server list {}: {e}", path.display());
                }
            }
            Err(e) => tracing::warn!("Can't serialize server list: {e}"),
        }
    }
}
