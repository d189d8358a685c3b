//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.engineio/config.json`). Every
//! field has a default, so a missing file or a partial one is fine.

use crate::transport::TransportKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Listener settings for the bundled server binary.
    #[serde(default)]
    pub server: ServerConfig,

    /// Protocol options.
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Bind address and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port for HTTP and WebSocket (default 3000).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_port() -> u16 {
    3000
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

/// Engine options. Times are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Mount path for the endpoint (default "/engine.io/").
    #[serde(default = "default_path")]
    pub path: String,

    /// Extra time a client gets to answer after `ping_interval` (default 60000).
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,

    /// Interval the client is told to ping at (default 25000).
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,

    /// How long an upgrade may take before it is cancelled (default 10000).
    #[serde(default = "default_upgrade_timeout")]
    pub upgrade_timeout: u64,

    /// Largest accepted POST body in bytes (default 100000000).
    #[serde(default = "default_max_http_buffer_size")]
    pub max_http_buffer_size: usize,

    /// Allowed transports (default: all).
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,

    #[serde(default = "default_true")]
    pub allow_upgrades: bool,

    /// Name of the session id cookie. Empty disables the cookie.
    #[serde(default = "default_cookie")]
    pub cookie: String,
}

fn default_path() -> String {
    "/engine.io/".to_string()
}

fn default_ping_timeout() -> u64 {
    60_000
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_upgrade_timeout() -> u64 {
    10_000
}

fn default_max_http_buffer_size() -> usize {
    100_000_000
}

fn default_transports() -> Vec<TransportKind> {
    TransportKind::ALL.to_vec()
}

fn default_true() -> bool {
    true
}

fn default_cookie() -> String {
    "io".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            ping_timeout: default_ping_timeout(),
            ping_interval: default_ping_interval(),
            upgrade_timeout: default_upgrade_timeout(),
            max_http_buffer_size: default_max_http_buffer_size(),
            transports: default_transports(),
            allow_upgrades: default_true(),
            cookie: default_cookie(),
        }
    }
}

impl EngineConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval)
    }

    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_millis(self.upgrade_timeout)
    }

    pub fn allows(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }

    /// Upgrades advertised to a session that starts on `kind`.
    pub fn upgrades(&self, kind: TransportKind) -> Vec<TransportKind> {
        if !self.allow_upgrades {
            return Vec::new();
        }
        kind.upgrades()
            .iter()
            .copied()
            .filter(|k| self.allows(*k))
            .collect()
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("ENGINEIO_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".engineio").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or ENGINEIO_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
