//! Broker configuration.
//!
//! Every timer the server runs on is a field here so deployments (and the
//! integration tests) can tune them; the defaults match the protocol's
//! documented bounds.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener address.
    pub bind_addr: SocketAddr,
    /// SQLite database holding users, sessions, and call history.
    pub db_path: PathBuf,
    /// Deadline for the client's public-key frame.
    pub handshake_timeout_secs: u64,
    /// Session token lifetime.
    pub session_ttl_secs: u64,
    /// Cadence of the idle-connection sweep.
    pub idle_sweep_secs: u64,
    /// Presence entries idle longer than this are evicted.
    pub idle_max_secs: u64,
    /// Cadence of the stuck-call sweep.
    pub call_sweep_secs: u64,
    /// Ringing calls older than this are timed out.
    pub ringing_max_secs: u64,
    /// Active calls without heartbeat for longer than this are timed out.
    pub active_max_secs: u64,
    /// Upper bound on one wire frame.
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5555".parse().expect("static addr"),
            db_path: PathBuf::from("users.db"),
            handshake_timeout_secs: 30,
            session_ttl_secs: 24 * 60 * 60,
            idle_sweep_secs: 30,
            idle_max_secs: 300,
            call_sweep_secs: 60,
            ringing_max_secs: 120,
            active_max_secs: 300,
            max_frame_len: 256 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_secs)
    }

    pub fn idle_max(&self) -> Duration {
        Duration::from_secs(self.idle_max_secs)
    }

    pub fn call_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.call_sweep_secs)
    }

    pub fn ringing_max(&self) -> Duration {
        Duration::from_secs(self.ringing_max_secs)
    }

    pub fn active_max(&self) -> Duration {
        Duration::from_secs(self.active_max_secs)
    }
}
