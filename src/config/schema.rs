//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files, and
//! every section has defaults so an empty file is a valid config.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lifecycle::shutdown::DEFAULT_DRAIN_TIMEOUT;
use crate::net::listener::{Network, DEFAULT_BACKLOG};
use crate::upgrade::coordinator::{UpgradeSettings, DEFAULT_READY_TIMEOUT};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// The listening socket handed down across upgrades.
    pub listener: ListenerConfig,

    /// HTTP request handling.
    pub http: HttpConfig,

    /// Upgrade and drain timing.
    pub upgrade: UpgradeConfig,

    /// Log output.
    pub logging: LoggingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Registry name; successors look the inherited socket up by it.
    pub name: String,

    pub network: Network,

    /// Bind address (e.g., "127.0.0.1:8080").
    pub address: String,

    /// Listen backlog for freshly bound sockets.
    pub backlog: i32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: "http".to_string(),
            network: Network::Tcp,
            address: "127.0.0.1:8080".to_string(),
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// HTTP configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
        }
    }
}

/// Upgrade configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Time an exiting generation gets to finish in-flight requests.
    pub drain_timeout_secs: u64,

    /// Time a successor gets to report ready before it is killed.
    pub ready_timeout_secs: u64,

    /// Where the pid of the generation owning the listeners is written.
    pub pid_file: Option<PathBuf>,

    /// Binary to start as successor. Defaults to the running executable.
    pub executable: Option<PathBuf>,
}

impl UpgradeConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Coordinator settings derived from this section.
    pub fn settings(&self) -> UpgradeSettings {
        UpgradeSettings {
            ready_timeout: self.ready_timeout(),
            pid_file: self.pid_file.clone(),
        }
    }
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT.as_secs(),
            ready_timeout_secs: DEFAULT_READY_TIMEOUT.as_secs(),
            pid_file: None,
            executable: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directives (e.g. "info" or "handoff_server=debug"). `RUST_LOG` wins.
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, for development.
    #[default]
    Pretty,
    /// One JSON object per line, for production.
    Json,
}
