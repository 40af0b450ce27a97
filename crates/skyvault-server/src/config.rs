//! Configuration for the storage server

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Parent directory of every per-user root
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Number of worker threads executing connection tasks
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Capacity of the circular task queue; tasks beyond it are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Socket read and file chunk size used by uploads and downloads
    #[serde(default = "default_transfer_buffer_size")]
    pub transfer_buffer_size: usize,

    /// Largest accepted control frame payload
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Readiness events fetched per poll
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Listen backlog passed to the kernel
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,

    /// Bound on unflushed control bytes queued for one connection
    #[serde(default = "default_outbox_limit")]
    pub outbox_limit: usize,

    /// Records returned by a history query
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Persistence backend
    #[serde(default)]
    pub database: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Persistence backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Everything is lost at shutdown
    Memory,
    /// SQLite database file; relative paths resolve against the storage root
    Sqlite { path: PathBuf },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite {
            path: PathBuf::from("skyvault.db"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
    /// Emit structured audit events for connections, logins and file operations
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

impl LoggingConfig {
    /// Filter for the subscriber; `RUST_LOG` wins over the configured level
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            storage_root: default_storage_root(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            transfer_buffer_size: default_transfer_buffer_size(),
            max_frame_size: default_max_frame_size(),
            max_events: default_max_events(),
            listen_backlog: default_listen_backlog(),
            outbox_limit: default_outbox_limit(),
            history_limit: default_history_limit(),
            database: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.worker_count == 0 {
            return Err(crate::Error::Config(
                "worker_count must be at least 1".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.transfer_buffer_size < 512 {
            return Err(crate::Error::Config(
                "transfer_buffer_size must be at least 512 bytes".to_string(),
            ));
        }

        if self.max_frame_size < 1024 {
            return Err(crate::Error::Config(
                "max_frame_size must be at least 1024 bytes".to_string(),
            ));
        }

        if self.outbox_limit < self.max_frame_size {
            return Err(crate::Error::Config(format!(
                "outbox_limit ({}) must hold at least one max-size frame ({})",
                self.outbox_limit, self.max_frame_size
            )));
        }

        if self.max_events == 0 {
            return Err(crate::Error::Config(
                "max_events must be at least 1".to_string(),
            ));
        }

        if self.storage_root.exists() && !self.storage_root.is_dir() {
            return Err(crate::Error::Config(format!(
                "Storage root is not a directory: {:?}",
                self.storage_root
            )));
        }

        Ok(())
    }

    /// Socket address string for the listener
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Database file with relative paths anchored at the storage root
    pub fn database_path(&self) -> Option<PathBuf> {
        match &self.database {
            StoreConfig::Memory => None,
            StoreConfig::Sqlite { path } if path.is_relative() => {
                Some(self.storage_root.join(path))
            }
            StoreConfig::Sqlite { path } => Some(path.clone()),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/skyvault")
}

fn default_worker_count() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    100
}

fn default_transfer_buffer_size() -> usize {
    4096
}

fn default_max_frame_size() -> usize {
    16 * 1024 * 1024
}

fn default_max_events() -> usize {
    1024
}

fn default_listen_backlog() -> i32 {
    128
}

fn default_outbox_limit() -> usize {
    16 * 1024 * 1024 + 4
}

fn default_history_limit() -> usize {
    100
}
