//! Validated configuration for the collector and the agent.
//!
//! The CLI builds these from flags and environment variables; the library
//! never reads the environment itself.

use std::path::PathBuf;
use std::time::Duration;

pub use crate::envelope::EnvelopeConfig;
use crate::error::{MetrixError, Result};
use crate::retry::DEFAULT_LADDER;

pub const DEFAULT_ADDR: &str = "localhost:8080";
pub const DEFAULT_STORE_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_WORKERS: usize = 3;

/// Backend selection.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageConfig {
    /// In-memory maps, optionally persisted to a snapshot file.
    Memory {
        path: Option<PathBuf>,
        restore: bool,
    },
    /// SQLite database at `url`.
    Database { url: String },
}

impl StorageConfig {
    /// A non-empty DSN selects the database; otherwise memory is used and an
    /// empty path disables the snapshot file.
    pub fn select(dsn: Option<&str>, path: Option<PathBuf>, restore: bool) -> Self {
        match dsn.map(str::trim).filter(|d| !d.is_empty()) {
            Some(url) => Self::Database {
                url: url.to_string(),
            },
            None => Self::Memory {
                path: path.filter(|p| !p.as_os_str().is_empty()),
                restore,
            },
        }
    }
}

impl std::fmt::Display for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory { path: Some(p), .. } => write!(f, "memory ({})", p.display()),
            Self::Memory { path: None, .. } => write!(f, "memory (volatile)"),
            Self::Database { .. } => write!(f, "database"),
        }
    }
}

/// Collector settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub storage: StorageConfig,
    /// Zero means flush after every write.
    pub store_interval: Duration,
    pub envelope: EnvelopeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            storage: StorageConfig::Memory {
                path: Some(PathBuf::from("metrix.json")),
                restore: true,
            },
            store_interval: DEFAULT_STORE_INTERVAL,
            envelope: EnvelopeConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.addr.trim().is_empty() {
            return Err(MetrixError::Config("listen address is empty".into()));
        }
        Ok(())
    }

    /// Whether every mutation is flushed before it is acknowledged.
    pub fn immediate_sync(&self) -> bool {
        self.store_interval.is_zero()
    }
}

/// Agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Collector `host:port`.
    pub server_addr: String,
    pub poll_interval: Duration,
    pub report_interval: Duration,
    /// Maximum in-flight deliveries; zero means unbounded.
    pub rate_limit: usize,
    pub workers: usize,
    pub envelope: EnvelopeConfig,
    pub retry_ladder: Vec<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_ADDR.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            report_interval: DEFAULT_REPORT_INTERVAL,
            rate_limit: 0,
            workers: DEFAULT_WORKERS,
            envelope: EnvelopeConfig::default(),
            retry_ladder: DEFAULT_LADDER.to_vec(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server_addr.trim().is_empty() {
            return Err(MetrixError::Config("collector address is empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(MetrixError::Config("poll interval must be positive".into()));
        }
        if self.report_interval.is_zero() {
            return Err(MetrixError::Config(
                "report interval must be positive".into(),
            ));
        }
        if self.workers == 0 {
            return Err(MetrixError::Config("at least one worker is required".into()));
        }
        Ok(())
    }
}
