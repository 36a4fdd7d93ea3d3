//! Configuration Module
//!
//! Handles building cache manager configuration, either programmatically or
//! from environment variables.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// == Defaults ==
/// Default time-to-live for entries stored without an explicit TTL
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default maximum number of logical entries
pub const DEFAULT_MAX_SIZE: usize = 100;

// == Storage Namespace ==
/// Selects the backend a manager writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageNamespace {
    /// Volatile in-process map holding live values
    EphemeralMemory,
    /// Text store that lives as long as the process session
    SessionPersistent,
    /// Text store backed by files on disk
    #[default]
    DurablePersistent,
}

impl StorageNamespace {
    /// Returns true for backends that only hold text.
    pub fn is_text(&self) -> bool {
        !matches!(self, StorageNamespace::EphemeralMemory)
    }
}

impl fmt::Display for StorageNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageNamespace::EphemeralMemory => "ephemeral-memory",
            StorageNamespace::SessionPersistent => "session-persistent",
            StorageNamespace::DurablePersistent => "durable-persistent",
        };
        f.write_str(name)
    }
}

impl FromStr for StorageNamespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "ephemeral-memory" => Ok(StorageNamespace::EphemeralMemory),
            "session" | "session-persistent" => Ok(StorageNamespace::SessionPersistent),
            "durable" | "local" | "durable-persistent" => Ok(StorageNamespace::DurablePersistent),
            other => Err(format!("unknown storage namespace '{}'", other)),
        }
    }
}

// == Manager Config ==
/// Cache manager configuration.
///
/// Immutable once handed to a manager; every value has a sensible default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// TTL applied when `set` is called without one
    pub ttl: Duration,
    /// Maximum number of logical entries kept after a write
    pub max_size: usize,
    /// Backend selection
    pub storage: StorageNamespace,
    /// Whether large payloads may be compressed
    pub compression: bool,
    /// Directory used by the durable backend
    pub data_dir: PathBuf,
}

impl ManagerConfig {
    /// Creates a new ManagerConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_TTL_MS` - Default TTL in milliseconds (default: 300000)
    /// - `CACHE_MAX_SIZE` - Maximum entries (default: 100)
    /// - `CACHE_STORAGE` - `memory`, `session` or `durable` (default: durable)
    /// - `CACHE_COMPRESSION` - `true`/`false`/`1`/`0` (default: false)
    /// - `CACHE_DATA_DIR` - Durable store directory (default: `<tmp>/mini_cache`)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ttl: env::var("CACHE_TTL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.ttl),
            max_size: env::var("CACHE_MAX_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_size),
            storage: env::var("CACHE_STORAGE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.storage),
            compression: env::var("CACHE_COMPRESSION")
                .ok()
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.compression),
            data_dir: env::var("CACHE_DATA_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
        }
    }

    // == Builders ==
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_storage(mut self, storage: StorageNamespace) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_size: DEFAULT_MAX_SIZE,
            storage: StorageNamespace::default(),
            compression: false,
            data_dir: env::temp_dir().join("mini_cache"),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
