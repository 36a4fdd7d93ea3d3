//! Storage Module
//!
//! Uniform read/write/remove/enumerate interface over the three backends a
//! cache manager can be configured with.

mod file;
mod memory;
mod session;

use std::fmt::Debug;

use serde_json::Value;

use crate::cache::CacheEntry;
use crate::config::{ManagerConfig, StorageNamespace};
use crate::error::{CacheError, Result};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use session::SessionStore;

// == Record ==
/// A value held by a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Live entry, kept without a text step (memory backend)
    Live(CacheEntry<Value>),
    /// Serialized text (entries, envelopes, manifests, chunks)
    Text(String),
}

impl Record {
    /// Text form of the record, serializing live entries.
    pub fn into_text(self) -> Result<String> {
        match self {
            Record::Text(text) => Ok(text),
            Record::Live(entry) => {
                serde_json::to_string(&entry).map_err(|e| CacheError::Serialization(e.to_string()))
            }
        }
    }
}

// == Storage Backend ==
/// A raw key/value store the cache manager writes through.
///
/// Implementations do no locking across calls; each method is one bounded
/// operation on the underlying store.
pub trait StorageBackend: Debug + Send {
    /// Which namespace this backend implements.
    fn namespace(&self) -> StorageNamespace;

    /// Reads the record under `key`.
    fn read(&self, key: &str) -> Option<Record>;

    /// Writes `record` under `key`.
    ///
    /// Fails with `QuotaExceeded` when the store is out of space.
    fn write(&mut self, key: &str, record: Record) -> Result<()>;

    /// Removes `key`; missing keys are ignored.
    fn remove(&mut self, key: &str);

    /// Every key currently held, in ascending order.
    fn keys(&self) -> Vec<String>;

    /// Keys accepted by `predicate`.
    fn enumerate_keys(&self, predicate: &dyn Fn(&str) -> bool) -> Vec<String> {
        self.keys().into_iter().filter(|k| predicate(k)).collect()
    }

    /// Number of keys accepted by `predicate`.
    fn count(&self, predicate: &dyn Fn(&str) -> bool) -> usize {
        self.keys().iter().filter(|k| predicate(k)).count()
    }
}

/// Builds the backend selected by `config.storage`.
pub fn open_backend(config: &ManagerConfig) -> Result<Box<dyn StorageBackend>> {
    Ok(match config.storage {
        StorageNamespace::EphemeralMemory => Box::new(MemoryStore::new()),
        StorageNamespace::SessionPersistent => Box::new(SessionStore::new()),
        StorageNamespace::DurablePersistent => Box::new(FileStore::open(&config.data_dir)?),
    })
}
