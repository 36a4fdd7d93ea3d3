//! Session-scoped text backend.
//!
//! Survives as long as the process does. Handles are cheap clones over the
//! same store, so several managers can share one session the way pages share
//! one session storage area.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::StorageNamespace;
use crate::error::{CacheError, Result};
use crate::storage::{Record, StorageBackend};

#[derive(Debug, Default)]
struct SessionState {
    items: BTreeMap<String, String>,
    /// Bytes used by keys and values
    used: usize,
    quota: Option<usize>,
}

/// Shared in-process text store with an optional byte quota.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    state: Arc<Mutex<SessionState>>,
}

impl SessionStore {
    /// Creates an unbounded session store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session store that rejects writes beyond `quota` bytes.
    pub fn with_quota(quota: usize) -> Self {
        let store = Self::new();
        store.lock().quota = Some(quota);
        store
    }

    /// Bytes currently held (keys plus values).
    pub fn used_bytes(&self) -> usize {
        self.lock().used
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageBackend for SessionStore {
    fn namespace(&self) -> StorageNamespace {
        StorageNamespace::SessionPersistent
    }

    fn read(&self, key: &str) -> Option<Record> {
        self.lock().items.get(key).cloned().map(Record::Text)
    }

    fn write(&mut self, key: &str, record: Record) -> Result<()> {
        let text = record.into_text()?;
        let mut state = self.lock();

        let previous = state.items.get(key).map_or(0, |old| key.len() + old.len());
        let needed = state.used - previous + key.len() + text.len();
        if let Some(quota) = state.quota {
            if needed > quota {
                return Err(CacheError::QuotaExceeded(key.to_string()));
            }
        }

        state.items.insert(key.to_string(), text);
        state.used = needed;
        Ok(())
    }

    fn remove(&mut self, key: &str) {
        let mut state = self.lock();
        if let Some(old) = state.items.remove(key) {
            state.used -= key.len() + old.len();
        }
    }

    fn keys(&self) -> Vec<String> {
        self.lock().items.keys().cloned().collect()
    }
}
