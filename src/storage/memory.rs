//! In-process memory backend.

use std::collections::BTreeMap;

use crate::config::StorageNamespace;
use crate::error::Result;
use crate::storage::{Record, StorageBackend};

/// Ordered map of raw keys to live records.
///
/// Lives and dies with its manager.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: BTreeMap<String, Record>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl StorageBackend for MemoryStore {
    fn namespace(&self) -> StorageNamespace {
        StorageNamespace::EphemeralMemory
    }

    fn read(&self, key: &str) -> Option<Record> {
        self.records.get(key).cloned()
    }

    fn write(&mut self, key: &str, record: Record) -> Result<()> {
        self.records.insert(key.to_string(), record);
        Ok(())
    }

    fn remove(&mut self, key: &str) {
        self.records.remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    fn count(&self, predicate: &dyn Fn(&str) -> bool) -> usize {
        self.records.keys().filter(|k| predicate(k)).count()
    }
}
