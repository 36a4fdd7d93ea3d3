//! Cache Statistics Module
//!
//! Tracks manager activity and reports a point-in-time view of its contents.

use serde::Serialize;

use crate::config::ManagerConfig;

// == Counters ==
/// Activity counters kept by a manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of retrievals that found nothing usable
    pub misses: u64,
    /// Entries removed by capacity eviction or quota recovery
    pub evictions: u64,
    /// Writes abandoned after refusal or failed recovery
    pub dropped_writes: u64,
}

impl Counters {
    // == Record Hit ==
    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    // == Record Miss ==
    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    // == Record Evictions ==
    pub fn record_evictions(&mut self, count: usize) {
        self.evictions += count as u64;
    }

    // == Record Dropped Write ==
    pub fn record_dropped_write(&mut self) {
        self.dropped_writes += 1;
    }
}

// == Manager Stats ==
/// Snapshot returned by `CacheManager::stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStats {
    /// Entries held as live values (memory backend only)
    pub memory_item_count: usize,
    /// Logical entries under the cache prefix in the backend
    pub backend_item_count: usize,
    /// Configuration the manager was built with
    pub config: ManagerConfig,
    #[serde(flatten)]
    pub counters: Counters,
}

impl ManagerStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.counters.hits + self.counters.misses;
        if total == 0 {
            0.0
        } else {
            self.counters.hits as f64 / total as f64
        }
    }
}
