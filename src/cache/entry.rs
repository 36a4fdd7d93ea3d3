//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with TTL support.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::clock::duration_ms;

// == Cache Entry ==
/// A cached value plus the metadata needed to judge its validity.
///
/// Serialized field names are part of the persisted format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The stored value
    pub data: T,
    /// Write time (Unix milliseconds)
    pub timestamp: i64,
    /// Lifetime in milliseconds
    pub ttl: u64,
    /// Full key the entry was written under
    pub key: String,
}

impl<T> CacheEntry<T> {
    // == Constructor ==
    /// Creates a new cache entry written at `timestamp`.
    pub fn new(key: impl Into<String>, data: T, timestamp: i64, ttl: Duration) -> Self {
        Self {
            data,
            timestamp,
            ttl: duration_ms(ttl),
            key: key.into(),
        }
    }

    // == Is Valid ==
    /// Checks whether the entry is still valid at `now`.
    ///
    /// Boundary condition: valid iff `now - timestamp < ttl`, so the entry is
    /// expired at exactly `timestamp + ttl`.
    pub fn is_valid_at(&self, now: i64) -> bool {
        is_fresh(self.timestamp, self.ttl, now)
    }

    // == Time To Live ==
    /// Returns remaining TTL in milliseconds at `now`, `0` once expired.
    pub fn ttl_remaining_ms(&self, now: i64) -> u64 {
        let expires = self.timestamp.saturating_add(ttl_as_i64(self.ttl));
        u64::try_from(expires.saturating_sub(now)).unwrap_or(0)
    }

    /// Converts the payload, keeping the metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            data: f(self.data),
            timestamp: self.timestamp,
            ttl: self.ttl,
            key: self.key,
        }
    }
}

// == Utility Functions ==
/// Shared validity rule for entries and chunk manifests.
pub fn is_fresh(timestamp: i64, ttl: u64, now: i64) -> bool {
    now.saturating_sub(timestamp) < ttl_as_i64(ttl)
}

fn ttl_as_i64(ttl: u64) -> i64 {
    i64::try_from(ttl).unwrap_or(i64::MAX)
}
