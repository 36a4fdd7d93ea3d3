//! Eviction Policy Module
//!
//! Keeps the number of logical entries under a backend prefix bounded by
//! deleting the oldest ones by write timestamp, and frees space when a
//! backend reports its quota exhausted.
//!
//! A logical entry is either a direct record or a chunk manifest; chunk
//! records whose manifest exists are accounted to it and deleted with it.

use std::collections::HashSet;

use tracing::debug;

use crate::cache::chunk;
use crate::cache::codec::{self, Stamp};
use crate::cache::entry::is_fresh;
use crate::storage::{Record, StorageBackend};

// == Candidate ==
/// A logical entry found while scanning a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Raw key of the direct record or manifest
    pub key: String,
    pub stamp: Stamp,
    /// Chunk count when `key` is a manifest
    pub chunks: Option<usize>,
}

// == Scan ==
/// Lists the logical entries under `prefix`, oldest first.
///
/// Records whose timestamp cannot be read are deleted on the way. Equal
/// timestamps are ordered by raw key.
pub fn scan(backend: &mut dyn StorageBackend, prefix: &str) -> Vec<Candidate> {
    let keys = backend.enumerate_keys(&|key: &str| key.starts_with(prefix));
    let present: HashSet<&str> = keys.iter().map(String::as_str).collect();

    let mut candidates = Vec::with_capacity(keys.len());
    let mut invalid = Vec::new();

    for key in &keys {
        if let Some(owner) = chunk::chunk_owner(key) {
            if present.contains(chunk::meta_key(owner).as_str()) {
                continue;
            }
        }

        match backend.read(key) {
            None => {}
            Some(Record::Live(entry)) => candidates.push(Candidate {
                key: key.clone(),
                stamp: Stamp {
                    timestamp: entry.timestamp,
                    ttl: entry.ttl,
                },
                chunks: None,
            }),
            Some(Record::Text(text)) => match classify(key, &text) {
                Some(candidate) => candidates.push(candidate),
                None => invalid.push(key.clone()),
            },
        }
    }

    for key in invalid {
        debug!(key = %key, "Deleting unreadable cache record");
        backend.remove(&key);
    }

    candidates.sort_by(|a, b| {
        a.stamp
            .timestamp
            .cmp(&b.stamp.timestamp)
            .then_with(|| a.key.cmp(&b.key))
    });
    candidates
}

fn classify(key: &str, text: &str) -> Option<Candidate> {
    if chunk::manifest_owner(key).is_some() {
        if let Ok(manifest) = serde_json::from_str::<chunk::ChunkManifest>(text) {
            return Some(Candidate {
                key: key.to_string(),
                stamp: Stamp {
                    timestamp: manifest.timestamp,
                    ttl: manifest.ttl,
                },
                chunks: Some(manifest.chunk_count),
            });
        }
    }

    codec::read_stamp(key, text).ok().map(|stamp| Candidate {
        key: key.to_string(),
        stamp,
        chunks: None,
    })
}

/// Deletes a logical entry, including its chunks.
pub fn remove_candidate(backend: &mut dyn StorageBackend, candidate: &Candidate) {
    match (candidate.chunks, chunk::manifest_owner(&candidate.key)) {
        (Some(count), Some(owner)) => chunk::remove(backend, owner, Some(count)),
        _ => backend.remove(&candidate.key),
    }
}

// == Capacity ==
/// Deletes the oldest entries until at most `max_size` remain.
///
/// Returns the number of entries evicted.
pub fn enforce_capacity(backend: &mut dyn StorageBackend, prefix: &str, max_size: usize) -> usize {
    let candidates = scan(backend, prefix);
    let excess = candidates.len().saturating_sub(max_size);
    for candidate in &candidates[..excess] {
        remove_candidate(backend, candidate);
    }
    if excess > 0 {
        debug!(evicted = excess, remaining = max_size, "Capacity eviction");
    }
    excess
}

// == Quota Recovery ==
/// Frees the oldest half (rounded up) of the entries under `prefix`.
///
/// Returns the number of entries removed.
pub fn reclaim(backend: &mut dyn StorageBackend, prefix: &str) -> usize {
    let candidates = scan(backend, prefix);
    let victims = candidates.len().div_ceil(2);
    for candidate in &candidates[..victims] {
        remove_candidate(backend, candidate);
    }
    victims
}

// == Expiry ==
/// Deletes every entry under `prefix` that has expired at `now`.
pub fn purge_expired(backend: &mut dyn StorageBackend, prefix: &str, now: i64) -> usize {
    let expired: Vec<Candidate> = scan(backend, prefix)
        .into_iter()
        .filter(|c| !is_fresh(c.stamp.timestamp, c.stamp.ttl, now))
        .collect();
    for candidate in &expired {
        remove_candidate(backend, candidate);
    }
    expired.len()
}

// == Count ==
/// Counts logical entries under `prefix` from key names alone.
pub fn count_entries(backend: &dyn StorageBackend, prefix: &str) -> usize {
    let keys = backend.enumerate_keys(&|key: &str| key.starts_with(prefix));
    let present: HashSet<&str> = keys.iter().map(String::as_str).collect();
    keys.iter()
        .filter(|key| match chunk::chunk_owner(key) {
            Some(owner) => !present.contains(chunk::meta_key(owner).as_str()),
            None => true,
        })
        .count()
}
