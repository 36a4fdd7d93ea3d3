//! Cache Manager Module
//!
//! Main cache engine combining key derivation, the entry and chunk codecs, a
//! storage backend and the eviction policy behind get/set/invalidate.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::chunk::{self, ChunkManifest, MAX_WRITE_SIZE};
use crate::cache::clock::{Clock, SystemClock};
use crate::cache::codec::{self, Stamp};
use crate::cache::entry::CacheEntry;
use crate::cache::eviction;
use crate::cache::key::{full_key, Params};
use crate::cache::stats::{Counters, ManagerStats};
use crate::config::{ManagerConfig, StorageNamespace};
use crate::error::{CacheError, Result};
use crate::storage::{open_backend, Record, StorageBackend};

/// Prefix of every raw key written by any manager
pub const KEY_PREFIX: &str = "cache_";

/// Raw backend key for a full key.
pub fn raw_key(full_key: &str) -> String {
    format!("{}{}", KEY_PREFIX, full_key)
}

// == Pending Write ==
/// An encoded entry, kept so a write can be retried after quota recovery.
#[derive(Debug)]
enum PendingWrite {
    Live(CacheEntry<Value>),
    Direct(String),
    Chunked {
        manifest: ChunkManifest,
        chunks: Vec<String>,
    },
}

// == Cache Manager ==
/// A cache over one backend with one immutable configuration.
///
/// Operations never fail towards the caller: misses, corruption and refused
/// writes all surface as `None` / no-op and are reported through `tracing`.
#[derive(Debug)]
pub struct CacheManager {
    config: ManagerConfig,
    backend: Box<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    counters: Counters,
    /// Timestamp of this manager's latest write
    last_stamp: i64,
}

impl CacheManager {
    // == Constructors ==
    /// Creates a manager over the backend selected by `config.storage`.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let backend = open_backend(&config)?;
        Ok(Self::with_backend(config, backend))
    }

    /// Creates a manager over an existing backend.
    ///
    /// `config.storage` is replaced by the backend's own namespace.
    pub fn with_backend(mut config: ManagerConfig, backend: Box<dyn StorageBackend>) -> Self {
        config.storage = backend.namespace();
        info!(
            storage = %config.storage,
            max_size = config.max_size,
            ttl_ms = config.ttl.as_millis() as u64,
            compression = config.compression,
            "Cache manager initialized"
        );
        Self {
            config,
            backend,
            clock: Arc::new(SystemClock),
            counters: Counters::default(),
            last_stamp: i64::MIN,
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // == Get ==
    /// Retrieves the value stored under `key` and `params`.
    ///
    /// Looks for a direct record first, then for a chunked one. Expired,
    /// corrupted and incomplete entries are purged and reported as absent.
    pub fn get<T: DeserializeOwned>(&mut self, key: &str, params: Option<&Params>) -> Option<T> {
        let full = full_key(key, params);
        let raw = raw_key(&full);
        let now = self.clock.now_ms();

        let found = match self.read_direct::<T>(&raw, now) {
            Ok(Some(data)) => Some(data),
            Ok(None) => self.read_chunked::<T>(&raw, now),
            Err(e) => {
                warn!(key = %full, "Discarding cached entry: {}", e);
                self.read_chunked::<T>(&raw, now)
            }
        };

        match found {
            Some(data) => {
                self.counters.record_hit();
                Some(data)
            }
            None => {
                self.counters.record_miss();
                None
            }
        }
    }

    fn read_direct<T: DeserializeOwned>(&mut self, raw: &str, now: i64) -> Result<Option<T>> {
        let entry = match self.backend.read(raw) {
            None => return Ok(None),
            Some(Record::Live(entry)) => entry.map(serde_json::from_value::<T>),
            Some(Record::Text(text)) => match codec::decode::<T>(raw, &text) {
                Ok(entry) => entry.map(Ok),
                Err(e) => {
                    self.backend.remove(raw);
                    return Err(e);
                }
            },
        };

        if !entry.is_valid_at(now) {
            debug!(key = raw, "Entry expired");
            self.backend.remove(raw);
            return Ok(None);
        }

        match entry.data {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                self.backend.remove(raw);
                Err(CacheError::corrupted(raw, e))
            }
        }
    }

    fn read_chunked<T: DeserializeOwned>(&mut self, raw: &str, now: i64) -> Option<T> {
        if !self.config.storage.is_text() {
            return None;
        }
        match chunk::load::<T>(self.backend.as_mut(), raw, now) {
            Ok(entry) => entry.map(|e| e.data),
            Err(e) => {
                warn!(key = raw, "Discarding chunked entry: {}", e);
                None
            }
        }
    }

    // == Set ==
    /// Stores `data` under `key` and `params`.
    ///
    /// Uses the configured TTL when `ttl` is `None`. Payloads over the single
    /// write cap are chunked; a refused or failed write is dropped.
    pub fn set<T: Serialize>(
        &mut self,
        key: &str,
        data: &T,
        params: Option<&Params>,
        ttl: Option<Duration>,
    ) {
        let full = full_key(key, params);
        if let Err(e) = self.try_set(&full, data, ttl) {
            self.counters.record_dropped_write();
            warn!(key = %full, "Cache write dropped: {}", e);
        }
    }

    fn try_set<T: Serialize>(&mut self, full: &str, data: &T, ttl: Option<Duration>) -> Result<()> {
        let raw = raw_key(full);
        let ttl = ttl.unwrap_or(self.config.ttl);
        let now = self.next_stamp();
        let pending = self.encode(&raw, CacheEntry::new(full, data, now, ttl))?;

        match self.apply(&raw, &pending) {
            Ok(()) => {}
            Err(e) if e.is_quota() => {
                let freed = eviction::reclaim(self.backend.as_mut(), KEY_PREFIX);
                self.counters.record_evictions(freed);
                warn!(key = %raw, freed, "Storage quota exceeded, retrying once");
                self.apply(&raw, &pending)?;
            }
            Err(e) => return Err(e),
        }

        let evicted = eviction::enforce_capacity(self.backend.as_mut(), KEY_PREFIX, self.config.max_size);
        self.counters.record_evictions(evicted);
        Ok(())
    }

    /// Write time for the next entry, strictly after the previous write.
    ///
    /// Writes landing in the same clock millisecond still order by write
    /// sequence, so eviction never prefers a just-written key.
    fn next_stamp(&mut self) -> i64 {
        let now = self.clock.now_ms().max(self.last_stamp.saturating_add(1));
        self.last_stamp = now;
        now
    }

    fn encode<T: Serialize>(&self, raw: &str, entry: CacheEntry<&T>) -> Result<PendingWrite> {
        if !self.config.storage.is_text() {
            let data =
                serde_json::to_value(entry.data).map_err(|e| CacheError::Serialization(e.to_string()))?;
            return Ok(PendingWrite::Live(CacheEntry {
                data,
                timestamp: entry.timestamp,
                ttl: entry.ttl,
                key: entry.key,
            }));
        }

        let stamp = Stamp::from(&entry);
        let text = codec::serialize(&entry)?;
        let payload = codec::maybe_compress(text, self.config.compression);
        if payload.stored_len(stamp) <= MAX_WRITE_SIZE {
            return Ok(PendingWrite::Direct(payload.into_stored(stamp)?));
        }

        let chunks: Vec<String> = chunk::plan(raw, &payload.body)?
            .into_iter()
            .map(str::to_string)
            .collect();
        let manifest = ChunkManifest {
            chunk_count: chunks.len(),
            timestamp: entry.timestamp,
            ttl: entry.ttl,
            key: entry.key,
            compressed: payload.compressed,
        };
        Ok(PendingWrite::Chunked { manifest, chunks })
    }

    fn apply(&mut self, raw: &str, pending: &PendingWrite) -> Result<()> {
        let backend = self.backend.as_mut();
        match pending {
            PendingWrite::Live(entry) => backend.write(raw, Record::Live(entry.clone())),
            PendingWrite::Direct(text) => {
                remove_chunk_set(backend, raw);
                backend.write(raw, Record::Text(text.clone()))
            }
            PendingWrite::Chunked { manifest, chunks } => {
                backend.remove(raw);
                remove_chunk_set(backend, raw);
                chunk::store(backend, raw, manifest, chunks)
            }
        }
    }

    // == Invalidate ==
    /// Removes the entry stored under `key` and `params`, direct or chunked.
    pub fn invalidate(&mut self, key: &str, params: Option<&Params>) {
        let raw = raw_key(&full_key(key, params));
        self.backend.remove(&raw);
        remove_chunk_set(self.backend.as_mut(), &raw);
        debug!(key = %raw, "Invalidated");
    }

    /// Removes every raw key starting with the cache prefix plus `prefix`.
    pub fn invalidate_prefix(&mut self, prefix: &str) {
        let removed = self.remove_prefixed(&format!("{}{}", KEY_PREFIX, prefix));
        debug!(prefix, removed, "Invalidated by prefix");
    }

    // == Clear ==
    /// Removes every raw key under the cache prefix.
    pub fn clear(&mut self) {
        let removed = self.remove_prefixed(KEY_PREFIX);
        info!(removed, "Cache cleared");
    }

    fn remove_prefixed(&mut self, prefix: &str) -> usize {
        let keys = self
            .backend
            .enumerate_keys(&|key: &str| key.starts_with(prefix));
        for key in &keys {
            self.backend.remove(key);
        }
        keys.len()
    }

    // == Purge Expired ==
    /// Removes every expired entry under the cache prefix.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now_ms();
        eviction::purge_expired(self.backend.as_mut(), KEY_PREFIX, now)
    }

    // == Stats ==
    /// Returns a snapshot of the manager's contents and counters.
    pub fn stats(&self) -> ManagerStats {
        let backend_item_count = eviction::count_entries(&*self.backend, KEY_PREFIX);
        let memory_item_count = match self.config.storage {
            StorageNamespace::EphemeralMemory => backend_item_count,
            _ => 0,
        };
        ManagerStats {
            memory_item_count,
            backend_item_count,
            config: self.config.clone(),
            counters: self.counters,
        }
    }
}

/// Removes the chunk set of `raw` if a readable manifest is present.
///
/// An unreadable `<raw>_meta` record may be a direct entry of its own; it is
/// left for the read path to judge.
fn remove_chunk_set(backend: &mut dyn StorageBackend, raw: &str) {
    if let Ok(Some(manifest)) = chunk::read_manifest(&*backend, raw) {
        chunk::remove(backend, raw, Some(manifest.chunk_count.min(chunk::MAX_CHUNKS)));
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::chunk::CHUNK_SIZE;
    use crate::cache::clock::ManualClock;
    use crate::storage::{MemoryStore, SessionStore};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Report {
        id: u32,
        rows: Vec<String>,
    }

    fn session_manager(config: ManagerConfig, clock: &ManualClock) -> (CacheManager, SessionStore) {
        let store = SessionStore::new();
        let manager = CacheManager::with_backend(config, Box::new(store.clone())).with_clock(clock.clone());
        (manager, store)
    }

    fn tick(clock: &ManualClock) {
        clock.advance(Duration::from_millis(1));
    }

    #[test]
    fn test_set_and_get_with_params() {
        let clock = ManualClock::new(1_000);
        let (mut cache, store) = session_manager(ManagerConfig::default(), &clock);
        let params = Params::new().with("page", 2).with("filter", "open");

        cache.set("tickets", &vec![1, 2, 3], Some(&params), None);
        let hit: Option<Vec<u32>> = cache.get("tickets", Some(&params));
        assert_eq!(hit, Some(vec![1, 2, 3]));

        let miss: Option<Vec<u32>> = cache.get("tickets", None);
        assert_eq!(miss, None);

        assert_eq!(
            store.keys(),
            vec![r#"cache_tickets__filter:"open"|page:2"#.to_string()]
        );
        let stats = cache.stats();
        assert_eq!(stats.counters.hits, 1);
        assert_eq!(stats.counters.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let clock = ManualClock::new(1_000);
        let (mut cache, store) = session_manager(ManagerConfig::default(), &clock);

        cache.set("short", &"v", None, Some(Duration::from_secs(1)));
        clock.advance(Duration::from_millis(999));
        assert_eq!(cache.get::<String>("short", None), Some("v".to_string()));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get::<String>("short", None), None);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_default_ttl_comes_from_config() {
        let clock = ManualClock::new(0);
        let config = ManagerConfig::default().with_ttl(Duration::from_secs(10));
        let (mut cache, _store) = session_manager(config, &clock);

        cache.set("k", &1, None, None);
        clock.advance(Duration::from_secs(9));
        assert_eq!(cache.get::<i32>("k", None), Some(1));
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get::<i32>("k", None), None);
    }

    #[test]
    fn test_memory_backend_keeps_live_entries() {
        let clock = ManualClock::new(5);
        let mut cache =
            CacheManager::with_backend(ManagerConfig::default(), Box::new(MemoryStore::new()))
                .with_clock(clock);
        let report = Report {
            id: 7,
            rows: vec!["a".into(), "b".into()],
        };

        cache.set("report", &report, None, None);
        assert_eq!(cache.get::<Report>("report", None), Some(report));

        let stats = cache.stats();
        assert_eq!(stats.config.storage, StorageNamespace::EphemeralMemory);
        assert_eq!(stats.memory_item_count, 1);
        assert_eq!(stats.backend_item_count, 1);
    }

    #[test]
    fn test_memory_backend_never_chunks() {
        let mut cache =
            CacheManager::with_backend(ManagerConfig::default(), Box::new(MemoryStore::new()));
        let big = "m".repeat(MAX_WRITE_SIZE + 1);

        cache.set("big", &big, None, None);
        assert_eq!(cache.get::<String>("big", None), Some(big));
        assert_eq!(cache.backend.keys(), vec!["cache_big".to_string()]);
    }

    #[test]
    fn test_corrupted_record_is_purged() {
        let clock = ManualClock::new(0);
        let (mut cache, mut store) = session_manager(ManagerConfig::default(), &clock);
        store.write("cache_broken", Record::Text("{oops".into())).unwrap();

        assert_eq!(cache.get::<String>("broken", None), None);
        assert!(store.keys().is_empty());
        assert_eq!(cache.stats().counters.misses, 1);
    }

    #[test]
    fn test_type_mismatch_is_purged() {
        let clock = ManualClock::new(0);
        let (mut cache, store) = session_manager(ManagerConfig::default(), &clock);

        cache.set("n", &"not a number", None, None);
        assert_eq!(cache.get::<u64>("n", None), None);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_large_value_is_chunked_and_invalidated() {
        let clock = ManualClock::new(0);
        let config = ManagerConfig::default().with_compression(false);
        let (mut cache, store) = session_manager(config, &clock);
        let big = "c".repeat(MAX_WRITE_SIZE + CHUNK_SIZE);

        cache.set("big", &big, None, None);
        let keys = store.keys();
        assert!(keys.contains(&"cache_big_meta".to_string()));
        assert!(keys.contains(&"cache_big_chunk_0".to_string()));
        assert!(!keys.contains(&"cache_big".to_string()));
        assert_eq!(cache.stats().backend_item_count, 1);

        assert_eq!(cache.get::<String>("big", None), Some(big));

        cache.invalidate("big", None);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_direct_write_replaces_chunked_entry() {
        let clock = ManualClock::new(0);
        let config = ManagerConfig::default().with_compression(false);
        let (mut cache, store) = session_manager(config, &clock);

        cache.set("k", &"x".repeat(MAX_WRITE_SIZE + 1), None, None);
        cache.set("k", &"small", None, None);

        assert_eq!(store.keys(), vec!["cache_k".to_string()]);
        assert_eq!(cache.get::<String>("k", None), Some("small".to_string()));
    }

    #[test]
    fn test_oversized_value_is_dropped() {
        let clock = ManualClock::new(0);
        let config = ManagerConfig::default().with_compression(false);
        let (mut cache, store) = session_manager(config, &clock);

        cache.set("huge", &"h".repeat(10 * CHUNK_SIZE + 1), None, None);
        assert!(store.keys().is_empty());
        assert_eq!(cache.stats().counters.dropped_writes, 1);
        assert_eq!(cache.get::<String>("huge", None), None);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let clock = ManualClock::new(0);
        let config = ManagerConfig::default().with_max_size(2);
        let (mut cache, store) = session_manager(config, &clock);

        for key in ["a", "b", "c"] {
            cache.set(key, &key, None, None);
            tick(&clock);
        }

        assert_eq!(store.keys(), vec!["cache_b".to_string(), "cache_c".to_string()]);
        assert_eq!(cache.get::<String>("a", None), None);
        assert_eq!(cache.stats().counters.evictions, 1);
    }

    #[test]
    fn test_burst_in_one_millisecond_keeps_latest_writes() {
        let clock = ManualClock::new(0);
        let config = ManagerConfig::default().with_max_size(2);
        let (mut cache, store) = session_manager(config, &clock);

        for key in ["c", "b", "a"] {
            cache.set(key, &key, None, None);
            assert_eq!(cache.get::<String>(key, None), Some(key.to_string()));
        }

        assert_eq!(store.keys(), vec!["cache_a".to_string(), "cache_b".to_string()]);
        assert_eq!(cache.get::<String>("c", None), None);
    }

    #[test]
    fn test_write_stamps_strictly_increase() {
        let clock = ManualClock::new(500);
        let mut cache =
            CacheManager::with_backend(ManagerConfig::default(), Box::new(MemoryStore::new()))
                .with_clock(clock.clone());

        assert_eq!(cache.next_stamp(), 500);
        assert_eq!(cache.next_stamp(), 501);
        clock.advance(Duration::from_millis(10));
        assert_eq!(cache.next_stamp(), 510);
    }

    #[test]
    fn test_quota_exceeded_reclaims_and_retries() {
        let clock = ManualClock::new(1_000);
        let store = SessionStore::with_quota(1_000);
        let mut cache = CacheManager::with_backend(ManagerConfig::default(), Box::new(store.clone()))
            .with_clock(clock.clone());
        let value = "v".repeat(200);

        for i in 0..4 {
            cache.set(&format!("k{}", i), &value, None, None);
            tick(&clock);
        }

        assert_eq!(store.keys(), vec!["cache_k2".to_string(), "cache_k3".to_string()]);
        let stats = cache.stats();
        assert_eq!(stats.counters.evictions, 2);
        assert_eq!(stats.counters.dropped_writes, 0);
    }

    #[test]
    fn test_quota_write_dropped_when_retry_fails() {
        let store = SessionStore::with_quota(100);
        let mut cache = CacheManager::with_backend(ManagerConfig::default(), Box::new(store.clone()));

        cache.set("big", &"b".repeat(500), None, None);
        assert!(store.keys().is_empty());
        assert_eq!(cache.stats().counters.dropped_writes, 1);
    }

    #[test]
    fn test_invalidate_prefix_and_clear_leave_foreign_keys() {
        let clock = ManualClock::new(0);
        let (mut cache, mut store) = session_manager(ManagerConfig::default(), &clock);
        store.write("theme", Record::Text("dark".into())).unwrap();

        cache.set("user_1", &1, None, None);
        cache.set("user_2", &2, None, None);
        cache.set("team_1", &3, None, None);

        cache.invalidate_prefix("user_");
        assert_eq!(store.keys(), vec!["cache_team_1".to_string(), "theme".to_string()]);

        cache.clear();
        assert_eq!(store.keys(), vec!["theme".to_string()]);
    }

    #[test]
    fn test_purge_expired_removes_only_stale_entries() {
        let clock = ManualClock::new(0);
        let (mut cache, store) = session_manager(ManagerConfig::default(), &clock);

        cache.set("old", &1, None, Some(Duration::from_millis(10)));
        cache.set("new", &2, None, Some(Duration::from_secs(60)));
        clock.advance(Duration::from_millis(10));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(store.keys(), vec!["cache_new".to_string()]);
    }

    #[test]
    fn test_with_backend_overrides_storage() {
        let config = ManagerConfig::default().with_storage(StorageNamespace::EphemeralMemory);
        let cache = CacheManager::with_backend(config, Box::new(SessionStore::new()));
        assert_eq!(cache.config().storage, StorageNamespace::SessionPersistent);
        assert_eq!(cache.stats().memory_item_count, 0);
    }
}
