//! Chunk Codec Module
//!
//! Splits payloads too large for a single backend write into a manifest plus
//! numbered chunk records, and reassembles them on read. A manifest and its
//! chunks live and die together.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::codec;
use crate::cache::entry::{is_fresh, CacheEntry};
use crate::error::{CacheError, Result};
use crate::storage::{Record, StorageBackend};

const MIB: usize = 1024 * 1024;

// == Public Constants ==
/// Largest payload written as a single record
pub const MAX_WRITE_SIZE: usize = 4 * MIB;

/// Size of each chunk record
pub const CHUNK_SIZE: usize = 2 * MIB;

/// Chunk sets larger than this are refused
pub const MAX_CHUNKS: usize = 10;

const META_SUFFIX: &str = "_meta";
const CHUNK_INFIX: &str = "_chunk_";

// == Chunk Manifest ==
/// Describes how to reassemble a chunked entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkManifest {
    pub chunk_count: usize,
    pub timestamp: i64,
    pub ttl: u64,
    pub key: String,
    pub compressed: bool,
}

impl ChunkManifest {
    pub fn is_valid_at(&self, now: i64) -> bool {
        is_fresh(self.timestamp, self.ttl, now)
    }
}

// == Key Derivation ==
/// Raw key of the manifest for `raw_key`.
pub fn meta_key(raw_key: &str) -> String {
    format!("{}{}", raw_key, META_SUFFIX)
}

/// Raw key of chunk `index` for `raw_key`.
pub fn chunk_key(raw_key: &str, index: usize) -> String {
    format!("{}{}{}", raw_key, CHUNK_INFIX, index)
}

/// If `key` names a chunk, returns the raw key it belongs to.
pub fn chunk_owner(key: &str) -> Option<&str> {
    let at = key.rfind(CHUNK_INFIX)?;
    let index = &key[at + CHUNK_INFIX.len()..];
    if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) {
        Some(&key[..at])
    } else {
        None
    }
}

/// If `key` names a manifest, returns the raw key it belongs to.
pub fn manifest_owner(key: &str) -> Option<&str> {
    key.strip_suffix(META_SUFFIX)
}

// == Split ==
/// Number of chunks a payload of `len` bytes needs.
pub fn chunk_count(len: usize) -> usize {
    len.div_ceil(CHUNK_SIZE)
}

/// Cuts `body` into slices of `size` bytes on character boundaries.
///
/// A character straddling a cut stays with the earlier slice, so slices may
/// run up to three bytes over `size` and there are never more than
/// [`chunk_count`] of them.
pub fn split(body: &str, size: usize) -> Vec<&str> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(body.len().div_ceil(size));
    let mut rest = body;
    while !rest.is_empty() {
        let mut end = size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end += 1;
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// Splits `body` for `raw_key`, refusing sets larger than [`MAX_CHUNKS`].
pub fn plan<'a>(raw_key: &str, body: &'a str) -> Result<Vec<&'a str>> {
    let planned = chunk_count(body.len());
    if planned > MAX_CHUNKS {
        return Err(CacheError::CapacityExceeded {
            key: raw_key.to_string(),
            chunks: planned,
            max: MAX_CHUNKS,
        });
    }
    Ok(split(body, CHUNK_SIZE))
}

// == Store ==
/// Writes the manifest, then every chunk in order.
///
/// On failure whatever part of the set was written is removed again before
/// the error is returned.
pub fn store(
    backend: &mut dyn StorageBackend,
    raw_key: &str,
    manifest: &ChunkManifest,
    chunks: &[String],
) -> Result<()> {
    let meta = serde_json::to_string(manifest).map_err(|e| CacheError::Serialization(e.to_string()))?;
    backend.write(&meta_key(raw_key), Record::Text(meta))?;

    for (index, chunk) in chunks.iter().enumerate() {
        if let Err(e) = backend.write(&chunk_key(raw_key, index), Record::Text(chunk.clone())) {
            remove(backend, raw_key, Some(index));
            return Err(e);
        }
    }

    debug!(key = raw_key, chunks = chunks.len(), "Stored chunked entry");
    Ok(())
}

// == Remove ==
/// Deletes the manifest and chunks of `raw_key`.
///
/// `count` is the number of chunks to delete; when unknown it is taken from
/// the manifest, and if that is unreadable every `<raw_key>_chunk_<n>` key is
/// deleted.
pub fn remove(backend: &mut dyn StorageBackend, raw_key: &str, count: Option<usize>) {
    let meta = meta_key(raw_key);
    let count = match count {
        Some(count) => Some(count),
        None => read_manifest(&*backend, raw_key)
            .ok()
            .flatten()
            .map(|m| m.chunk_count)
            .filter(|&count| count <= MAX_CHUNKS),
    };

    match count {
        Some(count) => {
            for index in 0..count {
                backend.remove(&chunk_key(raw_key, index));
            }
        }
        None => {
            let orphans = backend.enumerate_keys(&|key: &str| chunk_owner(key) == Some(raw_key));
            for key in orphans {
                backend.remove(&key);
            }
        }
    }
    backend.remove(&meta);
}

// == Load ==
/// Reads the manifest stored for `raw_key`, if any.
pub fn read_manifest(backend: &dyn StorageBackend, raw_key: &str) -> Result<Option<ChunkManifest>> {
    let meta = meta_key(raw_key);
    match backend.read(&meta) {
        None => Ok(None),
        Some(record) => {
            let text = record.into_text()?;
            serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| CacheError::corrupted(meta, e))
        }
    }
}

/// Reassembles the chunked entry stored for `raw_key`.
///
/// Returns `Ok(None)` when there is no manifest or it has expired. A corrupt
/// manifest, a missing chunk, or an unparseable payload removes the whole set
/// and is reported as an error.
pub fn load<T: DeserializeOwned>(
    backend: &mut dyn StorageBackend,
    raw_key: &str,
    now: i64,
) -> Result<Option<CacheEntry<T>>> {
    let manifest = match read_manifest(&*backend, raw_key) {
        Ok(Some(manifest)) => manifest,
        Ok(None) => return Ok(None),
        Err(e) => {
            remove(backend, raw_key, None);
            return Err(e);
        }
    };

    if manifest.chunk_count > MAX_CHUNKS {
        remove(backend, raw_key, None);
        return Err(CacheError::corrupted(
            meta_key(raw_key),
            format!("manifest claims {} chunks", manifest.chunk_count),
        ));
    }

    if !manifest.is_valid_at(now) {
        debug!(key = raw_key, "Chunked entry expired");
        remove(backend, raw_key, Some(manifest.chunk_count));
        return Ok(None);
    }

    let mut body = String::with_capacity(manifest.chunk_count * CHUNK_SIZE);
    for index in 0..manifest.chunk_count {
        let chunk = backend
            .read(&chunk_key(raw_key, index))
            .map(Record::into_text)
            .transpose();
        match chunk {
            Ok(Some(text)) => body.push_str(&text),
            Ok(None) => {
                warn!(key = raw_key, index, "Chunk missing, purging chunked entry");
                remove(backend, raw_key, Some(manifest.chunk_count));
                return Err(CacheError::ChunkIncomplete {
                    key: raw_key.to_string(),
                    index,
                });
            }
            Err(e) => {
                remove(backend, raw_key, Some(manifest.chunk_count));
                return Err(e);
            }
        }
    }

    match codec::decode_body(raw_key, &body, manifest.compressed) {
        Ok(entry) => Ok(Some(entry)),
        Err(e) => {
            remove(backend, raw_key, Some(manifest.chunk_count));
            Err(e)
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SessionStore;
    use std::time::Duration;

    fn manifest(chunk_count: usize) -> ChunkManifest {
        ChunkManifest {
            chunk_count,
            timestamp: 1_000,
            ttl: 60_000,
            key: "big".to_string(),
            compressed: false,
        }
    }

    fn store_entry(backend: &mut SessionStore, data: &str) -> usize {
        let entry = CacheEntry::new("big", data.to_string(), 1_000, Duration::from_secs(60));
        let text = codec::serialize(&entry).unwrap();
        let chunks: Vec<String> = plan("cache_big", &text)
            .unwrap()
            .into_iter()
            .map(str::to_string)
            .collect();
        store(backend, "cache_big", &manifest(chunks.len()), &chunks).unwrap();
        chunks.len()
    }

    #[test]
    fn test_key_derivation() {
        assert_eq!(meta_key("cache_x"), "cache_x_meta");
        assert_eq!(chunk_key("cache_x", 3), "cache_x_chunk_3");
        assert_eq!(chunk_owner("cache_x_chunk_3"), Some("cache_x"));
        assert_eq!(chunk_owner("cache_x_chunk_"), None);
        assert_eq!(chunk_owner("cache_x_chunk_a"), None);
        assert_eq!(manifest_owner("cache_x_meta"), Some("cache_x"));
        assert_eq!(manifest_owner("cache_x"), None);
    }

    #[test]
    fn test_manifest_field_names() {
        let text = serde_json::to_string(&manifest(3)).unwrap();
        assert_eq!(
            text,
            r#"{"chunkCount":3,"timestamp":1000,"ttl":60000,"key":"big","compressed":false}"#
        );
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE + 1), 2);
        assert_eq!(chunk_count(10 * CHUNK_SIZE), 10);
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let body = "aé€😀b";
        let chunks = split(body, 2);
        assert_eq!(chunks.concat(), body);
        assert_eq!(chunks, vec!["aé", "€", "😀", "b"]);

        assert_eq!(split("abcdef", 4), vec!["abcd", "ef"]);
        assert!(split("", 4).is_empty());
    }

    #[test]
    fn test_plan_multibyte_payload_at_chunk_limit() {
        // 3-byte characters straddle every 2 MiB cut
        let body = "€".repeat(MAX_CHUNKS * CHUNK_SIZE / 3);
        assert_eq!(chunk_count(body.len()), MAX_CHUNKS);

        let chunks = plan("cache_euro", &body).unwrap();
        assert_eq!(chunks.len(), MAX_CHUNKS);
        assert_eq!(chunks.concat(), body);
    }

    #[test]
    fn test_plan_refuses_too_many_chunks() {
        let body = "x".repeat(MAX_CHUNKS * CHUNK_SIZE + 1);
        let result = plan("cache_huge", &body);
        assert!(matches!(
            result,
            Err(CacheError::CapacityExceeded { chunks: 11, max: 10, .. })
        ));

        let body = "x".repeat(MAX_CHUNKS * CHUNK_SIZE);
        assert_eq!(plan("cache_huge", &body).unwrap().len(), MAX_CHUNKS);
    }

    #[test]
    fn test_store_and_load_roundtrip() {
        let mut backend = SessionStore::new();
        let data = "y".repeat(MAX_WRITE_SIZE + 100);
        let count = store_entry(&mut backend, &data);
        assert_eq!(count, 3);

        let entry: CacheEntry<String> = load(&mut backend, "cache_big", 2_000).unwrap().unwrap();
        assert_eq!(entry.data, data);
    }

    #[test]
    fn test_load_without_manifest_is_miss() {
        let mut backend = SessionStore::new();
        let result = load::<String>(&mut backend, "cache_none", 0).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_load_expired_purges_everything() {
        let mut backend = SessionStore::new();
        store_entry(&mut backend, &"z".repeat(MAX_WRITE_SIZE));

        let result = load::<String>(&mut backend, "cache_big", 61_000).unwrap();
        assert!(result.is_none());
        assert!(backend.keys().is_empty());
    }

    #[test]
    fn test_missing_chunk_purges_set() {
        let mut backend = SessionStore::new();
        store_entry(&mut backend, &"q".repeat(MAX_WRITE_SIZE + 1));
        backend.remove(&chunk_key("cache_big", 1));

        let result = load::<String>(&mut backend, "cache_big", 2_000);
        assert!(matches!(
            result,
            Err(CacheError::ChunkIncomplete { index: 1, .. })
        ));
        assert!(backend.keys().is_empty());
    }

    #[test]
    fn test_corrupt_manifest_purges_orphans() {
        let mut backend = SessionStore::new();
        backend.write("cache_big_meta", Record::Text("{broken".into())).unwrap();
        backend.write("cache_big_chunk_0", Record::Text("a".into())).unwrap();
        backend.write("cache_big_chunk_1", Record::Text("b".into())).unwrap();
        backend.write("cache_other", Record::Text("keep".into())).unwrap();

        let result = load::<String>(&mut backend, "cache_big", 0);
        assert!(matches!(result, Err(CacheError::ParseCorruption { .. })));
        assert_eq!(backend.keys(), vec!["cache_other".to_string()]);
    }

    #[test]
    fn test_failed_chunk_write_leaves_nothing() {
        let mut backend = SessionStore::with_quota(3 * 1024);
        let chunks = vec!["a".repeat(1024), "b".repeat(1024), "c".repeat(1024)];

        let result = store(&mut backend, "cache_big", &manifest(3), &chunks);
        assert!(matches!(result, Err(CacheError::QuotaExceeded(_))));
        assert!(backend.keys().is_empty());
        assert_eq!(backend.used_bytes(), 0);
    }
}
