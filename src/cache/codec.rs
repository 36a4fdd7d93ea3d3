//! Entry Codec Module
//!
//! Serializes cache entries to text and applies the compression policy.
//! Compressed payloads are zstd frames carried as base64 inside an envelope.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::entry::CacheEntry;
use crate::error::{CacheError, Result};

// == Public Constants ==
/// Serialized size above which compression is attempted
pub const COMPRESSION_THRESHOLD: usize = 1024 * 1024; // 1 MiB

/// Compressed payload must be smaller than this fraction of the original
pub const COMPRESSION_RATIO: f64 = 0.8;

const ZSTD_LEVEL: i32 = 3;

// == Envelope ==
/// Wrapper marking a stored payload as compressed.
///
/// Carries the entry's timestamp and TTL in the clear so eviction scans can
/// order envelopes without decompressing them. Envelopes written without
/// them are still read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub compressed: bool,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl Envelope {
    fn wrap(data: String, stamp: Stamp) -> Self {
        Self {
            compressed: true,
            data,
            timestamp: Some(stamp.timestamp),
            ttl: Some(stamp.ttl),
        }
    }

    /// Stamp recorded in the envelope itself, if any.
    pub fn stamp(&self) -> Option<Stamp> {
        Some(Stamp {
            timestamp: self.timestamp?,
            ttl: self.ttl?,
        })
    }
}

// == Payload ==
/// Encoded entry ready for storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// Entry JSON, or base64 of the compressed entry JSON
    pub body: String,
    pub compressed: bool,
}

impl Payload {
    /// Length of the text [`Payload::into_stored`] produces.
    pub fn stored_len(&self, stamp: Stamp) -> usize {
        if !self.compressed {
            return self.body.len();
        }
        // base64 needs no escaping, so the shell length simply adds up
        let shell = serde_json::to_string(&Envelope::wrap(String::new(), stamp)).map_or(0, |s| s.len());
        self.body.len() + shell
    }

    /// Text written under the entry's own key.
    pub fn into_stored(self, stamp: Stamp) -> Result<String> {
        if !self.compressed {
            return Ok(self.body);
        }
        serde_json::to_string(&Envelope::wrap(self.body, stamp))
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

/// Timestamp and TTL of a stored record, for scans that skip the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Stamp {
    pub timestamp: i64,
    pub ttl: u64,
}

impl<T> From<&CacheEntry<T>> for Stamp {
    fn from(entry: &CacheEntry<T>) -> Self {
        Self {
            timestamp: entry.timestamp,
            ttl: entry.ttl,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredForm<T> {
    Envelope(Envelope),
    Plain(T),
}

// == Serialize ==
/// Canonical text form of an entry.
pub fn serialize<T: Serialize>(entry: &CacheEntry<T>) -> Result<String> {
    serde_json::to_string(entry).map_err(|e| CacheError::Serialization(e.to_string()))
}

// == Compression Policy ==
/// Compresses `text` when enabled, large enough, and worth it.
///
/// Any failure keeps the uncompressed text.
pub fn maybe_compress(text: String, enabled: bool) -> Payload {
    if !enabled || text.len() <= COMPRESSION_THRESHOLD {
        return Payload {
            body: text,
            compressed: false,
        };
    }

    match compress(&text) {
        Ok(encoded) if (encoded.len() as f64) < COMPRESSION_RATIO * text.len() as f64 => {
            debug!(
                original = text.len(),
                compressed = encoded.len(),
                "Payload compressed"
            );
            Payload {
                body: encoded,
                compressed: true,
            }
        }
        Ok(encoded) => {
            debug!(
                original = text.len(),
                compressed = encoded.len(),
                "Compression saved too little, storing uncompressed"
            );
            Payload {
                body: text,
                compressed: false,
            }
        }
        Err(e) => {
            warn!("Compression failed, storing uncompressed: {}", e);
            Payload {
                body: text,
                compressed: false,
            }
        }
    }
}

/// zstd-compresses `text` and base64-encodes the frame.
pub fn compress(text: &str) -> Result<String> {
    let frame = zstd::stream::encode_all(text.as_bytes(), ZSTD_LEVEL)
        .map_err(|e| CacheError::CompressionFailure(e.to_string()))?;
    Ok(STANDARD.encode(frame))
}

/// Reverses [`compress`].
pub fn decompress(data: &str) -> Result<String> {
    let frame = STANDARD
        .decode(data)
        .map_err(|e| CacheError::CompressionFailure(e.to_string()))?;
    let bytes = zstd::stream::decode_all(frame.as_slice())
        .map_err(|e| CacheError::CompressionFailure(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| CacheError::CompressionFailure(e.to_string()))
}

// == Decode ==
/// Decodes a record stored directly under `raw_key`.
///
/// Every failure, including a failed decompression, is reported as
/// `ParseCorruption` so the caller purges the record.
pub fn decode<T: DeserializeOwned>(raw_key: &str, stored: &str) -> Result<CacheEntry<T>> {
    decode_as::<CacheEntry<T>>(raw_key, stored)
}

/// Extracts timestamp and TTL without materializing the payload.
///
/// Envelopes carrying their own stamp are not decompressed.
pub fn read_stamp(raw_key: &str, stored: &str) -> Result<Stamp> {
    let parsed = serde_json::from_str::<StoredForm<Stamp>>(stored);
    if let Ok(StoredForm::Envelope(envelope)) = &parsed {
        if let (true, Some(stamp)) = (envelope.compressed, envelope.stamp()) {
            return Ok(stamp);
        }
    }
    resolve(raw_key, parsed)
}

/// Parses reassembled chunk text, decompressing it first when flagged.
pub fn decode_body<T: DeserializeOwned>(
    raw_key: &str,
    body: &str,
    compressed: bool,
) -> Result<CacheEntry<T>> {
    if compressed {
        let text = decompress(body).map_err(|e| CacheError::corrupted(raw_key, e))?;
        parse(raw_key, &text)
    } else {
        parse(raw_key, body)
    }
}

fn decode_as<T: DeserializeOwned>(raw_key: &str, stored: &str) -> Result<T> {
    resolve(raw_key, serde_json::from_str::<StoredForm<T>>(stored))
}

fn resolve<T: DeserializeOwned>(
    raw_key: &str,
    parsed: serde_json::Result<StoredForm<T>>,
) -> Result<T> {
    match parsed {
        Ok(StoredForm::Plain(value)) => Ok(value),
        Ok(StoredForm::Envelope(envelope)) if envelope.compressed => {
            let text = decompress(&envelope.data).map_err(|e| CacheError::corrupted(raw_key, e))?;
            parse(raw_key, &text)
        }
        Ok(StoredForm::Envelope(_)) => Err(CacheError::corrupted(
            raw_key,
            "envelope without compressed flag",
        )),
        Err(e) => Err(CacheError::corrupted(raw_key, e)),
    }
}

fn parse<T: DeserializeOwned>(raw_key: &str, text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| CacheError::corrupted(raw_key, e))
}
