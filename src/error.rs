//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror. None of these errors reach
//! callers of `get`/`set`; the manager resolves each one to a safe default and
//! reports it on the tracing channel.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache engine.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Stored entry, envelope or manifest could not be parsed
    #[error("Corrupted record under '{key}': {reason}")]
    ParseCorruption { key: String, reason: String },

    /// A chunk belonging to a manifest is missing
    #[error("Chunk {index} of '{key}' is missing")]
    ChunkIncomplete { key: String, index: usize },

    /// Compressing or decompressing a payload failed
    #[error("Compression failed: {0}")]
    CompressionFailure(String),

    /// Payload would need more chunks than allowed
    #[error("Payload for '{key}' needs {chunks} chunks (max {max})")]
    CapacityExceeded {
        key: String,
        chunks: usize,
        max: usize,
    },

    /// Backend rejected a write for lack of space
    #[error("Storage quota exceeded writing '{0}'")]
    QuotaExceeded(String),

    /// Value could not be encoded into a storable form
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Backend I/O failure other than quota exhaustion
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    // == Constructors ==
    /// Builds a `ParseCorruption` error for the given raw key.
    pub fn corrupted(key: impl Into<String>, reason: impl ToString) -> Self {
        CacheError::ParseCorruption {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true when the error signals exhausted backend capacity.
    pub fn is_quota(&self) -> bool {
        matches!(self, CacheError::QuotaExceeded(_))
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;
