//! Cache Module
//!
//! Provides a key/value cache engine over pluggable storage backends, with
//! TTL expiration, transparent compression, chunking of large payloads and
//! oldest-first eviction.

mod chunk;
mod clock;
mod codec;
mod entry;
mod eviction;
mod key;
mod manager;
mod stats;


// Re-export public types
pub use chunk::{ChunkManifest, CHUNK_SIZE, MAX_CHUNKS, MAX_WRITE_SIZE};
pub use clock::{current_timestamp_ms, Clock, ManualClock, SystemClock};
pub use codec::{Envelope, COMPRESSION_RATIO, COMPRESSION_THRESHOLD};
pub use entry::CacheEntry;
pub use key::{full_key, Params, PARAM_SEPARATOR};
pub use manager::{raw_key, CacheManager, KEY_PREFIX};
pub use stats::{Counters, ManagerStats};
