//! Mini Cache - A pluggable key-value cache engine
//!
//! Caches serializable values under parameterized keys in memory, in a
//! process-wide session store or in a durable directory, with TTL expiration,
//! compression, chunking and oldest-first eviction.

pub mod cache;
pub mod config;
pub mod error;
pub mod storage;
pub mod tasks;

pub use cache::{CacheManager, Params};
pub use config::{ManagerConfig, StorageNamespace};
pub use error::CacheError;
pub use tasks::spawn_sweep_task;
