//! Expiry Sweep Task
//!
//! Background task that periodically removes expired cache entries, so
//! entries nobody reads again do not linger in the backend until evicted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::CacheManager;

/// Spawns a background task that periodically purges expired entries.
///
/// The task runs in an infinite loop, sleeping for `interval` between sweeps
/// and holding the manager lock only while a sweep runs.
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during shutdown.
///
/// # Example
/// ```ignore
/// let cache = Arc::new(Mutex::new(CacheManager::new(ManagerConfig::from_env())?));
/// let sweep_handle = spawn_sweep_task(cache.clone(), Duration::from_secs(60));
/// // Later, during shutdown:
/// sweep_handle.abort();
/// ```
pub fn spawn_sweep_task(cache: Arc<Mutex<CacheManager>>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            "Starting expiry sweep task"
        );

        loop {
            tokio::time::sleep(interval).await;

            let removed = cache.lock().await.purge_expired();

            if removed > 0 {
                info!("Expiry sweep: removed {} expired entries", removed);
            } else {
                debug!("Expiry sweep: no expired entries found");
            }
        }
    })
}
