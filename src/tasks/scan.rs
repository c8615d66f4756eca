//! Expiration Scan Task
//!
//! Background task that periodically removes expired cache entries, for
//! caches that see too little traffic for the opportunistic scans to run.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheKey, MemoryCache};

/// Spawns a task on the current tokio runtime that sweeps expired entries
/// every `interval`.
///
/// The task only holds a weak reference, and ends on its own once every
/// handle to the cache is dropped or the cache is disposed. The returned
/// handle can be used to abort it earlier.
///
/// # Panics
/// Panics when called outside of a tokio runtime.
pub fn spawn_expiration_scan_task<K, V>(
    cache: &MemoryCache<K, V>,
    interval: Duration,
) -> JoinHandle<()>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    let cache = cache.downgrade();

    tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            "Starting expiration scan task"
        );

        loop {
            tokio::time::sleep(interval).await;

            let Some(inner) = cache.upgrade() else {
                debug!("Expiration scan: cache dropped, stopping");
                break;
            };
            if inner.is_disposed() {
                debug!("Expiration scan: cache disposed, stopping");
                break;
            }

            let removed = inner.scan_for_expired_items();
            if removed > 0 {
                info!(removed, "Expiration scan: removed expired entries");
            } else {
                debug!("Expiration scan: no expired entries found");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MemoryCacheOptions;
    use std::sync::Arc;

    fn cache_with_clock(clock: Arc<ManualClock>) -> MemoryCache<String, String> {
        MemoryCache::new(MemoryCacheOptions::new().with_clock(clock)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_task_removes_expired_entries() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with_clock(clock.clone());

        let mut entry = cache.create_entry("expire_soon".to_string()).unwrap();
        entry.set_value("value".to_string());
        entry
            .set_absolute_expiration_relative_to_now(Duration::from_secs(1))
            .unwrap();
        entry.commit().unwrap();

        let handle = spawn_expiration_scan_task(&cache, Duration::from_millis(20));
        clock.advance(Duration::from_secs(2));

        let mut remaining = cache.count();
        for _ in 0..100 {
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            remaining = cache.count();
        }
        assert_eq!(remaining, 0, "Expired entry should have been scanned out");

        handle.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_task_preserves_valid_entries() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with_clock(clock);
        cache
            .insert("long_lived".to_string(), "value".to_string())
            .unwrap();

        let handle = spawn_expiration_scan_task(&cache, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            cache.try_get(&"long_lived".to_string()).unwrap().as_deref(),
            Some(&"value".to_string())
        );
        handle.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_task_stops_when_cache_disposed() {
        let cache: MemoryCache<String, String> =
            MemoryCache::new(MemoryCacheOptions::default()).unwrap();
        let handle = spawn_expiration_scan_task(&cache, Duration::from_millis(10));

        cache.dispose();
        let finished = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(finished.is_ok(), "Task should stop after dispose");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_task_stops_when_cache_dropped() {
        let cache: MemoryCache<String, String> =
            MemoryCache::new(MemoryCacheOptions::default()).unwrap();
        let handle = spawn_expiration_scan_task(&cache, Duration::from_millis(10));

        drop(cache);
        let finished = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(finished.is_ok(), "Task should stop once the cache is gone");
    }

    #[tokio::test]
    async fn test_scan_task_can_be_aborted() {
        let cache: MemoryCache<String, String> =
            MemoryCache::new(MemoryCacheOptions::default()).unwrap();
        let handle = spawn_expiration_scan_task(&cache, Duration::from_secs(1));

        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
