//! Cache Store Module
//!
//! The cache engine: commits entries, serves reads, and schedules
//! expiration scans, expired-entry batches and over-capacity compaction on
//! the background executor.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_queue::SegQueue;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

use crate::cache::compaction;
use crate::cache::entry::{CacheEntry, Entry, EvictionReason};
use crate::cache::linked;
use crate::cache::state::CoherentState;
use crate::cache::stats::{MemoryCacheStatistics, StatsRegistry};
use crate::cache::{CacheKey, EXPIRED_BATCH_SIZE, MAX_SIZE_UPDATE_RETRIES};
use crate::clock::{duration_ticks, to_ticks};
use crate::config::MemoryCacheOptions;
use crate::error::{CacheError, Result};
use crate::tasks::{Executor, OwnedRuntime};

/// Time the expired-entry batch task waits so more entries can queue up.
const EXPIRED_BATCH_DELAY: Duration = Duration::from_millis(100);

// == Cache Inner ==
/// State shared by every handle of one cache, its entries under
/// construction and its background tasks.
pub(crate) struct CacheInner<K, V> {
    options: MemoryCacheOptions,
    state: ArcSwap<CoherentState<K, V>>,
    disposed: AtomicBool,
    /// Ticks of the last scheduled expiration scan
    last_expiration_scan: AtomicI64,
    scan_frequency: i64,
    stats: Option<StatsRegistry>,
    expired_queue: SegQueue<Arc<Entry<K, V>>>,
    processing_expired: AtomicBool,
    compaction_gate: Arc<Semaphore>,
    executor: Executor,
}

impl<K, V> CacheInner<K, V>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    fn new(options: MemoryCacheOptions, executor: Executor) -> Self {
        let now = to_ticks(options.clock().now());
        let scan_frequency = duration_ticks(options.expiration_scan_frequency());
        let stats = options.track_statistics().then(StatsRegistry::new);

        Self {
            options,
            state: ArcSwap::from_pointee(CoherentState::new()),
            disposed: AtomicBool::new(false),
            last_expiration_scan: AtomicI64::new(now),
            scan_frequency,
            stats,
            expired_queue: SegQueue::new(),
            processing_expired: AtomicBool::new(false),
            compaction_gate: Arc::new(Semaphore::new(1)),
            executor,
        }
    }

    fn now(&self) -> i64 {
        to_ticks(self.options.clock().now())
    }

    fn tracks_size(&self) -> bool {
        self.options.size_limit().is_some()
    }

    pub(crate) fn tracks_linked_entries(&self) -> bool {
        self.options.track_linked_entries()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn check_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(CacheError::ObjectDisposed);
        }
        Ok(())
    }

    // == Commit ==
    /// Publishes a committed entry, replacing any entry under the same key.
    pub(crate) fn set_entry(self: &Arc<Self>, entry: &Arc<Entry<K, V>>) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }

        if self.tracks_size() && entry.size() < 0 {
            return Err(CacheError::invalid(
                "cache entry must specify a size when a size limit is set",
            ));
        }

        let now = self.now();
        entry.apply_relative_expiration(now);
        entry.touch(now);

        // Clear may swap the state while this commit is in flight.
        let state = self.state.load_full();
        let prior = state.get(entry.key());
        if let Some(prior) = &prior {
            prior.set_expired(EvictionReason::Replaced);
        }

        if entry.check_expired(now) {
            trace!(key = ?entry.key(), "entry already expired at commit");
            entry.invoke_eviction_callbacks(&self.executor);
            if let Some(prior) = &prior {
                state.remove_entry(prior, self.tracks_size(), &self.executor);
            }
        } else if self.update_size_exceeds_capacity(&state, entry, prior.as_ref()) {
            trace!(key = ?entry.key(), size = entry.size(), "entry rejected over capacity");
            entry.set_expired(EvictionReason::Capacity);
            self.trigger_overcapacity_compaction();
            entry.invoke_eviction_callbacks(&self.executor);
            if let Some(prior) = &prior {
                state.remove_entry(prior, self.tracks_size(), &self.executor);
            }
        } else {
            if state.insert_or_replace(entry, prior.as_ref()) {
                trace!(key = ?entry.key(), replaced = prior.is_some(), "entry committed");
                self.attach_expiration_tokens(entry);
            } else {
                trace!(key = ?entry.key(), "concurrent writer won the key");
                if self.tracks_size() {
                    let prior_size = prior.as_ref().map_or(0, |prior| prior.size());
                    state.add_size(prior_size - entry.size());
                }
                entry.set_expired(EvictionReason::Replaced);
                entry.invoke_eviction_callbacks(&self.executor);
            }

            if let Some(prior) = &prior {
                prior.invoke_eviction_callbacks(&self.executor);
            }
        }

        self.start_scan_for_expired_items_if_needed(now);
        Ok(())
    }

    /// Reserves the size delta of replacing `prior` with `entry`. Returns
    /// `true`, leaving the size untouched, when the result would not fit.
    fn update_size_exceeds_capacity(
        &self,
        state: &CoherentState<K, V>,
        entry: &Entry<K, V>,
        prior: Option<&Arc<Entry<K, V>>>,
    ) -> bool {
        let Some(limit) = self.options.size_limit() else {
            return false;
        };

        let mut read = state.size();
        for _ in 0..MAX_SIZE_UPDATE_RETRIES {
            let mut new_size = read.saturating_add(entry.size());
            if let Some(prior) = prior {
                new_size = new_size.saturating_sub(prior.size());
            }

            if new_size < 0 || new_size > limit {
                return true;
            }

            match state.compare_exchange_size(read, new_size) {
                Ok(_) => return false,
                Err(actual) => read = actual,
            }
        }

        debug!(retries = MAX_SIZE_UPDATE_RETRIES, "size update contended, treating as over capacity");
        true
    }

    fn attach_expiration_tokens(self: &Arc<Self>, entry: &Arc<Entry<K, V>>) {
        let cache = Arc::downgrade(self);
        let expired = Arc::downgrade(entry);
        entry.attach_tokens(move || {
            let Some(entry) = expired.upgrade() else {
                return;
            };
            entry.set_expired(EvictionReason::TokenExpired);
            if let Some(cache) = cache.upgrade() {
                cache.entry_expired(entry);
            }
        });
    }

    // == Read ==
    fn try_get(self: &Arc<Self>, key: &K) -> Result<Option<Arc<V>>> {
        self.check_disposed()?;

        let now = self.now();
        let state = self.state.load_full();
        if let Some(entry) = state.get(key) {
            // A replaced entry may still be read while its successor is being published.
            if !entry.check_expired(now) || entry.eviction_reason() == EvictionReason::Replaced {
                entry.touch(now);
                let value = entry.value();

                if self.tracks_linked_entries() {
                    if let Some(parent) = linked::current() {
                        entry.propagate_options_to(parent.as_ref());
                    }
                }

                self.start_scan_for_expired_items_if_needed(now);
                if let Some(stats) = &self.stats {
                    stats.record_hit();
                }
                return Ok(value);
            }

            state.remove_entry(&entry, self.tracks_size(), &self.executor);
        }

        self.start_scan_for_expired_items_if_needed(now);
        if let Some(stats) = &self.stats {
            stats.record_miss();
        }
        Ok(None)
    }

    // == Remove ==
    fn remove(self: &Arc<Self>, key: &K) -> Result<()> {
        self.check_disposed()?;

        let state = self.state.load_full();
        if let Some(entry) = state.remove_key(key) {
            if self.tracks_size() {
                state.add_size(-entry.size());
            }
            entry.set_expired(EvictionReason::Removed);
            entry.invoke_eviction_callbacks(&self.executor);
        }

        self.start_scan_for_expired_items_if_needed(self.now());
        Ok(())
    }

    // == Clear ==
    fn clear(&self) -> Result<()> {
        self.check_disposed()?;

        let abandoned = self.state.swap(Arc::new(CoherentState::new()));
        let entries = abandoned.snapshot();
        for entry in &entries {
            entry.set_expired(EvictionReason::Removed);
            entry.invoke_eviction_callbacks(&self.executor);
        }

        debug!(cleared = entries.len(), "cache cleared");
        Ok(())
    }

    // == Compaction ==
    fn compact(&self, percentage: f64) -> Result<()> {
        self.check_disposed()?;
        if !(0.0..=1.0).contains(&percentage) {
            return Err(CacheError::invalid(format!(
                "compaction percentage must be between 0 and 1 inclusive, got {percentage}"
            )));
        }

        let state = self.state.load_full();
        let target = (state.count() as f64 * percentage) as i64;
        let outcome = compaction::compact(
            &state,
            target,
            |_| 1,
            self.now(),
            self.tracks_size(),
            &self.executor,
        )?;

        info!(
            target,
            selected = outcome.selected,
            removed = outcome.removed,
            "manual compaction finished"
        );
        Ok(())
    }

    fn trigger_overcapacity_compaction(self: &Arc<Self>) {
        let Ok(permit) = Arc::clone(&self.compaction_gate).try_acquire_owned() else {
            trace!("compaction already running");
            return;
        };

        let cache = Arc::clone(self);
        self.executor.execute(move || {
            let _permit = permit;
            cache.overcapacity_compaction();
        });
    }

    fn overcapacity_compaction(&self) {
        let Some(low_watermark) = self.options.low_watermark() else {
            return;
        };

        let state = self.state.load_full();
        let current = state.size();
        if current <= low_watermark {
            return;
        }

        match compaction::compact(
            &state,
            current - low_watermark,
            |entry| entry.size(),
            self.now(),
            true,
            &self.executor,
        ) {
            Ok(outcome) => info!(
                size_before = current,
                low_watermark,
                selected = outcome.selected,
                removed = outcome.removed,
                reclaimed = outcome.reclaimed,
                "over-capacity compaction finished"
            ),
            Err(err) => warn!(error = %err, "over-capacity compaction failed"),
        }
    }

    // == Expiration Scan ==
    fn start_scan_for_expired_items_if_needed(self: &Arc<Self>, now: i64) {
        let last = self.last_expiration_scan.load(Ordering::Acquire);
        if now.saturating_sub(last) <= self.scan_frequency {
            return;
        }

        // Only the caller that moves the timestamp schedules a scan.
        if self
            .last_expiration_scan
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let cache = Arc::clone(self);
        self.executor.execute(move || {
            cache.scan_for_expired_items();
        });
    }

    /// Removes every entry that is expired now. Returns how many were removed.
    pub(crate) fn scan_for_expired_items(&self) -> usize {
        let now = self.now();
        self.last_expiration_scan.fetch_max(now, Ordering::AcqRel);

        let state = self.state.load_full();
        let mut removed = 0;
        for entry in state.snapshot() {
            if entry.check_expired(now) && state.remove_entry(&entry, self.tracks_size(), &self.executor)
            {
                removed += 1;
            }
        }

        debug!(removed, remaining = state.count(), "expiration scan finished");
        removed
    }

    // == Expired Batches ==
    /// Queues an entry whose expiration token fired for batched removal.
    fn entry_expired(self: &Arc<Self>, entry: Arc<Entry<K, V>>) {
        self.expired_queue.push(entry);
        self.process_batch_if_needed();
    }

    fn process_batch_if_needed(self: &Arc<Self>) {
        if self.expired_queue.is_empty() {
            return;
        }
        if self
            .processing_expired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let cache = Arc::clone(self);
        let _detached = self.executor.spawn(async move {
            tokio::time::sleep(EXPIRED_BATCH_DELAY).await;
            cache.process_expired_batch();
        });
    }

    fn process_expired_batch(self: &Arc<Self>) {
        let state = self.state.load_full();
        let mut removed = 0;
        for _ in 0..EXPIRED_BATCH_SIZE {
            let Some(entry) = self.expired_queue.pop() else {
                break;
            };
            if state.remove_entry(&entry, self.tracks_size(), &self.executor) {
                removed += 1;
            }
        }
        debug!(removed, "expired entry batch processed");

        self.processing_expired.store(false, Ordering::Release);
        self.process_batch_if_needed();
    }

    // == Statistics ==
    fn statistics(&self) -> Option<MemoryCacheStatistics> {
        let stats = self.stats.as_ref()?;
        let (total_hits, total_misses) = stats.totals();
        let state = self.state.load();

        Some(MemoryCacheStatistics {
            total_hits,
            total_misses,
            current_entry_count: state.count(),
            current_estimated_size: self.tracks_size().then(|| state.size()),
        })
    }
}

// == Memory Cache ==
/// Thread-safe in-memory cache.
///
/// Cloning is cheap and every clone shares the same entries. Background work
/// runs on the surrounding multi-threaded tokio runtime when there is one,
/// otherwise on a small runtime owned by the cache.
pub struct MemoryCache<K, V>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    inner: Arc<CacheInner<K, V>>,
    _runtime: Option<Arc<OwnedRuntime>>,
}

impl<K, V> MemoryCache<K, V>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    // == Constructor ==
    pub fn new(options: MemoryCacheOptions) -> Result<Self> {
        let (executor, runtime) = Executor::current_or_owned()?;
        debug!(
            size_limit = ?options.size_limit(),
            track_statistics = options.track_statistics(),
            track_linked_entries = options.track_linked_entries(),
            "memory cache created"
        );

        Ok(Self {
            inner: Arc::new(CacheInner::new(options, executor)),
            _runtime: runtime.map(Arc::new),
        })
    }

    pub fn options(&self) -> &MemoryCacheOptions {
        &self.inner.options
    }

    /// Starts building an entry for `key`. The entry becomes visible once
    /// committed or dropped.
    pub fn create_entry(&self, key: K) -> Result<CacheEntry<K, V>> {
        self.inner.check_disposed()?;
        Ok(CacheEntry::new(key, Arc::clone(&self.inner)))
    }

    /// Returns the value for `key` if it is present and not expired.
    pub fn try_get(&self, key: &K) -> Result<Option<Arc<V>>> {
        self.inner.try_get(key)
    }

    /// Stores `value` under `key` with default entry options.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        let mut entry = self.create_entry(key)?;
        entry.set_value(value);
        entry.commit()
    }

    /// Returns the cached value, or builds and commits one with `factory`.
    ///
    /// The factory gets the entry under construction so it can set size,
    /// expiration and callbacks.
    pub fn get_or_insert_with<F>(&self, key: K, factory: F) -> Result<Arc<V>>
    where
        F: FnOnce(&mut CacheEntry<K, V>) -> V,
    {
        if let Some(value) = self.try_get(&key)? {
            return Ok(value);
        }

        let mut entry = self.create_entry(key)?;
        let value = Arc::new(factory(&mut entry));
        entry.set_shared_value(Arc::clone(&value));
        entry.commit()?;
        Ok(value)
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        self.inner.remove(key)
    }

    /// Drops every entry. Eviction callbacks fire with `Removed`.
    pub fn clear(&self) -> Result<()> {
        self.inner.clear()
    }

    /// Removes `percentage` of the entries by count, expired entries first,
    /// then by priority and least recent use.
    pub fn compact(&self, percentage: f64) -> Result<()> {
        self.inner.compact(percentage)
    }

    /// `None` unless statistics tracking is enabled.
    pub fn statistics(&self) -> Option<MemoryCacheStatistics> {
        self.inner.statistics()
    }

    pub fn count(&self) -> usize {
        self.inner.state.load().count()
    }

    /// Aggregate entry size. Only maintained with a size limit, and only
    /// eventually consistent with [`count`](Self::count).
    pub fn size(&self) -> i64 {
        self.inner.state.load().size()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.state.load().keys()
    }

    /// Marks the cache disposed. Later operations fail with
    /// [`CacheError::ObjectDisposed`], while commits of entries already
    /// under construction are ignored.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::AcqRel) {
            debug!("memory cache disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub(crate) fn downgrade(&self) -> Weak<CacheInner<K, V>> {
        Arc::downgrade(&self.inner)
    }
}

impl<K, V> Clone for MemoryCache<K, V>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _runtime: self._runtime.clone(),
        }
    }
}

impl<K, V> fmt::Debug for MemoryCache<K, V>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("count", &self.count())
            .field("size", &self.size())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::token::CancellationChangeToken;
    use std::thread;
    use std::time::Instant;

    fn cache() -> MemoryCache<String, String> {
        MemoryCache::new(MemoryCacheOptions::default()).unwrap()
    }

    fn sized_cache(limit: i64) -> MemoryCache<String, String> {
        MemoryCache::new(MemoryCacheOptions::new().with_size_limit(limit).unwrap()).unwrap()
    }

    fn put_sized(cache: &MemoryCache<String, String>, key: &str, size: i64) {
        let mut entry = cache.create_entry(key.to_string()).unwrap();
        entry.set_value(format!("value_{key}"));
        entry.set_size(size).unwrap();
        entry.commit().unwrap();
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_replace_updates_size() {
        let cache = sized_cache(100);
        put_sized(&cache, "key1", 10);
        put_sized(&cache, "key1", 4);

        assert_eq!(cache.count(), 1);
        assert_eq!(cache.size(), 4);
    }

    #[test]
    fn test_missing_size_rejected_with_limit() {
        let cache = sized_cache(100);
        let mut entry = cache.create_entry("key1".to_string()).unwrap();
        entry.set_value("value".to_string());

        assert!(matches!(entry.commit(), Err(CacheError::InvalidArgument(_))));
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn test_entry_over_limit_rejected() {
        let cache = sized_cache(10);
        put_sized(&cache, "small", 6);
        put_sized(&cache, "big", 6);

        assert!(cache.try_get(&"big".to_string()).unwrap().is_none());
        assert_eq!(cache.size(), 6);
    }

    #[test]
    fn test_replace_over_limit_removes_prior() {
        let cache = sized_cache(10);
        put_sized(&cache, "key1", 6);
        put_sized(&cache, "key1", 11);

        assert!(cache.try_get(&"key1".to_string()).unwrap().is_none());
        assert_eq!(cache.count(), 0);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_replaced_entry_still_readable() {
        let cache = cache();
        cache.insert("key1".to_string(), "old".to_string()).unwrap();

        let state = cache.inner.state.load_full();
        state
            .get(&"key1".to_string())
            .unwrap()
            .set_expired(EvictionReason::Replaced);

        assert_eq!(
            cache.try_get(&"key1".to_string()).unwrap().as_deref(),
            Some(&"old".to_string())
        );
    }

    #[test]
    fn test_removed_entry_not_readable() {
        let cache = cache();
        cache.insert("key1".to_string(), "old".to_string()).unwrap();

        let state = cache.inner.state.load_full();
        state
            .get(&"key1".to_string())
            .unwrap()
            .set_expired(EvictionReason::Removed);

        assert!(cache.try_get(&"key1".to_string()).unwrap().is_none());
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn test_token_expiry_removed_in_batch() {
        let cache = cache();
        let token = CancellationChangeToken::new();
        let mut entry = cache.create_entry("key1".to_string()).unwrap();
        entry.set_value("value".to_string());
        entry.add_expiration_token(Arc::new(token.clone()));
        entry.commit().unwrap();

        token.cancel();
        assert!(wait_until(|| cache.count() == 0));
        assert!(cache.inner.expired_queue.is_empty());
    }

    #[test]
    fn test_scan_removes_expired_entries() {
        let clock = Arc::new(ManualClock::default());
        let cache: MemoryCache<String, String> = MemoryCache::new(
            MemoryCacheOptions::new()
                .with_clock(clock.clone())
                .with_expiration_scan_frequency(Duration::from_secs(3600)),
        )
        .unwrap();

        let mut entry = cache.create_entry("key1".to_string()).unwrap();
        entry.set_value("value".to_string());
        entry
            .set_absolute_expiration_relative_to_now(Duration::from_secs(10))
            .unwrap();
        entry.commit().unwrap();
        cache.insert("key2".to_string(), "value".to_string()).unwrap();

        clock.advance(Duration::from_secs(11));
        assert_eq!(cache.inner.scan_for_expired_items(), 1);
        assert_eq!(cache.keys(), vec!["key2".to_string()]);
    }

    #[test]
    fn test_scan_scheduled_after_frequency() {
        let clock = Arc::new(ManualClock::default());
        let cache: MemoryCache<String, String> = MemoryCache::new(
            MemoryCacheOptions::new()
                .with_clock(clock.clone())
                .with_expiration_scan_frequency(Duration::from_secs(60)),
        )
        .unwrap();

        let mut entry = cache.create_entry("key1".to_string()).unwrap();
        entry.set_value("value".to_string());
        entry
            .set_absolute_expiration_relative_to_now(Duration::from_secs(10))
            .unwrap();
        entry.commit().unwrap();

        clock.advance(Duration::from_secs(61));
        cache.remove(&"unrelated".to_string()).unwrap();

        assert!(wait_until(|| cache.count() == 0));
    }

    #[test]
    fn test_dispose_ignores_pending_commit() {
        let cache = cache();
        let mut entry = cache.create_entry("key1".to_string()).unwrap();
        entry.set_value("value".to_string());

        cache.dispose();
        assert!(entry.commit().is_ok());
        assert_eq!(cache.count(), 0);
        assert!(matches!(
            cache.try_get(&"key1".to_string()),
            Err(CacheError::ObjectDisposed)
        ));
    }

    #[test]
    fn test_compact_rejects_out_of_range() {
        let cache = cache();
        assert!(matches!(
            cache.compact(1.1),
            Err(CacheError::InvalidArgument(_))
        ));
    }
}
