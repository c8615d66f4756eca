//! Cache Statistics Module
//!
//! Hit and miss counters sharded per calling thread. Each thread bumps its
//! own shard without contention; a snapshot sums the live shards plus an
//! accumulator that absorbs shards of threads that have exited.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

// == Memory Cache Statistics ==
/// Point-in-time snapshot of cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryCacheStatistics {
    /// Number of successful lookups
    pub total_hits: u64,
    /// Number of lookups that found nothing or an expired entry
    pub total_misses: u64,
    /// Entries currently in the cache
    pub current_entry_count: usize,
    /// Aggregate entry size, only reported when a size limit is configured
    pub current_estimated_size: Option<i64>,
}

impl MemoryCacheStatistics {
    // == Hit Rate ==
    /// Returns hits / (hits + misses), or 0.0 if no lookups have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_hits + self.total_misses;
        if total == 0 {
            0.0
        } else {
            self.total_hits as f64 / total as f64
        }
    }
}

// == Shards ==
#[derive(Debug, Default)]
struct StatsShard {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatsShard {
    fn totals(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    shards: Vec<Arc<StatsShard>>,
    retired_hits: u64,
    retired_misses: u64,
}

#[derive(Debug, Default)]
struct RegistryShared {
    state: Mutex<RegistryState>,
}

impl RegistryShared {
    fn register(&self, shard: Arc<StatsShard>) {
        self.state.lock().shards.push(shard);
    }

    /// Folds a departing shard into the accumulator.
    fn retire(&self, shard: &Arc<StatsShard>) {
        let mut state = self.state.lock();
        state.shards.retain(|other| !Arc::ptr_eq(other, shard));
        let (hits, misses) = shard.totals();
        state.retired_hits += hits;
        state.retired_misses += misses;
    }
}

/// A thread's handle on one registry's shard.
struct ShardHandle {
    shard: Arc<StatsShard>,
    owner: Weak<RegistryShared>,
}

impl Drop for ShardHandle {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.retire(&self.shard);
        }
    }
}

thread_local! {
    static SHARDS: RefCell<Vec<ShardHandle>> = const { RefCell::new(Vec::new()) };
}

#[derive(Clone, Copy)]
enum Counter {
    Hit,
    Miss,
}

// == Stats Registry ==
/// Per-cache statistics, sharded by thread.
#[derive(Debug, Default)]
pub(crate) struct StatsRegistry {
    shared: Arc<RegistryShared>,
}

impl StatsRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.record(Counter::Hit);
    }

    pub(crate) fn record_miss(&self) {
        self.record(Counter::Miss);
    }

    fn record(&self, counter: Counter) {
        let recorded = SHARDS.try_with(|shards| {
            let shard = self.local_shard(&mut shards.borrow_mut());
            bump(&shard, counter);
        });

        // Thread-local storage is gone while the thread is exiting.
        if recorded.is_err() {
            let mut state = self.shared.state.lock();
            match counter {
                Counter::Hit => state.retired_hits += 1,
                Counter::Miss => state.retired_misses += 1,
            }
        }
    }

    fn local_shard(&self, shards: &mut Vec<ShardHandle>) -> Arc<StatsShard> {
        let owner = Arc::as_ptr(&self.shared);
        if let Some(handle) = shards.iter().find(|handle| handle.owner.as_ptr() == owner) {
            return Arc::clone(&handle.shard);
        }

        // Drop handles of caches that no longer exist before growing.
        shards.retain(|handle| handle.owner.strong_count() > 0);

        let shard = Arc::new(StatsShard::default());
        self.shared.register(Arc::clone(&shard));
        shards.push(ShardHandle {
            shard: Arc::clone(&shard),
            owner: Arc::downgrade(&self.shared),
        });
        shard
    }

    /// Sums every live shard and the retired totals.
    pub(crate) fn totals(&self) -> (u64, u64) {
        let state = self.shared.state.lock();
        state.shards.iter().fold(
            (state.retired_hits, state.retired_misses),
            |(hits, misses), shard| {
                let (shard_hits, shard_misses) = shard.totals();
                (hits + shard_hits, misses + shard_misses)
            },
        )
    }
}

fn bump(shard: &StatsShard, counter: Counter) {
    match counter {
        Counter::Hit => shard.hits.fetch_add(1, Ordering::Relaxed),
        Counter::Miss => shard.misses.fetch_add(1, Ordering::Relaxed),
    };
}
