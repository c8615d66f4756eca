//! Compaction Module
//!
//! Selects and removes entries until a removal target is met. Expired
//! entries always go first; the rest are taken by priority bucket
//! (Low, Normal, High) and least recently used within a bucket.
//! `NeverRemove` entries are never selected.

use std::sync::Arc;

use crate::cache::entry::{CacheItemPriority, Entry, EvictionReason};
use crate::cache::state::CoherentState;
use crate::cache::CacheKey;
use crate::error::Result;
use crate::tasks::Executor;

/// A candidate with its access time read once, so sorting never observes a
/// value that changes under it.
type Candidate<K, V> = (i64, Arc<Entry<K, V>>);

// == Compaction Outcome ==
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CompactionOutcome {
    /// Entries selected for removal
    pub selected: usize,
    /// Entries actually removed from the map
    pub removed: usize,
    /// Sum of the measure over the selected entries
    pub reclaimed: i64,
}

// == Compact ==
/// Removes entries from `state` until `measure` summed over the selection
/// reaches `target`.
pub(crate) fn compact<K, V, M>(
    state: &CoherentState<K, V>,
    target: i64,
    measure: M,
    now: i64,
    track_size: bool,
    executor: &Executor,
) -> Result<CompactionOutcome>
where
    K: CacheKey,
    V: Send + Sync + 'static,
    M: Fn(&Entry<K, V>) -> i64,
{
    let mut selected: Vec<Arc<Entry<K, V>>> = Vec::new();
    let mut reclaimed = 0i64;

    let mut low: Vec<Candidate<K, V>> = Vec::new();
    let mut normal: Vec<Candidate<K, V>> = Vec::new();
    let mut high: Vec<Candidate<K, V>> = Vec::new();

    for entry in state.snapshot() {
        if entry.check_expired(now) {
            reclaimed += measure(&entry);
            selected.push(entry);
            continue;
        }

        match entry.priority()? {
            CacheItemPriority::Low => low.push((entry.last_accessed(), entry)),
            CacheItemPriority::Normal => normal.push((entry.last_accessed(), entry)),
            CacheItemPriority::High => high.push((entry.last_accessed(), entry)),
            CacheItemPriority::NeverRemove => {}
        }
    }

    for bucket in [low, normal, high] {
        if reclaimed >= target {
            break;
        }
        reclaimed = expire_bucket(bucket, target, reclaimed, &measure, &mut selected);
    }

    let mut removed = 0;
    for entry in &selected {
        if state.remove_entry(entry, track_size, executor) {
            removed += 1;
        }
    }

    Ok(CompactionOutcome {
        selected: selected.len(),
        removed,
        reclaimed,
    })
}

fn expire_bucket<K, V, M>(
    mut bucket: Vec<Candidate<K, V>>,
    target: i64,
    mut reclaimed: i64,
    measure: &M,
    selected: &mut Vec<Arc<Entry<K, V>>>,
) -> i64
where
    M: Fn(&Entry<K, V>) -> i64,
{
    bucket.sort_by_key(|(last_accessed, _)| *last_accessed);

    for (_, entry) in bucket {
        if reclaimed >= target {
            break;
        }
        entry.set_expired(EvictionReason::Capacity);
        reclaimed += measure(&entry);
        selected.push(entry);
    }
    reclaimed
}
