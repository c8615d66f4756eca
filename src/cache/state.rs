//! Coherent State Module
//!
//! The live key→entry map together with its aggregate size.
//!
//! The size is not updated atomically with the map; it only becomes
//! consistent with the contents once concurrent writers settle. `clear`
//! replaces the whole state instead of emptying it, so in-flight operations
//! holding the previous state finish against it without disturbing the
//! accounting of the new one.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use crate::cache::entry::Entry;
use crate::cache::CacheKey;
use crate::tasks::Executor;

// == Coherent State ==
pub(crate) struct CoherentState<K, V> {
    entries: DashMap<K, Arc<Entry<K, V>>>,
    size: AtomicI64,
}

impl<K, V> CoherentState<K, V>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            size: AtomicI64::new(0),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }

    /// Aggregate size of the entries. Eventually consistent with `count`.
    pub(crate) fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self, key: &K) -> Option<Arc<Entry<K, V>>> {
        self.entries.get(key).map(|found| Arc::clone(found.value()))
    }

    pub(crate) fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|item| item.key().clone()).collect()
    }

    /// Copies the current entries so callers can walk them while the map
    /// is being modified.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Entry<K, V>>> {
        self.entries.iter().map(|item| Arc::clone(item.value())).collect()
    }

    pub(crate) fn compare_exchange_size(&self, current: i64, new: i64) -> Result<i64, i64> {
        self.size
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    pub(crate) fn add_size(&self, delta: i64) {
        self.size.fetch_add(delta, Ordering::AcqRel);
    }

    /// Inserts `entry`, replacing `prior` if that is still the mapped entry.
    ///
    /// When `prior` has already vanished, falls back to a plain insert.
    /// Returns `false` when another writer's entry occupies the key.
    pub(crate) fn insert_or_replace(
        &self,
        entry: &Arc<Entry<K, V>>,
        prior: Option<&Arc<Entry<K, V>>>,
    ) -> bool {
        match self.entries.entry(entry.key().clone()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(Arc::clone(entry));
                true
            }
            MapEntry::Occupied(mut occupied) => match prior {
                Some(prior) if Arc::ptr_eq(occupied.get(), prior) => {
                    occupied.insert(Arc::clone(entry));
                    true
                }
                _ => false,
            },
        }
    }

    /// Removes `key` whatever entry it maps to.
    pub(crate) fn remove_key(&self, key: &K) -> Option<Arc<Entry<K, V>>> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    /// Removes `entry` only if the map still holds this exact instance,
    /// then releases its size and schedules its eviction callbacks.
    pub(crate) fn remove_entry(
        &self,
        entry: &Arc<Entry<K, V>>,
        track_size: bool,
        executor: &Executor,
    ) -> bool {
        let removed = self
            .entries
            .remove_if(entry.key(), |_, mapped| Arc::ptr_eq(mapped, entry))
            .is_some();

        if removed {
            if track_size {
                self.add_size(-entry.size());
            }
            entry.invoke_eviction_callbacks(executor);
        }
        removed
    }
}
