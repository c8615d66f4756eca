//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check the entry state machine and the cache against a
//! simple model.

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::entry::Entry;
use crate::cache::{CacheItemPriority, EvictionReason, MemoryCache};
use crate::config::MemoryCacheOptions;

// == Strategies ==
/// Generates cache keys from a small space so operations collide
fn key_strategy() -> impl Strategy<Value = String> {
    "[a-e][0-9]".prop_map(|s| s)
}

fn value_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ]{1,32}".prop_map(|s| s)
}

fn reason_strategy() -> impl Strategy<Value = EvictionReason> {
    prop_oneof![
        Just(EvictionReason::Removed),
        Just(EvictionReason::Replaced),
        Just(EvictionReason::Expired),
        Just(EvictionReason::TokenExpired),
        Just(EvictionReason::Capacity),
    ]
}

fn priority_strategy() -> impl Strategy<Value = CacheItemPriority> {
    prop_oneof![
        Just(CacheItemPriority::Low),
        Just(CacheItemPriority::Normal),
        Just(CacheItemPriority::High),
        Just(CacheItemPriority::NeverRemove),
    ]
}

/// Generates a sequence of cache operations for testing
#[derive(Debug, Clone)]
enum CacheOp {
    Set { key: String, value: String, size: i64 },
    Get { key: String },
    Remove { key: String },
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (key_strategy(), value_strategy(), 0i64..16)
            .prop_map(|(key, value, size)| CacheOp::Set { key, value, size }),
        key_strategy().prop_map(|key| CacheOp::Get { key }),
        key_strategy().prop_map(|key| CacheOp::Remove { key }),
    ]
}

fn set(cache: &MemoryCache<String, String>, key: String, value: String, size: i64) {
    let mut entry = cache.create_entry(key).unwrap();
    entry.set_value(value);
    entry.set_size(size).unwrap();
    entry.commit().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    // Only the first eviction reason recorded on an entry sticks.
    #[test]
    fn prop_first_reason_wins(reasons in prop::collection::vec(reason_strategy(), 1..8)) {
        let entry: Entry<String, String> = Entry::new("key".to_string());
        for reason in &reasons {
            entry.set_expired(*reason);
        }

        prop_assert_eq!(entry.eviction_reason(), reasons[0]);
    }

    // Once a reason is set, no combination of time and policy revives the entry.
    #[test]
    fn prop_expired_stays_expired(
        reason in reason_strategy(),
        now in any::<i64>(),
        deadline in any::<i64>(),
        sliding in 1i64..i64::MAX,
    ) {
        let entry: Entry<String, String> = Entry::new("key".to_string());
        entry.set_absolute_expiration(deadline);
        entry.set_sliding_expiration(sliding);
        entry.touch(now);
        entry.set_expired(reason);

        prop_assert!(entry.check_expired(now));
        prop_assert!(entry.check_expired(now.saturating_sub(sliding)));
    }

    // Without expiration or capacity pressure, reads return the last write.
    #[test]
    fn prop_round_trip_matches_model(ops in prop::collection::vec(cache_op_strategy(), 1..60)) {
        let cache: MemoryCache<String, String> = MemoryCache::new(MemoryCacheOptions::default()).unwrap();
        let mut model: HashMap<String, String> = HashMap::new();

        for op in ops {
            match op {
                CacheOp::Set { key, value, size } => {
                    set(&cache, key.clone(), value.clone(), size);
                    model.insert(key, value);
                }
                CacheOp::Get { key } => {
                    let found = cache.try_get(&key).unwrap();
                    prop_assert_eq!(found.as_deref(), model.get(&key));
                }
                CacheOp::Remove { key } => {
                    cache.remove(&key).unwrap();
                    model.remove(&key);
                }
            }
        }

        prop_assert_eq!(cache.count(), model.len());
    }

    // Hit and miss counters match the number of each outcome.
    #[test]
    fn prop_statistics_accuracy(ops in prop::collection::vec(cache_op_strategy(), 1..60)) {
        let cache: MemoryCache<String, String> = MemoryCache::new(
            MemoryCacheOptions::new().with_track_statistics(true),
        )
        .unwrap();
        let mut expected_hits: u64 = 0;
        let mut expected_misses: u64 = 0;

        for op in ops {
            match op {
                CacheOp::Set { key, value, size } => set(&cache, key, value, size),
                CacheOp::Get { key } => match cache.try_get(&key).unwrap() {
                    Some(_) => expected_hits += 1,
                    None => expected_misses += 1,
                },
                CacheOp::Remove { key } => cache.remove(&key).unwrap(),
            }
        }

        let stats = cache.statistics().unwrap();
        prop_assert_eq!(stats.total_hits, expected_hits, "Hits mismatch");
        prop_assert_eq!(stats.total_misses, expected_misses, "Misses mismatch");
        prop_assert_eq!(stats.current_entry_count, cache.count(), "Entry count mismatch");
        prop_assert_eq!(stats.current_estimated_size, None);
    }

    // With a limit that is never reached, the aggregate size is the sum of
    // the live entries' sizes.
    #[test]
    fn prop_size_accounting(ops in prop::collection::vec(cache_op_strategy(), 1..60)) {
        let cache: MemoryCache<String, String> = MemoryCache::new(
            MemoryCacheOptions::new().with_size_limit(i64::MAX).unwrap(),
        )
        .unwrap();
        let mut model: HashMap<String, i64> = HashMap::new();

        for op in ops {
            match op {
                CacheOp::Set { key, value, size } => {
                    set(&cache, key.clone(), value, size);
                    model.insert(key, size);
                }
                CacheOp::Get { key } => {
                    let _ = cache.try_get(&key).unwrap();
                }
                CacheOp::Remove { key } => {
                    cache.remove(&key).unwrap();
                    model.remove(&key);
                }
            }
        }

        prop_assert_eq!(cache.size(), model.values().sum::<i64>());
        prop_assert_eq!(cache.count(), model.len());
    }

    // Manual compaction never evicts NeverRemove entries and removes at
    // most the requested share of the rest.
    #[test]
    fn prop_compaction_spares_never_remove(
        priorities in prop::collection::vec(priority_strategy(), 1..40),
        percentage in 0.0f64..=1.0,
    ) {
        let cache: MemoryCache<String, String> = MemoryCache::new(MemoryCacheOptions::default()).unwrap();
        for (index, priority) in priorities.iter().enumerate() {
            let mut entry = cache.create_entry(format!("key{index}")).unwrap();
            entry.set_value("value".to_string()).set_priority(*priority);
            entry.commit().unwrap();
        }

        cache.compact(percentage).unwrap();

        let pinned = priorities
            .iter()
            .filter(|priority| **priority == CacheItemPriority::NeverRemove)
            .count();
        let target = (priorities.len() as f64 * percentage) as usize;
        let keys = cache.keys();
        for (index, priority) in priorities.iter().enumerate() {
            if *priority == CacheItemPriority::NeverRemove {
                let expected_key = format!("key{}", index);
                prop_assert!(keys.contains(&expected_key));
            }
        }
        let expected_removed = target.min(priorities.len() - pinned);
        prop_assert_eq!(cache.count(), priorities.len() - expected_removed);
    }
}

#[test]
fn test_entry_shared_across_threads() {
    let entry: Arc<Entry<String, String>> = Arc::new(Entry::new("key".to_string()));
    let workers: Vec<_> = [EvictionReason::Removed, EvictionReason::Capacity]
        .into_iter()
        .map(|reason| {
            let entry = entry.clone();
            std::thread::spawn(move || entry.set_expired(reason))
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(matches!(
        entry.eviction_reason(),
        EvictionReason::Removed | EvictionReason::Capacity
    ));
}
