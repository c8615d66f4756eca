//! Cache Module
//!
//! Provides an in-process memory cache with absolute and sliding expiration,
//! change-token invalidation and priority-weighted compaction.

mod compaction;
mod entry;
mod linked;
mod state;
mod stats;
mod store;
mod tokens;

#[cfg(test)]
mod property_tests;

use std::fmt::Debug;
use std::hash::Hash;

// Re-export public types
pub use entry::{CacheEntry, CacheItemPriority, EvictionReason};
pub use stats::MemoryCacheStatistics;
pub use store::MemoryCache;

// == Public Constants ==
/// Upper bound on compare-and-swap attempts when reserving size
pub const MAX_SIZE_UPDATE_RETRIES: usize = 100;

/// Entries removed per pass of the expired-entry batch task
pub const EXPIRED_BATCH_SIZE: usize = 100;

// == Cache Key ==
/// Bound for cache keys.
pub trait CacheKey: Hash + Eq + Clone + Send + Sync + Debug + 'static {}

impl<T> CacheKey for T where T: Hash + Eq + Clone + Send + Sync + Debug + 'static {}
