//! Mini Memcache - A thread-safe in-process memory cache
//!
//! Provides absolute and sliding expiration, change-token invalidation,
//! priority-weighted compaction under a size limit, and post-eviction
//! callbacks.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod tasks;
pub mod token;

pub use cache::{CacheEntry, CacheItemPriority, EvictionReason, MemoryCache, MemoryCacheStatistics};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MemoryCacheOptions;
pub use error::{CacheError, Result};
pub use tasks::spawn_expiration_scan_task;
pub use token::{on_change, CancellationChangeToken, ChangeRegistration, ChangeToken, PollingChangeToken};
