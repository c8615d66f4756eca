//! Background Tasks Module
//!
//! Background work for the cache.
//!
//! # Tasks
//! - Executor: runs scans, compaction and eviction callbacks off the caller's thread
//! - Expiration Scan: optionally sweeps expired entries at a fixed interval

mod executor;
mod scan;

pub(crate) use executor::{Executor, OwnedRuntime};
pub use scan::spawn_expiration_scan_task;
