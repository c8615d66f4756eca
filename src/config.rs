//! Configuration Module
//!
//! Options for a [`MemoryCache`](crate::cache::MemoryCache), built in code or
//! loaded from environment variables.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result};

const DEFAULT_COMPACTION_PERCENTAGE: f64 = 0.05;
const DEFAULT_SCAN_FREQUENCY: Duration = Duration::from_secs(60);

/// Cache configuration.
///
/// Fixed for the lifetime of the cache once passed to
/// [`MemoryCache::new`](crate::cache::MemoryCache::new).
#[derive(Debug, Clone)]
pub struct MemoryCacheOptions {
    /// Maximum aggregate entry size, in caller-defined units
    size_limit: Option<i64>,
    /// Share of the size limit freed by an over-capacity compaction
    compaction_percentage: f64,
    /// Minimum time between opportunistic expiration scans
    expiration_scan_frequency: Duration,
    /// Whether hit and miss counters are kept
    track_statistics: bool,
    /// Whether reads inside an entry under construction cascade into it
    track_linked_entries: bool,
    /// Time source for expiration
    clock: Arc<dyn Clock>,
}

impl MemoryCacheOptions {
    /// Creates options with every setting at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_SIZE_LIMIT` - Maximum aggregate size (default: unlimited)
    /// - `CACHE_COMPACTION_PERCENTAGE` - Compaction share, 0 to 1 (default: 0.05)
    /// - `CACHE_SCAN_FREQUENCY_MS` - Expiration scan frequency in ms (default: 60000)
    /// - `CACHE_TRACK_STATISTICS` - Keep hit/miss counters (default: false)
    /// - `CACHE_TRACK_LINKED_ENTRIES` - Cascade expiration into parents (default: false)
    ///
    /// Unparsable values fall back to the default; parsed values outside
    /// the accepted range are rejected.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();

        if let Some(limit) = env_value::<i64>("CACHE_SIZE_LIMIT") {
            options = options.with_size_limit(limit)?;
        }
        if let Some(percentage) = env_value::<f64>("CACHE_COMPACTION_PERCENTAGE") {
            options = options.with_compaction_percentage(percentage)?;
        }
        if let Some(millis) = env_value::<u64>("CACHE_SCAN_FREQUENCY_MS") {
            options = options.with_expiration_scan_frequency(Duration::from_millis(millis));
        }
        if let Some(track) = env_value::<bool>("CACHE_TRACK_STATISTICS") {
            options = options.with_track_statistics(track);
        }
        if let Some(track) = env_value::<bool>("CACHE_TRACK_LINKED_ENTRIES") {
            options = options.with_track_linked_entries(track);
        }

        Ok(options)
    }

    // == Builder ==

    pub fn with_size_limit(mut self, limit: i64) -> Result<Self> {
        if limit < 0 {
            return Err(CacheError::invalid(format!(
                "size limit must be non-negative, got {limit}"
            )));
        }
        self.size_limit = Some(limit);
        Ok(self)
    }

    pub fn without_size_limit(mut self) -> Self {
        self.size_limit = None;
        self
    }

    pub fn with_compaction_percentage(mut self, percentage: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&percentage) {
            return Err(CacheError::invalid(format!(
                "compaction percentage must be between 0 and 1 inclusive, got {percentage}"
            )));
        }
        self.compaction_percentage = percentage;
        Ok(self)
    }

    pub fn with_expiration_scan_frequency(mut self, frequency: Duration) -> Self {
        self.expiration_scan_frequency = frequency;
        self
    }

    pub fn with_track_statistics(mut self, track: bool) -> Self {
        self.track_statistics = track;
        self
    }

    pub fn with_track_linked_entries(mut self, track: bool) -> Self {
        self.track_linked_entries = track;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // == Accessors ==

    pub fn size_limit(&self) -> Option<i64> {
        self.size_limit
    }

    pub fn compaction_percentage(&self) -> f64 {
        self.compaction_percentage
    }

    pub fn expiration_scan_frequency(&self) -> Duration {
        self.expiration_scan_frequency
    }

    pub fn track_statistics(&self) -> bool {
        self.track_statistics
    }

    pub fn track_linked_entries(&self) -> bool {
        self.track_linked_entries
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Size the cache is compacted down to once it goes over the limit.
    pub(crate) fn low_watermark(&self) -> Option<i64> {
        self.size_limit
            .map(|limit| limit - (limit as f64 * self.compaction_percentage) as i64)
    }
}

impl Default for MemoryCacheOptions {
    fn default() -> Self {
        Self {
            size_limit: None,
            compaction_percentage: DEFAULT_COMPACTION_PERCENTAGE,
            expiration_scan_frequency: DEFAULT_SCAN_FREQUENCY,
            track_statistics: false,
            track_linked_entries: false,
            clock: Arc::new(SystemClock),
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
