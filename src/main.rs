//! Mini Memcache - soak driver
//!
//! Hammers a size-limited cache from several tasks for a while and prints
//! the resulting statistics as JSON.

use std::env;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mini_memcache::{
    spawn_expiration_scan_task, CacheItemPriority, EvictionReason, MemoryCache,
    MemoryCacheOptions,
};

const WORKERS: u64 = 4;
const KEY_SPACE: u64 = 4_096;
const DEFAULT_SIZE_LIMIT: i64 = 1_024;
const DEFAULT_SOAK_SECONDS: u64 = 10;

/// Counters kept by the driver itself, next to the cache statistics.
#[derive(Debug, Default)]
struct SoakCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    capacity_evictions: AtomicU64,
    other_evictions: AtomicU64,
}

/// Main entry point for the soak driver.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load cache options from environment variables
/// 3. Start the periodic expiration scan
/// 4. Run worker tasks until the soak time elapses or Ctrl+C
/// 5. Print statistics
#[tokio::main]
async fn main() -> Result<()> {
    // Defaults to "mini_memcache=info", can be overridden with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mini_memcache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Mini Memcache soak run");

    let mut options = MemoryCacheOptions::from_env()
        .context("invalid cache configuration")?
        .with_track_statistics(true);
    if options.size_limit().is_none() {
        options = options.with_size_limit(DEFAULT_SIZE_LIMIT)?;
    }
    let soak_for = Duration::from_secs(
        env::var("SOAK_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SOAK_SECONDS),
    );
    info!(
        "Configuration loaded: size_limit={:?}, compaction_percentage={}, soak={}s",
        options.size_limit(),
        options.compaction_percentage(),
        soak_for.as_secs()
    );

    let cache: MemoryCache<u64, String> = MemoryCache::new(options)?;
    let scan_handle = spawn_expiration_scan_task(&cache, Duration::from_secs(1));

    let stop = Arc::new(AtomicBool::new(false));
    let counters = Arc::new(SoakCounters::default());
    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            tokio::spawn(run_worker(
                cache.clone(),
                worker,
                stop.clone(),
                counters.clone(),
            ))
        })
        .collect();

    tokio::select! {
        _ = tokio::time::sleep(soak_for) => info!("Soak time elapsed"),
        _ = signal::ctrl_c() => info!("Received Ctrl+C, stopping workers..."),
    }

    stop.store(true, Ordering::Release);
    for worker in workers {
        match worker.await {
            Ok(Err(err)) => warn!("Worker failed: {}", err),
            Err(err) => warn!("Worker panicked: {}", err),
            Ok(Ok(())) => {}
        }
    }
    scan_handle.abort();

    let stats = cache
        .statistics()
        .context("statistics tracking is enabled")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    info!(
        hit_rate = stats.hit_rate(),
        reads = counters.reads.load(Ordering::Relaxed),
        writes = counters.writes.load(Ordering::Relaxed),
        capacity_evictions = counters.capacity_evictions.load(Ordering::Relaxed),
        other_evictions = counters.other_evictions.load(Ordering::Relaxed),
        "Soak run complete"
    );

    cache.dispose();
    Ok(())
}

/// Reads a pseudo-random key and fills it on a miss.
async fn run_worker(
    cache: MemoryCache<u64, String>,
    worker: u64,
    stop: Arc<AtomicBool>,
    counters: Arc<SoakCounters>,
) -> mini_memcache::Result<()> {
    let mut seed = 0x9E37_79B9_7F4A_7C15 ^ (worker + 1);
    let mut iteration: u64 = 0;

    while !stop.load(Ordering::Acquire) {
        seed = xorshift(seed);
        let key = seed % KEY_SPACE;

        counters.reads.fetch_add(1, Ordering::Relaxed);
        if cache.try_get(&key)?.is_none() {
            let mut entry = cache.create_entry(key)?;
            entry
                .set_value(format!("worker-{worker}-value-{key}"))
                .set_priority(priority_for(key));
            entry.set_size((key % 4 + 1) as i64)?;
            entry.set_sliding_expiration(Duration::from_secs(2))?;

            let callback_counters = counters.clone();
            entry.register_post_eviction_callback(move |_, _, reason| {
                let counter = match reason {
                    EvictionReason::Capacity => &callback_counters.capacity_evictions,
                    _ => &callback_counters.other_evictions,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            });

            entry.commit()?;
            counters.writes.fetch_add(1, Ordering::Relaxed);
        }

        iteration += 1;
        if iteration % 64 == 0 {
            tokio::task::yield_now().await;
        }
    }

    Ok(())
}

fn priority_for(key: u64) -> CacheItemPriority {
    match key % 16 {
        0 => CacheItemPriority::NeverRemove,
        1..=5 => CacheItemPriority::Low,
        6..=11 => CacheItemPriority::Normal,
        _ => CacheItemPriority::High,
    }
}

fn xorshift(mut state: u64) -> u64 {
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    state
}
