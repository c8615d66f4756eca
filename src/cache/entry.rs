//! Cache Entry Module
//!
//! The record behind one cache slot, its expiration state machine, and the
//! [`CacheEntry`] handle callers fill in before it is committed.

use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::cache::linked::{self, LinkedScope};
use crate::cache::store::CacheInner;
use crate::cache::tokens::{EntryTokens, EvictionCallback};
use crate::clock::{duration_ticks, from_ticks};
use crate::error::{CacheError, Result};
use crate::tasks::Executor;
use crate::token::ChangeToken;

const NO_DEADLINE: i64 = i64::MAX;
const UNSET: i64 = 0;
const NO_SIZE: i64 = -1;

// == Eviction Reason ==
/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum EvictionReason {
    /// The entry has not been evicted
    None = 0,
    /// Removed explicitly or by `clear`
    Removed = 1,
    /// Overwritten by a newer entry for the same key
    Replaced = 2,
    /// Absolute or sliding expiration elapsed
    Expired = 3,
    /// An expiration token changed
    TokenExpired = 4,
    /// Evicted to bring the cache back under its size limit
    Capacity = 5,
}

impl EvictionReason {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => EvictionReason::Removed,
            2 => EvictionReason::Replaced,
            3 => EvictionReason::Expired,
            4 => EvictionReason::TokenExpired,
            5 => EvictionReason::Capacity,
            _ => EvictionReason::None,
        }
    }
}

// == Cache Item Priority ==
/// Eviction priority. Compaction removes lower priorities first and never
/// touches [`CacheItemPriority::NeverRemove`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum CacheItemPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    NeverRemove = 3,
}

impl TryFrom<u8> for CacheItemPriority {
    type Error = CacheError;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(CacheItemPriority::Low),
            1 => Ok(CacheItemPriority::Normal),
            2 => Ok(CacheItemPriority::High),
            3 => Ok(CacheItemPriority::NeverRemove),
            other => Err(CacheError::Unsupported(format!(
                "unknown cache item priority {other}"
            ))),
        }
    }
}

// == Entry ==
/// One cache slot.
///
/// Every field is interior-mutable because an entry under construction is
/// shared with the linked-entry stack, and a committed entry is shared by
/// every reader of the map.
pub(crate) struct Entry<K, V> {
    key: K,
    value: ArcSwapOption<V>,
    size: AtomicI64,
    priority: AtomicU8,
    /// Ticks; `NO_DEADLINE` when unset.
    absolute_expiration: AtomicI64,
    /// Duration in ticks; `UNSET` when unset.
    relative_expiration: AtomicI64,
    /// Duration in ticks; `UNSET` when unset.
    sliding_expiration: AtomicI64,
    last_accessed: AtomicI64,
    eviction_reason: AtomicU8,
    tokens: Mutex<EntryTokens<K, V>>,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(key: K) -> Self {
        Self {
            key,
            value: ArcSwapOption::empty(),
            size: AtomicI64::new(NO_SIZE),
            priority: AtomicU8::new(CacheItemPriority::Normal as u8),
            absolute_expiration: AtomicI64::new(NO_DEADLINE),
            relative_expiration: AtomicI64::new(UNSET),
            sliding_expiration: AtomicI64::new(UNSET),
            last_accessed: AtomicI64::new(0),
            eviction_reason: AtomicU8::new(EvictionReason::None as u8),
            tokens: Mutex::new(EntryTokens::default()),
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    pub(crate) fn value(&self) -> Option<Arc<V>> {
        self.value.load_full()
    }

    pub(crate) fn set_value(&self, value: Arc<V>) {
        self.value.store(Some(value));
    }

    /// Size in caller-defined units, negative when never set.
    pub(crate) fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn set_size(&self, size: i64) {
        self.size.store(size, Ordering::Release);
    }

    pub(crate) fn priority(&self) -> Result<CacheItemPriority> {
        CacheItemPriority::try_from(self.priority.load(Ordering::Acquire))
    }

    pub(crate) fn set_priority(&self, priority: CacheItemPriority) {
        self.priority.store(priority as u8, Ordering::Release);
    }

    pub(crate) fn absolute_expiration(&self) -> Option<i64> {
        match self.absolute_expiration.load(Ordering::Acquire) {
            NO_DEADLINE => None,
            ticks => Some(ticks),
        }
    }

    pub(crate) fn set_absolute_expiration(&self, ticks: i64) {
        self.absolute_expiration.store(ticks, Ordering::Release);
    }

    /// Keeps the earlier of the current deadline and `ticks`.
    pub(crate) fn lower_absolute_expiration(&self, ticks: i64) {
        self.absolute_expiration.fetch_min(ticks, Ordering::AcqRel);
    }

    pub(crate) fn relative_expiration(&self) -> Option<i64> {
        match self.relative_expiration.load(Ordering::Acquire) {
            UNSET => None,
            ticks => Some(ticks),
        }
    }

    pub(crate) fn set_relative_expiration(&self, ticks: i64) {
        self.relative_expiration.store(ticks, Ordering::Release);
    }

    pub(crate) fn sliding_expiration(&self) -> Option<i64> {
        match self.sliding_expiration.load(Ordering::Acquire) {
            UNSET => None,
            ticks => Some(ticks),
        }
    }

    pub(crate) fn set_sliding_expiration(&self, ticks: i64) {
        self.sliding_expiration.store(ticks, Ordering::Release);
    }

    pub(crate) fn last_accessed(&self) -> i64 {
        self.last_accessed.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self, now: i64) {
        self.last_accessed.store(now, Ordering::Release);
    }

    pub(crate) fn eviction_reason(&self) -> EvictionReason {
        EvictionReason::from_u8(self.eviction_reason.load(Ordering::Acquire))
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.eviction_reason() != EvictionReason::None
    }

    pub(crate) fn add_token(&self, token: Arc<dyn ChangeToken>) {
        self.tokens.lock().add_token(token);
    }

    pub(crate) fn add_callback(&self, callback: EvictionCallback<K, V>) {
        self.tokens.lock().add_callback(callback);
    }

    pub(crate) fn token_count(&self) -> usize {
        self.tokens.lock().token_count()
    }

    // == Expiration ==

    /// Records `reason` unless a reason is already set, then drops any
    /// token registrations.
    pub(crate) fn set_expired(&self, reason: EvictionReason) {
        let _ = self.eviction_reason.compare_exchange(
            EvictionReason::None as u8,
            reason as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.detach_tokens();
    }

    /// Turns a relative deadline into an absolute one at commit time,
    /// keeping any earlier deadline cascaded from a linked entry.
    pub(crate) fn apply_relative_expiration(&self, now: i64) {
        if let Some(relative) = self.relative_expiration() {
            self.lower_absolute_expiration(now.saturating_add(relative));
        }
    }

    /// Whether the entry is expired at `now`. May record an eviction
    /// reason as a side effect but never removes anything.
    pub(crate) fn check_expired(&self, now: i64) -> bool {
        self.is_expired() || self.check_for_expired_time(now) || self.check_for_expired_tokens()
    }

    fn check_for_expired_time(&self, now: i64) -> bool {
        if let Some(deadline) = self.absolute_expiration() {
            if deadline <= now {
                self.set_expired(EvictionReason::Expired);
                return true;
            }
        }

        if let Some(sliding) = self.sliding_expiration() {
            if now.saturating_sub(self.last_accessed()) >= sliding {
                self.set_expired(EvictionReason::Expired);
                return true;
            }
        }

        false
    }

    fn check_for_expired_tokens(&self) -> bool {
        // The lock is released before set_expired, which locks again to detach.
        let changed = self.tokens.lock().any_changed();
        if changed {
            self.set_expired(EvictionReason::TokenExpired);
        }
        changed
    }

    /// Registers `on_change` on every token that raises callbacks.
    /// Registration happens at most once per entry.
    pub(crate) fn attach_tokens<F>(&self, on_change: F)
    where
        F: Fn() + Clone + Send + 'static,
    {
        let Some(tokens) = self.tokens.lock().begin_attach() else {
            return;
        };
        if tokens.is_empty() {
            return;
        }

        // Tokens may fire synchronously while registering, so no lock is held here.
        let registrations: Vec<_> = tokens
            .iter()
            .map(|token| token.register_change_callback(Box::new(on_change.clone())))
            .collect();

        let stale = {
            let mut guard = self.tokens.lock();
            if self.is_expired() {
                Some(registrations)
            } else {
                guard.store_registrations(registrations);
                None
            }
        };
        drop(stale);
    }

    fn detach_tokens(&self) {
        let registrations = self.tokens.lock().take_registrations();
        drop(registrations);
    }

    /// Copies this entry's tokens and absolute deadline onto `parent`.
    pub(crate) fn propagate_options_to(&self, parent: &dyn LinkedScope) {
        let tokens = self.tokens.lock().tokens_snapshot();
        let deadline = self.absolute_expiration();
        if tokens.is_empty() && deadline.is_none() {
            return;
        }
        parent.absorb(&tokens, deadline);
    }
}

impl<K, V> LinkedScope for Entry<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn absorb(&self, tokens: &[Arc<dyn ChangeToken>], absolute_expiration: Option<i64>) {
        if !tokens.is_empty() {
            self.tokens.lock().extend_tokens(tokens);
        }
        if let Some(deadline) = absolute_expiration {
            self.lower_absolute_expiration(deadline);
        }
    }
}

impl<K, V> Entry<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Schedules the post-eviction callbacks on the background executor.
    pub(crate) fn invoke_eviction_callbacks(self: &Arc<Self>, executor: &Executor) {
        if !self.tokens.lock().has_callbacks() {
            return;
        }
        let entry = Arc::clone(self);
        executor.execute(move || entry.run_eviction_callbacks());
    }

    fn run_eviction_callbacks(&self) {
        let callbacks = self.tokens.lock().take_callbacks();
        if callbacks.is_empty() {
            return;
        }

        let value = self.value();
        let reason = self.eviction_reason();
        for callback in callbacks {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                callback(&self.key, value.clone(), reason)
            }));
            if outcome.is_err() {
                warn!(?reason, "post-eviction callback panicked");
            }
        }
    }
}

impl<K: fmt::Debug, V> fmt::Debug for Entry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("size", &self.size())
            .field("last_accessed", &self.last_accessed())
            .field("eviction_reason", &self.eviction_reason())
            .finish_non_exhaustive()
    }
}

// == Cache Entry Handle ==
/// An entry being built. Configure it, then [`commit`](CacheEntry::commit)
/// it or let it drop; dropping commits as well.
///
/// The entry is not visible to readers until it is committed.
///
/// With linked-entry tracking the handle is registered as the current
/// parent of the thread that created it, so it must be committed on that
/// thread. The handle is not `Send`:
///
/// ```compile_fail
/// use mini_memcache::{MemoryCache, MemoryCacheOptions};
///
/// let cache: MemoryCache<String, String> =
///     MemoryCache::new(MemoryCacheOptions::new().with_track_linked_entries(true)).unwrap();
/// let mut entry = cache.create_entry("key".to_string()).unwrap();
/// entry.set_value("value".to_string());
/// std::thread::spawn(move || entry.commit()).join().unwrap().unwrap();
/// ```
///
/// For the same reason a future holding a handle across an `.await` cannot
/// be handed to `tokio::spawn`.
pub struct CacheEntry<K, V>
where
    K: super::CacheKey,
    V: Send + Sync + 'static,
{
    entry: Arc<Entry<K, V>>,
    cache: Arc<CacheInner<K, V>>,
    linked: bool,
    committed: bool,
    /// Pins the handle to the thread whose linked stack holds it
    _thread_bound: PhantomData<*const ()>,
}

impl<K, V> CacheEntry<K, V>
where
    K: super::CacheKey,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(key: K, cache: Arc<CacheInner<K, V>>) -> Self {
        let entry = Arc::new(Entry::new(key));
        let linked = cache.tracks_linked_entries();
        if linked {
            linked::enter(entry.clone());
        }

        Self {
            entry,
            cache,
            linked,
            committed: false,
            _thread_bound: PhantomData,
        }
    }

    // == Accessors ==

    pub fn key(&self) -> &K {
        self.entry.key()
    }

    pub fn value(&self) -> Option<Arc<V>> {
        self.entry.value()
    }

    /// Size in caller-defined units, `None` until set.
    pub fn size(&self) -> Option<i64> {
        Some(self.entry.size()).filter(|size| *size >= 0)
    }

    pub fn priority(&self) -> CacheItemPriority {
        self.entry.priority().unwrap_or_default()
    }

    pub fn absolute_expiration(&self) -> Option<DateTime<Utc>> {
        self.entry.absolute_expiration().and_then(from_ticks)
    }

    pub fn absolute_expiration_relative_to_now(&self) -> Option<Duration> {
        self.entry
            .relative_expiration()
            .map(|ticks| Duration::from_micros(ticks.unsigned_abs()))
    }

    pub fn sliding_expiration(&self) -> Option<Duration> {
        self.entry
            .sliding_expiration()
            .map(|ticks| Duration::from_micros(ticks.unsigned_abs()))
    }

    pub fn expiration_token_count(&self) -> usize {
        self.entry.token_count()
    }

    // == Setters ==

    pub fn set_value(&mut self, value: V) -> &mut Self {
        self.entry.set_value(Arc::new(value));
        self
    }

    /// Stores an already shared value.
    pub fn set_shared_value(&mut self, value: Arc<V>) -> &mut Self {
        self.entry.set_value(value);
        self
    }

    /// Sets the entry size used for size-limit accounting.
    pub fn set_size(&mut self, size: i64) -> Result<&mut Self> {
        if size < 0 {
            return Err(CacheError::invalid(format!(
                "size must be non-negative, got {size}"
            )));
        }
        self.entry.set_size(size);
        Ok(self)
    }

    pub fn set_priority(&mut self, priority: CacheItemPriority) -> &mut Self {
        self.entry.set_priority(priority);
        self
    }

    pub fn set_absolute_expiration(&mut self, at: DateTime<Utc>) -> &mut Self {
        self.entry.set_absolute_expiration(crate::clock::to_ticks(at));
        self
    }

    /// Expire `after` the moment the entry is committed.
    pub fn set_absolute_expiration_relative_to_now(&mut self, after: Duration) -> Result<&mut Self> {
        let ticks = positive_ticks(after, "absolute expiration relative to now")?;
        self.entry.set_relative_expiration(ticks);
        Ok(self)
    }

    /// Expire once the entry goes unread for `window`.
    pub fn set_sliding_expiration(&mut self, window: Duration) -> Result<&mut Self> {
        let ticks = positive_ticks(window, "sliding expiration")?;
        self.entry.set_sliding_expiration(ticks);
        Ok(self)
    }

    pub fn add_expiration_token(&mut self, token: Arc<dyn ChangeToken>) -> &mut Self {
        self.entry.add_token(token);
        self
    }

    /// Registers a callback fired once, off the calling thread, after the
    /// entry is evicted for any reason.
    pub fn register_post_eviction_callback<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&K, Option<Arc<V>>, EvictionReason) + Send + Sync + 'static,
    {
        self.entry.add_callback(Box::new(callback));
        self
    }

    /// Like [`register_post_eviction_callback`](Self::register_post_eviction_callback),
    /// with a state value handed back to the callback.
    pub fn register_post_eviction_callback_with_state<S, F>(
        &mut self,
        callback: F,
        state: S,
    ) -> &mut Self
    where
        S: Send + Sync + 'static,
        F: Fn(&K, Option<Arc<V>>, EvictionReason, &S) + Send + Sync + 'static,
    {
        self.entry.add_callback(Box::new(move |key, value, reason| {
            callback(key, value, reason, &state)
        }));
        self
    }

    // == Commit ==

    /// Makes the entry visible in the cache.
    ///
    /// Committing to a disposed cache does nothing.
    pub fn commit(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.committed = true;

        if self.linked {
            linked::exit(Arc::as_ptr(&self.entry) as *const ());
        }

        if self.entry.value().is_none() {
            return Err(CacheError::invalid("cache entry committed without a value"));
        }

        self.cache.set_entry(&self.entry)?;

        if self.linked {
            if let Some(parent) = linked::current() {
                self.entry.propagate_options_to(parent.as_ref());
            }
        }
        Ok(())
    }
}

impl<K, V> Drop for CacheEntry<K, V>
where
    K: super::CacheKey,
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = self.finish() {
            warn!(key = ?self.entry.key(), error = %err, "dropped cache entry was not committed");
        }
    }
}

impl<K, V> fmt::Debug for CacheEntry<K, V>
where
    K: super::CacheKey,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("entry", &self.entry)
            .field("committed", &self.committed)
            .finish()
    }
}

fn positive_ticks(duration: Duration, what: &str) -> Result<i64> {
    let ticks = duration_ticks(duration);
    if ticks <= 0 {
        return Err(CacheError::invalid(format!("{what} must be positive")));
    }
    Ok(ticks)
}
