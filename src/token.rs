//! Change Token Module
//!
//! External invalidation signals consumed by cache entries, plus two
//! concrete token kinds and the `on_change` re-registration helper.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Callback registered on a change token. Runs at most once.
pub type ChangeCallback = Box<dyn FnOnce() + Send + 'static>;

// == Change Token Trait ==
/// Propagates notifications that a change has occurred.
///
/// Once `has_changed` returns `true` it must keep returning `true` for the
/// lifetime of the token. Callbacks may be invoked on any thread.
pub trait ChangeToken: Send + Sync {
    /// Whether a change has occurred.
    fn has_changed(&self) -> bool;

    /// Whether the token raises callbacks on its own. When `false`,
    /// consumers must poll [`ChangeToken::has_changed`].
    fn active_change_callbacks(&self) -> bool;

    /// Registers `callback` to run when the token changes.
    ///
    /// `has_changed` must already report `true` when the callback runs.
    fn register_change_callback(&self, callback: ChangeCallback) -> ChangeRegistration;
}

// == Change Registration ==
/// Handle for a registered change callback.
///
/// Dropping the handle unregisters the callback.
#[must_use = "dropping a ChangeRegistration unregisters its callback"]
pub struct ChangeRegistration {
    unregister: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl ChangeRegistration {
    /// Creates a registration that runs `unregister` when dropped.
    pub fn new<F>(unregister: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            unregister: Some(Box::new(unregister)),
        }
    }

    /// A registration with nothing to undo.
    pub fn empty() -> Self {
        Self { unregister: None }
    }

    /// Unregisters the callback now.
    pub fn dispose(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

impl Drop for ChangeRegistration {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for ChangeRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeRegistration")
            .field("active", &self.unregister.is_some())
            .finish()
    }
}

// == Cancellation Change Token ==
/// Token that changes once [`CancellationChangeToken::cancel`] is called.
///
/// Clones share state, so one clone can be handed to cache entries while
/// another is kept to trigger the change.
#[derive(Clone, Default)]
pub struct CancellationChangeToken {
    inner: Arc<CancellationInner>,
}

#[derive(Default)]
struct CancellationInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, ChangeCallback)>>,
}

impl CancellationChangeToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token changed and runs every registered callback on the
    /// calling thread. Later calls do nothing.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for (_, callback) in callbacks {
            callback();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl ChangeToken for CancellationChangeToken {
    fn has_changed(&self) -> bool {
        self.is_cancelled()
    }

    fn active_change_callbacks(&self) -> bool {
        true
    }

    fn register_change_callback(&self, callback: ChangeCallback) -> ChangeRegistration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut callbacks = self.inner.callbacks.lock();
            // Checked under the lock so a concurrent cancel cannot miss us.
            if !self.inner.cancelled.load(Ordering::Acquire) {
                callbacks.push((id, callback));
                let weak: Weak<CancellationInner> = Arc::downgrade(&self.inner);
                return ChangeRegistration::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        // Bind before dropping so the callback is freed outside the lock.
                        let removed = {
                            let mut callbacks = inner.callbacks.lock();
                            callbacks
                                .iter()
                                .position(|(other, _)| *other == id)
                                .map(|index| callbacks.swap_remove(index))
                        };
                        drop(removed);
                    }
                });
            }
        }

        // Already cancelled: fire right away.
        callback();
        ChangeRegistration::empty()
    }
}

impl fmt::Debug for CancellationChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationChangeToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// == Polling Change Token ==
/// Passive token whose state is discovered by polling a predicate.
///
/// The first `true` from the predicate is latched.
pub struct PollingChangeToken {
    predicate: Box<dyn Fn() -> bool + Send + Sync>,
    changed: AtomicBool,
}

impl PollingChangeToken {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            changed: AtomicBool::new(false),
        }
    }
}

impl ChangeToken for PollingChangeToken {
    fn has_changed(&self) -> bool {
        if self.changed.load(Ordering::Acquire) {
            return true;
        }
        if (self.predicate)() {
            self.changed.store(true, Ordering::Release);
            return true;
        }
        false
    }

    fn active_change_callbacks(&self) -> bool {
        false
    }

    fn register_change_callback(&self, _callback: ChangeCallback) -> ChangeRegistration {
        ChangeRegistration::empty()
    }
}

impl fmt::Debug for PollingChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingChangeToken")
            .field("changed", &self.changed.load(Ordering::Relaxed))
            .finish()
    }
}

// == On Change ==
/// Calls `consumer` every time the token produced by `producer` changes.
///
/// After each change a fresh token is requested from `producer`; it is
/// only subscribed to if it has not already changed. Dropping the returned
/// registration stops further notifications.
pub fn on_change<P, C>(producer: P, consumer: C) -> ChangeRegistration
where
    P: Fn() -> Option<Arc<dyn ChangeToken>> + Send + Sync + 'static,
    C: Fn() + Send + Sync + 'static,
{
    let subscription = Arc::new(OnChangeSubscription {
        producer: Box::new(producer),
        consumer: Box::new(consumer),
        disposed: AtomicBool::new(false),
        current: Mutex::new(None),
    });

    let token = (subscription.producer)();
    subscription.subscribe(token);

    ChangeRegistration::new(move || subscription.dispose())
}

struct OnChangeSubscription {
    producer: Box<dyn Fn() -> Option<Arc<dyn ChangeToken>> + Send + Sync>,
    consumer: Box<dyn Fn() + Send + Sync>,
    disposed: AtomicBool,
    current: Mutex<Option<ChangeRegistration>>,
}

impl OnChangeSubscription {
    fn subscribe(self: &Arc<Self>, token: Option<Arc<dyn ChangeToken>>) {
        let Some(token) = token else { return };
        if self.disposed.load(Ordering::Acquire) {
            return;
        }

        let weak = Arc::downgrade(self);
        let registration = token.register_change_callback(Box::new(move || {
            if let Some(subscription) = weak.upgrade() {
                subscription.fired();
            }
        }));

        let previous = if self.disposed.load(Ordering::Acquire) {
            Some(registration)
        } else {
            self.current.lock().replace(registration)
        };
        drop(previous);
    }

    fn fired(self: &Arc<Self>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }

        let next = (self.producer)();
        (self.consumer)();

        if let Some(token) = next {
            if !token.has_changed() {
                self.subscribe(Some(token));
            }
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let registration = self.current.lock().take();
        drop(registration);
    }
}
