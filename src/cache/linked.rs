//! Linked Entries Module
//!
//! Per-thread stack of entries still under construction. When a cache with
//! linked-entry tracking reads or commits an entry while another one is
//! being built on the same thread, the inner entry's expiration tokens and
//! absolute deadline are copied onto the outer one.

use std::cell::RefCell;
use std::sync::Arc;

use crate::token::ChangeToken;

// == Linked Scope ==
/// An entry under construction that can absorb expiration settings.
pub(crate) trait LinkedScope: Send + Sync {
    /// Adds `tokens` and lowers the absolute deadline to `absolute_expiration`
    /// when that is earlier.
    fn absorb(&self, tokens: &[Arc<dyn ChangeToken>], absolute_expiration: Option<i64>);
}

thread_local! {
    static SCOPES: RefCell<Vec<Arc<dyn LinkedScope>>> = const { RefCell::new(Vec::new()) };
}

fn address(scope: &Arc<dyn LinkedScope>) -> *const () {
    Arc::as_ptr(scope) as *const ()
}

/// Makes `scope` the current entry under construction.
pub(crate) fn enter(scope: Arc<dyn LinkedScope>) {
    let _ = SCOPES.try_with(|scopes| scopes.borrow_mut().push(scope));
}

/// Leaves the scope whose data pointer is `scope`.
///
/// Handles are normally dropped innermost first, but an out-of-order exit
/// only removes the matching scope.
pub(crate) fn exit(scope: *const ()) {
    let _ = SCOPES.try_with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        if let Some(index) = scopes.iter().rposition(|other| address(other) == scope) {
            scopes.remove(index);
        }
    });
}

/// The innermost entry under construction on this thread.
pub(crate) fn current() -> Option<Arc<dyn LinkedScope>> {
    SCOPES
        .try_with(|scopes| scopes.borrow().last().cloned())
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        deadlines: Mutex<Vec<Option<i64>>>,
    }

    impl LinkedScope for Recorder {
        fn absorb(&self, _tokens: &[Arc<dyn ChangeToken>], absolute_expiration: Option<i64>) {
            self.deadlines.lock().push(absolute_expiration);
        }
    }

    #[test]
    fn test_enter_exit_nesting() {
        let outer: Arc<dyn LinkedScope> = Arc::new(Recorder::default());
        let inner: Arc<dyn LinkedScope> = Arc::new(Recorder::default());

        assert!(current().is_none());
        enter(outer.clone());
        enter(inner.clone());
        assert_eq!(address(&current().unwrap()), address(&inner));

        exit(address(&inner));
        assert_eq!(address(&current().unwrap()), address(&outer));

        exit(address(&outer));
        assert!(current().is_none());
    }

    #[test]
    fn test_out_of_order_exit() {
        let outer: Arc<dyn LinkedScope> = Arc::new(Recorder::default());
        let inner: Arc<dyn LinkedScope> = Arc::new(Recorder::default());

        enter(outer.clone());
        enter(inner.clone());
        exit(address(&outer));

        assert_eq!(address(&current().unwrap()), address(&inner));
        exit(address(&inner));
        assert!(current().is_none());
    }

    #[test]
    fn test_scopes_are_per_thread() {
        let scope: Arc<dyn LinkedScope> = Arc::new(Recorder::default());
        enter(scope.clone());

        let seen_elsewhere = std::thread::spawn(|| current().is_some()).join().unwrap();
        assert!(!seen_elsewhere);

        exit(address(&scope));
    }
}
