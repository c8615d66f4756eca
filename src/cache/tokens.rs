//! Entry Tokens Module
//!
//! Expiration tokens, their callback registrations and the post-eviction
//! callbacks of a single entry. Kept apart from the entry record since most
//! entries never use any of them.

use std::sync::Arc;

use crate::cache::EvictionReason;
use crate::token::{ChangeRegistration, ChangeToken};

/// Callback fired once after an entry leaves the cache.
pub(crate) type EvictionCallback<K, V> =
    Box<dyn Fn(&K, Option<Arc<V>>, EvictionReason) + Send + Sync + 'static>;

// == Entry Tokens ==
pub(crate) struct EntryTokens<K, V> {
    expiration_tokens: Vec<Arc<dyn ChangeToken>>,
    registrations: Vec<ChangeRegistration>,
    callbacks: Vec<EvictionCallback<K, V>>,
    attached: bool,
}

impl<K, V> Default for EntryTokens<K, V> {
    fn default() -> Self {
        Self {
            expiration_tokens: Vec::new(),
            registrations: Vec::new(),
            callbacks: Vec::new(),
            attached: false,
        }
    }
}

impl<K, V> EntryTokens<K, V> {
    pub(crate) fn add_token(&mut self, token: Arc<dyn ChangeToken>) {
        self.expiration_tokens.push(token);
    }

    pub(crate) fn extend_tokens(&mut self, tokens: &[Arc<dyn ChangeToken>]) {
        self.expiration_tokens.extend(tokens.iter().cloned());
    }

    pub(crate) fn add_callback(&mut self, callback: EvictionCallback<K, V>) {
        self.callbacks.push(callback);
    }

    pub(crate) fn token_count(&self) -> usize {
        self.expiration_tokens.len()
    }

    pub(crate) fn has_callbacks(&self) -> bool {
        !self.callbacks.is_empty()
    }

    /// Whether any expiration token reports a change.
    pub(crate) fn any_changed(&self) -> bool {
        self.expiration_tokens.iter().any(|token| token.has_changed())
    }

    pub(crate) fn tokens_snapshot(&self) -> Vec<Arc<dyn ChangeToken>> {
        self.expiration_tokens.clone()
    }

    /// Claims the right to register callbacks. Returns the tokens that
    /// raise active callbacks, or `None` if registration already happened.
    pub(crate) fn begin_attach(&mut self) -> Option<Vec<Arc<dyn ChangeToken>>> {
        if self.attached {
            return None;
        }
        self.attached = true;
        Some(
            self.expiration_tokens
                .iter()
                .filter(|token| token.active_change_callbacks())
                .cloned()
                .collect(),
        )
    }

    pub(crate) fn store_registrations(&mut self, registrations: Vec<ChangeRegistration>) {
        self.registrations.extend(registrations);
    }

    /// Takes the registrations so the caller can drop them outside the lock.
    pub(crate) fn take_registrations(&mut self) -> Vec<ChangeRegistration> {
        std::mem::take(&mut self.registrations)
    }

    /// Takes the eviction callbacks. Only the first caller gets any.
    pub(crate) fn take_callbacks(&mut self) -> Vec<EvictionCallback<K, V>> {
        std::mem::take(&mut self.callbacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{CancellationChangeToken, PollingChangeToken};

    #[test]
    fn test_begin_attach_only_once() {
        let mut tokens: EntryTokens<String, String> = EntryTokens::default();
        tokens.add_token(Arc::new(CancellationChangeToken::new()));
        tokens.add_token(Arc::new(PollingChangeToken::new(|| false)));

        let active = tokens.begin_attach().unwrap();
        assert_eq!(active.len(), 1, "only active tokens are registered");
        assert!(tokens.begin_attach().is_none());
    }

    #[test]
    fn test_any_changed() {
        let mut tokens: EntryTokens<String, String> = EntryTokens::default();
        let token = CancellationChangeToken::new();
        tokens.add_token(Arc::new(token.clone()));

        assert!(!tokens.any_changed());
        token.cancel();
        assert!(tokens.any_changed());
    }

    #[test]
    fn test_take_callbacks_once() {
        let mut tokens: EntryTokens<String, String> = EntryTokens::default();
        tokens.add_callback(Box::new(|_, _, _| {}));

        assert!(tokens.has_callbacks());
        assert_eq!(tokens.take_callbacks().len(), 1);
        assert!(tokens.take_callbacks().is_empty());
        assert!(!tokens.has_callbacks());
    }
}
