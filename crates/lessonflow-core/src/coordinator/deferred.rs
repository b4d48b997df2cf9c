// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Values that become known later, possibly never.

use tokio::sync::watch;

/// State of a [`Deferred`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredState<T> {
    /// Not resolved yet.
    Pending,
    /// Resolved, to a value or to nothing.
    Resolved(Option<T>),
}

/// A handle that is pending, resolved to a value, or resolved to none.
///
/// Pending and none are both ordinary states: a playback that never started
/// leaves its handle resolved to `None`, not in error. Only the first
/// resolution counts.
#[derive(Debug)]
pub struct Deferred<T> {
    state: watch::Sender<DeferredState<T>>,
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deferred<T> {
    /// Create a pending handle.
    pub fn new() -> Self {
        let (state, _) = watch::channel(DeferredState::Pending);
        Self { state }
    }

    /// Resolve the handle. Returns `false` if it was already resolved.
    pub fn resolve(&self, value: Option<T>) -> bool {
        let mut value = Some(value);
        self.state.send_if_modified(|state| {
            if matches!(state, DeferredState::Pending) {
                *state = DeferredState::Resolved(value.take().flatten());
                true
            } else {
                false
            }
        })
    }

    /// Current state without waiting.
    pub fn peek(&self) -> DeferredState<T> {
        self.state.borrow().clone()
    }

    /// Whether the handle is still pending.
    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), DeferredState::Pending)
    }

    /// Wait for resolution.
    pub async fn wait(&self) -> Option<T> {
        let mut rx = self.state.subscribe();
        match rx
            .wait_for(|state| !matches!(state, DeferredState::Pending))
            .await
        {
            Ok(state) => match &*state {
                DeferredState::Resolved(value) => value.clone(),
                DeferredState::Pending => None,
            },
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let handle = Deferred::new();
        assert!(handle.is_pending());
        assert!(handle.resolve(Some("playback-1".to_string())));
        assert!(!handle.resolve(None));
        assert_eq!(
            handle.peek(),
            DeferredState::Resolved(Some("playback-1".to_string()))
        );
        assert_eq!(handle.wait().await, Some("playback-1".to_string()));
    }

    #[tokio::test]
    async fn test_waiter_sees_none_resolution() {
        let handle: Arc<Deferred<String>> = Arc::new(Deferred::new());
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };

        tokio::task::yield_now().await;
        handle.resolve(None);

        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(handle.peek(), DeferredState::Resolved(None));
    }
}
