// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Copy-on-notify listener sets.
//!
//! Listeners are snapshotted under the lock and invoked after it is
//! released, so a listener may unregister itself (or register others) from
//! inside its own callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Receives state change notifications.
pub trait StateListener<S>: Send + Sync {
    /// Called with the newly entered state.
    fn on_state_change(&self, state: &S);
}

impl<S, F> StateListener<S> for F
where
    F: Fn(&S) + Send + Sync,
{
    fn on_state_change(&self, state: &S) {
        self(state)
    }
}

/// Handle returned by [`ListenerSet::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Entry<S> = (ListenerId, Arc<dyn StateListener<S>>);

/// A set of listeners for state `S`.
pub struct ListenerSet<S> {
    listeners: Mutex<Vec<Entry<S>>>,
    next_id: AtomicU64,
}

impl<S> Default for ListenerSet<S> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<S> std::fmt::Debug for ListenerSet<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

impl<S> ListenerSet<S> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry<S>>> {
        // A panicking listener runs outside the lock, so poisoning can only
        // come from a panic inside this module; the Vec is still consistent.
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a listener.
    pub fn register(&self, listener: Arc<dyn StateListener<S>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push((id, listener));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener registered at the time of the call.
    ///
    /// Returns the number of listeners notified.
    pub fn notify(&self, state: &S) -> usize {
        let snapshot: Vec<Arc<dyn StateListener<S>>> = self
            .entries()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in &snapshot {
            listener.on_state_change(state);
        }
        snapshot.len()
    }
}
