// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Training-application state machine.
//!
//! ```text
//!  unset ──► LOADED ──► RUNNING ◄──► PAUSED
//!    ▲                     │            │
//!    │                     ▼            │
//!    └──────────────── STOPPED ◄────────┘
//! ```
//!
//! Any other requested transition is rejected by [`is_valid_transition`] and
//! logged by the caller. Rejections are expected: a learner pausing the
//! scenario can race with the scenario finishing on its own.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::listeners::{ListenerId, ListenerSet, StateListener};

/// Non-null training application states. `None` represents unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrainingAppState {
    /// The scenario has been loaded but not started.
    Loaded,
    /// The scenario is running.
    Running,
    /// The scenario is paused (e.g. while a survey is shown).
    Paused,
    /// The scenario has stopped.
    Stopped,
}

/// Whether moving from `from` to `to` is allowed.
pub fn is_valid_transition(from: Option<TrainingAppState>, to: Option<TrainingAppState>) -> bool {
    use TrainingAppState::*;
    matches!(
        (from, to),
        (None, Some(Loaded))
            | (Some(Loaded), Some(Running))
            | (Some(Running), Some(Paused))
            | (Some(Paused), Some(Running))
            | (Some(Running), Some(Stopped))
            | (Some(Paused), Some(Stopped))
            | (Some(Stopped), None)
    )
}

/// Owns the current training application state and its listeners.
#[derive(Debug, Default)]
pub struct TrainingAppStateMachine {
    state: Mutex<Option<TrainingAppState>>,
    listeners: ListenerSet<TrainingAppState>,
}

impl TrainingAppStateMachine {
    /// Create a machine in the unset state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> Option<TrainingAppState> {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<TrainingAppState>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener for non-null states.
    pub fn add_listener(&self, listener: Arc<dyn StateListener<TrainingAppState>>) -> ListenerId {
        self.listeners.register(listener)
    }

    /// Remove a listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Request a transition.
    ///
    /// Returns `false` (after logging) if the transition is not valid from the
    /// current state. On success, listeners are notified of a non-null state
    /// after the state has been stored; a transition to unset clears them.
    pub fn transition(&self, to: Option<TrainingAppState>) -> bool {
        {
            let mut current = self.lock();
            if !is_valid_transition(*current, to) {
                warn!(
                    from = ?*current,
                    to = ?to,
                    "Ignoring invalid training application state transition"
                );
                return false;
            }
            *current = to;
        }

        match to {
            Some(state) => {
                let notified = self.listeners.notify(&state);
                debug!(state = ?state, notified, "Training application state changed");
            }
            None => {
                self.listeners.clear();
                debug!("Training application state unset, listeners cleared");
            }
        }
        true
    }

    /// Force the state back to unset and drop every listener.
    ///
    /// Used by session cleanup, where the normal transition table no longer
    /// applies.
    pub fn reset(&self) {
        *self.lock() = None;
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ALL: [Option<TrainingAppState>; 5] = [
        None,
        Some(TrainingAppState::Loaded),
        Some(TrainingAppState::Running),
        Some(TrainingAppState::Paused),
        Some(TrainingAppState::Stopped),
    ];

    #[test]
    fn test_transition_table_is_exact() {
        use TrainingAppState::*;
        let allowed = [
            (None, Some(Loaded)),
            (Some(Loaded), Some(Running)),
            (Some(Running), Some(Paused)),
            (Some(Paused), Some(Running)),
            (Some(Running), Some(Stopped)),
            (Some(Paused), Some(Stopped)),
            (Some(Stopped), None),
        ];

        for from in ALL {
            for to in ALL {
                assert_eq!(
                    is_valid_transition(from, to),
                    allowed.contains(&(from, to)),
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_invalid_transition_notifies_nobody() {
        let machine = TrainingAppStateMachine::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for from in ALL {
            for to in ALL {
                if is_valid_transition(from, to) {
                    continue;
                }
                // Drive the machine to `from` along valid edges, then try `to`.
                machine.reset();
                let counter = calls.clone();
                machine.add_listener(Arc::new(move |_: &TrainingAppState| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
                drive_to(&machine, from);
                let before = machine.listener_count();
                calls.store(0, Ordering::SeqCst);

                assert!(!machine.transition(to));
                assert_eq!(machine.state(), from);
                assert_eq!(calls.load(Ordering::SeqCst), 0);
                assert_eq!(machine.listener_count(), before);
            }
        }
    }

    fn drive_to(machine: &TrainingAppStateMachine, target: Option<TrainingAppState>) {
        use TrainingAppState::*;
        let path: &[TrainingAppState] = match target {
            None => &[],
            Some(Loaded) => &[Loaded],
            Some(Running) => &[Loaded, Running],
            Some(Paused) => &[Loaded, Running, Paused],
            Some(Stopped) => &[Loaded, Running, Stopped],
        };
        for state in path {
            assert!(machine.transition(Some(*state)));
        }
    }

    #[test]
    fn test_full_cycle_notifies_listeners() {
        use TrainingAppState::*;
        let machine = TrainingAppStateMachine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        machine.add_listener(Arc::new(move |state: &TrainingAppState| {
            sink.lock().unwrap().push(*state);
        }));

        for state in [Loaded, Running, Paused, Running, Stopped] {
            assert!(machine.transition(Some(state)));
        }

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Loaded, Running, Paused, Running, Stopped]
        );
    }

    #[test]
    fn test_unset_clears_listeners() {
        use TrainingAppState::*;
        let machine = TrainingAppStateMachine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        machine.add_listener(Arc::new(move |_: &TrainingAppState| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        machine.transition(Some(Loaded));
        machine.transition(Some(Running));
        machine.transition(Some(Stopped));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert!(machine.transition(None));
        assert_eq!(machine.listener_count(), 0);

        assert!(machine.transition(Some(Loaded)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
