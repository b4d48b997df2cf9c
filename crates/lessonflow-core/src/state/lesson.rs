// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lesson state machine.
//!
//! Tracks the real-time lesson (the assessed part of a training
//! application) separately from the scenario itself. Listeners usually
//! wait for one particular state and unregister themselves from inside the
//! notification.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::listeners::{ListenerId, ListenerSet, StateListener};

/// Lesson states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LessonState {
    /// The lesson is being assessed.
    Running,
    /// Assessment is suspended.
    Paused,
    /// The lesson ended.
    Stopped,
}

/// Whether the lesson may move from `from` to `to`.
///
/// `None` means no lesson has started yet; a new lesson may start after the
/// previous one stopped.
pub fn is_valid_lesson_transition(from: Option<LessonState>, to: LessonState) -> bool {
    use LessonState::*;
    matches!(
        (from, to),
        (None, Running)
            | (Some(Stopped), Running)
            | (Some(Running), Paused)
            | (Some(Paused), Running)
            | (Some(Running), Stopped)
            | (Some(Paused), Stopped)
    )
}

/// Owns the lesson state and its listener set.
#[derive(Debug, Default)]
pub struct LessonStateMachine {
    state: Mutex<Option<LessonState>>,
    listeners: ListenerSet<LessonState>,
}

impl LessonStateMachine {
    /// Create a machine with no lesson.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<LessonState>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state.
    pub fn state(&self) -> Option<LessonState> {
        *self.lock()
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn StateListener<LessonState>>) -> ListenerId {
        self.listeners.register(listener)
    }

    /// Remove a listener. Safe to call from inside a notification.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Request a transition; invalid requests are logged and ignored.
    pub fn transition(&self, to: LessonState) -> bool {
        {
            let mut current = self.lock();
            if !is_valid_lesson_transition(*current, to) {
                warn!(from = ?*current, to = ?to, "Ignoring invalid lesson state transition");
                return false;
            }
            *current = Some(to);
        }
        let notified = self.listeners.notify(&to);
        debug!(state = ?to, notified, "Lesson state changed");
        true
    }

    /// Forget the lesson and every listener.
    pub fn reset(&self) {
        *self.lock() = None;
        self.listeners.clear();
    }
}
