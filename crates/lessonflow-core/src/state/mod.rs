// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State machines owned by a session.
//!
//! | Machine | States | Listener behaviour |
//! |---------|--------|--------------------|
//! | [`lifecycle`] | RUNNING, CLOSING, CLOSED | watch channel + cancellation token |
//! | [`training_app`] | unset, LOADED, RUNNING, PAUSED, STOPPED | notified on non-null, cleared on unset |
//! | [`lesson`] | RUNNING, PAUSED, STOPPED | notified on every change |
//!
//! Transitions are validated by pure predicates before any listener runs.

pub mod lesson;
pub mod lifecycle;
pub mod listeners;
pub mod training_app;

pub use lesson::{LessonState, LessonStateMachine};
pub use lifecycle::{LifecycleState, SessionLifecycle};
pub use listeners::{ListenerId, ListenerSet, StateListener};
pub use training_app::{TrainingAppState, TrainingAppStateMachine, is_valid_transition};
