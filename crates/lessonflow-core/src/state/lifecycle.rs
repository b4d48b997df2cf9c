// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session lifecycle: RUNNING → CLOSING → CLOSED.
//!
//! The lifecycle is the only cancellation signal a session has. Every
//! transition is decided inside the watch channel's lock, so exactly one
//! caller wins each edge no matter how many race for it.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Local lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Normal operation.
    Running,
    /// Termination has started; new outbound requests are suppressed.
    Closing,
    /// Resources released. Terminal.
    Closed,
}

/// Shared lifecycle handle for one session.
#[derive(Debug)]
pub struct SessionLifecycle {
    state: watch::Sender<LifecycleState>,
    closing: CancellationToken,
}

impl Default for SessionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLifecycle {
    /// Create a lifecycle in the RUNNING state.
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Running);
        Self {
            state,
            closing: CancellationToken::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Whether the session still accepts new work.
    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Token cancelled as soon as the session leaves RUNNING.
    pub fn closing_token(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// RUNNING → CLOSING. Returns `true` only for the caller that made the move.
    pub fn begin_closing(&self) -> bool {
        let won = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::Closing;
                true
            } else {
                false
            }
        });
        if won {
            self.closing.cancel();
        }
        won
    }

    /// RUNNING or CLOSING → CLOSED. Returns `true` exactly once.
    pub fn finish_closing(&self) -> bool {
        let won = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Closed {
                false
            } else {
                *state = LifecycleState::Closed;
                true
            }
        });
        if won {
            self.closing.cancel();
        }
        won
    }

    /// Wait until the session reaches CLOSED.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| *state == LifecycleState::Closed).await;
    }
}
