// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Learner progress through the authored course.
//!
//! Progress is measured against the enabled objects the course started
//! with. Objects inserted at runtime (branch paths, adaptive courseflow
//! expansions) are consumed without moving the counter, so the bar holds
//! still while the learner works through them.

use std::sync::Arc;

use serde::Serialize;

/// Progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Enabled authored objects reached so far.
    pub current: usize,
    /// Enabled authored objects in the course.
    pub max: usize,
}

/// Receives progress updates (e.g. an LMS or dashboard feed).
pub trait ProgressReporter: Send + Sync {
    /// Report progress. `is_final` is set once, when the course ends.
    fn report_progress(&self, progress: Progress, is_final: bool);
}

/// A progress report ready to hand to its reporters.
///
/// Built under the session lock, delivered after it is released.
pub struct ProgressReport {
    pub(crate) progress: Progress,
    pub(crate) is_final: bool,
    pub(crate) reporters: Vec<Arc<dyn ProgressReporter>>,
}

impl std::fmt::Debug for ProgressReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReport")
            .field("progress", &self.progress)
            .field("is_final", &self.is_final)
            .field("reporters", &self.reporters.len())
            .finish()
    }
}

impl ProgressReport {
    /// The snapshot being reported.
    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Invoke every reporter.
    pub fn deliver(self) {
        for reporter in &self.reporters {
            reporter.report_progress(self.progress, self.is_final);
        }
    }
}
