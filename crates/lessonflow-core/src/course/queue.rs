// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The ordered, mutable queue of course objects.
//!
//! ```text
//!   objects:  [ A ][ B ][ C ][ D ][ E ]
//!                        ▲
//!                      cursor            insert_transitions([X, Y])
//!
//!   objects:  [ A ][ B ][ C ][ X ][ Y ][ D ][ E ]
//! ```
//!
//! The cursor starts before the first object. Insertion always lands
//! immediately after the cursor, so inserted objects run next and nothing is
//! ever placed behind the current object.

use std::sync::Arc;

use tracing::{debug, info};

use super::object::CourseObject;
use super::progress::{Progress, ProgressReport, ProgressReporter};
use crate::error::{Result, SessionError};

/// Course object queue with progress tracking.
pub struct CourseQueue {
    objects: Vec<CourseObject>,
    /// Index of the current object; `None` before the first call to
    /// [`next_transition`](Self::next_transition).
    cursor: Option<usize>,
    /// Inserted objects not yet consumed. Only the count matters.
    inserted_pending: usize,
    current_progress: usize,
    max_progress: usize,
    reporters: Vec<Arc<dyn ProgressReporter>>,
}

impl std::fmt::Debug for CourseQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourseQueue")
            .field("len", &self.objects.len())
            .field("cursor", &self.cursor)
            .field("inserted_pending", &self.inserted_pending)
            .field("progress", &self.progress())
            .finish()
    }
}

impl CourseQueue {
    /// Build a queue from the authored objects.
    ///
    /// At least one object must be enabled.
    pub fn new(objects: Vec<CourseObject>) -> Result<Self> {
        let enabled = objects.iter().filter(|o| !o.is_disabled()).count();
        if enabled == 0 {
            return Err(SessionError::InvalidCourse {
                reason: "there must be at least one enabled course object".to_string(),
            });
        }

        Ok(Self {
            objects,
            cursor: None,
            inserted_pending: 0,
            current_progress: 0,
            max_progress: enabled,
            reporters: Vec::new(),
        })
    }

    /// Total number of objects (including consumed ones).
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the queue holds no objects at all.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn next_index(&self) -> usize {
        self.cursor.map_or(0, |i| i.saturating_add(1))
    }

    /// Whether another object follows the current one.
    pub fn has_more_transitions(&self) -> bool {
        self.next_index() < self.objects.len()
    }

    /// Advance to the next object and return it.
    ///
    /// Disabled objects are returned too; skipping them is the caller's job
    /// so that it can do so without side effects. Progress only moves for
    /// enabled, authored objects.
    pub fn next_transition(&mut self) -> Option<&CourseObject> {
        if !self.has_more_transitions() {
            return None;
        }

        let index = self.next_index();
        self.cursor = Some(index);
        let enabled = !self.objects[index].is_disabled();
        self.update_progress(enabled);
        debug!(index, name = %self.objects[index].name(), "Advanced course queue");
        self.objects.get(index)
    }

    fn update_progress(&mut self, increment: bool) {
        if self.inserted_pending == 0 {
            if increment {
                self.current_progress += 1;
            }
        } else {
            self.inserted_pending -= 1;
        }
    }

    /// The current object, if the cursor is on one.
    pub fn current_transition(&self) -> Option<&CourseObject> {
        self.cursor.and_then(|i| self.objects.get(i))
    }

    /// Insert objects immediately after the current one.
    pub fn insert_transitions(&mut self, objects: Vec<CourseObject>) {
        if objects.is_empty() {
            return;
        }
        let at = self.next_index().min(self.objects.len());
        info!(at, count = objects.len(), "Inserting course objects");
        self.inserted_pending += objects.len();
        self.objects.splice(at..at, objects);
    }

    /// Insert a single object immediately after the current one.
    pub fn insert_transition(&mut self, object: CourseObject) {
        self.insert_transitions(vec![object]);
    }

    /// Skip every remaining object and mark the course complete.
    pub fn set_next_transition_to_end(&mut self) {
        self.cursor = Some(self.objects.len());
        self.set_progress_to_end();
    }

    /// Mark progress as complete.
    pub fn set_progress_to_end(&mut self) {
        self.inserted_pending = 0;
        self.current_progress = self.max_progress;
    }

    /// Current progress.
    pub fn progress(&self) -> Progress {
        Progress {
            current: self.current_progress,
            max: self.max_progress,
        }
    }

    /// Add a progress reporter.
    pub fn add_progress_reporter(&mut self, reporter: Arc<dyn ProgressReporter>) {
        self.reporters.push(reporter);
    }

    /// Prepare a progress report.
    ///
    /// A final report takes the reporters with it, so no report (final or
    /// otherwise) can follow.
    pub fn progress_report(&mut self, is_final: bool) -> ProgressReport {
        let reporters = if is_final {
            std::mem::take(&mut self.reporters)
        } else {
            self.reporters.clone()
        };
        ProgressReport {
            progress: self.progress(),
            is_final,
            reporters,
        }
    }
}
