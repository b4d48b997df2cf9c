// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Events waiting for the next after-action review.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Message shown by a review that has nothing to show.
pub const NOTHING_TO_REVIEW: &str = "There are no results to review at this time.";

/// Something the learner did that a later review will display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReviewEvent {
    /// A survey was completed.
    SurveyResult {
        /// When it was completed.
        timestamp: DateTime<Utc>,
        /// Survey name.
        survey_name: String,
        /// Survey results as returned by the UI.
        results: Value,
    },
    /// A scenario ended with a score.
    ScenarioScore {
        /// When the score was produced.
        timestamp: DateTime<Utc>,
        /// Lesson name.
        lesson_name: String,
        /// The score as produced by the assessment.
        score: Value,
    },
}

impl ReviewEvent {
    /// Event time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ReviewEvent::SurveyResult { timestamp, .. } => *timestamp,
            ReviewEvent::ScenarioScore { timestamp, .. } => *timestamp,
        }
    }
}

/// Review events ordered by timestamp.
///
/// Draining removes what it returns, so an event is displayed at most once.
#[derive(Debug, Default)]
pub struct PendingReviewEvents {
    events: BTreeMap<(DateTime<Utc>, u64), ReviewEvent>,
    seq: u64,
}

impl PendingReviewEvents {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event.
    pub fn add(&mut self, event: ReviewEvent) {
        self.seq += 1;
        self.events.insert((event.timestamp(), self.seq), event);
    }

    /// Remove and return every event, oldest first.
    pub fn drain_for_display(&mut self) -> Vec<ReviewEvent> {
        std::mem::take(&mut self.events).into_values().collect()
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop every pending event.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}
