// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Branch path history store.
//!
//! Authored branches using a balanced or custom distribution need to know
//! how many learners already took each path. The history is keyed by
//! `(course_id, experiment_id, branch_id, path_id)` and shared by every
//! session of a deployment.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresBranchHistory;
pub use self::sqlite::SqliteBranchHistory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SessionError;

/// Experiment id stored when a session is not part of an experiment.
pub const NOT_AVAILABLE: &str = "N/A";

/// Identifies one path of one branch of one course.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchPathKey {
    /// Course identifier.
    pub course_id: String,
    /// Experiment identifier, if the course runs inside an experiment.
    pub experiment_id: Option<String>,
    /// Authored branch id.
    pub branch_id: i64,
    /// Path id within the branch.
    pub path_id: i64,
}

impl BranchPathKey {
    /// The experiment id as stored.
    pub fn stored_experiment_id(&self) -> &str {
        self.experiment_id.as_deref().unwrap_or(NOT_AVAILABLE)
    }
}

/// A history update sent when a path is entered or finished.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchPathUpdate {
    /// Path being updated.
    pub key: BranchPathKey,
    /// Path name, kept for reporting.
    pub path_name: String,
    /// Count this learner (first entry into the branch for this session).
    pub increment: bool,
    /// The learner finished the path. Stores ignore these for counting.
    pub path_ending: bool,
}

/// Branch path history row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BranchPathHistoryRecord {
    /// Course identifier.
    pub course_id: String,
    /// Experiment identifier (`N/A` outside experiments).
    pub experiment_id: String,
    /// Authored branch id.
    pub branch_id: i64,
    /// Path id.
    pub path_id: i64,
    /// Path name at the time of the last update.
    pub path_name: Option<String>,
    /// Learners counted for distribution decisions.
    pub learner_count: i64,
    /// Learners who actually entered the path.
    pub actual_count: i64,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

/// Persistence interface for branch path history.
#[async_trait]
pub trait BranchHistoryStore: Send + Sync {
    /// Fetch the history of each key, creating zeroed rows for unknown keys.
    ///
    /// The result is in the same order as `keys`.
    async fn path_counts(
        &self,
        keys: &[BranchPathKey],
        path_names: &[String],
    ) -> Result<Vec<BranchPathHistoryRecord>, SessionError>;

    /// Record that a learner entered (or finished) a path.
    ///
    /// Path-ending updates are accepted and ignored.
    async fn record(&self, update: &BranchPathUpdate) -> Result<(), SessionError>;

    /// Look up a single path.
    async fn get(&self, key: &BranchPathKey)
    -> Result<Option<BranchPathHistoryRecord>, SessionError>;
}
