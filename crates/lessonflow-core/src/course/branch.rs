// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authored branches and path selection.
//!
//! A branch holds several paths; exactly one is chosen each time the branch
//! is reached. The selection strategies are:
//!
//! | Strategy | Input | Choice |
//! |----------|-------|--------|
//! | `random` | path count | uniform |
//! | `balanced` | historical counts | lowest count, first wins ties |
//! | `custom_percent` | authored percentages + counts | path whose selection keeps the distribution closest to the authored one |
//! | `learner_centric` | conditions + learner history | unique highest score, else the default path |
//!
//! The selected path's objects are spliced into the course queue followed by
//! a [`PathEnd`] marker.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::conditions::{LearnerHistory, PathCondition};
use super::object::{CourseObject, PathEnd};
use crate::error::{Result, SessionError};
use crate::persistence::{BranchHistoryStore, BranchPathKey, BranchPathUpdate};

/// How a branch picks its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStrategy {
    /// Uniformly random.
    Random,
    /// Least-taken path.
    Balanced,
    /// Follow authored percentages.
    CustomPercent,
    /// Path whose conditions best match the learner.
    LearnerCentric,
}

/// One path of an authored branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchPath {
    /// Path identifier, unique within the branch.
    pub path_id: i64,
    /// Display name.
    pub name: String,
    /// Share of learners (0 to 100) for `custom_percent` branches.
    #[serde(default)]
    pub percent: Option<f64>,
    /// Conditions for `learner_centric` branches.
    #[serde(default)]
    pub conditions: Vec<PathCondition>,
    /// Objects the learner sees on this path.
    #[serde(default)]
    pub objects: Vec<CourseObject>,
    /// Fallback path for `learner_centric` branches.
    #[serde(default)]
    pub is_default: bool,
}

/// A course object that splits the course into alternative paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoredBranch {
    /// Name used for logging and lookup.
    pub name: String,
    /// Disabled objects are skipped.
    #[serde(default)]
    pub disabled: bool,
    /// Branch identifier, unique within the course.
    pub branch_id: i64,
    /// Selection strategy.
    pub strategy: BranchStrategy,
    /// Candidate paths in authored order.
    pub paths: Vec<BranchPath>,
}

impl AuthoredBranch {
    /// Index of the default path; the first path when none is flagged.
    pub fn default_path_index(&self) -> usize {
        self.paths.iter().position(|p| p.is_default).unwrap_or(0)
    }

    /// Whether any path condition needs LMS score records.
    pub fn needs_scores(&self) -> bool {
        self.strategy == BranchStrategy::LearnerCentric
            && self
                .paths
                .iter()
                .flat_map(|p| &p.conditions)
                .any(PathCondition::needs_scores)
    }
}

// ============================================================================
// Selection algorithms
// ============================================================================

/// Uniform pick among `path_count` paths.
pub fn select_random<R: Rng + ?Sized>(path_count: usize, rng: &mut R) -> Option<usize> {
    if path_count == 0 {
        return None;
    }
    Some(rng.gen_range(0..path_count))
}

/// Index of the lowest count. The first one wins ties.
pub fn select_balanced(counts: &[i64]) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (i, &count) in counts.iter().enumerate() {
        match best {
            Some((_, lowest)) if count >= lowest => {}
            _ => best = Some((i, count)),
        }
    }
    best.map(|(i, _)| i)
}

/// Greedy pick that keeps the realized distribution closest to `fractions`.
///
/// For each candidate `i` the distance
/// `Σj |fractions[j] - (counts[j] + [i == j]) / (total + 1)|` is computed
/// and the smallest wins; the first one wins ties.
pub fn select_custom_percent(fractions: &[f64], counts: &[i64]) -> Option<usize> {
    if fractions.is_empty() || fractions.len() != counts.len() {
        return None;
    }

    let total: i64 = counts.iter().sum();
    let denominator = (total + 1) as f64;

    let mut best: Option<(usize, f64)> = None;
    for candidate in 0..fractions.len() {
        let distance: f64 = fractions
            .iter()
            .zip(counts)
            .enumerate()
            .map(|(j, (fraction, &count))| {
                let taken = if j == candidate { count + 1 } else { count };
                (fraction - taken as f64 / denominator).abs()
            })
            .sum();

        match best {
            Some((_, lowest)) if distance >= lowest => {}
            _ => best = Some((candidate, distance)),
        }
    }
    best.map(|(i, _)| i)
}

/// Index of the unique highest score; `default` when the highest is tied
/// (which includes all paths scoring zero).
pub fn select_learner_centric(scores: &[usize], default: usize) -> usize {
    let Some(&highest) = scores.iter().max() else {
        return default;
    };
    if highest == 0 {
        return default;
    }

    let mut winners = scores.iter().enumerate().filter(|(_, s)| **s == highest);
    match (winners.next(), winners.next()) {
        (Some((i, _)), None) => i,
        _ => default,
    }
}

/// The objects to splice into the queue for the selected path.
pub fn expand(branch: &AuthoredBranch, path_index: usize) -> Vec<CourseObject> {
    let Some(path) = branch.paths.get(path_index) else {
        return Vec::new();
    };

    let mut objects = path.objects.clone();
    objects.push(CourseObject::PathEnd(PathEnd {
        branch_id: branch.branch_id,
        branch_name: branch.name.clone(),
        path_id: path.path_id,
        path_name: path.name.clone(),
    }));
    objects
}

// ============================================================================
// Selector
// ============================================================================

/// Chooses branch paths and records them in the shared history.
#[derive(Clone)]
pub struct BranchSelector {
    store: Arc<dyn BranchHistoryStore>,
    course_id: String,
    experiment_id: Option<String>,
}

impl std::fmt::Debug for BranchSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchSelector")
            .field("course_id", &self.course_id)
            .field("experiment_id", &self.experiment_id)
            .finish()
    }
}

impl BranchSelector {
    /// Create a selector for one course (and experiment).
    pub fn new(
        store: Arc<dyn BranchHistoryStore>,
        course_id: impl Into<String>,
        experiment_id: Option<String>,
    ) -> Self {
        Self {
            store,
            course_id: course_id.into(),
            experiment_id,
        }
    }

    /// History key of one path.
    pub fn key(&self, branch_id: i64, path_id: i64) -> BranchPathKey {
        BranchPathKey {
            course_id: self.course_id.clone(),
            experiment_id: self.experiment_id.clone(),
            branch_id,
            path_id,
        }
    }

    /// Choose a path index for `branch`.
    #[instrument(skip(self, branch, history), fields(branch_id = branch.branch_id, strategy = ?branch.strategy))]
    pub async fn select(&self, branch: &AuthoredBranch, history: &LearnerHistory) -> Result<usize> {
        if branch.paths.is_empty() {
            return Err(SessionError::BranchSelectionFailed {
                branch_id: branch.branch_id,
                reason: "branch has no paths".to_string(),
            });
        }

        let selected = match branch.strategy {
            BranchStrategy::Random => select_random(branch.paths.len(), &mut rand::thread_rng()),
            BranchStrategy::Balanced => {
                let counts = self.counts(branch).await?;
                select_balanced(&counts)
            }
            BranchStrategy::CustomPercent => {
                let counts = self.counts(branch).await?;
                let fractions: Vec<f64> = branch
                    .paths
                    .iter()
                    .map(|p| p.percent.unwrap_or(0.0) / 100.0)
                    .collect();
                select_custom_percent(&fractions, &counts)
            }
            BranchStrategy::LearnerCentric => {
                let scores: Vec<usize> = branch
                    .paths
                    .iter()
                    .map(|p| history.path_score(&p.conditions))
                    .collect();
                debug!(?scores, "Scored learner-centric paths");
                Some(select_learner_centric(&scores, branch.default_path_index()))
            }
        };

        let index = selected.ok_or_else(|| SessionError::BranchSelectionFailed {
            branch_id: branch.branch_id,
            reason: "no path could be selected".to_string(),
        })?;

        info!(
            path_id = branch.paths[index].path_id,
            path = %branch.paths[index].name,
            "Selected branch path"
        );
        Ok(index)
    }

    async fn counts(&self, branch: &AuthoredBranch) -> Result<Vec<i64>> {
        let keys: Vec<BranchPathKey> = branch
            .paths
            .iter()
            .map(|p| self.key(branch.branch_id, p.path_id))
            .collect();
        let names: Vec<String> = branch.paths.iter().map(|p| p.name.clone()).collect();

        let records = self.store.path_counts(&keys, &names).await?;
        Ok(records.iter().map(|r| r.learner_count).collect())
    }

    /// Record that the learner entered the path at `path_index`.
    pub async fn record_entry(
        &self,
        branch: &AuthoredBranch,
        path_index: usize,
        increment: bool,
    ) -> Result<()> {
        let Some(path) = branch.paths.get(path_index) else {
            return Err(SessionError::BranchSelectionFailed {
                branch_id: branch.branch_id,
                reason: format!("path index {} out of range", path_index),
            });
        };

        self.store
            .record(&BranchPathUpdate {
                key: self.key(branch.branch_id, path.path_id),
                path_name: path.name.clone(),
                increment,
                path_ending: false,
            })
            .await
    }

    /// Record that the learner finished a path.
    pub async fn record_path_end(&self, end: &PathEnd) -> Result<()> {
        self.store
            .record(&BranchPathUpdate {
                key: self.key(end.branch_id, end.path_id),
                path_name: end.path_name.clone(),
                increment: false,
                path_ending: true,
            })
            .await
    }
}
