// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Course flow: what the learner sees, in which order.
//!
//! - [`object`]: the closed set of course objects
//! - [`queue`]: the mutable object queue with mid-course insertion
//! - [`branch`]: authored branch path selection
//! - [`conditions`]: learner-centric path conditions
//! - [`review`]: events waiting for an after-action review
//! - [`progress`]: progress reporting

pub mod branch;
pub mod conditions;
pub mod object;
pub mod progress;
pub mod queue;
pub mod review;

pub use branch::{AuthoredBranch, BranchPath, BranchSelector, BranchStrategy};
pub use conditions::{LearnerHistory, PathCondition};
pub use object::{CourseDefinition, CourseObject};
pub use progress::{Progress, ProgressReporter};
pub use queue::CourseQueue;
pub use review::{PendingReviewEvents, ReviewEvent};
