// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Course objects: the closed set of content units a course is made of.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::branch::AuthoredBranch;

/// Instructional text shown to the learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guidance {
    /// Name used for logging and lookup.
    pub name: String,
    /// Disabled objects are skipped.
    #[serde(default)]
    pub disabled: bool,
    /// Content to display.
    pub message: String,
    /// Whether to take over the whole learner view.
    #[serde(default)]
    pub full_screen: bool,
    /// Display for this long, then continue automatically.
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

/// A survey presented through the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Survey {
    /// Name used for logging and lookup.
    pub name: String,
    /// Disabled objects are skipped.
    #[serde(default)]
    pub disabled: bool,
    /// Key of the survey in the survey store.
    pub survey_key: String,
    /// Whether to take over the whole learner view.
    #[serde(default = "default_true")]
    pub full_screen: bool,
}

/// A scenario run in an external (or embedded) training application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingApplication {
    /// Name used for logging and lookup.
    pub name: String,
    /// Disabled objects are skipped.
    #[serde(default)]
    pub disabled: bool,
    /// Opaque scenario description forwarded to the gateway.
    #[serde(default)]
    pub scenario: Value,
    /// Whether a real-time assessment (knowledge session) runs alongside.
    #[serde(default)]
    pub real_time_assessment: bool,
    /// Gateway interop plugins to connect; empty means no gateway connection.
    #[serde(default)]
    pub interops: Vec<String>,
    /// Whether the application is embedded in the learner's browser.
    #[serde(default)]
    pub embedded: bool,
    /// Team roles for a shared knowledge session; empty for individual lessons.
    #[serde(default)]
    pub team_roles: Vec<String>,
    /// Log to replay instead of running a live scenario.
    #[serde(default)]
    pub playback_log: Option<String>,
}

impl TrainingApplication {
    /// Whether the gateway must be connected for this lesson.
    pub fn uses_interops(&self) -> bool {
        !self.interops.is_empty()
    }

    /// Whether the lesson is shared by a team.
    pub fn is_team_lesson(&self) -> bool {
        !self.team_roles.is_empty()
    }
}

/// Static lesson material (slides, documents, web pages).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonMaterial {
    /// Name used for logging and lookup.
    pub name: String,
    /// Disabled objects are skipped.
    #[serde(default)]
    pub disabled: bool,
    /// Resource references handed to the UI.
    #[serde(default)]
    pub resources: Vec<String>,
}

/// Displays the pending review events collected so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AfterActionReview {
    /// Name used for logging and lookup.
    pub name: String,
    /// Disabled objects are skipped.
    #[serde(default)]
    pub disabled: bool,
    /// Whether to take over the whole learner view.
    #[serde(default = "default_true")]
    pub full_screen: bool,
}

/// Asks the pedagogical service what the learner should see next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveCourseflow {
    /// Name used for logging and lookup.
    pub name: String,
    /// Disabled objects are skipped.
    #[serde(default)]
    pub disabled: bool,
    /// Concepts covered by this adaptive section.
    #[serde(default)]
    pub concepts: Vec<String>,
}

/// Synthetic marker placed after the objects of a selected branch path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathEnd {
    /// Branch the path belongs to.
    pub branch_id: i64,
    /// Name of the branch object.
    pub branch_name: String,
    /// The path that just finished.
    pub path_id: i64,
    /// Name of the path.
    pub path_name: String,
}

/// One unit of course content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CourseObject {
    /// Instructional text.
    Guidance(Guidance),
    /// A survey.
    Survey(Survey),
    /// A training application scenario.
    TrainingApplication(TrainingApplication),
    /// Lesson material.
    LessonMaterial(LessonMaterial),
    /// After-action review of pending events.
    AfterActionReview(AfterActionReview),
    /// Authored branch choosing one of several paths.
    AuthoredBranch(AuthoredBranch),
    /// Adaptive courseflow driven by the pedagogical service.
    AdaptiveCourseflow(AdaptiveCourseflow),
    /// End of a branch path.
    PathEnd(PathEnd),
}

impl CourseObject {
    /// Name used for logging and lookup.
    pub fn name(&self) -> &str {
        match self {
            CourseObject::Guidance(o) => &o.name,
            CourseObject::Survey(o) => &o.name,
            CourseObject::TrainingApplication(o) => &o.name,
            CourseObject::LessonMaterial(o) => &o.name,
            CourseObject::AfterActionReview(o) => &o.name,
            CourseObject::AuthoredBranch(o) => &o.name,
            CourseObject::AdaptiveCourseflow(o) => &o.name,
            CourseObject::PathEnd(o) => &o.path_name,
        }
    }

    /// Whether the author disabled this object. Path end markers never are.
    pub fn is_disabled(&self) -> bool {
        match self {
            CourseObject::Guidance(o) => o.disabled,
            CourseObject::Survey(o) => o.disabled,
            CourseObject::TrainingApplication(o) => o.disabled,
            CourseObject::LessonMaterial(o) => o.disabled,
            CourseObject::AfterActionReview(o) => o.disabled,
            CourseObject::AuthoredBranch(o) => o.disabled,
            CourseObject::AdaptiveCourseflow(o) => o.disabled,
            CourseObject::PathEnd(_) => false,
        }
    }

    /// Short kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CourseObject::Guidance(_) => "guidance",
            CourseObject::Survey(_) => "survey",
            CourseObject::TrainingApplication(_) => "training_application",
            CourseObject::LessonMaterial(_) => "lesson_material",
            CourseObject::AfterActionReview(_) => "after_action_review",
            CourseObject::AuthoredBranch(_) => "authored_branch",
            CourseObject::AdaptiveCourseflow(_) => "adaptive_courseflow",
            CourseObject::PathEnd(_) => "path_end",
        }
    }
}

/// A course as loaded from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseDefinition {
    /// Identifier of the course (used to key branch history).
    pub course_id: String,
    /// Display name.
    pub name: String,
    /// Objects in authored order.
    pub objects: Vec<CourseObject>,
}

impl CourseDefinition {
    /// Parse a course from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

fn default_true() -> bool {
    true
}
