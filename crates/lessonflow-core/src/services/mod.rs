// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The boundary to collaborating services.
//!
//! A session talks to six services, each addressed by a [`ModuleKind`]:
//!
//! | Module | Role |
//! |--------|------|
//! | `Tutor` | UI presentation: guidance, surveys, reviews, final message |
//! | `Gateway` | training application control |
//! | `Learner` | learner model |
//! | `Pedagogy` | pedagogical decisions (adaptive courseflow) |
//! | `Lms` | score publication and retrieval |
//! | `Sensor` | sensor capture |
//!
//! Every request goes through [`ServiceBus::send`] with a [`Callback`] that
//! receives the reply. How a bus reaches the service (message broker,
//! in-process call, test script) is its own business.

pub mod loopback;
pub mod mock;

pub use loopback::LoopbackBus;
pub use mock::{MockServiceBus, RecordedRequest, ScriptedReply};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::callback::Callback;
use crate::course::review::ReviewEvent;

/// A collaborating service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// UI presentation.
    Tutor,
    /// Training application gateway.
    Gateway,
    /// Learner model.
    Learner,
    /// Pedagogical decisions.
    Pedagogy,
    /// Scoring and learning management.
    Lms,
    /// Sensor capture.
    Sensor,
}

impl ModuleKind {
    /// Every module, in the order sessions are closed on them.
    pub const ALL: [ModuleKind; 6] = [
        ModuleKind::Learner,
        ModuleKind::Pedagogy,
        ModuleKind::Gateway,
        ModuleKind::Sensor,
        ModuleKind::Lms,
        ModuleKind::Tutor,
    ];
}

/// Identity of the session a request belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Domain session id.
    pub session_id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Owning user's name.
    pub username: String,
    /// Course being run.
    pub course_id: String,
    /// Experiment the course runs in, if any.
    pub experiment_id: Option<String>,
    /// Whether the learner runs the course embedded in another application.
    pub embedded: bool,
}

/// Requests a session can send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceRequest {
    // Initialization
    /// Load the learner model for this user.
    InitializeLearner,
    /// Tell the UI a domain session exists.
    InitializeDomainSession {
        /// Course being run.
        course_id: String,
    },
    /// Prepare the pedagogical model.
    InitializePedagogy,
    /// Start sensor capture.
    InitializeSensors,
    /// Connect the gateway interops the course needs.
    ConnectGateway {
        /// Interop plugin names.
        interops: Vec<String>,
    },
    /// Start the session on every module.
    StartSession,

    // Presentation
    /// Show guidance.
    DisplayGuidance {
        /// Content.
        message: String,
        /// Take over the learner view.
        full_screen: bool,
        /// Close automatically after this many seconds.
        duration_secs: Option<u64>,
    },
    /// Show a survey; the reply payload holds the response.
    DisplaySurvey {
        /// Survey key.
        survey_key: String,
        /// Take over the learner view.
        full_screen: bool,
    },
    /// Show lesson material.
    DisplayLessonMaterial {
        /// Resource references.
        resources: Vec<String>,
    },
    /// Show an after-action review.
    DisplayAar {
        /// Events to review, oldest first.
        events: Vec<ReviewEvent>,
        /// Shown instead of the events when there are none.
        message: Option<String>,
        /// Take over the learner view.
        full_screen: bool,
    },
    /// Last message before the session closes.
    DisplayFinalMessage {
        /// Message text.
        message: String,
    },

    // Training application
    /// Load a scenario.
    LoadScenario {
        /// Opaque scenario description.
        scenario: Value,
        /// Whether the application runs embedded.
        embedded: bool,
    },
    /// Start the loaded scenario. Intermediate payloads are assessments;
    /// the terminal reply arrives when the scenario ends.
    StartScenario {
        /// Lesson name.
        lesson_name: String,
    },
    /// Pause the scenario.
    PauseScenario,
    /// Resume the scenario.
    ResumeScenario,
    /// Stop the scenario.
    StopScenario,
    /// Stop replaying a log.
    StopPlayback {
        /// Playback handle returned when the replay started.
        handle: String,
    },
    /// The lesson with real-time assessment is over.
    LessonCompleted,

    // Learner model and pedagogy
    /// A course object started.
    CourseStateChanged {
        /// Object name.
        object_name: String,
        /// Object kind.
        object_kind: String,
    },
    /// Ask what to show next for an adaptive section.
    AdaptiveCourseflowRequest {
        /// Concepts of the section.
        concepts: Vec<String>,
    },

    // LMS
    /// Publish a lesson score.
    PublishScore {
        /// Learner identity.
        username: String,
        /// Lesson that produced the score.
        lesson_name: String,
        /// The score.
        score: Value,
    },
    /// Fetch published score records.
    LmsDataRequest {
        /// Records to fetch.
        record_ids: Vec<String>,
    },

    /// Close the session on a module.
    CloseSession {
        /// Why the session ends.
        reason: String,
    },
}

/// Payload-free request discriminant, for scripting and journals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum RequestKind {
    InitializeLearner,
    InitializeDomainSession,
    InitializePedagogy,
    InitializeSensors,
    ConnectGateway,
    StartSession,
    DisplayGuidance,
    DisplaySurvey,
    DisplayLessonMaterial,
    DisplayAar,
    DisplayFinalMessage,
    LoadScenario,
    StartScenario,
    PauseScenario,
    ResumeScenario,
    StopScenario,
    StopPlayback,
    LessonCompleted,
    CourseStateChanged,
    AdaptiveCourseflowRequest,
    PublishScore,
    LmsDataRequest,
    CloseSession,
}

impl RequestKind {
    /// Name used in logs and callback labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::InitializeLearner => "initialize_learner",
            RequestKind::InitializeDomainSession => "initialize_domain_session",
            RequestKind::InitializePedagogy => "initialize_pedagogy",
            RequestKind::InitializeSensors => "initialize_sensors",
            RequestKind::ConnectGateway => "connect_gateway",
            RequestKind::StartSession => "start_session",
            RequestKind::DisplayGuidance => "display_guidance",
            RequestKind::DisplaySurvey => "display_survey",
            RequestKind::DisplayLessonMaterial => "display_lesson_material",
            RequestKind::DisplayAar => "display_aar",
            RequestKind::DisplayFinalMessage => "display_final_message",
            RequestKind::LoadScenario => "load_scenario",
            RequestKind::StartScenario => "start_scenario",
            RequestKind::PauseScenario => "pause_scenario",
            RequestKind::ResumeScenario => "resume_scenario",
            RequestKind::StopScenario => "stop_scenario",
            RequestKind::StopPlayback => "stop_playback",
            RequestKind::LessonCompleted => "lesson_completed",
            RequestKind::CourseStateChanged => "course_state_changed",
            RequestKind::AdaptiveCourseflowRequest => "adaptive_courseflow_request",
            RequestKind::PublishScore => "publish_score",
            RequestKind::LmsDataRequest => "lms_data_request",
            RequestKind::CloseSession => "close_session",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServiceRequest {
    /// Discriminant of this request.
    pub fn kind(&self) -> RequestKind {
        match self {
            ServiceRequest::InitializeLearner => RequestKind::InitializeLearner,
            ServiceRequest::InitializeDomainSession { .. } => RequestKind::InitializeDomainSession,
            ServiceRequest::InitializePedagogy => RequestKind::InitializePedagogy,
            ServiceRequest::InitializeSensors => RequestKind::InitializeSensors,
            ServiceRequest::ConnectGateway { .. } => RequestKind::ConnectGateway,
            ServiceRequest::StartSession => RequestKind::StartSession,
            ServiceRequest::DisplayGuidance { .. } => RequestKind::DisplayGuidance,
            ServiceRequest::DisplaySurvey { .. } => RequestKind::DisplaySurvey,
            ServiceRequest::DisplayLessonMaterial { .. } => RequestKind::DisplayLessonMaterial,
            ServiceRequest::DisplayAar { .. } => RequestKind::DisplayAar,
            ServiceRequest::DisplayFinalMessage { .. } => RequestKind::DisplayFinalMessage,
            ServiceRequest::LoadScenario { .. } => RequestKind::LoadScenario,
            ServiceRequest::StartScenario { .. } => RequestKind::StartScenario,
            ServiceRequest::PauseScenario => RequestKind::PauseScenario,
            ServiceRequest::ResumeScenario => RequestKind::ResumeScenario,
            ServiceRequest::StopScenario => RequestKind::StopScenario,
            ServiceRequest::StopPlayback { .. } => RequestKind::StopPlayback,
            ServiceRequest::LessonCompleted => RequestKind::LessonCompleted,
            ServiceRequest::CourseStateChanged { .. } => RequestKind::CourseStateChanged,
            ServiceRequest::AdaptiveCourseflowRequest { .. } => {
                RequestKind::AdaptiveCourseflowRequest
            }
            ServiceRequest::PublishScore { .. } => RequestKind::PublishScore,
            ServiceRequest::LmsDataRequest { .. } => RequestKind::LmsDataRequest,
            ServiceRequest::CloseSession { .. } => RequestKind::CloseSession,
        }
    }

    /// Whether the request needs an established gateway connection.
    ///
    /// Loading a scenario and connecting are always allowed.
    pub fn needs_gateway_connection(&self) -> bool {
        matches!(
            self.kind(),
            RequestKind::StartScenario
                | RequestKind::PauseScenario
                | RequestKind::ResumeScenario
                | RequestKind::StopScenario
                | RequestKind::LessonCompleted
        )
    }
}

/// Transport to the collaborating services.
///
/// Implementations must eventually deliver exactly one terminal outcome on
/// `callback` for every request they accept, or drop it (which the waiting
/// side treats as a communication failure).
#[async_trait]
pub trait ServiceBus: Send + Sync {
    /// Send `request` for `session` to `target`.
    async fn send(
        &self,
        session: &SessionInfo,
        target: ModuleKind,
        request: ServiceRequest,
        callback: Callback,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_connection_requirement() {
        assert!(!ServiceRequest::LoadScenario {
            scenario: Value::Null,
            embedded: false
        }
        .needs_gateway_connection());
        assert!(ServiceRequest::StopScenario.needs_gateway_connection());
        assert!(ServiceRequest::LessonCompleted.needs_gateway_connection());
        assert!(!ServiceRequest::StartSession.needs_gateway_connection());
    }

    #[test]
    fn test_request_serializes_with_tag() {
        let json = serde_json::to_value(ServiceRequest::CloseSession {
            reason: "done".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "close_session", "reason": "done"}));
        assert_eq!(
            ServiceRequest::PauseScenario.kind().to_string(),
            "pause_scenario"
        );
    }
}
