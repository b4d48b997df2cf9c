// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Multi-phase graceful termination.
//!
//! ```text
//!   1 lesson completed ─► 2 stop scenario ─► 3 mark CLOSING ─► 4 notify joiners
//!     ─► 5 publish pending score ─► 6 close modules ─► 7 final message
//!     ─► 8 close tutor ─► 9 cleanup
//! ```
//!
//! Every phase is best-effort and bounded by the phase timeout: a failing or
//! hanging collaborator costs at most one timeout, and the next phase runs
//! regardless. The UI presentation module is closed last so the learner can
//! read the final message.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::coordinator::{ModuleCoordinator, RequestOutcome};
use crate::error::COURSE_ENDING_MESSAGE;
use crate::services::{ModuleKind, ServiceRequest};
use crate::state::SessionLifecycle;

/// Message shown when the learner finished the whole course.
pub const COURSE_COMPLETED_MESSAGE: &str = "You have completed the course.";

/// Why a session ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    /// Every course object was visited.
    CourseCompleted,
    /// The learner left early.
    LearnerExit,
    /// A fatal error. `details` is only ever logged.
    Error {
        /// What went wrong.
        details: String,
    },
}

impl TerminationReason {
    /// Short code sent to collaborating modules.
    pub fn code(&self) -> &'static str {
        match self {
            TerminationReason::CourseCompleted => "course_completed",
            TerminationReason::LearnerExit => "learner_exit",
            TerminationReason::Error { .. } => "error",
        }
    }

    /// Final message for the learner, if any.
    pub fn final_message(&self) -> Option<&'static str> {
        match self {
            TerminationReason::CourseCompleted => Some(COURSE_COMPLETED_MESSAGE),
            TerminationReason::LearnerExit => None,
            TerminationReason::Error { .. } => Some(COURSE_ENDING_MESSAGE),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Error { details } => write!(f, "error: {}", details),
            other => f.write_str(other.code()),
        }
    }
}

/// Termination phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPhase {
    /// Tell the gateway a real-time-assessment lesson is over.
    LessonCompleted,
    /// Stop the scenario and any playback.
    StopScenario,
    /// RUNNING → CLOSING.
    MarkClosing,
    /// End a hosted knowledge session, cascading to joiners.
    NotifyJoiners,
    /// Publish a score that was not published yet.
    PublishScore,
    /// Close the session on every module except UI presentation.
    CloseModules,
    /// Show the final message.
    FinalMessage,
    /// Close the session on UI presentation.
    CloseTutor,
    /// CLOSING → CLOSED and resource release.
    Cleanup,
}

impl TerminationPhase {
    /// Every phase in order.
    pub const ALL: [TerminationPhase; 9] = [
        TerminationPhase::LessonCompleted,
        TerminationPhase::StopScenario,
        TerminationPhase::MarkClosing,
        TerminationPhase::NotifyJoiners,
        TerminationPhase::PublishScore,
        TerminationPhase::CloseModules,
        TerminationPhase::FinalMessage,
        TerminationPhase::CloseTutor,
        TerminationPhase::Cleanup,
    ];
}

/// How one phase went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "details", rename_all = "snake_case")]
pub enum PhaseOutcome {
    /// The phase did its work.
    Completed,
    /// Nothing to do.
    Skipped,
    /// The phase failed; termination continued.
    Failed(String),
    /// The phase hit the phase timeout; termination continued.
    TimedOut,
}

impl From<RequestOutcome> for PhaseOutcome {
    fn from(outcome: RequestOutcome) -> Self {
        match outcome {
            RequestOutcome::Completed(_) => PhaseOutcome::Completed,
            RequestOutcome::Failed(failure) => PhaseOutcome::Failed(failure.to_string()),
            RequestOutcome::Dropped => PhaseOutcome::Skipped,
        }
    }
}

/// Per-phase outcomes of one termination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminationReport {
    /// Why the session ended.
    pub reason: TerminationReason,
    /// Outcomes in execution order.
    pub phases: Vec<(TerminationPhase, PhaseOutcome)>,
}

impl TerminationReport {
    /// Outcome of `phase`.
    pub fn outcome(&self, phase: TerminationPhase) -> Option<&PhaseOutcome> {
        self.phases
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, outcome)| outcome)
    }

    /// Phases that failed or timed out.
    pub fn problems(&self) -> Vec<TerminationPhase> {
        self.phases
            .iter()
            .filter(|(_, o)| matches!(o, PhaseOutcome::Failed(_) | PhaseOutcome::TimedOut))
            .map(|(p, _)| *p)
            .collect()
    }
}

/// Result of asking a session to terminate.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationStatus {
    /// This call ran the termination phases.
    Performed(TerminationReport),
    /// Another call is terminating (or terminated) the session. Await
    /// the session's closed state to know when it is done.
    AlreadyTerminating,
}

impl TerminationStatus {
    /// The report, if this call performed the termination.
    pub fn report(&self) -> Option<&TerminationReport> {
        match self {
            TerminationStatus::Performed(report) => Some(report),
            TerminationStatus::AlreadyTerminating => None,
        }
    }
}

/// What the scenario phase has to stop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioRelease {
    /// A scenario is loaded or running.
    pub scenario_active: bool,
    /// Playback to stop.
    pub playback: Option<String>,
}

/// A score produced by a lesson and not yet published.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingScore {
    /// Lesson that produced it.
    pub lesson_name: String,
    /// The score.
    pub score: Value,
}

/// The session side of termination.
pub trait Teardown: Send + Sync {
    /// Coordinator used for shutdown requests.
    fn coordinator(&self) -> &ModuleCoordinator;

    /// Lifecycle to move to CLOSING.
    fn lifecycle(&self) -> &SessionLifecycle;

    /// Whether a lesson with real-time assessment over gateway interops is active.
    fn assessment_over_interops(&self) -> bool;

    /// Release live-entity tracking and resolve pending playback; report
    /// what is left to stop.
    fn release_scenario(&self) -> ScenarioRelease;

    /// End the knowledge session this session hosts. `None` if it hosts none,
    /// otherwise the number of joiners notified.
    fn end_hosted_session(&self) -> Option<usize>;

    /// Take the score waiting for publication.
    fn take_unpublished_score(&self) -> Option<PendingScore>;

    /// CLOSING → CLOSED. `true` only for the call that performed it.
    fn cleanup(&self) -> bool;
}

/// Runs the termination phases.
#[derive(Debug, Clone, Copy)]
pub struct TerminationController {
    phase_timeout: Duration,
}

impl TerminationController {
    /// Create a controller bounding each phase by `phase_timeout`.
    pub fn new(phase_timeout: Duration) -> Self {
        Self { phase_timeout }
    }

    /// Run every phase against `session`.
    #[instrument(skip(self, session, reason), fields(session_id = session.coordinator().info().session_id, reason = reason.code()))]
    pub async fn run(&self, session: &dyn Teardown, reason: TerminationReason) -> TerminationReport {
        let mut phases = Vec::with_capacity(TerminationPhase::ALL.len());

        for phase in TerminationPhase::ALL {
            let outcome = match tokio::time::timeout(
                self.phase_timeout,
                self.run_phase(phase, session, &reason),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => PhaseOutcome::TimedOut,
            };

            match &outcome {
                PhaseOutcome::Failed(error) => {
                    warn!(phase = ?phase, error = %error, "Termination phase failed");
                }
                PhaseOutcome::TimedOut => {
                    warn!(phase = ?phase, timeout = ?self.phase_timeout, "Termination phase timed out");
                }
                _ => debug!(phase = ?phase, outcome = ?outcome, "Termination phase finished"),
            }
            phases.push((phase, outcome));
        }

        let report = TerminationReport { reason, phases };
        info!(problems = ?report.problems(), "Session terminated");
        report
    }

    async fn run_phase(
        &self,
        phase: TerminationPhase,
        session: &dyn Teardown,
        reason: &TerminationReason,
    ) -> PhaseOutcome {
        let coordinator = session.coordinator();

        match phase {
            TerminationPhase::LessonCompleted => {
                if !session.assessment_over_interops() {
                    return PhaseOutcome::Skipped;
                }
                coordinator
                    .request_during_shutdown(ModuleKind::Gateway, ServiceRequest::LessonCompleted)
                    .await
                    .into()
            }
            TerminationPhase::StopScenario => {
                let release = session.release_scenario();
                let mut outcome = PhaseOutcome::Skipped;
                if release.scenario_active {
                    outcome = coordinator
                        .request_during_shutdown(ModuleKind::Gateway, ServiceRequest::StopScenario)
                        .await
                        .into();
                }
                if let Some(handle) = release.playback {
                    let stopped: PhaseOutcome = coordinator
                        .request_during_shutdown(
                            ModuleKind::Gateway,
                            ServiceRequest::StopPlayback { handle },
                        )
                        .await
                        .into();
                    if outcome != PhaseOutcome::Completed || matches!(stopped, PhaseOutcome::Failed(_)) {
                        outcome = stopped;
                    }
                }
                outcome
            }
            TerminationPhase::MarkClosing => {
                if session.lifecycle().begin_closing() {
                    PhaseOutcome::Completed
                } else {
                    PhaseOutcome::Skipped
                }
            }
            TerminationPhase::NotifyJoiners => match session.end_hosted_session() {
                Some(joiners) => {
                    debug!(joiners, "Ended hosted knowledge session");
                    PhaseOutcome::Completed
                }
                None => PhaseOutcome::Skipped,
            },
            TerminationPhase::PublishScore => {
                let Some(pending) = session.take_unpublished_score() else {
                    return PhaseOutcome::Skipped;
                };
                coordinator
                    .request_during_shutdown(
                        ModuleKind::Lms,
                        ServiceRequest::PublishScore {
                            username: coordinator.info().username.clone(),
                            lesson_name: pending.lesson_name,
                            score: pending.score,
                        },
                    )
                    .await
                    .into()
            }
            TerminationPhase::CloseModules => {
                let mut failures = Vec::new();
                for module in ModuleKind::ALL.into_iter().filter(|m| *m != ModuleKind::Tutor) {
                    let outcome = coordinator
                        .request_during_shutdown(
                            module,
                            ServiceRequest::CloseSession {
                                reason: reason.code().to_string(),
                            },
                        )
                        .await;
                    if let RequestOutcome::Failed(failure) = outcome {
                        failures.push(format!("{:?}: {}", module, failure));
                    }
                }
                if failures.is_empty() {
                    PhaseOutcome::Completed
                } else {
                    PhaseOutcome::Failed(failures.join("; "))
                }
            }
            TerminationPhase::FinalMessage => {
                let Some(message) = reason.final_message() else {
                    return PhaseOutcome::Skipped;
                };
                coordinator
                    .request_during_shutdown(
                        ModuleKind::Tutor,
                        ServiceRequest::DisplayFinalMessage {
                            message: message.to_string(),
                        },
                    )
                    .await
                    .into()
            }
            TerminationPhase::CloseTutor => coordinator
                .request_during_shutdown(
                    ModuleKind::Tutor,
                    ServiceRequest::CloseSession {
                        reason: reason.code().to_string(),
                    },
                )
                .await
                .into(),
            TerminationPhase::Cleanup => {
                if session.cleanup() {
                    PhaseOutcome::Completed
                } else {
                    PhaseOutcome::Skipped
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::config::SessionSettings;
    use crate::services::{MockServiceBus, RequestKind, ScriptedReply, SessionInfo};
    use crate::state::LifecycleState;

    struct FakeSession {
        coordinator: ModuleCoordinator,
        lifecycle: Arc<SessionLifecycle>,
        scenario_active: bool,
        score: Mutex<Option<PendingScore>>,
        cleanups: Mutex<usize>,
    }

    impl FakeSession {
        fn new(bus: Arc<MockServiceBus>, settings: SessionSettings) -> Self {
            let lifecycle = Arc::new(SessionLifecycle::new());
            let coordinator = ModuleCoordinator::new(
                SessionInfo {
                    session_id: 8,
                    user_id: 1,
                    username: "learner".to_string(),
                    course_id: "course".to_string(),
                    experiment_id: None,
                    embedded: false,
                },
                bus,
                lifecycle.clone(),
                settings,
            );
            Self {
                coordinator,
                lifecycle,
                scenario_active: false,
                score: Mutex::new(None),
                cleanups: Mutex::new(0),
            }
        }
    }

    impl Teardown for FakeSession {
        fn coordinator(&self) -> &ModuleCoordinator {
            &self.coordinator
        }

        fn lifecycle(&self) -> &SessionLifecycle {
            &self.lifecycle
        }

        fn assessment_over_interops(&self) -> bool {
            false
        }

        fn release_scenario(&self) -> ScenarioRelease {
            ScenarioRelease {
                scenario_active: self.scenario_active,
                playback: None,
            }
        }

        fn end_hosted_session(&self) -> Option<usize> {
            None
        }

        fn take_unpublished_score(&self) -> Option<PendingScore> {
            self.score.lock().unwrap().take()
        }

        fn cleanup(&self) -> bool {
            *self.cleanups.lock().unwrap() += 1;
            self.lifecycle.finish_closing()
        }
    }

    #[tokio::test]
    async fn test_phases_run_in_order_and_tutor_closes_last() {
        let bus = Arc::new(MockServiceBus::new());
        let session = FakeSession::new(bus.clone(), SessionSettings::default());
        *session.score.lock().unwrap() = Some(PendingScore {
            lesson_name: "range".to_string(),
            score: serde_json::json!({"grade": "pass"}),
        });

        let report = TerminationController::new(Duration::from_secs(5))
            .run(&session, TerminationReason::Error { details: "db down".to_string() })
            .await;

        let order: Vec<TerminationPhase> = report.phases.iter().map(|(p, _)| *p).collect();
        assert_eq!(order, TerminationPhase::ALL.to_vec());
        assert_eq!(report.outcome(TerminationPhase::PublishScore), Some(&PhaseOutcome::Completed));
        assert_eq!(report.outcome(TerminationPhase::StopScenario), Some(&PhaseOutcome::Skipped));
        assert!(report.problems().is_empty());

        let closes = bus.requests_of(RequestKind::CloseSession);
        assert_eq!(closes.len(), 6);
        assert_eq!(closes.last().map(|r| r.target), Some(ModuleKind::Tutor));
        assert!(closes.iter().all(|r| r.request
            == ServiceRequest::CloseSession {
                reason: "error".to_string()
            }));

        let final_messages = bus.requests_of(RequestKind::DisplayFinalMessage);
        assert_eq!(
            final_messages[0].request,
            ServiceRequest::DisplayFinalMessage {
                message: COURSE_ENDING_MESSAGE.to_string()
            }
        );
        assert_eq!(session.lifecycle.state(), LifecycleState::Closed);
        assert_eq!(*session.cleanups.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_module_costs_one_timeout() {
        let bus = Arc::new(MockServiceBus::new());
        bus.always(RequestKind::CloseSession, ScriptedReply::Silent);
        let settings = SessionSettings {
            request_timeout: Duration::from_secs(30),
            phase_timeout: Duration::from_secs(1),
        };
        let session = FakeSession::new(bus.clone(), settings);

        let report = TerminationController::new(settings.phase_timeout)
            .run(&session, TerminationReason::LearnerExit)
            .await;

        assert_eq!(report.outcome(TerminationPhase::CloseModules), Some(&PhaseOutcome::TimedOut));
        assert_eq!(report.outcome(TerminationPhase::FinalMessage), Some(&PhaseOutcome::Skipped));
        assert!(matches!(
            report.outcome(TerminationPhase::CloseTutor),
            Some(PhaseOutcome::Failed(_) | PhaseOutcome::TimedOut)
        ));
        assert_eq!(report.outcome(TerminationPhase::Cleanup), Some(&PhaseOutcome::Completed));
        assert_eq!(session.lifecycle.state(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn test_failed_close_is_reported_and_termination_continues() {
        let bus = Arc::new(MockServiceBus::new());
        bus.reply_with(RequestKind::CloseSession, ScriptedReply::nack("learner module gone"));
        let session = FakeSession {
            scenario_active: true,
            ..FakeSession::new(bus.clone(), SessionSettings::default())
        };

        let report = TerminationController::new(Duration::from_secs(5))
            .run(&session, TerminationReason::CourseCompleted)
            .await;

        assert!(matches!(
            report.outcome(TerminationPhase::CloseModules),
            Some(PhaseOutcome::Failed(reason)) if reason.contains("learner module gone")
        ));
        // Dropped: the gateway was never connected.
        assert_eq!(report.outcome(TerminationPhase::StopScenario), Some(&PhaseOutcome::Skipped));
        assert_eq!(bus.count(RequestKind::CloseSession), 6);
        assert_eq!(
            bus.requests_of(RequestKind::DisplayFinalMessage)[0].request,
            ServiceRequest::DisplayFinalMessage {
                message: COURSE_COMPLETED_MESSAGE.to_string()
            }
        );
    }

    #[test]
    fn test_reason_display_keeps_details_out_of_code() {
        let reason = TerminationReason::Error {
            details: "password authentication failed".to_string(),
        };
        assert_eq!(reason.code(), "error");
        assert!(reason.to_string().contains("password"));
        assert_eq!(reason.final_message(), Some(COURSE_ENDING_MESSAGE));
    }
}
