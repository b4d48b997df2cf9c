// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session initialization as an explicit stage sequence.
//!
//! ```text
//!   InitializeLearner ─► InitializeDomainSession ─► InitializePedagogy
//!          ─► InitializeSensors* ─► ConnectGateway* ─► StartSession
//!
//!   * skipped when the course does not need it
//! ```
//!
//! Each stage is one request; the next stage starts on the previous stage's
//! terminal success. A failing stage aborts initialization unless it is
//! best-effort.

use tracing::{info, instrument, warn};

use super::{ModuleCoordinator, RequestOutcome};
use crate::callback::RequestFailure;
use crate::error::{Result, SessionError};
use crate::services::{ModuleKind, ServiceRequest};

/// What initialization needs to know about the course.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitPlan {
    /// Course being started.
    pub course_id: String,
    /// Interops the gateway must connect; empty skips the gateway stage.
    pub interops: Vec<String>,
    /// Whether sensors are configured.
    pub sensors: bool,
}

/// One initialization step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    /// Load the learner model.
    InitializeLearner,
    /// Announce the domain session to the UI.
    InitializeDomainSession,
    /// Prepare the pedagogical model.
    InitializePedagogy,
    /// Start sensor capture.
    InitializeSensors,
    /// Connect the gateway interops.
    ConnectGateway,
    /// Start the session on every module.
    StartSession,
}

impl InitStage {
    /// Where initialization begins.
    pub const FIRST: InitStage = InitStage::InitializeLearner;

    /// Stage name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            InitStage::InitializeLearner => "initialize_learner",
            InitStage::InitializeDomainSession => "initialize_domain_session",
            InitStage::InitializePedagogy => "initialize_pedagogy",
            InitStage::InitializeSensors => "initialize_sensors",
            InitStage::ConnectGateway => "connect_gateway",
            InitStage::StartSession => "start_session",
        }
    }

    /// Module the stage talks to.
    pub fn target(&self) -> ModuleKind {
        match self {
            InitStage::InitializeLearner => ModuleKind::Learner,
            InitStage::InitializeDomainSession => ModuleKind::Tutor,
            InitStage::InitializePedagogy => ModuleKind::Pedagogy,
            InitStage::InitializeSensors => ModuleKind::Sensor,
            InitStage::ConnectGateway => ModuleKind::Gateway,
            InitStage::StartSession => ModuleKind::Tutor,
        }
    }

    /// The request the stage sends.
    pub fn request(&self, plan: &InitPlan) -> ServiceRequest {
        match self {
            InitStage::InitializeLearner => ServiceRequest::InitializeLearner,
            InitStage::InitializeDomainSession => ServiceRequest::InitializeDomainSession {
                course_id: plan.course_id.clone(),
            },
            InitStage::InitializePedagogy => ServiceRequest::InitializePedagogy,
            InitStage::InitializeSensors => ServiceRequest::InitializeSensors,
            InitStage::ConnectGateway => ServiceRequest::ConnectGateway {
                interops: plan.interops.clone(),
            },
            InitStage::StartSession => ServiceRequest::StartSession,
        }
    }

    /// Failures of best-effort stages are logged and initialization goes on.
    pub fn best_effort(&self) -> bool {
        matches!(self, InitStage::InitializeSensors)
    }

    /// The stage after this one, skipping stages the plan does not need.
    pub fn next(&self, plan: &InitPlan) -> Option<InitStage> {
        let mut next = self.successor()?;
        loop {
            let needed = match next {
                InitStage::InitializeSensors => plan.sensors,
                InitStage::ConnectGateway => !plan.interops.is_empty(),
                _ => true,
            };
            if needed {
                return Some(next);
            }
            next = next.successor()?;
        }
    }

    fn successor(&self) -> Option<InitStage> {
        match self {
            InitStage::InitializeLearner => Some(InitStage::InitializeDomainSession),
            InitStage::InitializeDomainSession => Some(InitStage::InitializePedagogy),
            InitStage::InitializePedagogy => Some(InitStage::InitializeSensors),
            InitStage::InitializeSensors => Some(InitStage::ConnectGateway),
            InitStage::ConnectGateway => Some(InitStage::StartSession),
            InitStage::StartSession => None,
        }
    }
}

/// What happened during initialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageReport {
    /// Stages that completed, in order.
    pub completed: Vec<InitStage>,
    /// Best-effort stages that failed.
    pub tolerated: Vec<(InitStage, RequestFailure)>,
}

/// Run every stage of `plan` in order.
///
/// A successful gateway stage marks the coordinator's connections as
/// established. The session is expected to terminate on error.
#[instrument(skip(coordinator, plan), fields(session_id = coordinator.info().session_id))]
pub async fn drive(coordinator: &ModuleCoordinator, plan: &InitPlan) -> Result<StageReport> {
    let mut report = StageReport::default();
    let mut stage = Some(InitStage::FIRST);

    while let Some(current) = stage {
        let outcome = coordinator
            .request(current.target(), current.request(plan))
            .await;

        match outcome {
            RequestOutcome::Completed(_) => {
                if current == InitStage::ConnectGateway {
                    coordinator.set_connections_established(true);
                }
                info!(stage = current.name(), "Initialization stage completed");
                report.completed.push(current);
            }
            RequestOutcome::Failed(failure) if current.best_effort() => {
                warn!(stage = current.name(), error = %failure, "Best-effort initialization stage failed");
                report.tolerated.push((current, failure));
            }
            RequestOutcome::Failed(failure) => {
                return Err(SessionError::StageFailed {
                    stage: current.name().to_string(),
                    reason: failure.to_string(),
                });
            }
            RequestOutcome::Dropped => {
                return Err(SessionError::SessionInactive {
                    session_id: coordinator.info().session_id,
                });
            }
        }

        stage = current.next(plan);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::SessionSettings;
    use crate::services::{MockServiceBus, RequestKind, ScriptedReply, SessionInfo};
    use crate::state::SessionLifecycle;

    fn coordinator(bus: Arc<MockServiceBus>) -> ModuleCoordinator {
        ModuleCoordinator::new(
            SessionInfo {
                session_id: 1,
                user_id: 1,
                username: "learner".to_string(),
                course_id: "course".to_string(),
                experiment_id: None,
                embedded: false,
            },
            bus,
            Arc::new(SessionLifecycle::new()),
            SessionSettings::default(),
        )
    }

    #[test]
    fn test_next_skips_unneeded_stages() {
        let minimal = InitPlan::default();
        assert_eq!(
            InitStage::InitializePedagogy.next(&minimal),
            Some(InitStage::StartSession)
        );

        let full = InitPlan {
            course_id: "c".to_string(),
            interops: vec!["vbs".to_string()],
            sensors: true,
        };
        assert_eq!(
            InitStage::InitializePedagogy.next(&full),
            Some(InitStage::InitializeSensors)
        );
        assert_eq!(
            InitStage::InitializeSensors.next(&full),
            Some(InitStage::ConnectGateway)
        );
        assert_eq!(InitStage::StartSession.next(&full), None);
    }

    #[tokio::test]
    async fn test_drive_runs_stages_in_order() {
        let bus = Arc::new(MockServiceBus::new());
        let coordinator = coordinator(bus.clone());
        let plan = InitPlan {
            course_id: "c".to_string(),
            interops: vec!["vbs".to_string()],
            sensors: false,
        };

        let report = drive(&coordinator, &plan).await.unwrap();

        assert_eq!(
            bus.kinds(),
            vec![
                RequestKind::InitializeLearner,
                RequestKind::InitializeDomainSession,
                RequestKind::InitializePedagogy,
                RequestKind::ConnectGateway,
                RequestKind::StartSession,
            ]
        );
        assert_eq!(report.completed.len(), 5);
        assert!(coordinator.connections_established());
    }

    #[tokio::test]
    async fn test_failing_stage_stops_initialization() {
        let bus = Arc::new(MockServiceBus::new());
        bus.reply_with(RequestKind::InitializePedagogy, ScriptedReply::nack("no model"));
        let coordinator = coordinator(bus.clone());

        let err = drive(&coordinator, &InitPlan::default()).await.unwrap_err();

        assert_eq!(err.error_code(), "STAGE_FAILED");
        assert!(err.to_string().contains("initialize_pedagogy"));
        assert_eq!(bus.count(RequestKind::StartSession), 0);
    }

    #[tokio::test]
    async fn test_best_effort_stage_failure_is_tolerated() {
        let bus = Arc::new(MockServiceBus::new());
        bus.reply_with(
            RequestKind::InitializeSensors,
            ScriptedReply::CommFailure("sensor offline".to_string()),
        );
        let coordinator = coordinator(bus.clone());
        let plan = InitPlan {
            sensors: true,
            ..InitPlan::default()
        };

        let report = drive(&coordinator, &plan).await.unwrap();

        assert_eq!(report.tolerated.len(), 1);
        assert_eq!(report.tolerated[0].0, InitStage::InitializeSensors);
        assert_eq!(bus.count(RequestKind::StartSession), 1);
    }
}
