// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The domain session: one learner working through one course.
//!
//! A [`DomainSession`] owns the course queue and every per-session state
//! machine, and drives the collaborating services through its
//! [`ModuleCoordinator`]:
//!
//! ```text
//!   start() ── init stages ──► run() ── advance() ─┬─► guidance / survey / material / review
//!                                                  ├─► authored branch ──► splice path + PathEnd
//!                                                  ├─► adaptive courseflow ──► splice decision (+ itself)
//!                                                  └─► training application ──► load, start, assess, score
//!
//!   terminate(reason) ──► TerminationController ──► cleanup()
//! ```
//!
//! Any unrecovered failure while the course progresses ends the session
//! with the generic learner message; the cause is logged.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use crate::callback::Reply;
use crate::config::SessionSettings;
use crate::coordinator::{
    Deferred, DeferredState, InitPlan, ModuleCoordinator, RequestOutcome, StageReport, UiWait,
    spawn_serialized, stages,
};
use crate::course::branch::expand;
use crate::course::conditions::{ScoreRecord, SurveyResponse};
use crate::course::object::{AdaptiveCourseflow, AfterActionReview, Survey, TrainingApplication};
use crate::course::progress::{Progress, ProgressReporter};
use crate::course::review::NOTHING_TO_REVIEW;
use crate::course::{
    AuthoredBranch, BranchSelector, CourseDefinition, CourseObject, CourseQueue, LearnerHistory,
    PendingReviewEvents, ReviewEvent,
};
use crate::error::{Result, SessionError};
use crate::knowledge::{
    KnowledgeSessionObserver, KnowledgeSessionRegistry, RegistryError, RoleAssignment,
    SessionMember, SessionType,
};
use crate::persistence::BranchHistoryStore;
use crate::services::{ModuleKind, RequestKind, ServiceBus, ServiceRequest, SessionInfo};
use crate::state::{
    LessonState, LessonStateMachine, LifecycleState, SessionLifecycle, TrainingAppState,
    TrainingAppStateMachine,
};
use crate::termination::{
    PendingScore, ScenarioRelease, Teardown, TerminationController, TerminationReason,
    TerminationStatus,
};

// ============================================================================
// Reply payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct AdaptiveDecision {
    #[serde(default)]
    objects: Vec<CourseObject>,
    #[serde(default)]
    complete: bool,
}

#[derive(Debug, Deserialize)]
struct LmsRecords {
    #[serde(default)]
    records: Vec<ScoreRecord>,
}

#[derive(Debug, Deserialize)]
struct PublishedRecord {
    record_id: String,
}

fn decode<T: DeserializeOwned>(kind: RequestKind, payload: &Value) -> Result<T> {
    T::deserialize(payload).map_err(|e| SessionError::InvalidPayload {
        request: kind.as_str().to_string(),
        details: e.to_string(),
    })
}

// ============================================================================
// Assessment feed
// ============================================================================

/// Assessments seen by this session, its own or a host's.
#[derive(Debug, Default)]
struct AssessmentFeed {
    latest: Mutex<Option<Value>>,
    host_ended: AtomicBool,
    ended: Notify,
}

impl AssessmentFeed {
    fn record(&self, payload: Value) {
        *self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(payload);
    }

    fn latest(&self) -> Option<Value> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn rearm(&self) {
        self.host_ended.store(false, Ordering::SeqCst);
    }

    async fn host_ended(&self) {
        while !self.host_ended.load(Ordering::SeqCst) {
            self.ended.notified().await;
        }
    }
}

impl KnowledgeSessionObserver for AssessmentFeed {
    fn assessment(&self, host_session_id: i64, payload: &Value) {
        debug!(host_session_id, "Assessment from host");
        self.record(payload.clone());
    }

    fn host_session_ended(&self, host_session_id: i64) {
        debug!(host_session_id, "Host ended the knowledge session");
        self.host_ended.store(true, Ordering::SeqCst);
        self.ended.notify_one();
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone)]
struct ActiveLesson {
    name: String,
    real_time_assessment: bool,
    uses_interops: bool,
    playback: Arc<Deferred<String>>,
}

struct SessionInner {
    queue: CourseQueue,
    review: PendingReviewEvents,
    history: LearnerHistory,
    published_records: Vec<String>,
    /// Branches entered at least once; later entries do not count again.
    entered_branches: HashSet<i64>,
    active_lesson: Option<ActiveLesson>,
    unpublished_score: Option<PendingScore>,
    visited: Vec<String>,
}

/// One learner's run through one course.
pub struct DomainSession {
    lifecycle: Arc<SessionLifecycle>,
    coordinator: ModuleCoordinator,
    selector: BranchSelector,
    registry: Arc<KnowledgeSessionRegistry>,
    training_app: TrainingAppStateMachine,
    lesson: LessonStateMachine,
    feed: Arc<AssessmentFeed>,
    plan: InitPlan,
    join_host: Option<i64>,
    terminating: AtomicBool,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for DomainSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainSession")
            .field("session_id", &self.session_id())
            .field("state", &self.lifecycle.state())
            .field("training_app", &self.training_app.state())
            .field("join_host", &self.join_host)
            .finish()
    }
}

impl DomainSession {
    /// Start building a session for `info` running `course`.
    pub fn builder(info: SessionInfo, course: CourseDefinition) -> DomainSessionBuilder {
        DomainSessionBuilder::new(info, course)
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Session identity.
    pub fn info(&self) -> &SessionInfo {
        self.coordinator.info()
    }

    /// Session id.
    pub fn session_id(&self) -> i64 {
        self.coordinator.info().session_id
    }

    /// Lifecycle state.
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Whether the session is still RUNNING and not terminating.
    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active() && !self.terminating.load(Ordering::SeqCst)
    }

    /// Training application state machine, for registering listeners.
    pub fn training_app(&self) -> &TrainingAppStateMachine {
        &self.training_app
    }

    /// Lesson state machine, for registering listeners.
    pub fn lesson(&self) -> &LessonStateMachine {
        &self.lesson
    }

    /// Current progress.
    pub fn progress(&self) -> Progress {
        self.lock().queue.progress()
    }

    /// Register a progress reporter.
    pub fn add_progress_reporter(&self, reporter: Arc<dyn ProgressReporter>) {
        self.lock().queue.add_progress_reporter(reporter);
    }

    /// Names of the objects presented so far, in order.
    pub fn visited(&self) -> Vec<String> {
        self.lock().visited.clone()
    }

    /// Number of events waiting for a review.
    pub fn pending_review_events(&self) -> usize {
        self.lock().review.len()
    }

    /// LMS record ids of the scores published so far.
    pub fn published_records(&self) -> Vec<String> {
        self.lock().published_records.clone()
    }

    /// Most recent assessment, produced here or forwarded by a host.
    pub fn latest_assessment(&self) -> Option<Value> {
        self.feed.latest()
    }

    /// Playback handle of the active lesson, if a lesson is active.
    pub fn playback_state(&self) -> Option<DeferredState<String>> {
        self.lock()
            .active_lesson
            .as_ref()
            .map(|lesson| lesson.playback.peek())
    }

    /// Whether another object follows the current one.
    pub fn has_more_transitions(&self) -> bool {
        self.lock().queue.has_more_transitions()
    }

    /// The object being presented.
    pub fn current_transition(&self) -> Option<CourseObject> {
        self.lock().queue.current_transition().cloned()
    }

    /// Splice objects in right after the current one.
    pub fn insert_transitions(&self, objects: Vec<CourseObject>) {
        self.lock().queue.insert_transitions(objects);
    }

    /// Skip the rest of the course.
    pub fn set_next_transition_to_end(&self) {
        self.lock().queue.set_next_transition_to_end();
    }

    // ========================================================================
    // Initialization and course flow
    // ========================================================================

    /// Run the initialization stages. A failure terminates the session.
    #[instrument(skip(self), fields(session_id = self.session_id()))]
    pub async fn start(&self) -> Result<StageReport> {
        match stages::drive(&self.coordinator, &self.plan).await {
            Ok(report) => {
                info!(
                    completed = report.completed.len(),
                    tolerated = report.tolerated.len(),
                    "Session initialized"
                );
                Ok(report)
            }
            Err(err) => {
                self.fail(&err).await;
                Err(err)
            }
        }
    }

    /// Present every remaining object, then terminate as completed.
    ///
    /// Returns early, without error, if the session is terminated meanwhile.
    /// A fatal error terminates the session before it is returned.
    pub async fn run(&self) -> Result<()> {
        let result = async {
            while self.advance().await? {}
            Ok::<(), SessionError>(())
        }
        .await;

        match result {
            Ok(()) => {
                if self.is_active() {
                    self.lock().queue.set_progress_to_end();
                    self.terminate(TerminationReason::CourseCompleted).await;
                }
                Ok(())
            }
            Err(err) => {
                self.fail(&err).await;
                Err(err)
            }
        }
    }

    async fn fail(&self, err: &SessionError) {
        if matches!(err, SessionError::SessionInactive { .. }) && !self.is_active() {
            debug!(session_id = self.session_id(), "Stopped; session is terminating");
            return;
        }
        error!(
            session_id = self.session_id(),
            error_code = err.error_code(),
            error = %err,
            "Fatal session error"
        );
        self.terminate(TerminationReason::Error {
            details: err.to_string(),
        })
        .await;
    }

    /// Present the next enabled object. Returns `false` when the course is
    /// over or the session stopped.
    #[instrument(skip(self), fields(session_id = self.session_id()))]
    pub async fn advance(&self) -> Result<bool> {
        let (object, report) = {
            let mut inner = self.lock();
            loop {
                if !self.is_active() {
                    return Ok(false);
                }
                let Some(object) = inner.queue.next_transition().cloned() else {
                    return Ok(false);
                };
                if object.is_disabled() {
                    debug!(object = %object.name(), "Skipping disabled course object");
                    continue;
                }
                inner.visited.push(object.name().to_string());
                break (object, inner.queue.progress_report(false));
            }
        };
        report.deliver();

        info!(object = %object.name(), kind = object.kind(), "Course state changed");
        self.announce(&object).await;
        self.execute(object).await?;
        Ok(true)
    }

    async fn announce(&self, object: &CourseObject) {
        if matches!(object, CourseObject::PathEnd(_)) {
            return;
        }
        for module in [ModuleKind::Learner, ModuleKind::Pedagogy] {
            self.coordinator
                .notify(
                    module,
                    ServiceRequest::CourseStateChanged {
                        object_name: object.name().to_string(),
                        object_kind: object.kind().to_string(),
                    },
                )
                .await;
        }
    }

    async fn execute(&self, object: CourseObject) -> Result<()> {
        match object {
            CourseObject::Guidance(guidance) => {
                self.coordinator
                    .request(
                        ModuleKind::Tutor,
                        ServiceRequest::DisplayGuidance {
                            message: guidance.message,
                            full_screen: guidance.full_screen,
                            duration_secs: guidance.duration_secs,
                        },
                    )
                    .await
                    .into_result(RequestKind::DisplayGuidance)?;
            }
            CourseObject::Survey(survey) => {
                self.present_survey(&survey).await?;
            }
            CourseObject::LessonMaterial(material) => {
                self.coordinator
                    .request(
                        ModuleKind::Tutor,
                        ServiceRequest::DisplayLessonMaterial {
                            resources: material.resources,
                        },
                    )
                    .await
                    .into_result(RequestKind::DisplayLessonMaterial)?;
            }
            CourseObject::AfterActionReview(review) => self.present_review(&review).await?,
            CourseObject::AuthoredBranch(branch) => self.enter_branch(&branch).await?,
            CourseObject::AdaptiveCourseflow(section) => self.expand_adaptive(&section).await?,
            CourseObject::PathEnd(end) => {
                if let Err(err) = self.selector.record_path_end(&end).await {
                    warn!(branch_id = end.branch_id, path_id = end.path_id, error = %err, "Failed to record path end");
                }
            }
            CourseObject::TrainingApplication(app) => self.run_training_application(&app).await?,
        }
        Ok(())
    }

    async fn present_survey(&self, survey: &Survey) -> Result<Option<Value>> {
        let reply = self
            .coordinator
            .request(
                ModuleKind::Tutor,
                ServiceRequest::DisplaySurvey {
                    survey_key: survey.survey_key.clone(),
                    full_screen: survey.full_screen,
                },
            )
            .await
            .into_result(RequestKind::DisplaySurvey)?;

        let Some(results) = reply.as_ref().and_then(Reply::payload).cloned() else {
            return Ok(None);
        };

        let mut inner = self.lock();
        match serde_json::from_value::<SurveyResponse>(results.clone()) {
            Ok(response) => inner.history.survey_responses.push(response),
            Err(e) => debug!(survey = %survey.name, error = %e, "Survey results carry no structured response"),
        }
        inner.review.add(ReviewEvent::SurveyResult {
            timestamp: Utc::now(),
            survey_name: survey.name.clone(),
            results: results.clone(),
        });
        Ok(Some(results))
    }

    async fn present_review(&self, review: &AfterActionReview) -> Result<()> {
        let events = self.lock().review.drain_for_display();
        let message = events.is_empty().then(|| NOTHING_TO_REVIEW.to_string());
        self.coordinator
            .request(
                ModuleKind::Tutor,
                ServiceRequest::DisplayAar {
                    events,
                    message,
                    full_screen: review.full_screen,
                },
            )
            .await
            .into_result(RequestKind::DisplayAar)?;
        Ok(())
    }

    async fn enter_branch(&self, branch: &AuthoredBranch) -> Result<()> {
        if branch.needs_scores() {
            self.refresh_score_records().await?;
        }

        let history = self.lock().history.clone();
        let index = self.selector.select(branch, &history).await?;

        let increment = self.lock().entered_branches.insert(branch.branch_id);
        self.selector.record_entry(branch, index, increment).await?;

        self.lock().queue.insert_transitions(expand(branch, index));
        Ok(())
    }

    async fn refresh_score_records(&self) -> Result<()> {
        let record_ids = self.lock().published_records.clone();
        if record_ids.is_empty() {
            return Ok(());
        }

        let reply = self
            .coordinator
            .request(ModuleKind::Lms, ServiceRequest::LmsDataRequest { record_ids })
            .await
            .into_result(RequestKind::LmsDataRequest)?;
        if let Some(payload) = reply.as_ref().and_then(Reply::payload) {
            let records: LmsRecords = decode(RequestKind::LmsDataRequest, payload)?;
            self.lock().history.score_records = records.records;
        }
        Ok(())
    }

    async fn expand_adaptive(&self, section: &AdaptiveCourseflow) -> Result<()> {
        let reply = self
            .coordinator
            .request(
                ModuleKind::Pedagogy,
                ServiceRequest::AdaptiveCourseflowRequest {
                    concepts: section.concepts.clone(),
                },
            )
            .await
            .into_result(RequestKind::AdaptiveCourseflowRequest)?;

        let decision = match reply.as_ref().and_then(Reply::payload) {
            Some(payload) => decode::<AdaptiveDecision>(RequestKind::AdaptiveCourseflowRequest, payload)?,
            None => AdaptiveDecision {
                objects: Vec::new(),
                complete: true,
            },
        };

        let mut objects = decision.objects;
        let revisit = !decision.complete && !objects.is_empty();
        if !decision.complete && objects.is_empty() {
            warn!(section = %section.name, "Adaptive courseflow offered nothing; leaving the section");
        }
        if revisit {
            objects.push(CourseObject::AdaptiveCourseflow(section.clone()));
        }

        info!(section = %section.name, count = objects.len(), revisit, "Expanding adaptive courseflow");
        self.lock().queue.insert_transitions(objects);
        Ok(())
    }

    // ========================================================================
    // Training applications
    // ========================================================================

    #[instrument(skip(self, app), fields(session_id = self.session_id(), lesson = %app.name))]
    async fn run_training_application(&self, app: &TrainingApplication) -> Result<()> {
        if app.real_time_assessment {
            if let Some(host_session_id) = self.join_host {
                return self.follow_host(host_session_id).await;
            }
        }

        let playback = Arc::new(Deferred::new());
        self.lock().active_lesson = Some(ActiveLesson {
            name: app.name.clone(),
            real_time_assessment: app.real_time_assessment,
            uses_interops: app.uses_interops(),
            playback: playback.clone(),
        });

        let result = self.host_lesson(app, &playback).await;

        // Never-started playback resolves to none.
        playback.resolve(None);
        self.lock().active_lesson = None;
        result
    }

    async fn host_lesson(&self, app: &TrainingApplication, playback: &Deferred<String>) -> Result<()> {
        let session_id = self.session_id();

        if app.real_time_assessment && !self.open_knowledge_session(app).await? {
            return Ok(());
        }
        if !self.connect_gateway(app).await? {
            return Ok(());
        }

        let loaded = self
            .coordinator
            .request(
                ModuleKind::Gateway,
                ServiceRequest::LoadScenario {
                    scenario: app.scenario.clone(),
                    embedded: app.embedded || self.info().embedded,
                },
            )
            .await
            .into_result(RequestKind::LoadScenario)?;
        if loaded.is_none() {
            return Ok(());
        }
        self.training_app.transition(Some(TrainingAppState::Loaded));
        playback.resolve(app.playback_log.clone());

        self.training_app.transition(Some(TrainingAppState::Running));
        self.lesson.transition(LessonState::Running);

        let registry = self.registry.clone();
        let feed = self.feed.clone();
        let forward = app.real_time_assessment;
        let outcome = self
            .coordinator
            .request_streaming(
                ModuleKind::Gateway,
                ServiceRequest::StartScenario {
                    lesson_name: app.name.clone(),
                },
                move |assessment| {
                    if forward {
                        registry.forward_assessment(session_id, &assessment);
                    }
                    feed.record(assessment);
                },
            )
            .await;

        let Some(reply) = outcome.into_result(RequestKind::StartScenario)? else {
            return Ok(());
        };

        self.training_app.transition(Some(TrainingAppState::Stopped));
        self.lesson.transition(LessonState::Stopped);
        self.training_app.transition(None);

        if app.real_time_assessment {
            self.close_knowledge_session(app).await;
        }

        if let Some(score) = reply.payload().cloned() {
            {
                let mut inner = self.lock();
                inner.review.add(ReviewEvent::ScenarioScore {
                    timestamp: Utc::now(),
                    lesson_name: app.name.clone(),
                    score: score.clone(),
                });
                inner.unpublished_score = Some(PendingScore {
                    lesson_name: app.name.clone(),
                    score,
                });
            }
            if self.is_active() {
                self.publish_pending_score().await?;
            }
        }
        Ok(())
    }

    /// Connect the gateway if the lesson needs it. `false` if the session
    /// stopped meanwhile.
    async fn connect_gateway(&self, app: &TrainingApplication) -> Result<bool> {
        if self.coordinator.connections_established() {
            return Ok(true);
        }
        let reply = self
            .coordinator
            .request(
                ModuleKind::Gateway,
                ServiceRequest::ConnectGateway {
                    interops: app.interops.clone(),
                },
            )
            .await
            .into_result(RequestKind::ConnectGateway)?;
        if reply.is_none() {
            return Ok(false);
        }
        self.coordinator.set_connections_established(true);
        Ok(true)
    }

    fn registry_error(&self, err: RegistryError) -> SessionError {
        SessionError::KnowledgeSession {
            session_id: self.session_id(),
            reason: err.to_string(),
        }
    }

    /// Host the lesson's knowledge session and start it. `false` if the
    /// session stopped while waiting for team roles.
    async fn open_knowledge_session(&self, app: &TrainingApplication) -> Result<bool> {
        let info = self.info();
        let member = SessionMember::new(info.session_id, info.username.clone());

        if app.is_team_lesson() {
            let session_type = if app.playback_log.is_some() {
                SessionType::Playback
            } else {
                SessionType::Active
            };
            // A live host fills one of the roles itself.
            let max_members = match session_type {
                SessionType::Playback => app.team_roles.len(),
                SessionType::Active => app.team_roles.len().saturating_sub(1),
            };
            let assignment = self
                .registry
                .host_team_session(
                    member,
                    &app.name,
                    &info.course_id,
                    info.experiment_id.clone(),
                    app.team_roles.clone(),
                    max_members,
                    session_type,
                )
                .map_err(|e| self.registry_error(e))?;

            match assignment {
                RoleAssignment::LobbyRequired => info!("Waiting for team roles to be assigned"),
                RoleAssignment::Reused => info!(
                    awaiting = self.registry.awaiting_rejoin(info.session_id),
                    "Reusing team roles; waiting for members to rejoin"
                ),
            }
            let closing = self.lifecycle.closing_token();
            if !self.registry.wait_until_ready(info.session_id, &closing).await {
                return Ok(false);
            }
        } else {
            self.registry
                .add_individual_session(member, &app.name, &info.course_id, info.experiment_id.clone())
                .map_err(|e| self.registry_error(e))?;
        }

        self.registry
            .start_session(info.session_id)
            .map_err(|e| self.registry_error(e))?;
        Ok(true)
    }

    /// End the hosted knowledge session. Joiners hear about it before this
    /// session moves on.
    async fn close_knowledge_session(&self, app: &TrainingApplication) {
        let joiners = self.registry.end_session(self.session_id());
        debug!(joiners, "Knowledge session ended with the lesson");

        if app.uses_interops() {
            let outcome = self
                .coordinator
                .request(ModuleKind::Gateway, ServiceRequest::LessonCompleted)
                .await;
            if let RequestOutcome::Failed(failure) = outcome {
                warn!(error = %failure, "Lesson completed notification failed");
            }
        }
    }

    /// Join the host's team session and wait until the host ends it.
    async fn follow_host(&self, host_session_id: i64) -> Result<()> {
        let info = self.info();
        let closing = self.lifecycle.closing_token();

        // The host may still be finishing its previous lesson.
        let hosted = tokio::time::timeout(
            self.coordinator.settings().request_timeout,
            self.registry.wait_for_team_session(host_session_id, &closing),
        )
        .await;
        match hosted {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(_) => return Err(self.registry_error(RegistryError::HostNotFound(host_session_id))),
        }

        self.feed.rearm();
        let observer: Arc<dyn KnowledgeSessionObserver> = self.feed.clone();
        self.registry
            .join_team_session(
                host_session_id,
                SessionMember::new(info.session_id, info.username.clone()),
                &info.course_id,
                observer,
            )
            .map_err(|e| self.registry_error(e))?;
        info!(host_session_id, "Joined team knowledge session");

        tokio::select! {
            biased;
            _ = closing.cancelled() => {
                debug!(host_session_id, "Stopped following host; session is closing");
            }
            _ = self.feed.host_ended() => {
                info!(host_session_id, "Host ended the team session");
            }
        }
        Ok(())
    }

    async fn publish_pending_score(&self) -> Result<()> {
        let Some(pending) = self.lock().unpublished_score.clone() else {
            return Ok(());
        };

        let reply = self
            .coordinator
            .request(
                ModuleKind::Lms,
                ServiceRequest::PublishScore {
                    username: self.info().username.clone(),
                    lesson_name: pending.lesson_name,
                    score: pending.score,
                },
            )
            .await
            .into_result(RequestKind::PublishScore)?;
        // Dropped: termination publishes it.
        let Some(reply) = reply else {
            return Ok(());
        };

        let mut inner = self.lock();
        inner.unpublished_score = None;
        match reply.payload() {
            Some(payload) => {
                let record: PublishedRecord = decode(RequestKind::PublishScore, payload)?;
                debug!(record_id = %record.record_id, "Score published");
                inner.published_records.push(record.record_id);
            }
            None => debug!("Score published without a record id"),
        }
        Ok(())
    }

    async fn pause_scenario(&self) -> Result<bool> {
        if self.training_app.state() != Some(TrainingAppState::Running) {
            return Ok(false);
        }
        let reply = self
            .coordinator
            .request(ModuleKind::Gateway, ServiceRequest::PauseScenario)
            .await
            .into_result(RequestKind::PauseScenario)?;
        if reply.is_none() {
            return Ok(false);
        }
        self.training_app.transition(Some(TrainingAppState::Paused));
        self.lesson.transition(LessonState::Paused);
        Ok(true)
    }

    async fn resume_scenario(&self) -> Result<()> {
        let reply = self
            .coordinator
            .request(ModuleKind::Gateway, ServiceRequest::ResumeScenario)
            .await
            .into_result(RequestKind::ResumeScenario)?;
        if reply.is_some() {
            self.training_app.transition(Some(TrainingAppState::Running));
            self.lesson.transition(LessonState::Running);
        }
        Ok(())
    }

    /// Pause the running scenario, show `survey`, then resume.
    ///
    /// Runs on its own task so the task delivering scenario replies keeps
    /// flowing. A failure terminates the session. The wait yields `None` if
    /// the session starts closing first.
    pub fn present_mid_lesson_survey(self: &Arc<Self>, survey: Survey) -> UiWait<Result<Option<Value>>> {
        let session = Arc::clone(self);
        spawn_serialized(self.lifecycle.closing_token(), async move {
            let result = async {
                let paused = session.pause_scenario().await?;
                let results = session.present_survey(&survey).await?;
                if paused {
                    session.resume_scenario().await?;
                }
                Ok::<_, SessionError>(results)
            }
            .await;

            if let Err(err) = &result {
                // Closing cancels the interaction task, so termination
                // runs on a task of its own.
                let session = Arc::clone(&session);
                let err = err.clone();
                tokio::spawn(async move { session.fail(&err).await });
            }
            result
        })
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Terminate the session.
    ///
    /// Only the first call runs the termination phases; every other call
    /// returns [`TerminationStatus::AlreadyTerminating`] at once without side
    /// effects. Use [`closed`](Self::closed) to wait for the end.
    #[instrument(skip(self, reason), fields(session_id = self.session_id(), reason = reason.code()))]
    pub async fn terminate(&self, reason: TerminationReason) -> TerminationStatus {
        if self.terminating.swap(true, Ordering::SeqCst)
            || self.lifecycle.state() != LifecycleState::Running
        {
            debug!("Session is already terminating");
            return TerminationStatus::AlreadyTerminating;
        }

        info!(%reason, "Terminating session");
        let report = TerminationController::new(self.coordinator.settings().phase_timeout)
            .run(self, reason)
            .await;
        TerminationStatus::Performed(report)
    }

    /// Wait until the session is CLOSED.
    pub async fn closed(&self) {
        self.lifecycle.closed().await;
    }

    /// Move to CLOSED and release everything the session owns.
    ///
    /// Only the first call does anything.
    pub fn cleanup(&self) -> bool {
        if !self.lifecycle.finish_closing() {
            debug!(session_id = self.session_id(), "Session already cleaned up");
            return false;
        }
        self.terminating.store(true, Ordering::SeqCst);

        let report = {
            let mut inner = self.lock();
            if let Some(lesson) = inner.active_lesson.take() {
                lesson.playback.resolve(None);
            }
            inner.review.clear();
            inner.queue.progress_report(true)
        };
        report.deliver();

        self.training_app.reset();
        self.lesson.reset();
        self.registry.cleanup_session(self.session_id());
        info!(session_id = self.session_id(), "Session cleaned up");
        true
    }
}

impl Teardown for DomainSession {
    fn coordinator(&self) -> &ModuleCoordinator {
        &self.coordinator
    }

    fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    fn assessment_over_interops(&self) -> bool {
        let active = self
            .lock()
            .active_lesson
            .as_ref()
            .is_some_and(|l| l.real_time_assessment && l.uses_interops);
        active && self.coordinator.connections_established()
    }

    fn release_scenario(&self) -> ScenarioRelease {
        let scenario_active = matches!(
            self.training_app.state(),
            Some(TrainingAppState::Loaded | TrainingAppState::Running | TrainingAppState::Paused)
        );
        let lesson = self.lock().active_lesson.clone();
        let playback = lesson.and_then(|lesson| {
            lesson.playback.resolve(None);
            debug!(lesson = %lesson.name, "Released lesson resources");
            match lesson.playback.peek() {
                DeferredState::Resolved(handle) => handle,
                DeferredState::Pending => None,
            }
        });
        ScenarioRelease {
            scenario_active,
            playback,
        }
    }

    fn end_hosted_session(&self) -> Option<usize> {
        let session_id = self.session_id();
        self.registry
            .get(session_id)
            .map(|_| self.registry.end_session(session_id))
    }

    fn take_unpublished_score(&self) -> Option<PendingScore> {
        self.lock().unpublished_score.take()
    }

    fn cleanup(&self) -> bool {
        DomainSession::cleanup(self)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builds a [`DomainSession`].
pub struct DomainSessionBuilder {
    info: SessionInfo,
    course: CourseDefinition,
    bus: Option<Arc<dyn ServiceBus>>,
    history: Option<Arc<dyn BranchHistoryStore>>,
    registry: Option<Arc<KnowledgeSessionRegistry>>,
    settings: SessionSettings,
    sensors: bool,
    join_host: Option<i64>,
}

impl DomainSessionBuilder {
    fn new(info: SessionInfo, course: CourseDefinition) -> Self {
        Self {
            info,
            course,
            bus: None,
            history: None,
            registry: None,
            settings: SessionSettings::default(),
            sensors: false,
            join_host: None,
        }
    }

    /// Transport to the collaborating services (required).
    pub fn bus(mut self, bus: Arc<dyn ServiceBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Branch history store (required).
    pub fn history_store(mut self, store: Arc<dyn BranchHistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    /// Shared knowledge session registry. Defaults to a private one.
    pub fn registry(mut self, registry: Arc<KnowledgeSessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Request and phase timeouts.
    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Initialize sensors.
    pub fn sensors(mut self, enabled: bool) -> Self {
        self.sensors = enabled;
        self
    }

    /// Join the team session hosted by `host_session_id` instead of hosting
    /// real-time assessments.
    pub fn join_host(mut self, host_session_id: i64) -> Self {
        self.join_host = Some(host_session_id);
        self
    }

    /// Build the session.
    pub fn build(self) -> anyhow::Result<DomainSession> {
        let bus = self
            .bus
            .ok_or_else(|| anyhow!("a service bus is required"))?;
        let history = self
            .history
            .ok_or_else(|| anyhow!("a branch history store is required"))?;

        let mut info = self.info;
        if info.course_id.is_empty() {
            info.course_id = self.course.course_id.clone();
        }

        let mut interops = Vec::new();
        collect_interops(&self.course.objects, &mut interops);
        let plan = InitPlan {
            course_id: info.course_id.clone(),
            interops,
            sensors: self.sensors,
        };

        let queue = CourseQueue::new(self.course.objects)?;
        let selector = BranchSelector::new(history, info.course_id.clone(), info.experiment_id.clone());
        let lifecycle = Arc::new(SessionLifecycle::new());
        let coordinator = ModuleCoordinator::new(info, bus, lifecycle.clone(), self.settings);

        Ok(DomainSession {
            lifecycle,
            coordinator,
            selector,
            registry: self.registry.unwrap_or_default(),
            training_app: TrainingAppStateMachine::new(),
            lesson: LessonStateMachine::new(),
            feed: Arc::new(AssessmentFeed::default()),
            plan,
            join_host: self.join_host,
            terminating: AtomicBool::new(false),
            inner: Mutex::new(SessionInner {
                queue,
                review: PendingReviewEvents::new(),
                history: LearnerHistory::default(),
                published_records: Vec::new(),
                entered_branches: HashSet::new(),
                active_lesson: None,
                unpublished_score: None,
                visited: Vec::new(),
            }),
        })
    }
}

fn collect_interops(objects: &[CourseObject], interops: &mut Vec<String>) {
    for object in objects.iter().filter(|o| !o.is_disabled()) {
        match object {
            CourseObject::TrainingApplication(app) => {
                for interop in &app.interops {
                    if !interops.contains(interop) {
                        interops.push(interop.clone());
                    }
                }
            }
            CourseObject::AuthoredBranch(branch) => {
                for path in &branch.paths {
                    collect_interops(&path.objects, interops);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::object::Guidance;
    use crate::persistence::SqliteBranchHistory;
    use crate::services::{MockServiceBus, ScriptedReply};

    fn info() -> SessionInfo {
        SessionInfo {
            session_id: 21,
            user_id: 4,
            username: "learner".to_string(),
            course_id: String::new(),
            experiment_id: None,
            embedded: false,
        }
    }

    fn guidance(name: &str, disabled: bool) -> CourseObject {
        CourseObject::Guidance(Guidance {
            name: name.to_string(),
            disabled,
            message: format!("{} text", name),
            full_screen: false,
            duration_secs: None,
        })
    }

    fn course(objects: Vec<CourseObject>) -> CourseDefinition {
        CourseDefinition {
            course_id: "course-1".to_string(),
            name: "Course".to_string(),
            objects,
        }
    }

    async fn session(
        bus: Arc<MockServiceBus>,
        objects: Vec<CourseObject>,
    ) -> (DomainSession, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteBranchHistory::from_path(dir.path().join("history.db"))
            .await
            .unwrap();
        let session = DomainSession::builder(info(), course(objects))
            .bus(bus)
            .history_store(Arc::new(store))
            .build()
            .unwrap();
        (session, dir)
    }

    #[test]
    fn test_builder_requires_bus() {
        let err = DomainSession::builder(info(), course(vec![guidance("a", false)]))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("service bus"));
    }

    #[tokio::test]
    async fn test_builder_rejects_course_without_enabled_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteBranchHistory::from_path(dir.path().join("history.db"))
            .await
            .unwrap();
        let err = DomainSession::builder(info(), course(vec![guidance("a", true)]))
            .bus(Arc::new(MockServiceBus::new()))
            .history_store(Arc::new(store))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("enabled"));
    }

    #[tokio::test]
    async fn test_advance_skips_disabled_objects() {
        let bus = Arc::new(MockServiceBus::new());
        let (session, _dir) = session(
            bus.clone(),
            vec![guidance("a", false), guidance("b", true), guidance("c", false)],
        )
        .await;

        assert!(session.advance().await.unwrap());
        assert!(session.advance().await.unwrap());
        assert!(!session.advance().await.unwrap());

        assert_eq!(session.visited(), vec!["a", "c"]);
        assert_eq!(bus.count(RequestKind::DisplayGuidance), 2);
        assert_eq!(bus.count(RequestKind::CourseStateChanged), 4);
        assert_eq!(session.progress(), Progress { current: 2, max: 2 });
    }

    #[tokio::test]
    async fn test_review_drains_pending_events() {
        let bus = Arc::new(MockServiceBus::new());
        bus.reply_with(
            RequestKind::DisplaySurvey,
            ScriptedReply::Payload(serde_json::json!({"answers": [1, 2]})),
        );
        let review = || {
            CourseObject::AfterActionReview(AfterActionReview {
                name: "review".to_string(),
                disabled: false,
                full_screen: true,
            })
        };
        let (session, _dir) = session(
            bus.clone(),
            vec![
                CourseObject::Survey(Survey {
                    name: "pre".to_string(),
                    disabled: false,
                    survey_key: "pre-key".to_string(),
                    full_screen: true,
                }),
                review(),
                review(),
            ],
        )
        .await;

        session.advance().await.unwrap();
        assert_eq!(session.pending_review_events(), 1);
        session.advance().await.unwrap();
        session.advance().await.unwrap();

        let reviews = bus.requests_of(RequestKind::DisplayAar);
        assert!(matches!(
            &reviews[0].request,
            ServiceRequest::DisplayAar { events, message: None, .. } if events.len() == 1
        ));
        assert!(matches!(
            &reviews[1].request,
            ServiceRequest::DisplayAar { events, message: Some(m), .. } if events.is_empty() && m == NOTHING_TO_REVIEW
        ));
    }

    #[tokio::test]
    async fn test_guidance_nack_is_fatal() {
        let bus = Arc::new(MockServiceBus::new());
        bus.reply_with(RequestKind::DisplayGuidance, ScriptedReply::nack("tutor gone"));
        let (session, _dir) = session(bus.clone(), vec![guidance("a", false), guidance("b", false)]).await;

        let err = session.run().await.unwrap_err();

        assert_eq!(err.error_code(), "NACK");
        assert_eq!(session.lifecycle_state(), LifecycleState::Closed);
        assert_eq!(bus.count(RequestKind::DisplayGuidance), 1);
        assert_eq!(
            bus.requests_of(RequestKind::DisplayFinalMessage)[0].request,
            ServiceRequest::DisplayFinalMessage {
                message: crate::error::COURSE_ENDING_MESSAGE.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_adaptive_courseflow_revisits_until_complete() {
        let bus = Arc::new(MockServiceBus::new());
        bus.reply_with(
            RequestKind::AdaptiveCourseflowRequest,
            ScriptedReply::Payload(serde_json::json!({
                "objects": [{"type": "guidance", "name": "rule", "message": "Rule"}],
                "complete": false
            })),
        );
        bus.reply_with(
            RequestKind::AdaptiveCourseflowRequest,
            ScriptedReply::Payload(serde_json::json!({"objects": [], "complete": true})),
        );
        let (session, _dir) = session(
            bus.clone(),
            vec![
                CourseObject::AdaptiveCourseflow(AdaptiveCourseflow {
                    name: "adaptive".to_string(),
                    disabled: false,
                    concepts: vec!["safety".to_string()],
                }),
                guidance("after", false),
            ],
        )
        .await;

        while session.advance().await.unwrap() {}

        assert_eq!(session.visited(), vec!["adaptive", "rule", "adaptive", "after"]);
        assert_eq!(bus.count(RequestKind::AdaptiveCourseflowRequest), 2);
        assert_eq!(session.progress(), Progress { current: 2, max: 2 });
    }

    #[tokio::test]
    async fn test_malformed_adaptive_decision_is_invalid_payload() {
        let bus = Arc::new(MockServiceBus::new());
        bus.reply_with(
            RequestKind::AdaptiveCourseflowRequest,
            ScriptedReply::Payload(serde_json::json!({"objects": "not a list"})),
        );
        let (session, _dir) = session(
            bus,
            vec![CourseObject::AdaptiveCourseflow(AdaptiveCourseflow {
                name: "adaptive".to_string(),
                disabled: false,
                concepts: Vec::new(),
            })],
        )
        .await;

        let err = session.advance().await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PAYLOAD");
    }

    #[tokio::test]
    async fn test_terminate_twice_is_idempotent() {
        let bus = Arc::new(MockServiceBus::new());
        let (session, _dir) = session(bus.clone(), vec![guidance("a", false)]).await;

        let first = session.terminate(TerminationReason::LearnerExit).await;
        let second = session.terminate(TerminationReason::LearnerExit).await;

        assert!(first.report().is_some());
        assert_eq!(second, TerminationStatus::AlreadyTerminating);
        assert_eq!(bus.count(RequestKind::CloseSession), 6);
        assert!(!session.cleanup());
        session.closed().await;
    }

    #[test]
    fn test_collect_interops_walks_branch_paths() {
        use crate::course::{BranchPath, BranchStrategy};

        let app = |interop: &str| {
            CourseObject::TrainingApplication(TrainingApplication {
                name: interop.to_string(),
                disabled: false,
                scenario: Value::Null,
                real_time_assessment: false,
                interops: vec![interop.to_string()],
                embedded: false,
                team_roles: Vec::new(),
                playback_log: None,
            })
        };
        let objects = vec![
            app("vbs"),
            CourseObject::AuthoredBranch(AuthoredBranch {
                name: "branch".to_string(),
                disabled: false,
                branch_id: 1,
                strategy: BranchStrategy::Random,
                paths: vec![BranchPath {
                    path_id: 1,
                    name: "p".to_string(),
                    percent: None,
                    conditions: Vec::new(),
                    objects: vec![app("vbs"), app("unity")],
                    is_default: true,
                }],
            }),
        ];

        let mut interops = Vec::new();
        collect_interops(&objects, &mut interops);
        assert_eq!(interops, vec!["vbs", "unity"]);
    }
}
