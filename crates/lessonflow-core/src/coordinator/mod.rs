// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Module coordinator: every request a session sends goes through here.
//!
//! The coordinator owns the rules that apply to all exchanges:
//!
//! - nothing is sent once the session left RUNNING; such requests resolve to
//!   [`RequestOutcome::Dropped`] and their callback is never invoked
//! - gateway control requests need an established gateway connection
//! - a request without a terminal reply within the timeout fails as a
//!   communication failure
//! - replies that arrive after the session started closing are discarded
//!
//! Termination uses [`ModuleCoordinator::request_during_shutdown`], which
//! skips the activity check and is bounded by the phase timeout instead.

pub mod deferred;
pub mod stages;
pub mod ui_wait;

pub use deferred::{Deferred, DeferredState};
pub use stages::{InitPlan, InitStage, StageReport};
pub use ui_wait::{UiWait, spawn_serialized};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::callback::{Callback, CallbackHandler, Reply, ReplyEvent, RequestFailure};
use crate::config::SessionSettings;
use crate::error::{Result, SessionError};
use crate::services::{ModuleKind, RequestKind, ServiceBus, ServiceRequest, SessionInfo};
use crate::state::SessionLifecycle;

/// How a coordinated request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Terminal success.
    Completed(Reply),
    /// Terminal failure (including timeouts).
    Failed(RequestFailure),
    /// Not sent, or its reply was discarded because the session is closing.
    Dropped,
}

impl RequestOutcome {
    /// Convert into a result: failures become [`SessionError`]s, a dropped
    /// request becomes `Ok(None)`.
    pub fn into_result(self, kind: RequestKind) -> Result<Option<Reply>> {
        match self {
            RequestOutcome::Completed(reply) => Ok(Some(reply)),
            RequestOutcome::Failed(failure) => Err(SessionError::from_failure(kind.as_str(), failure)),
            RequestOutcome::Dropped => Ok(None),
        }
    }

    /// Whether the request completed successfully.
    pub fn is_completed(&self) -> bool {
        matches!(self, RequestOutcome::Completed(_))
    }
}

/// Logs failures of fire-and-forget notifications.
struct LogFailures {
    session_id: i64,
    kind: RequestKind,
}

impl CallbackHandler for LogFailures {
    fn success(&self, _reply: Reply) {
        debug!(session_id = self.session_id, request = %self.kind, "Notification acknowledged");
    }

    fn failure(&self, failure: RequestFailure) {
        warn!(
            session_id = self.session_id,
            request = %self.kind,
            error = %failure,
            "Notification failed"
        );
    }
}

/// Sends requests on behalf of one session.
pub struct ModuleCoordinator {
    info: SessionInfo,
    bus: Arc<dyn ServiceBus>,
    lifecycle: Arc<SessionLifecycle>,
    settings: SessionSettings,
    connections_established: AtomicBool,
}

impl std::fmt::Debug for ModuleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCoordinator")
            .field("session_id", &self.info.session_id)
            .field("settings", &self.settings)
            .field("connections_established", &self.connections_established())
            .finish()
    }
}

impl ModuleCoordinator {
    /// Create a coordinator.
    pub fn new(
        info: SessionInfo,
        bus: Arc<dyn ServiceBus>,
        lifecycle: Arc<SessionLifecycle>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            info,
            bus,
            lifecycle,
            settings,
            connections_established: AtomicBool::new(false),
        }
    }

    /// The session this coordinator speaks for.
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Timeouts in use.
    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    /// Whether the gateway connected the interops the course needs.
    pub fn connections_established(&self) -> bool {
        self.connections_established.load(Ordering::SeqCst)
    }

    /// Record whether the gateway is connected.
    pub fn set_connections_established(&self, established: bool) {
        self.connections_established
            .store(established, Ordering::SeqCst);
    }

    fn admit(&self, target: ModuleKind, request: &ServiceRequest) -> bool {
        if !self.lifecycle.is_active() {
            debug!(
                session_id = self.info.session_id,
                request = %request.kind(),
                "Dropping request; session is no longer running"
            );
            return false;
        }
        if target == ModuleKind::Gateway
            && request.needs_gateway_connection()
            && !self.connections_established()
        {
            debug!(
                session_id = self.info.session_id,
                request = %request.kind(),
                "Dropping gateway request; no connection established"
            );
            return false;
        }
        true
    }

    /// Send with a caller-supplied callback.
    ///
    /// Returns `false` if the request was dropped; the callback is then never
    /// invoked.
    pub async fn send(&self, target: ModuleKind, request: ServiceRequest, callback: Callback) -> bool {
        if !self.admit(target, &request) {
            return false;
        }
        self.bus.send(&self.info, target, request, callback).await;
        true
    }

    /// Send a notification whose failure is only logged.
    pub async fn notify(&self, target: ModuleKind, request: ServiceRequest) -> bool {
        let kind = request.kind();
        let callback = Callback::new(
            kind.as_str(),
            LogFailures {
                session_id: self.info.session_id,
                kind,
            },
        );
        self.send(target, request, callback).await
    }

    /// Send and wait for the terminal outcome.
    #[instrument(skip(self, request), fields(session_id = self.info.session_id, request = %request.kind()))]
    pub async fn request(&self, target: ModuleKind, request: ServiceRequest) -> RequestOutcome {
        self.request_streaming(target, request, |_| {}).await
    }

    /// Send, wait for the terminal outcome and collect intermediate payloads.
    pub async fn request_collecting(
        &self,
        target: ModuleKind,
        request: ServiceRequest,
    ) -> (RequestOutcome, Vec<Value>) {
        let mut received = Vec::new();
        let outcome = self
            .request_streaming(target, request, |payload| received.push(payload))
            .await;
        (outcome, received)
    }

    /// Send and hand each intermediate payload to `on_received` as it arrives.
    pub async fn request_streaming<F>(
        &self,
        target: ModuleKind,
        request: ServiceRequest,
        on_received: F,
    ) -> RequestOutcome
    where
        F: FnMut(Value) + Send,
    {
        if !self.admit(target, &request) {
            return RequestOutcome::Dropped;
        }
        self.exchange(target, request, self.settings.request_timeout, true, on_received)
            .await
    }

    /// Send during termination: no activity check, bounded by the phase
    /// timeout, and the reply is awaited even though the session is closing.
    pub async fn request_during_shutdown(
        &self,
        target: ModuleKind,
        request: ServiceRequest,
    ) -> RequestOutcome {
        if target == ModuleKind::Gateway
            && request.needs_gateway_connection()
            && !self.connections_established()
        {
            return RequestOutcome::Dropped;
        }
        self.exchange(target, request, self.settings.phase_timeout, false, |_| {})
            .await
    }

    async fn exchange<F>(
        &self,
        target: ModuleKind,
        request: ServiceRequest,
        timeout: Duration,
        discard_on_close: bool,
        mut on_received: F,
    ) -> RequestOutcome
    where
        F: FnMut(Value) + Send,
    {
        let kind = request.kind();
        let (callback, mut pending) = Callback::channel(kind.as_str());
        self.bus
            .send(&self.info, target, request, callback.clone())
            .await;

        let closing = self.lifecycle.closing_token();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = closing.cancelled(), if discard_on_close => {
                    debug!(
                        session_id = self.info.session_id,
                        request = %kind,
                        "Discarding reply; session is closing"
                    );
                    return RequestOutcome::Dropped;
                }
                event = pending.next_event() => match event {
                    Some(ReplyEvent::Received(payload)) => on_received(payload),
                    Some(ReplyEvent::Terminal(Ok(reply))) => return RequestOutcome::Completed(reply),
                    Some(ReplyEvent::Terminal(Err(failure))) => return RequestOutcome::Failed(failure),
                    None => {
                        return RequestOutcome::Failed(RequestFailure::Communication(
                            "reply stream ended".to_string(),
                        ));
                    }
                },
                _ = &mut deadline => {
                    let failure = RequestFailure::Communication(format!(
                        "no reply to '{}' within {:?}",
                        kind, timeout
                    ));
                    // Late replies hit a terminated callback and are ignored.
                    callback.fail(failure.clone());
                    return RequestOutcome::Failed(failure);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{MockServiceBus, ScriptedReply};

    fn info() -> SessionInfo {
        SessionInfo {
            session_id: 5,
            user_id: 2,
            username: "learner".to_string(),
            course_id: "course".to_string(),
            experiment_id: None,
            embedded: false,
        }
    }

    fn coordinator(bus: Arc<MockServiceBus>, settings: SessionSettings) -> ModuleCoordinator {
        ModuleCoordinator::new(info(), bus, Arc::new(SessionLifecycle::new()), settings)
    }

    #[tokio::test]
    async fn test_inactive_session_drops_requests() {
        let bus = Arc::new(MockServiceBus::new());
        let lifecycle = Arc::new(SessionLifecycle::new());
        let coordinator = ModuleCoordinator::new(
            info(),
            bus.clone(),
            lifecycle.clone(),
            SessionSettings::default(),
        );

        lifecycle.begin_closing();

        let outcome = coordinator
            .request(ModuleKind::Tutor, ServiceRequest::StartSession)
            .await;
        assert_eq!(outcome, RequestOutcome::Dropped);
        assert!(!coordinator.notify(ModuleKind::Learner, ServiceRequest::InitializeLearner).await);
        assert!(bus.requests().is_empty());

        let outcome = coordinator
            .request_during_shutdown(
                ModuleKind::Tutor,
                ServiceRequest::CloseSession {
                    reason: "done".to_string(),
                },
            )
            .await;
        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn test_gateway_control_requires_connection() {
        let bus = Arc::new(MockServiceBus::new());
        let coordinator = coordinator(bus.clone(), SessionSettings::default());

        let outcome = coordinator
            .request(ModuleKind::Gateway, ServiceRequest::PauseScenario)
            .await;
        assert_eq!(outcome, RequestOutcome::Dropped);

        let outcome = coordinator
            .request(
                ModuleKind::Gateway,
                ServiceRequest::LoadScenario {
                    scenario: Value::Null,
                    embedded: false,
                },
            )
            .await;
        assert!(outcome.is_completed());

        coordinator.set_connections_established(true);
        let outcome = coordinator
            .request(ModuleKind::Gateway, ServiceRequest::PauseScenario)
            .await;
        assert!(outcome.is_completed());
        assert_eq!(bus.count(RequestKind::PauseScenario), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_reply_times_out() {
        let bus = Arc::new(MockServiceBus::new());
        bus.always(RequestKind::StartSession, ScriptedReply::Silent);
        let settings = SessionSettings {
            request_timeout: Duration::from_millis(50),
            phase_timeout: Duration::from_millis(10),
        };
        let coordinator = coordinator(bus, settings);

        let outcome = coordinator
            .request(ModuleKind::Tutor, ServiceRequest::StartSession)
            .await;
        assert!(matches!(
            outcome,
            RequestOutcome::Failed(RequestFailure::Communication(_))
        ));

        let err = outcome.into_result(RequestKind::StartSession).unwrap_err();
        assert_eq!(err.error_code(), "COMMUNICATION_FAILURE");
    }

    #[tokio::test]
    async fn test_closing_discards_in_flight_reply() {
        let bus = Arc::new(MockServiceBus::new());
        bus.always(RequestKind::StartScenario, ScriptedReply::Silent);
        let lifecycle = Arc::new(SessionLifecycle::new());
        let coordinator = Arc::new(ModuleCoordinator::new(
            info(),
            bus,
            lifecycle.clone(),
            SessionSettings::default(),
        ));
        coordinator.set_connections_established(true);

        let waiting = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .request(
                        ModuleKind::Gateway,
                        ServiceRequest::StartScenario {
                            lesson_name: "range".to_string(),
                        },
                    )
                    .await
            })
        };

        tokio::task::yield_now().await;
        lifecycle.begin_closing();

        assert_eq!(waiting.await.unwrap(), RequestOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_streaming_sees_payloads_before_outcome() {
        let bus = Arc::new(MockServiceBus::new());
        bus.reply_with(
            RequestKind::DisplaySurvey,
            ScriptedReply::Received(
                vec![serde_json::json!({"page": 1}), serde_json::json!({"page": 2})],
                Box::new(ScriptedReply::Payload(serde_json::json!({"done": true}))),
            ),
        );
        let coordinator = coordinator(bus, SessionSettings::default());

        let (outcome, received) = coordinator
            .request_collecting(
                ModuleKind::Tutor,
                ServiceRequest::DisplaySurvey {
                    survey_key: "pre".to_string(),
                    full_screen: true,
                },
            )
            .await;

        assert_eq!(
            outcome,
            RequestOutcome::Completed(Reply::Payload(serde_json::json!({"done": true})))
        );
        assert_eq!(received.len(), 2);
    }
}
