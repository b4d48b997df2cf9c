// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock service bus for testing.
//!
//! Records every request and answers from a script. Unscripted requests are
//! acknowledged.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{ModuleKind, RequestKind, ServiceBus, ServiceRequest, SessionInfo};
use crate::callback::{Callback, Reply, RequestFailure};

/// A scripted answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// Terminal success without payload.
    Ack,
    /// Terminal success with payload.
    Payload(Value),
    /// Intermediate payloads followed by another reply.
    Received(Vec<Value>, Box<ScriptedReply>),
    /// Negative acknowledgement.
    Nack {
        /// Failure code.
        code: String,
        /// Failure reason.
        reason: String,
    },
    /// Communication failure.
    CommFailure(String),
    /// Never answer (the callback is kept alive until the bus is dropped).
    Silent,
    /// Answer after a delay.
    Delayed(Duration, Box<ScriptedReply>),
}

impl ScriptedReply {
    /// A nack with a generic code.
    pub fn nack(reason: impl Into<String>) -> Self {
        ScriptedReply::Nack {
            code: "OPERATION_FAILED".to_string(),
            reason: reason.into(),
        }
    }
}

/// A request seen by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// Sending session.
    pub session_id: i64,
    /// Target module.
    pub target: ModuleKind,
    /// The request.
    pub request: ServiceRequest,
}

/// Mock bus for testing.
#[derive(Debug, Default)]
pub struct MockServiceBus {
    journal: Mutex<Vec<RecordedRequest>>,
    queued: Mutex<HashMap<RequestKind, VecDeque<ScriptedReply>>>,
    standing: Mutex<HashMap<RequestKind, ScriptedReply>>,
    parked: Arc<Mutex<Vec<Callback>>>,
}

impl MockServiceBus {
    /// Create a mock that acknowledges everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next `kind` request with `reply`. Queued replies are used
    /// in order before any standing reply.
    pub fn reply_with(&self, kind: RequestKind, reply: ScriptedReply) -> &Self {
        lock(&self.queued)
            .entry(kind)
            .or_default()
            .push_back(reply);
        self
    }

    /// Answer every `kind` request with `reply`.
    pub fn always(&self, kind: RequestKind, reply: ScriptedReply) -> &Self {
        lock(&self.standing).insert(kind, reply);
        self
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.journal).clone()
    }

    /// Requests of one kind.
    pub fn requests_of(&self, kind: RequestKind) -> Vec<RecordedRequest> {
        lock(&self.journal)
            .iter()
            .filter(|r| r.request.kind() == kind)
            .cloned()
            .collect()
    }

    /// Number of requests of one kind.
    pub fn count(&self, kind: RequestKind) -> usize {
        lock(&self.journal)
            .iter()
            .filter(|r| r.request.kind() == kind)
            .count()
    }

    /// Kinds of every request, in send order.
    pub fn kinds(&self) -> Vec<RequestKind> {
        lock(&self.journal)
            .iter()
            .map(|r| r.request.kind())
            .collect()
    }

    fn next_reply(&self, kind: RequestKind) -> ScriptedReply {
        if let Some(reply) = lock(&self.queued).get_mut(&kind).and_then(VecDeque::pop_front) {
            return reply;
        }
        lock(&self.standing)
            .get(&kind)
            .cloned()
            .unwrap_or(ScriptedReply::Ack)
    }
}

/// Deliver `reply` on `callback`. Silent replies park the callback so the
/// waiter neither succeeds nor sees a dropped callback.
fn deliver(reply: ScriptedReply, callback: Callback, parked: Arc<Mutex<Vec<Callback>>>) {
    match reply {
        ScriptedReply::Ack => {
            callback.succeed(Reply::Ack);
        }
        ScriptedReply::Payload(value) => {
            callback.succeed(Reply::Payload(value));
        }
        ScriptedReply::Received(payloads, then) => {
            for payload in payloads {
                callback.received(payload);
            }
            deliver(*then, callback, parked);
        }
        ScriptedReply::Nack { code, reason } => {
            callback.fail(RequestFailure::Nack { code, reason });
        }
        ScriptedReply::CommFailure(reason) => {
            callback.fail(RequestFailure::Communication(reason));
        }
        ScriptedReply::Silent => {
            lock(&parked).push(callback);
        }
        ScriptedReply::Delayed(delay, then) => {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                deliver(*then, callback, parked);
            });
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ServiceBus for MockServiceBus {
    async fn send(
        &self,
        session: &SessionInfo,
        target: ModuleKind,
        request: ServiceRequest,
        callback: Callback,
    ) {
        let kind = request.kind();
        lock(&self.journal).push(RecordedRequest {
            session_id: session.session_id,
            target,
            request,
        });
        let reply = self.next_reply(kind);
        deliver(reply, callback, self.parked.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SessionInfo {
        SessionInfo {
            session_id: 1,
            user_id: 1,
            username: "learner".to_string(),
            course_id: "course".to_string(),
            experiment_id: None,
            embedded: false,
        }
    }

    #[tokio::test]
    async fn test_queued_replies_precede_standing_ones() {
        let bus = MockServiceBus::new();
        bus.always(RequestKind::PauseScenario, ScriptedReply::nack("busy"))
            .reply_with(RequestKind::PauseScenario, ScriptedReply::Ack);

        let (first, first_reply) = Callback::channel("pause");
        bus.send(&info(), ModuleKind::Gateway, ServiceRequest::PauseScenario, first)
            .await;
        assert_eq!(first_reply.outcome().await, Ok(Reply::Ack));

        let (second, second_reply) = Callback::channel("pause");
        bus.send(&info(), ModuleKind::Gateway, ServiceRequest::PauseScenario, second)
            .await;
        assert!(matches!(
            second_reply.outcome().await,
            Err(RequestFailure::Nack { .. })
        ));

        assert_eq!(bus.count(RequestKind::PauseScenario), 2);
    }

    #[tokio::test]
    async fn test_received_then_delayed_payload() {
        let bus = MockServiceBus::new();
        bus.reply_with(
            RequestKind::StartScenario,
            ScriptedReply::Received(
                vec![serde_json::json!({"assessment": 1})],
                Box::new(ScriptedReply::Delayed(
                    Duration::from_millis(5),
                    Box::new(ScriptedReply::Payload(serde_json::json!({"score": 90}))),
                )),
            ),
        );

        let (callback, pending) = Callback::channel("start");
        bus.send(
            &info(),
            ModuleKind::Gateway,
            ServiceRequest::StartScenario {
                lesson_name: "range".to_string(),
            },
            callback,
        )
        .await;

        let (outcome, received) = pending.collect().await;
        assert_eq!(outcome, Ok(Reply::Payload(serde_json::json!({"score": 90}))));
        assert_eq!(received, vec![serde_json::json!({"assessment": 1})]);
    }
}
