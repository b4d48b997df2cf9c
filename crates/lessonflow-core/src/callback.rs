// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The three-outcome callback every cross-service exchange is built on.
//!
//! A [`Callback`] is bound to exactly one outstanding request. It accepts any
//! number of intermediate payloads followed by exactly one terminal outcome:
//!
//! ```text
//!            received(payload)*
//!                  │
//!        ┌─────────┴─────────┐
//!        ▼                   ▼
//!   success(reply)    failure(RequestFailure)
//!        │                   │
//!        └──── terminated ───┘   later calls are ignored
//! ```
//!
//! Whoever delivers the outcome (a bus implementation, a mock, a timeout)
//! may race with others; the first terminal call wins and every later call
//! is a no-op that returns `false`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Terminal success payload of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Plain acknowledgement.
    Ack,
    /// Structured reply (decision, record reference, ...).
    Payload(Value),
}

impl Reply {
    /// The payload, if the reply carried one.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Reply::Ack => None,
            Reply::Payload(value) => Some(value),
        }
    }
}

/// Terminal failure of a request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestFailure {
    /// The collaborating service explicitly rejected the request.
    #[error("negative acknowledgement ({code}): {reason}")]
    Nack {
        /// Machine-readable reason code.
        code: String,
        /// Human-readable reason.
        reason: String,
    },

    /// The reply never arrived or could not be understood.
    #[error("communication failure: {0}")]
    Communication(String),
}

/// Receives the outcomes of one request.
///
/// `received` has a no-op default since most requests never produce
/// intermediate payloads.
pub trait CallbackHandler: Send + Sync {
    /// An intermediate payload arrived.
    fn received(&self, _payload: Value) {}

    /// The request completed.
    fn success(&self, reply: Reply);

    /// The request failed.
    fn failure(&self, failure: RequestFailure);
}

struct CallbackInner {
    label: String,
    terminated: AtomicBool,
    handler: Box<dyn CallbackHandler>,
}

/// Exactly-once wrapper around a [`CallbackHandler`].
///
/// Cloning shares the terminal guard, so a bus may hand clones to a reply
/// task and a timeout task without risking a double delivery.
#[derive(Clone)]
pub struct Callback {
    inner: Arc<CallbackInner>,
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("label", &self.inner.label)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Callback {
    /// Wrap a handler.
    pub fn new(label: impl Into<String>, handler: impl CallbackHandler + 'static) -> Self {
        Self {
            inner: Arc::new(CallbackInner {
                label: label.into(),
                terminated: AtomicBool::new(false),
                handler: Box::new(handler),
            }),
        }
    }

    /// Create a callback whose outcomes are delivered to a [`PendingReply`].
    pub fn channel(label: impl Into<String>) -> (Callback, PendingReply) {
        let (terminal_tx, terminal_rx) = oneshot::channel();
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let handler = ChannelHandler {
            terminal: Mutex::new(Some(terminal_tx)),
            received: received_tx,
        };
        (
            Callback::new(label, handler),
            PendingReply {
                terminal: terminal_rx,
                received: received_rx,
                finished: false,
            },
        )
    }

    /// Name of the request this callback belongs to.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether a terminal outcome has been delivered.
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Deliver an intermediate payload. Ignored once terminated.
    pub fn received(&self, payload: Value) -> bool {
        if self.is_terminated() {
            debug!(request = %self.inner.label, "Dropping payload received after terminal outcome");
            return false;
        }
        self.inner.handler.received(payload);
        true
    }

    /// Deliver terminal success. Returns `false` if an outcome was already delivered.
    pub fn succeed(&self, reply: Reply) -> bool {
        if !self.claim_terminal() {
            return false;
        }
        self.inner.handler.success(reply);
        true
    }

    /// Deliver terminal failure. Returns `false` if an outcome was already delivered.
    pub fn fail(&self, failure: RequestFailure) -> bool {
        if !self.claim_terminal() {
            return false;
        }
        self.inner.handler.failure(failure);
        true
    }

    fn claim_terminal(&self) -> bool {
        let claimed = self
            .inner
            .terminated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !claimed {
            debug!(request = %self.inner.label, "Ignoring second terminal outcome");
        }
        claimed
    }
}

struct ChannelHandler {
    terminal: Mutex<Option<oneshot::Sender<Result<Reply, RequestFailure>>>>,
    received: mpsc::UnboundedSender<Value>,
}

impl ChannelHandler {
    fn finish(&self, outcome: Result<Reply, RequestFailure>) {
        let sender = match self.terminal.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            // The waiter may have given up (timeout, shutdown); nothing to do then.
            let _ = sender.send(outcome);
        }
    }
}

impl CallbackHandler for ChannelHandler {
    fn received(&self, payload: Value) {
        let _ = self.received.send(payload);
    }

    fn success(&self, reply: Reply) {
        self.finish(Ok(reply));
    }

    fn failure(&self, failure: RequestFailure) {
        self.finish(Err(failure));
    }
}

/// The awaiting side of [`Callback::channel`].
#[derive(Debug)]
pub struct PendingReply {
    terminal: oneshot::Receiver<Result<Reply, RequestFailure>>,
    received: mpsc::UnboundedReceiver<Value>,
    finished: bool,
}

/// One step of a reply stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    /// An intermediate payload.
    Received(Value),
    /// The terminal outcome. Nothing follows it.
    Terminal(Result<Reply, RequestFailure>),
}

fn dropped() -> RequestFailure {
    RequestFailure::Communication("callback dropped without a reply".to_string())
}

impl PendingReply {
    /// Wait for the terminal outcome, discarding intermediate payloads.
    ///
    /// If every clone of the callback is dropped without an outcome the
    /// request is reported as a communication failure.
    pub async fn outcome(self) -> Result<Reply, RequestFailure> {
        self.collect().await.0
    }

    /// Wait for the terminal outcome and return every intermediate payload
    /// that preceded it, in arrival order.
    pub async fn collect(mut self) -> (Result<Reply, RequestFailure>, Vec<Value>) {
        if self.finished {
            return (Err(dropped()), Vec::new());
        }
        let outcome = (&mut self.terminal).await.unwrap_or_else(|_| Err(dropped()));
        let mut received = Vec::new();
        while let Ok(payload) = self.received.try_recv() {
            received.push(payload);
        }
        (outcome, received)
    }

    /// Wait for the next event: an intermediate payload or the terminal
    /// outcome. Payloads delivered before the terminal outcome always come
    /// first. Returns `None` after the terminal outcome was returned.
    pub async fn next_event(&mut self) -> Option<ReplyEvent> {
        if self.finished {
            return None;
        }
        tokio::select! {
            biased;
            Some(payload) = self.received.recv() => Some(ReplyEvent::Received(payload)),
            outcome = &mut self.terminal => {
                self.finished = true;
                Some(ReplyEvent::Terminal(outcome.unwrap_or_else(|_| Err(dropped()))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        received: AtomicUsize,
        successes: AtomicUsize,
        failures: AtomicUsize,
    }

    impl CallbackHandler for Arc<Counting> {
        fn received(&self, _payload: Value) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }

        fn success(&self, _reply: Reply) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        fn failure(&self, _failure: RequestFailure) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_exactly_one_terminal_outcome() {
        let counts = Arc::new(Counting::default());
        let callback = Callback::new("display_survey", counts.clone());

        assert!(callback.received(serde_json::json!({"answer": 1})));
        assert!(callback.received(serde_json::json!({"answer": 2})));
        assert!(callback.succeed(Reply::Ack));
        assert!(!callback.fail(RequestFailure::Communication("late".to_string())));
        assert!(!callback.succeed(Reply::Ack));
        assert!(!callback.received(serde_json::json!({"answer": 3})));

        assert_eq!(counts.received.load(Ordering::SeqCst), 2);
        assert_eq!(
            counts.successes.load(Ordering::SeqCst) + counts.failures.load(Ordering::SeqCst),
            1
        );
        assert!(callback.is_terminated());
    }

    #[test]
    fn test_concurrent_terminal_outcomes_deliver_once() {
        let counts = Arc::new(Counting::default());
        let callback = Callback::new("start_session", counts.clone());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let cb = callback.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        cb.succeed(Reply::Ack)
                    } else {
                        cb.fail(RequestFailure::Communication("race".to_string()))
                    }
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(
            counts.successes.load(Ordering::SeqCst) + counts.failures.load(Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_channel_collects_intermediate_payloads() {
        let (callback, pending) = Callback::channel("display_survey");
        callback.received(serde_json::json!("first"));
        callback.received(serde_json::json!("second"));
        callback.succeed(Reply::Payload(serde_json::json!({"done": true})));

        let (outcome, received) = pending.collect().await;
        assert_eq!(
            outcome,
            Ok(Reply::Payload(serde_json::json!({"done": true})))
        );
        assert_eq!(
            received,
            vec![serde_json::json!("first"), serde_json::json!("second")]
        );
    }

    #[tokio::test]
    async fn test_events_arrive_in_delivery_order() {
        let (callback, mut pending) = Callback::channel("start_scenario");
        callback.received(serde_json::json!(1));
        callback.received(serde_json::json!(2));
        callback.succeed(Reply::Ack);

        assert_eq!(
            pending.next_event().await,
            Some(ReplyEvent::Received(serde_json::json!(1)))
        );
        assert_eq!(
            pending.next_event().await,
            Some(ReplyEvent::Received(serde_json::json!(2)))
        );
        assert_eq!(
            pending.next_event().await,
            Some(ReplyEvent::Terminal(Ok(Reply::Ack)))
        );
        assert_eq!(pending.next_event().await, None);
    }

    #[tokio::test]
    async fn test_dropped_callback_is_communication_failure() {
        let (callback, pending) = Callback::channel("close_session");
        drop(callback);

        let outcome = pending.outcome().await;
        assert!(matches!(outcome, Err(RequestFailure::Communication(_))));
    }

    #[tokio::test]
    async fn test_nack_reaches_waiter() {
        let (callback, pending) = Callback::channel("load_scenario");
        let delivering = callback.clone();
        tokio::spawn(async move {
            delivering.fail(RequestFailure::Nack {
                code: "OPERATION_FAILED".to_string(),
                reason: "scenario missing".to_string(),
            });
        });

        let outcome = pending.outcome().await;
        assert_eq!(
            outcome,
            Err(RequestFailure::Nack {
                code: "OPERATION_FAILED".to_string(),
                reason: "scenario missing".to_string(),
            })
        );
        assert!(callback.is_terminated());
    }
}
