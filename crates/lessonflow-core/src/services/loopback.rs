// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A bus that answers every request itself.
//!
//! Used for dry runs: a course can be walked end to end (branches selected,
//! history recorded) without any collaborating service running.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{ModuleKind, ServiceBus, ServiceRequest, SessionInfo};
use crate::callback::{Callback, Reply};

/// Acknowledges everything. Score publication yields a fresh record id and
/// adaptive courseflow requests finish immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackBus;

impl LoopbackBus {
    /// Create a loopback bus.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ServiceBus for LoopbackBus {
    async fn send(
        &self,
        session: &SessionInfo,
        target: ModuleKind,
        request: ServiceRequest,
        callback: Callback,
    ) {
        info!(
            session_id = session.session_id,
            target = ?target,
            request = %request.kind(),
            "Loopback request"
        );

        let reply = match request {
            ServiceRequest::PublishScore { .. } => Reply::Payload(json!({
                "record_id": Uuid::new_v4().to_string(),
            })),
            ServiceRequest::LmsDataRequest { .. } => Reply::Payload(json!({ "records": [] })),
            ServiceRequest::AdaptiveCourseflowRequest { .. } => Reply::Payload(json!({
                "objects": [],
                "complete": true,
            })),
            _ => Reply::Ack,
        };
        callback.succeed(reply);
    }
}
