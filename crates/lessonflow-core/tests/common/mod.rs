// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for lessonflow-core integration tests.
//!
//! Provides TestContext: a scripted service bus, a throwaway SQLite branch
//! history and a knowledge session registry shared by every session built
//! from the context.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use lessonflow_core::DomainSession;
use lessonflow_core::DomainSessionBuilder;
use lessonflow_core::config::SessionSettings;
use lessonflow_core::course::object::{Guidance, TrainingApplication};
use lessonflow_core::course::{CourseDefinition, CourseObject};
use lessonflow_core::knowledge::KnowledgeSessionRegistry;
use lessonflow_core::persistence::SqliteBranchHistory;
use lessonflow_core::services::{MockServiceBus, SessionInfo};

pub const COURSE_ID: &str = "course-e2e";

/// Test context shared by the sessions of one test.
pub struct TestContext {
    pub bus: Arc<MockServiceBus>,
    pub history: Arc<SqliteBranchHistory>,
    pub registry: Arc<KnowledgeSessionRegistry>,
    _dir: TempDir,
}

impl TestContext {
    /// Create a new test context.
    ///
    /// This sets up:
    /// 1. A mock bus that acknowledges everything until scripted otherwise
    /// 2. A migrated SQLite branch history in a temp directory
    /// 3. An empty knowledge session registry
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let history = SqliteBranchHistory::from_path(dir.path().join("history.db"))
            .await
            .expect("Failed to open branch history");

        Self {
            bus: Arc::new(MockServiceBus::new()),
            history: Arc::new(history),
            registry: Arc::new(KnowledgeSessionRegistry::new()),
            _dir: dir,
        }
    }

    /// Builder for a session wired to this context.
    pub fn builder(&self, session_id: i64, objects: Vec<CourseObject>) -> DomainSessionBuilder {
        DomainSession::builder(info(session_id), course(objects))
            .bus(self.bus.clone())
            .history_store(self.history.clone())
            .registry(self.registry.clone())
            .settings(SessionSettings {
                request_timeout: Duration::from_secs(5),
                phase_timeout: Duration::from_secs(1),
            })
    }

    /// Build a session wired to this context.
    pub fn session(&self, session_id: i64, objects: Vec<CourseObject>) -> Arc<DomainSession> {
        Arc::new(
            self.builder(session_id, objects)
                .build()
                .expect("Failed to build session"),
        )
    }
}

pub fn info(session_id: i64) -> SessionInfo {
    SessionInfo {
        session_id,
        user_id: session_id * 10,
        username: format!("learner-{}", session_id),
        course_id: COURSE_ID.to_string(),
        experiment_id: None,
        embedded: false,
    }
}

pub fn course(objects: Vec<CourseObject>) -> CourseDefinition {
    CourseDefinition {
        course_id: COURSE_ID.to_string(),
        name: "End to end course".to_string(),
        objects,
    }
}

pub fn guidance(name: &str) -> CourseObject {
    CourseObject::Guidance(Guidance {
        name: name.to_string(),
        disabled: false,
        message: format!("{} text", name),
        full_screen: false,
        duration_secs: None,
    })
}

pub fn training_app(name: &str) -> TrainingApplication {
    TrainingApplication {
        name: name.to_string(),
        disabled: false,
        scenario: Value::Null,
        real_time_assessment: false,
        interops: Vec::new(),
        embedded: false,
        team_roles: Vec::new(),
        playback_log: None,
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "Timed out waiting for {}", what);
}
