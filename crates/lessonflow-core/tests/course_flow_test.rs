// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for authored branches and adaptive courseflow.

mod common;

use common::*;
use serde_json::json;

use lessonflow_core::course::object::{AdaptiveCourseflow, Survey};
use lessonflow_core::course::{AuthoredBranch, BranchPath, BranchStrategy, CourseObject};
use lessonflow_core::persistence::{BranchHistoryStore, BranchPathKey};
use lessonflow_core::services::{ModuleKind, RequestKind, ScriptedReply, ServiceRequest};

fn path(path_id: i64, name: &str, objects: Vec<CourseObject>) -> BranchPath {
    BranchPath {
        path_id,
        name: name.to_string(),
        percent: None,
        conditions: Vec::new(),
        objects,
        is_default: false,
    }
}

fn balanced_branch() -> CourseObject {
    CourseObject::AuthoredBranch(AuthoredBranch {
        name: "practice".to_string(),
        disabled: false,
        branch_id: 7,
        strategy: BranchStrategy::Balanced,
        paths: vec![
            path(1, "easy", vec![guidance("easy drill")]),
            path(2, "hard", vec![guidance("hard drill")]),
        ],
    })
}

fn key(path_id: i64) -> BranchPathKey {
    BranchPathKey {
        course_id: COURSE_ID.to_string(),
        experiment_id: None,
        branch_id: 7,
        path_id,
    }
}

#[tokio::test]
async fn test_balanced_branch_spreads_learners_across_paths() {
    let ctx = TestContext::new().await;

    let mut taken = Vec::new();
    for session_id in 1..=3 {
        let session = ctx.session(session_id, vec![guidance("intro"), balanced_branch()]);
        session.start().await.unwrap();
        session.run().await.unwrap();
        taken.push(session.visited());
    }

    assert_eq!(taken[0], vec!["intro", "practice", "easy drill", "easy"]);
    assert_eq!(taken[1], vec!["intro", "practice", "hard drill", "hard"]);
    assert_eq!(taken[2], vec!["intro", "practice", "easy drill", "easy"]);

    let easy = ctx.history.get(&key(1)).await.unwrap().expect("easy path recorded");
    let hard = ctx.history.get(&key(2)).await.unwrap().expect("hard path recorded");
    assert_eq!(easy.learner_count, 2);
    assert_eq!(hard.learner_count, 1);
    assert_eq!(easy.path_name.as_deref(), Some("easy"));
}

#[tokio::test]
async fn test_path_end_is_not_announced() {
    let ctx = TestContext::new().await;
    let session = ctx.session(4, vec![balanced_branch()]);
    session.start().await.unwrap();
    session.run().await.unwrap();

    let announced: Vec<String> = ctx
        .bus
        .requests_of(RequestKind::CourseStateChanged)
        .into_iter()
        .filter(|r| r.target == ModuleKind::Learner)
        .filter_map(|r| match r.request {
            ServiceRequest::CourseStateChanged { object_name, .. } => Some(object_name),
            _ => None,
        })
        .collect();
    assert_eq!(announced, vec!["practice", "easy drill"]);
}

#[tokio::test]
async fn test_adaptive_courseflow_splices_pedagogical_decisions() {
    let ctx = TestContext::new().await;
    ctx.bus
        .reply_with(
            RequestKind::AdaptiveCourseflowRequest,
            ScriptedReply::Payload(json!({
                "objects": [
                    {"type": "guidance", "name": "rule", "message": "Check your sectors"},
                    {"type": "survey", "name": "recall", "survey_key": "recall-key"}
                ],
                "complete": false
            })),
        )
        .reply_with(
            RequestKind::AdaptiveCourseflowRequest,
            ScriptedReply::Payload(json!({
                "objects": [{"type": "guidance", "name": "example", "message": "Example"}],
                "complete": true
            })),
        )
        .reply_with(
            RequestKind::DisplaySurvey,
            ScriptedReply::Payload(json!({"answers": ["sector"]})),
        );

    let adaptive = CourseObject::AdaptiveCourseflow(AdaptiveCourseflow {
        name: "room clearing".to_string(),
        disabled: false,
        concepts: vec!["sectors".to_string(), "corners".to_string()],
    });
    let session = ctx.session(5, vec![adaptive, guidance("wrap up")]);
    session.start().await.unwrap();
    session.run().await.unwrap();

    assert_eq!(
        session.visited(),
        vec!["room clearing", "rule", "recall", "room clearing", "example", "wrap up"]
    );
    let requests = ctx.bus.requests_of(RequestKind::AdaptiveCourseflowRequest);
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.target == ModuleKind::Pedagogy));
    assert_eq!(
        requests[0].request,
        ServiceRequest::AdaptiveCourseflowRequest {
            concepts: vec!["sectors".to_string(), "corners".to_string()]
        }
    );

    // Spliced objects do not count towards authored progress.
    let progress = session.progress();
    assert_eq!((progress.current, progress.max), (2, 2));
}

#[tokio::test]
async fn test_disabled_branch_paths_are_never_counted() {
    let ctx = TestContext::new().await;
    let mut branch = balanced_branch();
    if let CourseObject::AuthoredBranch(b) = &mut branch {
        b.disabled = true;
    }
    let session = ctx.session(
        6,
        vec![
            branch,
            CourseObject::Survey(Survey {
                name: "exit".to_string(),
                disabled: false,
                survey_key: "exit-key".to_string(),
                full_screen: false,
            }),
        ],
    );
    session.start().await.unwrap();
    session.run().await.unwrap();

    assert_eq!(session.visited(), vec!["exit"]);
    assert!(ctx.history.get(&key(1)).await.unwrap().is_none());
}
