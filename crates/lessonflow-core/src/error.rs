// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for lessonflow-core.
//!
//! [`SessionError`] is the unified error for anything that can end a course
//! session. Invalid state-machine transitions are deliberately absent: those
//! are rejected by a predicate and logged, never raised.

use std::fmt;

use crate::callback::RequestFailure;

/// Result type using SessionError
pub type Result<T> = std::result::Result<T, SessionError>;

/// Text shown to the learner whenever a session ends because of an error.
///
/// The detailed cause is only ever logged.
pub const COURSE_ENDING_MESSAGE: &str =
    "The course is ending because of an error. Please contact your instructor.";

/// Errors that can occur while running a course session.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SessionError {
    /// The course definition cannot be executed.
    InvalidCourse {
        /// Why the course was rejected.
        reason: String,
    },

    /// A collaborating service explicitly rejected a request.
    Nack {
        /// The request that was rejected.
        request: String,
        /// Machine-readable rejection code.
        code: String,
        /// Rejection reason supplied by the service.
        reason: String,
    },

    /// A reply never arrived or arrived malformed.
    CommunicationFailure {
        /// The request whose reply failed.
        request: String,
        /// What went wrong.
        reason: String,
    },

    /// A stage of the initialization sequence failed.
    StageFailed {
        /// The stage that failed.
        stage: String,
        /// The underlying failure.
        reason: String,
    },

    /// The session is no longer running.
    SessionInactive {
        /// The session that was inactive.
        session_id: i64,
    },

    /// No branch path could be selected.
    BranchSelectionFailed {
        /// The authored branch being evaluated.
        branch_id: i64,
        /// Why no path was chosen.
        reason: String,
    },

    /// A knowledge session registry operation was rejected.
    KnowledgeSession {
        /// The session making the request.
        session_id: i64,
        /// The registry's reason.
        reason: String,
    },

    /// A reply payload could not be interpreted.
    InvalidPayload {
        /// The request whose payload was bad.
        request: String,
        /// Decode error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl SessionError {
    /// Build the error for a failed request to a collaborating service.
    pub fn from_failure(request: impl Into<String>, failure: RequestFailure) -> Self {
        let request = request.into();
        match failure {
            RequestFailure::Nack { code, reason } => Self::Nack {
                request,
                code,
                reason,
            },
            RequestFailure::Communication(reason) => Self::CommunicationFailure { request, reason },
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidCourse { .. } => "INVALID_COURSE",
            Self::Nack { .. } => "NACK",
            Self::CommunicationFailure { .. } => "COMMUNICATION_FAILURE",
            Self::StageFailed { .. } => "STAGE_FAILED",
            Self::SessionInactive { .. } => "SESSION_INACTIVE",
            Self::BranchSelectionFailed { .. } => "BRANCH_SELECTION_FAILED",
            Self::KnowledgeSession { .. } => "KNOWLEDGE_SESSION",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// The message a learner sees when this error ends their session.
    ///
    /// Always generic; use `Display` for the log line.
    pub fn learner_message(&self) -> &'static str {
        COURSE_ENDING_MESSAGE
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCourse { reason } => write!(f, "Invalid course: {}", reason),
            Self::Nack {
                request,
                code,
                reason,
            } => {
                write!(f, "Request '{}' was rejected ({}): {}", request, code, reason)
            }
            Self::CommunicationFailure { request, reason } => {
                write!(f, "Communication failure for '{}': {}", request, reason)
            }
            Self::StageFailed { stage, reason } => {
                write!(f, "Session stage '{}' failed: {}", stage, reason)
            }
            Self::SessionInactive { session_id } => {
                write!(f, "Session {} is no longer running", session_id)
            }
            Self::BranchSelectionFailed { branch_id, reason } => {
                write!(
                    f,
                    "Unable to select a path for branch {}: {}",
                    branch_id, reason
                )
            }
            Self::KnowledgeSession { session_id, reason } => {
                write!(
                    f,
                    "Knowledge session error for session {}: {}",
                    session_id, reason
                )
            }
            Self::InvalidPayload { request, details } => {
                write!(f, "Invalid reply payload for '{}': {}", request, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for SessionError {}

impl From<sqlx::Error> for SessionError {
    fn from(err: sqlx::Error) -> Self {
        SessionError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for SessionError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        SessionError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}
