// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lessonflow Core - Course Session Orchestrator
//!
//! This crate runs one learner's session through a multi-step course. It
//! sequences course content, coordinates the collaborating services that
//! present it, assess it and record it, and takes the session from
//! initialization to a graceful termination.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            DomainSession                                │
//! │      course queue · branch selection · adaptive courseflow · review     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!         │                      │                          │
//!         │ requests             │ state changes            │ terminate
//!         ▼                      ▼                          ▼
//! ┌──────────────────┐  ┌──────────────────────┐  ┌──────────────────────┐
//! │ ModuleCoordinator│  │ State machines       │  │ TerminationController│
//! │ callbacks,       │  │ lifecycle, training  │  │ nine best-effort     │
//! │ timeouts, stages │  │ app, lesson          │  │ phases               │
//! └──────────────────┘  └──────────────────────┘  └──────────────────────┘
//!         │
//!         ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              ServiceBus                                 │
//! │        Tutor · Gateway · Learner · Pedagogy · Lms · Sensor              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Branch selection history lives in SQLite or PostgreSQL (`sqlx`); team
//! sessions meet in the process-wide [`knowledge::KnowledgeSessionRegistry`].
//!
//! # Session Lifecycle
//!
//! ```text
//!     ┌─────────┐  terminate   ┌─────────┐  cleanup   ┌────────┐
//!     │ RUNNING │─────────────►│ CLOSING │───────────►│ CLOSED │
//!     └─────────┘              └─────────┘            └────────┘
//! ```
//!
//! | State | Description |
//! |-------|-------------|
//! | `RUNNING` | Course objects are presented; requests are sent |
//! | `CLOSING` | Termination in progress; new requests are dropped, in-flight replies discarded |
//! | `CLOSED` | Resources released; every later call is a no-op |
//!
//! Termination is idempotent: only the first caller runs the phases.
//!
//! # Course Objects
//!
//! | Object | Behaviour |
//! |--------|-----------|
//! | Guidance, lesson material | displayed by the tutor |
//! | Survey | displayed; results kept for reviews and branch conditions |
//! | After-action review | displays and drains the pending review events |
//! | Training application | load, start, stream assessments, publish the score |
//! | Authored branch | selects one path (random, balanced, custom percent, learner centric) |
//! | Adaptive courseflow | splices in the pedagogical decision and revisits itself until complete |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `LESSONFLOW_DATABASE_URL` | Yes | - | `sqlite:` path or PostgreSQL URL for branch history |
//! | `LESSONFLOW_REQUEST_TIMEOUT_MS` | No | `30000` | Reply timeout for a request |
//! | `LESSONFLOW_PHASE_TIMEOUT_MS` | No | `5000` | Bound of each termination phase |
//! | `LESSONFLOW_COURSE_FILE` | No | - | Course JSON for the dry-run binary |
//!
//! # Modules
//!
//! - [`callback`]: three-outcome request callbacks
//! - [`config`]: configuration from environment variables
//! - [`coordinator`]: request rules, initialization stages, deferred values
//! - [`course`]: course objects, queue, branches, reviews, progress
//! - [`error`]: error types with error code mapping
//! - [`knowledge`]: shared real-time assessment sessions
//! - [`persistence`]: branch path history stores
//! - [`services`]: the collaborating-service boundary
//! - [`session`]: the domain session
//! - [`state`]: lifecycle, training application and lesson state machines
//! - [`termination`]: graceful termination

#![deny(missing_docs)]

/// Three-outcome callbacks bound to one outstanding request.
pub mod callback;

/// Configuration loaded from environment variables.
pub mod config;

/// Module coordinator: request admission, timeouts and initialization stages.
pub mod coordinator;

/// Course flow: objects, queue, branch selection, conditions, reviews.
pub mod course;

/// Error types for session operations with error code mapping.
pub mod error;

/// Knowledge (real-time assessment) session registry.
pub mod knowledge;

/// Embedded database migrations.
pub mod migrations;

/// Branch path history persistence (SQLite and PostgreSQL).
pub mod persistence;

/// Collaborating services and the bus that reaches them.
pub mod services;

/// The domain session orchestrator.
pub mod session;

/// Session, training application and lesson state machines.
pub mod state;

/// Multi-phase graceful termination.
pub mod termination;

pub use error::{Result, SessionError};
pub use session::{DomainSession, DomainSessionBuilder};
pub use termination::{TerminationReason, TerminationReport, TerminationStatus};
