// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lessonflow Core - dry run
//!
//! Walks a course file against the loopback bus: every object is presented,
//! branch paths are selected and recorded in the history store, and the
//! session terminates as it would for a learner.
//!
//! ```text
//! lessonflow-core [COURSE_FILE]
//! ```
//!
//! The course file defaults to `LESSONFLOW_COURSE_FILE`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use lessonflow_core::config::Config;
use lessonflow_core::course::CourseDefinition;
use lessonflow_core::knowledge::KnowledgeSessionRegistry;
use lessonflow_core::persistence::{BranchHistoryStore, PostgresBranchHistory, SqliteBranchHistory};
use lessonflow_core::services::{LoopbackBus, SessionInfo};
use lessonflow_core::{DomainSession, TerminationReason, migrations};

async fn open_history(database_url: &str) -> Result<Arc<dyn BranchHistoryStore>> {
    if database_url.starts_with("sqlite:") {
        let store = SqliteBranchHistory::connect(database_url).await?;
        return Ok(Arc::new(store));
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    info!("Running database migrations...");
    migrations::run_postgres(&pool).await?;
    Ok(Arc::new(PostgresBranchHistory::new(pool)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lessonflow_core=info".parse()?),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    let course_file = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => path,
        None => match config.course_file.clone() {
            Some(path) => path,
            None => bail!("no course file given (argument or LESSONFLOW_COURSE_FILE)"),
        },
    };

    info!(
        course_file = %course_file.display(),
        request_timeout = ?config.request_timeout,
        phase_timeout = ?config.phase_timeout,
        "Configuration loaded"
    );

    let json = tokio::fs::read_to_string(&course_file)
        .await
        .with_context(|| format!("failed to read {}", course_file.display()))?;
    let course = CourseDefinition::from_json(&json)
        .with_context(|| format!("failed to parse {}", course_file.display()))?;

    let history = open_history(&config.database_url).await?;
    info!("Branch history store ready");

    let info = SessionInfo {
        session_id: 1,
        user_id: 0,
        username: "dry-run".to_string(),
        course_id: course.course_id.clone(),
        experiment_id: None,
        embedded: false,
    };
    let session = Arc::new(
        DomainSession::builder(info, course)
            .bus(Arc::new(LoopbackBus::new()))
            .history_store(history)
            .registry(Arc::new(KnowledgeSessionRegistry::new()))
            .settings(config.session_settings())
            .build()?,
    );

    let runner = {
        let session = session.clone();
        tokio::spawn(async move {
            session.start().await?;
            session.run().await
        })
    };

    tokio::select! {
        result = runner => match result {
            Ok(Ok(())) => info!("Course finished"),
            Ok(Err(e)) => warn!(error_code = e.error_code(), "Course ended with an error: {}", e),
            Err(e) => error!("Session task failed: {}", e),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            session.terminate(TerminationReason::LearnerExit).await;
        }
    }

    session.closed().await;

    let progress = session.progress();
    let visited = session.visited();
    println!(
        "Visited {} object(s), progress {}/{}:",
        visited.len(),
        progress.current,
        progress.max
    );
    for name in visited {
        println!("  {}", name);
    }

    info!("Shutdown complete");
    Ok(())
}
