// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed branch history.

use sqlx::PgPool;
use tracing::debug;

use crate::error::SessionError;

use super::{BranchHistoryStore, BranchPathHistoryRecord, BranchPathKey, BranchPathUpdate};

/// PostgreSQL-backed branch history store.
#[derive(Clone)]
pub struct PostgresBranchHistory {
    pool: PgPool,
}

impl PostgresBranchHistory {
    /// Create a store from a pool. Run [`crate::migrations::run_postgres`] first.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Queries
// ============================================================================

const SELECT_PATH: &str = r#"
    SELECT course_id, experiment_id, branch_id, path_id, path_name,
           learner_count, actual_count, updated_at
    FROM branch_path_history
    WHERE course_id = $1 AND experiment_id = $2 AND branch_id = $3 AND path_id = $4
"#;

const ENSURE_PATH: &str = r#"
    INSERT INTO branch_path_history
        (course_id, experiment_id, branch_id, path_id, path_name,
         learner_count, actual_count, updated_at)
    VALUES ($1, $2, $3, $4, $5, 0, 0, NOW())
    ON CONFLICT (course_id, experiment_id, branch_id, path_id) DO NOTHING
"#;

#[async_trait::async_trait]
impl BranchHistoryStore for PostgresBranchHistory {
    async fn path_counts(
        &self,
        keys: &[BranchPathKey],
        path_names: &[String],
    ) -> Result<Vec<BranchPathHistoryRecord>, SessionError> {
        let mut tx = self.pool.begin().await?;
        let mut records = Vec::with_capacity(keys.len());

        for (i, key) in keys.iter().enumerate() {
            sqlx::query(ENSURE_PATH)
                .bind(&key.course_id)
                .bind(key.stored_experiment_id())
                .bind(key.branch_id)
                .bind(key.path_id)
                .bind(path_names.get(i).cloned())
                .execute(&mut *tx)
                .await?;

            let record = sqlx::query_as::<_, BranchPathHistoryRecord>(SELECT_PATH)
                .bind(&key.course_id)
                .bind(key.stored_experiment_id())
                .bind(key.branch_id)
                .bind(key.path_id)
                .fetch_one(&mut *tx)
                .await?;
            records.push(record);
        }

        tx.commit().await?;
        Ok(records)
    }

    async fn record(&self, update: &BranchPathUpdate) -> Result<(), SessionError> {
        if update.path_ending {
            debug!(
                branch_id = update.key.branch_id,
                path_id = update.key.path_id,
                "Ignoring path-ending history update"
            );
            return Ok(());
        }

        let key = &update.key;
        if update.increment {
            sqlx::query(
                r#"
                INSERT INTO branch_path_history
                    (course_id, experiment_id, branch_id, path_id, path_name,
                     learner_count, actual_count, updated_at)
                VALUES ($1, $2, $3, $4, $5, 1, 1, NOW())
                ON CONFLICT (course_id, experiment_id, branch_id, path_id) DO UPDATE SET
                    learner_count = branch_path_history.learner_count + 1,
                    actual_count = branch_path_history.actual_count + 1,
                    path_name = EXCLUDED.path_name,
                    updated_at = NOW()
                "#,
            )
            .bind(&key.course_id)
            .bind(key.stored_experiment_id())
            .bind(key.branch_id)
            .bind(key.path_id)
            .bind(&update.path_name)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(ENSURE_PATH)
                .bind(&key.course_id)
                .bind(key.stored_experiment_id())
                .bind(key.branch_id)
                .bind(key.path_id)
                .bind(Some(update.path_name.clone()))
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    async fn get(
        &self,
        key: &BranchPathKey,
    ) -> Result<Option<BranchPathHistoryRecord>, SessionError> {
        let record = sqlx::query_as::<_, BranchPathHistoryRecord>(SELECT_PATH)
            .bind(&key.course_id)
            .bind(key.stored_experiment_id())
            .bind(key.branch_id)
            .bind(key.path_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }
}
