// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed branch history.

use std::path::Path;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::migrations;

use super::{BranchHistoryStore, BranchPathHistoryRecord, BranchPathKey, BranchPathUpdate};

/// SQLite-backed branch history store.
#[derive(Clone)]
pub struct SqliteBranchHistory {
    pool: SqlitePool,
}

impl SqliteBranchHistory {
    /// Create a store from an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let history = SqliteBranchHistory::from_path(".data/lessonflow.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| SessionError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, SessionError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| SessionError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        migrations::run_sqlite(&pool).await?;
        info!("Branch history store ready (sqlite)");

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl BranchHistoryStore for SqliteBranchHistory {
    async fn path_counts(
        &self,
        keys: &[BranchPathKey],
        path_names: &[String],
    ) -> Result<Vec<BranchPathHistoryRecord>, SessionError> {
        let mut tx = self.pool.begin().await?;
        let mut records = Vec::with_capacity(keys.len());

        for (i, key) in keys.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO branch_path_history
                    (course_id, experiment_id, branch_id, path_id, path_name,
                     learner_count, actual_count, updated_at)
                VALUES (?, ?, ?, ?, ?, 0, 0, ?)
                ON CONFLICT (course_id, experiment_id, branch_id, path_id) DO NOTHING
                "#,
            )
            .bind(&key.course_id)
            .bind(key.stored_experiment_id())
            .bind(key.branch_id)
            .bind(key.path_id)
            .bind(path_names.get(i).cloned())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            let record = sqlx::query_as::<_, BranchPathHistoryRecord>(
                r#"
                SELECT course_id, experiment_id, branch_id, path_id, path_name,
                       learner_count, actual_count, updated_at
                FROM branch_path_history
                WHERE course_id = ? AND experiment_id = ? AND branch_id = ? AND path_id = ?
                "#,
            )
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
                VALUES (?, ?, ?, ?, ?, 1, 1, ?)
                ON CONFLICT (course_id, experiment_id, branch_id, path_id) DO UPDATE SET
                    learner_count = learner_count + 1,
                    actual_count = actual_count + 1,
                    path_name = excluded.path_name,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&key.course_id)
            .bind(key.stored_experiment_id())
            .bind(key.branch_id)
            .bind(key.path_id)
            .bind(&update.path_name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO branch_path_history
                    (course_id, experiment_id, branch_id, path_id, path_name,
                     learner_count, actual_count, updated_at)
                VALUES (?, ?, ?, ?, ?, 0, 0, ?)
                ON CONFLICT (course_id, experiment_id, branch_id, path_id) DO NOTHING
                "#,
            )
            .bind(&key.course_id)
            .bind(key.stored_experiment_id())
            .bind(key.branch_id)
            .bind(key.path_id)
            .bind(&update.path_name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn get(
        &self,
        key: &BranchPathKey,
    ) -> Result<Option<BranchPathHistoryRecord>, SessionError> {
        let record = sqlx::query_as::<_, BranchPathHistoryRecord>(
            r#"
            SELECT course_id, experiment_id, branch_id, path_id, path_name,
                   learner_count, actual_count, updated_at
            FROM branch_path_history
            WHERE course_id = ? AND experiment_id = ? AND branch_id = ? AND path_id = ?
            "#,
        )
        .bind(&key.course_id)
        .bind(key.stored_experiment_id())
        .bind(key.branch_id)
        .bind(key.path_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path_id: i64) -> BranchPathKey {
        BranchPathKey {
            course_id: "course-1".to_string(),
            experiment_id: None,
            branch_id: 7,
            path_id,
        }
    }

    async fn store() -> (tempfile::TempDir, SqliteBranchHistory) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteBranchHistory::from_path(dir.path().join("history.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_path_counts_creates_zeroed_rows_in_key_order() {
        let (_dir, store) = store().await;
        let keys = vec![key(3), key(1), key(2)];
        let names = vec!["c".to_string(), "a".to_string(), "b".to_string()];

        let records = store.path_counts(&keys, &names).await.unwrap();

        assert_eq!(
            records.iter().map(|r| r.path_id).collect::<Vec<_>>(),
            vec![3, 1, 2]
        );
        assert!(records.iter().all(|r| r.learner_count == 0));
        assert_eq!(records[0].experiment_id, "N/A");
        assert_eq!(records[0].path_name.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_record_increments_and_ignores_path_end() {
        let (_dir, store) = store().await;
        let update = BranchPathUpdate {
            key: key(1),
            path_name: "a".to_string(),
            increment: true,
            path_ending: false,
        };

        store.record(&update).await.unwrap();
        store.record(&update).await.unwrap();
        store
            .record(&BranchPathUpdate {
                path_ending: true,
                ..update.clone()
            })
            .await
            .unwrap();
        store
            .record(&BranchPathUpdate {
                increment: false,
                ..update.clone()
            })
            .await
            .unwrap();

        let record = store.get(&key(1)).await.unwrap().unwrap();
        assert_eq!(record.learner_count, 2);
        assert_eq!(record.actual_count, 2);
        assert!(store.get(&key(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_experiments_are_counted_separately() {
        let (_dir, store) = store().await;
        let in_experiment = BranchPathKey {
            experiment_id: Some("exp-1".to_string()),
            ..key(1)
        };

        store
            .record(&BranchPathUpdate {
                key: in_experiment.clone(),
                path_name: "a".to_string(),
                increment: true,
                path_ending: false,
            })
            .await
            .unwrap();

        let counts = store
            .path_counts(&[key(1), in_experiment], &[])
            .await
            .unwrap();
        assert_eq!(counts[0].learner_count, 0);
        assert_eq!(counts[1].learner_count, 1);
    }
}
