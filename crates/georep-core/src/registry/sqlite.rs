//! SQLite-backed registry store implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::SyncError;

use super::{RegistryRecord, RegistryStore, SyncState, VerificationState, next_retry_at};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const SELECT_COLUMNS: &str = "id, replicable_name, model_record_id, state, verification_state, \
     retry_count, last_sync_failure, last_synced_at, last_sync_attempt_at, retry_at, created_at";

/// SQLite-backed registry store.
#[derive(Clone)]
pub struct SqliteRegistryStore {
    pool: SqlitePool,
}

impl SqliteRegistryStore {
    /// Create a new registry store from an existing pool.
    ///
    /// The caller is responsible for running migrations
    /// (see [`crate::migrations::run_sqlite`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a registry store from a file path.
    ///
    /// Creates parent directories and the database file if needed,
    /// connects with sensible defaults, and runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Other(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| SyncError::Other(format!("Failed to run migrations: {}", e)))?;

        Ok(Self { pool })
    }

    /// Append a `model_record_id NOT IN (...)` clause with one placeholder
    /// per excluded id.
    fn push_except_clause(sql: &mut String, except_ids: &[i64]) {
        if !except_ids.is_empty() {
            sql.push_str(" AND model_record_id NOT IN (");
            sql.push_str(&vec!["?"; except_ids.len()].join(","));
            sql.push(')');
        }
    }
}

#[async_trait::async_trait]
impl RegistryStore for SqliteRegistryStore {
    async fn upsert_registry(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO registries (replicable_name, model_record_id, state, verification_state, created_at)
            VALUES (?, ?, 'pending', 'pending', CURRENT_TIMESTAMP)
            ON CONFLICT (replicable_name, model_record_id) DO NOTHING
            "#,
        )
        .bind(replicable_name)
        .bind(model_record_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_registry(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<Option<RegistryRecord>, SyncError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM registries WHERE replicable_name = ? AND model_record_id = ?"
        );
        let record = sqlx::query_as::<_, RegistryRecord>(&sql)
            .bind(replicable_name)
            .bind(model_record_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn find_never_attempted_sync(
        &self,
        replicable_name: &str,
        batch_size: usize,
        except_ids: &[i64],
    ) -> Result<Vec<RegistryRecord>, SyncError> {
        let mut sql = format!(
            "SELECT {SELECT_COLUMNS} FROM registries \
             WHERE replicable_name = ? AND state = 'pending' AND last_sync_attempt_at IS NULL"
        );
        Self::push_except_clause(&mut sql, except_ids);
        sql.push_str(" ORDER BY created_at ASC, id ASC LIMIT ?");

        let mut query = sqlx::query_as::<_, RegistryRecord>(&sql).bind(replicable_name);
        for id in except_ids {
            query = query.bind(id);
        }
        query = query.bind(batch_size as i64);

        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn find_needs_sync_again(
        &self,
        replicable_name: &str,
        batch_size: usize,
        except_ids: &[i64],
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<RegistryRecord>, SyncError> {
        let mut sql = format!(
            "SELECT {SELECT_COLUMNS} FROM registries \
             WHERE replicable_name = ? \
               AND ( (state = 'failed' AND (retry_at IS NULL OR retry_at <= ?)) \
                  OR (state = 'synced' AND verification_state = 'failed') \
                  OR (state = 'started' AND last_sync_attempt_at IS NOT NULL AND last_sync_attempt_at < ?) )"
        );
        Self::push_except_clause(&mut sql, except_ids);
        sql.push_str(" ORDER BY retry_at ASC, last_sync_attempt_at ASC, id ASC LIMIT ?");

        let mut query = sqlx::query_as::<_, RegistryRecord>(&sql)
            .bind(replicable_name)
            .bind(Utc::now())
            .bind(stale_before);
        for id in except_ids {
            query = query.bind(id);
        }
        query = query.bind(batch_size as i64);

        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn mark_sync_started(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE registries
            SET state = 'started', last_sync_attempt_at = ?
            WHERE replicable_name = ? AND model_record_id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(replicable_name)
        .bind(model_record_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::RegistryNotFound {
                replicable_name: replicable_name.to_string(),
                model_record_id,
            });
        }

        Ok(())
    }

    async fn mark_synced(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE registries
            SET state = 'synced',
                verification_state = 'pending',
                retry_count = 0,
                last_sync_failure = NULL,
                retry_at = NULL,
                last_synced_at = ?
            WHERE replicable_name = ? AND model_record_id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(replicable_name)
        .bind(model_record_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::RegistryNotFound {
                replicable_name: replicable_name.to_string(),
                model_record_id,
            });
        }

        Ok(())
    }

    async fn mark_sync_failed(
        &self,
        replicable_name: &str,
        model_record_id: i64,
        error: &str,
    ) -> Result<(), SyncError> {
        // Single-writer-per-row discipline makes read-modify-write safe here.
        let record = self
            .get_registry(replicable_name, model_record_id)
            .await?
            .ok_or_else(|| SyncError::RegistryNotFound {
                replicable_name: replicable_name.to_string(),
                model_record_id,
            })?;

        let retry_count = record.retry_count + 1;
        let retry_at = next_retry_at(retry_count, Utc::now());

        sqlx::query(
            r#"
            UPDATE registries
            SET state = 'failed',
                retry_count = ?,
                last_sync_failure = ?,
                retry_at = ?
            WHERE replicable_name = ? AND model_record_id = ?
            "#,
        )
        .bind(retry_count)
        .bind(error)
        .bind(retry_at)
        .bind(replicable_name)
        .bind(model_record_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_verification_started(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError> {
        self.set_verification(replicable_name, model_record_id, "started", None)
            .await
    }

    async fn mark_verification_succeeded(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError> {
        self.set_verification(replicable_name, model_record_id, "succeeded", None)
            .await
    }

    async fn mark_verification_failed(
        &self,
        replicable_name: &str,
        model_record_id: i64,
        reason: &str,
    ) -> Result<(), SyncError> {
        self.set_verification(replicable_name, model_record_id, "failed", Some(reason))
            .await
    }

    async fn count_registries(
        &self,
        replicable_name: Option<&str>,
        state: SyncState,
    ) -> Result<i64, SyncError> {
        let count: (i64,) = if let Some(name) = replicable_name {
            sqlx::query_as(
                "SELECT COUNT(*) FROM registries WHERE replicable_name = ? AND state = ?",
            )
            .bind(name)
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_as("SELECT COUNT(*) FROM registries WHERE state = ?")
                .bind(state.as_str())
                .fetch_one(&self.pool)
                .await?
        };

        Ok(count.0)
    }

    async fn delete_registry(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM registries WHERE replicable_name = ? AND model_record_id = ?")
            .bind(replicable_name)
            .bind(model_record_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

impl SqliteRegistryStore {
    async fn set_verification(
        &self,
        replicable_name: &str,
        model_record_id: i64,
        verification_state: &str,
        reason: Option<&str>,
    ) -> Result<(), SyncError> {
        debug_assert!(VerificationState::parse(verification_state).is_some());

        let result = sqlx::query(
            r#"
            UPDATE registries
            SET verification_state = ?,
                last_sync_failure = COALESCE(?, last_sync_failure)
            WHERE replicable_name = ? AND model_record_id = ?
            "#,
        )
        .bind(verification_state)
        .bind(reason)
        .bind(replicable_name)
        .bind(model_record_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::RegistryNotFound {
                replicable_name: replicable_name.to_string(),
                model_record_id,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn test_store() -> SqliteRegistryStore {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect in-memory sqlite");
        MIGRATOR.run(&pool).await.expect("run migrations");
        SqliteRegistryStore::new(pool)
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = test_store().await;

        store.upsert_registry("package_file", 1).await.unwrap();
        store.upsert_registry("package_file", 1).await.unwrap();

        let count = store
            .count_registries(Some("package_file"), SyncState::Pending)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_find_never_attempted_excludes_ids() {
        let store = test_store().await;

        for id in 1..=5 {
            store.upsert_registry("package_file", id).await.unwrap();
        }

        let rows = store
            .find_never_attempted_sync("package_file", 10, &[2, 4])
            .await
            .unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.model_record_id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn test_find_never_attempted_respects_batch_size() {
        let store = test_store().await;

        for id in 1..=7 {
            store.upsert_registry("job_artifact", id).await.unwrap();
        }

        let rows = store
            .find_never_attempted_sync("job_artifact", 3, &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_started_row_leaves_never_attempted_pool() {
        let store = test_store().await;

        store.upsert_registry("package_file", 1).await.unwrap();
        store.mark_sync_started("package_file", 1).await.unwrap();

        let rows = store
            .find_never_attempted_sync("package_file", 10, &[])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_mark_sync_failed_bookkeeping() {
        let store = test_store().await;

        store.upsert_registry("package_file", 7).await.unwrap();
        store.mark_sync_started("package_file", 7).await.unwrap();
        store
            .mark_sync_failed("package_file", 7, "connection reset")
            .await
            .unwrap();

        let record = store
            .get_registry("package_file", 7)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sync_state(), Some(SyncState::Failed));
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_sync_failure.as_deref(), Some("connection reset"));
        assert!(record.retry_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_row_waits_for_retry_at() {
        let store = test_store().await;

        store.upsert_registry("package_file", 7).await.unwrap();
        store.mark_sync_started("package_file", 7).await.unwrap();
        store
            .mark_sync_failed("package_file", 7, "timeout")
            .await
            .unwrap();

        // retry_at is ~20s in the future, so the row is not yet eligible
        let stale_before = Utc::now() - ChronoDuration::hours(1);
        let rows = store
            .find_needs_sync_again("package_file", 10, &[], stale_before)
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_stale_started_row_needs_sync_again() {
        let store = test_store().await;

        store.upsert_registry("package_file", 3).await.unwrap();
        store.mark_sync_started("package_file", 3).await.unwrap();

        // A cutoff in the future makes the fresh attempt look abandoned
        let stale_before = Utc::now() + ChronoDuration::seconds(5);
        let rows = store
            .find_needs_sync_again("package_file", 10, &[], stale_before)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model_record_id, 3);
    }

    #[tokio::test]
    async fn test_verification_failure_triggers_resync() {
        let store = test_store().await;

        store.upsert_registry("package_file", 9).await.unwrap();
        store.mark_sync_started("package_file", 9).await.unwrap();
        store.mark_synced("package_file", 9).await.unwrap();
        store
            .mark_verification_failed("package_file", 9, "checksum mismatch")
            .await
            .unwrap();

        let stale_before = Utc::now() - ChronoDuration::hours(1);
        let rows = store
            .find_needs_sync_again("package_file", 10, &[], stale_before)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model_record_id, 9);
    }

    #[tokio::test]
    async fn test_mark_synced_resets_retry_bookkeeping() {
        let store = test_store().await;

        store.upsert_registry("package_file", 5).await.unwrap();
        store.mark_sync_started("package_file", 5).await.unwrap();
        store
            .mark_sync_failed("package_file", 5, "disk full")
            .await
            .unwrap();
        store.mark_sync_started("package_file", 5).await.unwrap();
        store.mark_synced("package_file", 5).await.unwrap();

        let record = store
            .get_registry("package_file", 5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sync_state(), Some(SyncState::Synced));
        assert_eq!(record.retry_count, 0);
        assert!(record.last_sync_failure.is_none());
        assert!(record.retry_at.is_none());
        assert!(record.last_synced_at.is_some());
        assert_eq!(record.verification(), Some(VerificationState::Pending));
    }

    #[tokio::test]
    async fn test_mark_on_missing_row_is_registry_not_found() {
        let store = test_store().await;

        let err = store.mark_sync_started("package_file", 404).await;
        assert!(matches!(
            err,
            Err(SyncError::RegistryNotFound {
                model_record_id: 404,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_delete_registry() {
        let store = test_store().await;

        store.upsert_registry("package_file", 1).await.unwrap();
        store.delete_registry("package_file", 1).await.unwrap();

        let record = store.get_registry("package_file", 1).await.unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("registry.db");

        let store = SqliteRegistryStore::from_path(&path).await.unwrap();
        store.upsert_registry("package_file", 1).await.unwrap();

        assert!(path.exists());
    }
}
