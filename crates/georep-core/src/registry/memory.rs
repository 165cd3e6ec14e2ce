//! In-memory registry store.
//!
//! Backs tests and embedded setups that do not want a database. Mirrors
//! the SQLite backend's semantics exactly, including retry gating and
//! stale-attempt rediscovery.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::SyncError;

use super::{RegistryRecord, RegistryStore, SyncState, next_retry_at};

/// In-memory registry store.
#[derive(Default)]
pub struct MemoryRegistryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<(String, i64), RegistryRecord>,
    next_id: i64,
}

impl MemoryRegistryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_row<T>(
        &self,
        replicable_name: &str,
        model_record_id: i64,
        f: impl FnOnce(&mut RegistryRecord) -> T,
    ) -> Result<T, SyncError> {
        let mut inner = self.inner.lock().expect("registry store lock poisoned");
        let key = (replicable_name.to_string(), model_record_id);
        match inner.rows.get_mut(&key) {
            Some(row) => Ok(f(row)),
            None => Err(SyncError::RegistryNotFound {
                replicable_name: replicable_name.to_string(),
                model_record_id,
            }),
        }
    }

    fn collect_sorted(
        &self,
        replicable_name: &str,
        batch_size: usize,
        except_ids: &[i64],
        mut eligible: impl FnMut(&RegistryRecord) -> bool,
    ) -> Vec<RegistryRecord> {
        let inner = self.inner.lock().expect("registry store lock poisoned");
        let mut rows: Vec<RegistryRecord> = inner
            .rows
            .values()
            .filter(|r| r.replicable_name == replicable_name)
            .filter(|r| !except_ids.contains(&r.model_record_id))
            .filter(|r| eligible(r))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        rows.truncate(batch_size);
        rows
    }
}

#[async_trait::async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn upsert_registry(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().expect("registry store lock poisoned");
        let key = (replicable_name.to_string(), model_record_id);
        if !inner.rows.contains_key(&key) {
            inner.next_id += 1;
            let record = RegistryRecord {
                id: inner.next_id,
                replicable_name: replicable_name.to_string(),
                model_record_id,
                state: SyncState::Pending.as_str().to_string(),
                verification_state: "pending".to_string(),
                retry_count: 0,
                last_sync_failure: None,
                last_synced_at: None,
                last_sync_attempt_at: None,
                retry_at: None,
                created_at: Utc::now(),
            };
            inner.rows.insert(key, record);
        }
        Ok(())
    }

    async fn get_registry(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<Option<RegistryRecord>, SyncError> {
        let inner = self.inner.lock().expect("registry store lock poisoned");
        Ok(inner
            .rows
            .get(&(replicable_name.to_string(), model_record_id))
            .cloned())
    }

    async fn find_never_attempted_sync(
        &self,
        replicable_name: &str,
        batch_size: usize,
        except_ids: &[i64],
    ) -> Result<Vec<RegistryRecord>, SyncError> {
        Ok(self.collect_sorted(replicable_name, batch_size, except_ids, |r| {
            r.state == "pending" && r.last_sync_attempt_at.is_none()
        }))
    }

    async fn find_needs_sync_again(
        &self,
        replicable_name: &str,
        batch_size: usize,
        except_ids: &[i64],
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<RegistryRecord>, SyncError> {
        let now = Utc::now();
        Ok(
            self.collect_sorted(replicable_name, batch_size, except_ids, |r| {
                let retry_due = r.state == "failed" && r.retry_at.is_none_or(|at| at <= now);
                let verification_failed = r.state == "synced" && r.verification_state == "failed";
                let stale_started = r.state == "started"
                    && r.last_sync_attempt_at.is_some_and(|at| at < stale_before);
                retry_due || verification_failed || stale_started
            }),
        )
    }

    async fn mark_sync_started(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError> {
        self.with_row(replicable_name, model_record_id, |row| {
            row.state = "started".to_string();
            row.last_sync_attempt_at = Some(Utc::now());
        })
    }

    async fn mark_synced(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError> {
        self.with_row(replicable_name, model_record_id, |row| {
            row.state = "synced".to_string();
            row.verification_state = "pending".to_string();
            row.retry_count = 0;
            row.last_sync_failure = None;
            row.retry_at = None;
            row.last_synced_at = Some(Utc::now());
        })
    }

    async fn mark_sync_failed(
        &self,
        replicable_name: &str,
        model_record_id: i64,
        error: &str,
    ) -> Result<(), SyncError> {
        self.with_row(replicable_name, model_record_id, |row| {
            row.state = "failed".to_string();
            row.retry_count += 1;
            row.last_sync_failure = Some(error.to_string());
            row.retry_at = Some(next_retry_at(row.retry_count, Utc::now()));
        })
    }

    async fn mark_verification_started(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError> {
        self.with_row(replicable_name, model_record_id, |row| {
            row.verification_state = "started".to_string();
        })
    }

    async fn mark_verification_succeeded(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError> {
        self.with_row(replicable_name, model_record_id, |row| {
            row.verification_state = "succeeded".to_string();
        })
    }

    async fn mark_verification_failed(
        &self,
        replicable_name: &str,
        model_record_id: i64,
        reason: &str,
    ) -> Result<(), SyncError> {
        self.with_row(replicable_name, model_record_id, |row| {
            row.verification_state = "failed".to_string();
            row.last_sync_failure = Some(reason.to_string());
        })
    }

    async fn count_registries(
        &self,
        replicable_name: Option<&str>,
        state: SyncState,
    ) -> Result<i64, SyncError> {
        let inner = self.inner.lock().expect("registry store lock poisoned");
        let count = inner
            .rows
            .values()
            .filter(|r| replicable_name.is_none_or(|name| r.replicable_name == name))
            .filter(|r| r.state == state.as_str())
            .count();
        Ok(count as i64)
    }

    async fn delete_registry(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().expect("registry store lock poisoned");
        inner
            .rows
            .remove(&(replicable_name.to_string(), model_record_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_matches_sqlite_semantics() {
        let store = MemoryRegistryStore::new();

        store.upsert_registry("package_file", 1).await.unwrap();
        store.upsert_registry("package_file", 1).await.unwrap();
        assert_eq!(
            store
                .count_registries(Some("package_file"), SyncState::Pending)
                .await
                .unwrap(),
            1
        );

        store.mark_sync_started("package_file", 1).await.unwrap();
        assert!(
            store
                .find_never_attempted_sync("package_file", 10, &[])
                .await
                .unwrap()
                .is_empty()
        );

        store
            .mark_sync_failed("package_file", 1, "oops")
            .await
            .unwrap();
        let record = store
            .get_registry("package_file", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.retry_count, 1);
        assert!(record.retry_at.is_some());
    }

    #[tokio::test]
    async fn test_memory_store_missing_row() {
        let store = MemoryRegistryStore::new();
        let err = store.mark_synced("package_file", 99).await;
        assert!(matches!(err, Err(SyncError::RegistryNotFound { .. })));
    }
}
