// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for the replication pipeline.
//!
//! These tests run the full path from registry rows through the runtime's
//! scheduler and worker pool against an in-memory SQLite database, with a
//! scripted transfer standing in for the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;

use georep_core::config::SiteRole;
use georep_core::dispatcher::ScheduledJob;
use georep_core::error::SyncError;
use georep_core::executor::Transfer;
use georep_core::guard::StaticTopology;
use georep_core::registry::{RegistryStore, SqliteRegistryStore, SyncState};
use georep_core::runtime::Runtime;
use georep_core::scheduler::SchedulerConfig;

/// Transfer that succeeds or fails per resource type.
struct ScriptedTransfer {
    failing_types: Vec<String>,
    calls: AtomicU32,
}

impl ScriptedTransfer {
    fn succeeding() -> Self {
        Self {
            failing_types: Vec::new(),
            calls: AtomicU32::new(0),
        }
    }

    fn failing_for(types: &[&str]) -> Self {
        Self {
            failing_types: types.iter().map(|s| s.to_string()).collect(),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Transfer for ScriptedTransfer {
    async fn transfer(&self, job: &ScheduledJob) -> Result<(), SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_types.contains(&job.replicable_name) {
            Err(SyncError::Transfer("primary returned 404".to_string()))
        } else {
            Ok(())
        }
    }
}

async fn sqlite_store() -> Arc<SqliteRegistryStore> {
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite should connect");
    georep_core::migrations::run_sqlite(&pool)
        .await
        .expect("migrations should run");
    Arc::new(SqliteRegistryStore::new(pool))
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within 5s");
}

fn fast_scheduler() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(20),
        backoff_interval: Duration::from_millis(100),
        db_retrieve_batch_size: 10,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pending_registries_sync_end_to_end() {
    let store = sqlite_store().await;
    for id in 1..=7 {
        store.upsert_registry("package_file", id).await.unwrap();
        store.upsert_registry("job_artifact", id).await.unwrap();
    }

    let transfer = Arc::new(ScriptedTransfer::succeeding());
    let runtime = Runtime::builder()
        .store(store.clone() as Arc<dyn RegistryStore>)
        .transfer(transfer.clone())
        .replicable_names(["package_file", "job_artifact"])
        .max_capacity(10)
        .scheduler_config(fast_scheduler())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    wait_until(|| async {
        let synced = store.count_registries(None, SyncState::Synced).await.unwrap();
        synced == 14
    })
    .await;

    runtime.shutdown().await.unwrap();

    for name in ["package_file", "job_artifact"] {
        for id in 1..=7 {
            let record = store.get_registry(name, id).await.unwrap().unwrap();
            assert_eq!(record.state, "synced");
            assert_eq!(record.verification_state, "succeeded");
            assert!(record.last_synced_at.is_some());
        }
    }
}

/// The first tick takes a balanced batch: 5 of each type, not 7 + 3.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_first_batch_is_type_balanced() {
    let store = sqlite_store().await;
    for id in 1..=7 {
        store.upsert_registry("package_file", id).await.unwrap();
        store.upsert_registry("job_artifact", id).await.unwrap();
    }

    // Transfers block forever, so the pool's 10 permits pin the first
    // tick's jobs in `started` where we can count them per type.
    struct StalledTransfer {
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl Transfer for StalledTransfer {
        async fn transfer(&self, _job: &ScheduledJob) -> Result<(), SyncError> {
            self.gate.notified().await;
            Ok(())
        }
    }

    let transfer = Arc::new(StalledTransfer {
        gate: tokio::sync::Notify::new(),
    });
    let runtime = Runtime::builder()
        .store(store.clone() as Arc<dyn RegistryStore>)
        .transfer(transfer.clone())
        .replicable_names(["package_file", "job_artifact"])
        .max_capacity(10)
        .scheduler_config(fast_scheduler())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    wait_until(|| async {
        store
            .count_registries(None, SyncState::Started)
            .await
            .unwrap()
            == 10
    })
    .await;

    let mut per_type: HashMap<&str, i64> = HashMap::new();
    for name in ["package_file", "job_artifact"] {
        per_type.insert(
            name,
            store
                .count_registries(Some(name), SyncState::Started)
                .await
                .unwrap(),
        );
    }
    assert_eq!(per_type["package_file"], 5);
    assert_eq!(per_type["job_artifact"], 5);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_transfer_records_error_and_backoff() {
    let store = sqlite_store().await;
    store.upsert_registry("package_file", 1).await.unwrap();

    let transfer = Arc::new(ScriptedTransfer::failing_for(&["package_file"]));
    let runtime = Runtime::builder()
        .store(store.clone() as Arc<dyn RegistryStore>)
        .transfer(transfer.clone())
        .replicable_names(["package_file"])
        .max_capacity(10)
        .scheduler_config(fast_scheduler())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    wait_until(|| async {
        let failed = store
            .count_registries(Some("package_file"), SyncState::Failed)
            .await
            .unwrap();
        failed == 1
    })
    .await;
    runtime.shutdown().await.unwrap();

    let record = store.get_registry("package_file", 1).await.unwrap().unwrap();
    assert_eq!(record.state, "failed");
    assert!(record.retry_count >= 1);
    assert!(
        record
            .last_sync_failure
            .as_deref()
            .unwrap()
            .contains("primary returned 404")
    );
    // Backoff gate is in the future, so the row is not immediately eligible
    let eligible = store
        .find_needs_sync_again("package_file", 10, &[], chrono::Utc::now())
        .await
        .unwrap();
    assert!(eligible.is_empty());
}

/// A mix of pending and retry-eligible rows fills one tick: pending rows
/// get priority, retries take the remaining capacity.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retries_fill_capacity_left_by_pending() {
    let store = sqlite_store().await;
    for id in 1..=3 {
        store.upsert_registry("package_file", id).await.unwrap();
    }
    // Eight rows whose synced copy failed verification
    for id in 10..=17 {
        store.upsert_registry("job_artifact", id).await.unwrap();
        store.mark_sync_started("job_artifact", id).await.unwrap();
        store.mark_synced("job_artifact", id).await.unwrap();
        store
            .mark_verification_failed("job_artifact", id, "checksum mismatch")
            .await
            .unwrap();
    }

    let transfer = Arc::new(ScriptedTransfer::succeeding());
    let runtime = Runtime::builder()
        .store(store.clone() as Arc<dyn RegistryStore>)
        .transfer(transfer.clone())
        .replicable_names(["package_file", "job_artifact"])
        .max_capacity(10)
        .scheduler_config(fast_scheduler())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    wait_until(|| async {
        let synced = store.count_registries(None, SyncState::Synced).await.unwrap();
        if synced != 11 {
            return false;
        }
        // Re-synced rows must also have re-verified
        for id in 10..=17 {
            let record = store.get_registry("job_artifact", id).await.unwrap().unwrap();
            if record.verification_state != "succeeded" {
                return false;
            }
        }
        true
    })
    .await;
    runtime.shutdown().await.unwrap();

    for id in 1..=3 {
        let record = store.get_registry("package_file", id).await.unwrap().unwrap();
        assert_eq!(record.state, "synced");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_primary_site_schedules_nothing() {
    let store = sqlite_store().await;
    store.upsert_registry("package_file", 1).await.unwrap();

    let transfer = Arc::new(ScriptedTransfer::succeeding());
    let runtime = Runtime::builder()
        .store(store.clone() as Arc<dyn RegistryStore>)
        .transfer(transfer.clone())
        .replicable_names(["package_file"])
        .topology(Arc::new(StaticTopology::new(SiteRole::Primary)))
        .scheduler_config(fast_scheduler())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    // Give the scheduler several tick intervals to (not) act
    tokio::time::sleep(Duration::from_millis(300)).await;
    runtime.shutdown().await.unwrap();

    assert_eq!(transfer.calls.load(Ordering::SeqCst), 0);
    let record = store.get_registry("package_file", 1).await.unwrap().unwrap();
    assert_eq!(record.state, "pending");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_started_rows_are_rediscovered() {
    let store = sqlite_store().await;
    store.upsert_registry("package_file", 1).await.unwrap();
    // Simulate a job that died mid-sync
    store.mark_sync_started("package_file", 1).await.unwrap();

    let transfer = Arc::new(ScriptedTransfer::succeeding());
    let runtime = Runtime::builder()
        .store(store.clone() as Arc<dyn RegistryStore>)
        .transfer(transfer.clone())
        .replicable_names(["package_file"])
        .stale_timeout(Duration::from_millis(50))
        .scheduler_config(fast_scheduler())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    wait_until(|| async {
        let record = store.get_registry("package_file", 1).await.unwrap().unwrap();
        record.state == "synced"
    })
    .await;
    runtime.shutdown().await.unwrap();
}
