// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replicator contract and registration table.
//!
//! A replicator represents one replicable resource type (job artifacts,
//! package files, ...). The batch loader iterates every registered
//! replicator each tick and asks it for sync candidates. The contract is a
//! closed trait rather than duck typing: the two query methods plus the
//! type name are all the scheduler ever needs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::SyncError;
use crate::registry::{RegistryRecord, RegistryStore};

/// One replicable resource type.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Stable name of the resource type (e.g. "package_file").
    fn replicable_name(&self) -> &str;

    /// Registries in `pending` state with no prior sync attempt.
    async fn find_registries_never_attempted_sync(
        &self,
        batch_size: usize,
        except_ids: &[i64],
    ) -> Result<Vec<RegistryRecord>, SyncError>;

    /// Registries whose previous attempt failed, stalled, or whose synced
    /// copy failed verification.
    async fn find_registries_needs_sync_again(
        &self,
        batch_size: usize,
        except_ids: &[i64],
    ) -> Result<Vec<RegistryRecord>, SyncError>;
}

/// Store-backed replicator.
///
/// Every resource type shares the registry schema, so one implementation
/// parameterized by name covers them all. A resource type with bespoke
/// candidate queries can implement [`Replicator`] directly instead.
pub struct StoreReplicator {
    name: String,
    store: Arc<dyn RegistryStore>,
    stale_timeout: Duration,
}

impl StoreReplicator {
    /// Create a replicator for `name` backed by `store`.
    ///
    /// `stale_timeout` is the age after which a row stuck in `started` is
    /// treated as abandoned and offered for re-sync.
    pub fn new(name: impl Into<String>, store: Arc<dyn RegistryStore>, stale_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            store,
            stale_timeout,
        }
    }
}

#[async_trait]
impl Replicator for StoreReplicator {
    fn replicable_name(&self) -> &str {
        &self.name
    }

    async fn find_registries_never_attempted_sync(
        &self,
        batch_size: usize,
        except_ids: &[i64],
    ) -> Result<Vec<RegistryRecord>, SyncError> {
        self.store
            .find_never_attempted_sync(&self.name, batch_size, except_ids)
            .await
    }

    async fn find_registries_needs_sync_again(
        &self,
        batch_size: usize,
        except_ids: &[i64],
    ) -> Result<Vec<RegistryRecord>, SyncError> {
        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.stale_timeout)
                .map_err(|e| SyncError::Other(format!("Invalid stale timeout: {}", e)))?;
        self.store
            .find_needs_sync_again(&self.name, batch_size, except_ids, stale_before)
            .await
    }
}

/// The set of replicators registered on this site.
///
/// Registration order is stable and doubles as the round-robin order used
/// by the batch loader.
#[derive(Default)]
pub struct ReplicatorSet {
    replicators: Vec<Arc<dyn Replicator>>,
}

impl ReplicatorSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a replicator. Later registrations with the same name are
    /// ignored.
    pub fn register(&mut self, replicator: Arc<dyn Replicator>) {
        let name = replicator.replicable_name();
        if self.get(name).is_none() {
            self.replicators.push(replicator);
        }
    }

    /// Look up a replicator by name.
    pub fn get(&self, replicable_name: &str) -> Option<&Arc<dyn Replicator>> {
        self.replicators
            .iter()
            .find(|r| r.replicable_name() == replicable_name)
    }

    /// Iterate replicators in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Replicator>> {
        self.replicators.iter()
    }

    /// Number of registered replicators.
    pub fn len(&self) -> usize {
        self.replicators.len()
    }

    /// Whether no replicator is registered.
    pub fn is_empty(&self) -> bool {
        self.replicators.is_empty()
    }
}
