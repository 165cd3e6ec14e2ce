// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable replication runtime.
//!
//! Wires the registry store, batch loader, dispatcher, scheduler and sync
//! worker pool together so an application can run a replication node with
//! a few builder calls.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use georep_core::registry::SqliteRegistryStore;
//! use georep_core::runtime::Runtime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteRegistryStore::from_path(".data/registry.db").await?);
//!
//!     let runtime = Runtime::builder()
//!         .store(store)
//!         .transfer(Arc::new(MyHttpTransfer::new()))
//!         .replicable_names(["package_file", "job_artifact"])
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::batch::BatchLoader;
use crate::config::Config;
use crate::dispatcher::{ChannelQueue, JobDispatcher};
use crate::executor::{SyncWorkerPool, Transfer};
use crate::guard::{SecondaryGuard, SiteTopology, StaticTopology};
use crate::registry::RegistryStore;
use crate::replicator::{Replicator, ReplicatorSet, StoreReplicator};
use crate::scheduler::{RegistrySyncStrategy, SchedulerConfig, SchedulerStrategy, SyncScheduler};

/// Builder for creating a [`Runtime`].
pub struct RuntimeBuilder {
    store: Option<Arc<dyn RegistryStore>>,
    transfer: Option<Arc<dyn Transfer>>,
    replicable_names: Vec<String>,
    replicators: Vec<Arc<dyn Replicator>>,
    topology: Arc<dyn SiteTopology>,
    strategy: Option<Arc<dyn SchedulerStrategy>>,
    max_capacity: usize,
    stale_timeout: Duration,
    scheduler: SchedulerConfig,
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("transfer", &self.transfer.as_ref().map(|_| "..."))
            .field("replicable_names", &self.replicable_names)
            .field("max_capacity", &self.max_capacity)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            transfer: None,
            replicable_names: Vec::new(),
            replicators: Vec::new(),
            topology: Arc::new(StaticTopology::secondary()),
            strategy: None,
            max_capacity: 10,
            stale_timeout: Duration::from_secs(3600),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl RuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registry store (required).
    pub fn store(mut self, store: Arc<dyn RegistryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the transfer mechanism (required).
    pub fn transfer(mut self, transfer: Arc<dyn Transfer>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    /// Register replicable resource types backed by the registry store.
    pub fn replicable_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replicable_names
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// Register a replicator with bespoke candidate queries.
    pub fn replicator(mut self, replicator: Arc<dyn Replicator>) -> Self {
        self.replicators.push(replicator);
        self
    }

    /// Set the site topology.
    ///
    /// Default: a static secondary site.
    pub fn topology(mut self, topology: Arc<dyn SiteTopology>) -> Self {
        self.topology = topology;
        self
    }

    /// Set a custom scheduling strategy.
    ///
    /// Default: [`RegistrySyncStrategy`] with `max_capacity`.
    pub fn strategy(mut self, strategy: Arc<dyn SchedulerStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Set the maximum concurrent sync transfers.
    ///
    /// Default: 10
    pub fn max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// Set the abandoned-sync cutoff for stuck `started` rows.
    ///
    /// Default: 1 hour
    pub fn stale_timeout(mut self, stale_timeout: Duration) -> Self {
        self.stale_timeout = stale_timeout;
        self
    }

    /// Set the scheduler loop configuration.
    pub fn scheduler_config(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Apply environment-derived configuration.
    ///
    /// Covers site role, intervals, batch size, capacity, stale timeout
    /// and replicable names. The store and transfer still have to be set
    /// explicitly.
    pub fn config(mut self, config: &Config) -> Self {
        self.topology = Arc::new(StaticTopology::new(config.site_role));
        self.max_capacity = config.max_capacity;
        self.stale_timeout = config.stale_timeout;
        self.scheduler = SchedulerConfig {
            poll_interval: config.poll_interval,
            backoff_interval: config.backoff_interval,
            db_retrieve_batch_size: config.db_retrieve_batch_size,
        };
        self.replicable_names
            .extend(config.replicable_names.iter().cloned());
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<RuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let transfer = self
            .transfer
            .ok_or_else(|| anyhow::anyhow!("transfer is required"))?;

        let mut replicators = ReplicatorSet::new();
        for name in &self.replicable_names {
            replicators.register(Arc::new(StoreReplicator::new(
                name.clone(),
                store.clone(),
                self.stale_timeout,
            )));
        }
        for replicator in self.replicators {
            replicators.register(replicator);
        }
        if replicators.is_empty() {
            anyhow::bail!("replicator set is empty");
        }

        let strategy = self
            .strategy
            .unwrap_or_else(|| Arc::new(RegistrySyncStrategy::new(self.max_capacity)));

        Ok(RuntimeConfig {
            store,
            transfer,
            replicators: Arc::new(replicators),
            topology: self.topology,
            strategy,
            max_capacity: self.max_capacity,
            scheduler: self.scheduler,
        })
    }
}

/// Configuration for a [`Runtime`].
pub struct RuntimeConfig {
    store: Arc<dyn RegistryStore>,
    transfer: Arc<dyn Transfer>,
    replicators: Arc<ReplicatorSet>,
    topology: Arc<dyn SiteTopology>,
    strategy: Arc<dyn SchedulerStrategy>,
    max_capacity: usize,
    scheduler: SchedulerConfig,
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("max_capacity", &self.max_capacity)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl RuntimeConfig {
    /// Start the runtime, spawning the scheduler and worker pool tasks.
    pub async fn start(self) -> Result<Runtime> {
        // Headroom so a full tick fits on the queue while workers drain it
        let queue_capacity = self.max_capacity.max(1) * 2;
        let (tx, rx) = mpsc::channel(queue_capacity);

        let pool = SyncWorkerPool::new(rx, self.store.clone(), self.transfer, self.max_capacity);
        let pool_shutdown = pool.shutdown_handle();
        let pool_handle = tokio::spawn(pool.run());

        let scheduler = SyncScheduler::new(
            BatchLoader::new(self.replicators),
            JobDispatcher::new(Arc::new(ChannelQueue::new(tx))),
            self.strategy,
            SecondaryGuard::new(self.topology),
            self.scheduler,
        );
        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn(scheduler.run());

        info!("Replication runtime started");

        Ok(Runtime {
            store: self.store,
            scheduler_handle,
            pool_handle,
            scheduler_shutdown,
            pool_shutdown,
        })
    }
}

/// A running replication node that can be embedded in an application.
///
/// The runtime manages:
/// - the scheduler loop producing sync jobs
/// - the worker pool executing them
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct Runtime {
    store: Arc<dyn RegistryStore>,
    scheduler_handle: JoinHandle<()>,
    pool_handle: JoinHandle<()>,
    scheduler_shutdown: Arc<Notify>,
    pool_shutdown: Arc<Notify>,
}

impl Runtime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Get a reference to the registry store.
    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the scheduler first so no new jobs are produced, then the
    /// worker pool, and waits for both tasks to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("Replication runtime shutting down...");

        self.scheduler_shutdown.notify_one();
        if let Err(e) = self.scheduler_handle.await {
            error!("Scheduler task panicked: {}", e);
            return Err(anyhow::anyhow!("scheduler task panicked: {}", e));
        }

        self.pool_shutdown.notify_one();
        if let Err(e) = self.pool_handle.await {
            error!("Worker pool task panicked: {}", e);
            return Err(anyhow::anyhow!("worker pool task panicked: {}", e));
        }

        info!("Replication runtime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.scheduler_handle.is_finished() && !self.pool_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteRole;
    use crate::dispatcher::ScheduledJob;
    use crate::error::SyncError;
    use crate::registry::MemoryRegistryStore;
    use async_trait::async_trait;

    struct NoopTransfer;

    #[async_trait]
    impl Transfer for NoopTransfer {
        async fn transfer(&self, _job: &ScheduledJob) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn memory_store() -> Arc<dyn RegistryStore> {
        Arc::new(MemoryRegistryStore::new())
    }

    #[test]
    fn test_builder_requires_store() {
        let result = Runtime::builder()
            .transfer(Arc::new(NoopTransfer))
            .replicable_names(["package_file"])
            .build();

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("store"));
    }

    #[test]
    fn test_builder_requires_transfer() {
        let result = Runtime::builder()
            .store(memory_store())
            .replicable_names(["package_file"])
            .build();

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("transfer"));
    }

    #[test]
    fn test_builder_requires_replicators() {
        let result = Runtime::builder()
            .store(memory_store())
            .transfer(Arc::new(NoopTransfer))
            .build();

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("replicator"));
    }

    #[test]
    fn test_builder_with_all_required_fields() {
        let result = Runtime::builder()
            .store(memory_store())
            .transfer(Arc::new(NoopTransfer))
            .replicable_names(["package_file", "job_artifact"])
            .max_capacity(4)
            .build();

        assert!(result.is_ok());
    }

    #[test]
    fn test_builder_applies_env_config() {
        let config = Config {
            database_url: "sqlite::memory:".to_string(),
            site_role: SiteRole::Secondary,
            poll_interval: Duration::from_secs(1),
            backoff_interval: Duration::from_secs(30),
            db_retrieve_batch_size: 50,
            max_capacity: 8,
            stale_timeout: Duration::from_secs(600),
            replicable_names: vec!["package_file".to_string()],
        };

        let builder = Runtime::builder()
            .store(memory_store())
            .transfer(Arc::new(NoopTransfer))
            .config(&config);
        assert_eq!(builder.max_capacity, 8);
        assert_eq!(builder.scheduler.db_retrieve_batch_size, 50);
        assert_eq!(builder.scheduler.poll_interval, Duration::from_secs(1));

        assert!(builder.build().is_ok());
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let runtime = Runtime::builder()
            .store(memory_store())
            .transfer(Arc::new(NoopTransfer))
            .replicable_names(["package_file"])
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        runtime.shutdown().await.unwrap();
    }
}
