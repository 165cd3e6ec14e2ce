// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry sync scheduler loop.
//!
//! Periodically wakes, loads a capacity-bounded batch of sync candidates
//! and dispatches a job for each. Two-phase retrieval per tick: registries
//! never attempted first, then registries needing another attempt with
//! whatever capacity phase one left over.
//!
//! The loop never dies on a failed tick: errors are logged and the next
//! tick proceeds on schedule. When a tick schedules nothing and the
//! strategy agrees, the next sleep stretches to the backoff interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::batch::{BatchLoader, TickContext};
use crate::dispatcher::JobDispatcher;
use crate::error::SyncError;
use crate::guard::SecondaryGuard;

/// Scheduler loop configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the tick fires.
    pub poll_interval: Duration,
    /// Sleep used instead of `poll_interval` after an idle tick.
    pub backoff_interval: Duration,
    /// Maximum candidates retrieved from the registry store per tick.
    pub db_retrieve_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            backoff_interval: Duration::from_secs(60),
            db_retrieve_batch_size: 100,
        }
    }
}

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Candidates loaded in the never-attempted phase.
    pub loaded_pending: usize,
    /// Candidates loaded in the needs-sync-again phase.
    pub loaded_retry: usize,
    /// Jobs actually scheduled.
    pub scheduled: usize,
}

/// Site-tunable scheduling policy.
pub trait SchedulerStrategy: Send + Sync {
    /// Hard cap on jobs scheduled per tick, typically the sync worker
    /// pool's concurrency.
    fn max_capacity(&self) -> usize;

    /// Whether an idle tick should stretch the next sleep to the backoff
    /// interval.
    fn should_apply_backoff(&self, stats: &TickStats) -> bool {
        let _ = stats;
        false
    }
}

/// Default strategy: fixed capacity, no backoff.
///
/// Registry queries are cheap, so the loop runs every tick regardless of
/// fill rate. Scheduler variants that want adaptive backoff override
/// [`SchedulerStrategy::should_apply_backoff`].
pub struct RegistrySyncStrategy {
    capacity: usize,
}

impl RegistrySyncStrategy {
    /// Strategy with the given per-tick capacity.
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl SchedulerStrategy for RegistrySyncStrategy {
    fn max_capacity(&self) -> usize {
        self.capacity
    }
}

/// Replication scheduler that runs as a background task.
pub struct SyncScheduler {
    loader: BatchLoader,
    dispatcher: JobDispatcher,
    strategy: Arc<dyn SchedulerStrategy>,
    guard: SecondaryGuard,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

impl SyncScheduler {
    /// Create a new scheduler.
    pub fn new(
        loader: BatchLoader,
        dispatcher: JobDispatcher,
        strategy: Arc<dyn SchedulerStrategy>,
        guard: SecondaryGuard,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            loader,
            dispatcher,
            strategy,
            guard,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            db_retrieve_batch_size = self.config.db_retrieve_batch_size,
            max_capacity = self.strategy.max_capacity(),
            "Registry sync scheduler started"
        );

        let mut sleep_for = self.config.poll_interval;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Registry sync scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(sleep_for) => {
                    let args = serde_json::json!({
                        "db_retrieve_batch_size": self.config.db_retrieve_batch_size,
                    });
                    let outcome = self
                        .guard
                        .execute("registry_sync_scheduler", &args, || self.tick())
                        .await;

                    sleep_for = self.config.poll_interval;
                    match outcome {
                        Some(Ok(stats)) => {
                            if stats.scheduled == 0 && self.strategy.should_apply_backoff(&stats) {
                                debug!(
                                    backoff_secs = self.config.backoff_interval.as_secs(),
                                    "No work found, backing off"
                                );
                                sleep_for = self.config.backoff_interval;
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Scheduler tick failed");
                        }
                        // Guard skipped the tick: not a secondary site
                        None => {}
                    }
                }
            }
        }
    }

    /// One scheduler tick.
    ///
    /// Total loaded candidates never exceed the per-tick budget: the
    /// needs-sync-again phase only gets the capacity the never-attempted
    /// phase did not consume, measured against loaded counts rather than
    /// scheduled ones so enqueue failures cannot inflate the budget.
    async fn tick(&self) -> Result<TickStats, SyncError> {
        let capacity = self
            .config
            .db_retrieve_batch_size
            .min(self.strategy.max_capacity());
        let mut ctx = TickContext::new(capacity);
        let mut stats = TickStats::default();

        let pending = self.loader.load_never_attempted(&ctx, capacity).await?;
        stats.loaded_pending = pending.len();
        for candidate in &pending {
            if self.dispatcher.schedule_job(&mut ctx, candidate).is_some() {
                stats.scheduled += 1;
            }
        }

        let remaining = capacity.saturating_sub(stats.loaded_pending);
        let retry = self.loader.load_needs_sync_again(&ctx, remaining).await?;
        stats.loaded_retry = retry.len();
        for candidate in &retry {
            if self.dispatcher.schedule_job(&mut ctx, candidate).is_some() {
                stats.scheduled += 1;
            }
        }

        if stats.scheduled > 0 {
            info!(
                loaded_pending = stats.loaded_pending,
                loaded_retry = stats.loaded_retry,
                scheduled = stats.scheduled,
                "Scheduled sync jobs"
            );
        } else {
            debug!("No sync jobs scheduled this tick");
        }

        Ok(stats)
    }
}
