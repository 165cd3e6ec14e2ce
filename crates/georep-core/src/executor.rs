// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sync job execution.
//!
//! The worker pool drains the job queue and runs each job against the
//! site's [`Transfer`] implementation, bounded by a concurrency permit.
//! Every outcome is written back to the registry store: success marks the
//! row synced and runs verification, failure records the error and the
//! next retry time. The pool itself never interprets transfer errors, it
//! only persists them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::dispatcher::ScheduledJob;
use crate::error::SyncError;
use crate::registry::RegistryStore;

/// Site-specific transfer mechanism.
///
/// Implementations fetch one resource from the primary site and install
/// it locally. `transfer` must be idempotent: a duplicate job for an
/// already-synced resource must succeed harmlessly.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Pull the resource named by `job` from the primary site.
    async fn transfer(&self, job: &ScheduledJob) -> Result<(), SyncError>;

    /// Check the locally installed copy against the primary's.
    ///
    /// Returns `Ok(false)` for a well-formed mismatch (for example a
    /// checksum difference) and `Err` when verification itself could not
    /// run. Defaults to trusting the transfer.
    async fn verify(&self, job: &ScheduledJob) -> Result<bool, SyncError> {
        let _ = job;
        Ok(true)
    }
}

/// Pool of sync workers draining the job queue.
pub struct SyncWorkerPool {
    rx: mpsc::Receiver<ScheduledJob>,
    store: Arc<dyn RegistryStore>,
    transfer: Arc<dyn Transfer>,
    concurrency: usize,
    shutdown: Arc<Notify>,
}

impl SyncWorkerPool {
    /// Create a pool with the given transfer concurrency.
    pub fn new(
        rx: mpsc::Receiver<ScheduledJob>,
        store: Arc<dyn RegistryStore>,
        transfer: Arc<dyn Transfer>,
        concurrency: usize,
    ) -> Self {
        Self {
            rx,
            store,
            transfer,
            concurrency,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the pool until shutdown or the queue closes.
    pub async fn run(mut self) {
        info!(concurrency = self.concurrency, "Sync worker pool started");

        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));
        loop {
            let job = tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Sync worker pool shutting down");
                    break;
                }
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => {
                        info!("Job queue closed, sync worker pool stopping");
                        break;
                    }
                },
            };

            let permit = tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Sync worker pool shutting down");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let store = self.store.clone();
            let transfer = self.transfer.clone();
            tokio::spawn(async move {
                let _permit = permit;
                process_job(store, transfer, job).await;
            });
        }
    }
}

/// Execute one sync job and persist its outcome.
async fn process_job(
    store: Arc<dyn RegistryStore>,
    transfer: Arc<dyn Transfer>,
    job: ScheduledJob,
) {
    debug!(
        job_id = %job.job_id,
        replicable_name = %job.replicable_name,
        model_record_id = job.model_record_id,
        "Starting sync job"
    );

    if let Err(e) = store
        .mark_sync_started(&job.replicable_name, job.model_record_id)
        .await
    {
        // Row deleted between scheduling and execution
        warn!(job_id = %job.job_id, error = %e, "Could not start sync job");
        return;
    }

    match transfer.transfer(&job).await {
        Ok(()) => {
            if let Err(e) = store
                .mark_synced(&job.replicable_name, job.model_record_id)
                .await
            {
                warn!(job_id = %job.job_id, error = %e, "Failed to record synced state");
                return;
            }
            run_verification(&store, &transfer, &job).await;
        }
        Err(e) => {
            warn!(
                job_id = %job.job_id,
                replicable_name = %job.replicable_name,
                model_record_id = job.model_record_id,
                error = %e,
                "Sync job failed"
            );
            if let Err(e) = store
                .mark_sync_failed(&job.replicable_name, job.model_record_id, &e.to_string())
                .await
            {
                warn!(job_id = %job.job_id, error = %e, "Failed to record sync failure");
            }
        }
    }
}

async fn run_verification(
    store: &Arc<dyn RegistryStore>,
    transfer: &Arc<dyn Transfer>,
    job: &ScheduledJob,
) {
    if let Err(e) = store
        .mark_verification_started(&job.replicable_name, job.model_record_id)
        .await
    {
        warn!(job_id = %job.job_id, error = %e, "Failed to record verification start");
        return;
    }

    let result = match transfer.verify(job).await {
        Ok(true) => {
            store
                .mark_verification_succeeded(&job.replicable_name, job.model_record_id)
                .await
        }
        Ok(false) => {
            warn!(
                job_id = %job.job_id,
                replicable_name = %job.replicable_name,
                model_record_id = job.model_record_id,
                "Verification mismatch, registry flagged for re-sync"
            );
            store
                .mark_verification_failed(
                    &job.replicable_name,
                    job.model_record_id,
                    "checksum mismatch",
                )
                .await
        }
        Err(e) => {
            store
                .mark_verification_failed(&job.replicable_name, job.model_record_id, &e.to_string())
                .await
        }
    };

    if let Err(e) = result {
        warn!(job_id = %job.job_id, error = %e, "Failed to record verification outcome");
    }
}
