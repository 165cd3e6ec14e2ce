// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job dispatch: candidates in, bounded async sync jobs out.
//!
//! The dispatcher guarantees at most one scheduled job per
//! `(replicable_name, model_record_id)` pair per tick. Cross-tick
//! duplicate prevention comes from the registry row's own state
//! transition once the job starts; a duplicate slipping through between
//! ticks is tolerated because sync jobs are idempotent.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::batch::{Candidate, TickContext};

/// Descriptor of a scheduled sync job. Ephemeral: lives in the tick
/// context during the scheduling pass and as the job queue payload.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    /// Resource type.
    pub replicable_name: String,
    /// Identifier of the underlying resource.
    pub model_record_id: i64,
    /// Identifier of the enqueued job.
    pub job_id: Uuid,
}

/// Async job-queue primitive consumed by the dispatcher.
///
/// Returns the job identifier, or `None` when the job could not be
/// enqueued (queue saturated). A `None` is not an error: the candidate is
/// dropped for this tick and re-discovered on the next one, since its
/// registry state is unchanged.
pub trait JobQueue: Send + Sync {
    /// Attempt to enqueue a sync job without blocking.
    fn try_enqueue(&self, replicable_name: &str, model_record_id: i64) -> Option<Uuid>;
}

/// Job queue backed by a bounded tokio channel feeding the worker pool.
pub struct ChannelQueue {
    tx: mpsc::Sender<ScheduledJob>,
}

impl ChannelQueue {
    /// Wrap a channel sender.
    pub fn new(tx: mpsc::Sender<ScheduledJob>) -> Self {
        Self { tx }
    }
}

impl JobQueue for ChannelQueue {
    fn try_enqueue(&self, replicable_name: &str, model_record_id: i64) -> Option<Uuid> {
        let job = ScheduledJob {
            replicable_name: replicable_name.to_string(),
            model_record_id,
            job_id: Uuid::new_v4(),
        };
        let job_id = job.job_id;
        match self.tx.try_send(job) {
            Ok(()) => Some(job_id),
            Err(_) => None,
        }
    }
}

/// Converts loaded candidates into scheduled jobs.
pub struct JobDispatcher {
    queue: Arc<dyn JobQueue>,
}

impl JobDispatcher {
    /// Create a dispatcher over a job queue.
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Schedule a sync job for `candidate`, recording the descriptor in
    /// the tick context.
    ///
    /// Returns `None` if the pair was already scheduled this tick or the
    /// queue refused the job.
    pub fn schedule_job(
        &self,
        ctx: &mut TickContext,
        candidate: &Candidate,
    ) -> Option<ScheduledJob> {
        if ctx.is_scheduled(&candidate.replicable_name, candidate.model_record_id) {
            debug!(
                replicable_name = %candidate.replicable_name,
                model_record_id = candidate.model_record_id,
                "Already scheduled this tick"
            );
            return None;
        }

        let Some(job_id) = self
            .queue
            .try_enqueue(&candidate.replicable_name, candidate.model_record_id)
        else {
            warn!(
                replicable_name = %candidate.replicable_name,
                model_record_id = candidate.model_record_id,
                "Job queue saturated, dropping candidate for this tick"
            );
            return None;
        };

        let job = ScheduledJob {
            replicable_name: candidate.replicable_name.clone(),
            model_record_id: candidate.model_record_id,
            job_id,
        };
        ctx.record(job.clone());
        Some(job)
    }
}
