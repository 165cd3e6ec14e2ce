// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch loading of sync candidates.
//!
//! Each scheduler tick retrieves a capacity-bounded, type-balanced set of
//! candidates across every registered replicator. Retrieval is two-phase:
//! never-attempted registries first, then (with whatever capacity remains)
//! registries that need another attempt. Allocation across types is
//! round-robin so no resource type starves the others.

use std::sync::Arc;

use tracing::debug;

use crate::dispatcher::ScheduledJob;
use crate::error::SyncError;
use crate::registry::RegistryRecord;
use crate::replicator::ReplicatorSet;

/// One sync candidate produced by the batch loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Resource type.
    pub replicable_name: String,
    /// Identifier of the underlying resource.
    pub model_record_id: i64,
}

impl From<RegistryRecord> for Candidate {
    fn from(record: RegistryRecord) -> Self {
        Self {
            replicable_name: record.replicable_name,
            model_record_id: record.model_record_id,
        }
    }
}

/// Explicit per-tick state threaded through loader and dispatcher.
///
/// Owns the set of jobs scheduled so far in the current tick; the loader
/// derives its exclusion lists from it, which is what keeps the retry
/// phase from re-selecting an item the pending phase already scheduled.
/// Dropped at the end of the tick — there is no cross-tick state beyond
/// the registry rows themselves.
#[derive(Debug)]
pub struct TickContext {
    db_retrieve_batch_size: usize,
    scheduled: Vec<ScheduledJob>,
}

impl TickContext {
    /// Start a tick with the given candidate budget.
    pub fn new(db_retrieve_batch_size: usize) -> Self {
        Self {
            db_retrieve_batch_size,
            scheduled: Vec::new(),
        }
    }

    /// Maximum candidates this tick may retrieve in total.
    pub fn db_retrieve_batch_size(&self) -> usize {
        self.db_retrieve_batch_size
    }

    /// Whether a job for this pair was already scheduled this tick.
    pub fn is_scheduled(&self, replicable_name: &str, model_record_id: i64) -> bool {
        self.scheduled.iter().any(|job| {
            job.replicable_name == replicable_name && job.model_record_id == model_record_id
        })
    }

    /// Model record ids already scheduled this tick for one resource type.
    pub fn except_ids(&self, replicable_name: &str) -> Vec<i64> {
        self.scheduled
            .iter()
            .filter(|job| job.replicable_name == replicable_name)
            .map(|job| job.model_record_id)
            .collect()
    }

    /// Jobs scheduled so far this tick.
    pub fn scheduled_jobs(&self) -> &[ScheduledJob] {
        &self.scheduled
    }

    pub(crate) fn record(&mut self, job: ScheduledJob) {
        self.scheduled.push(job);
    }
}

/// Loads capacity-bounded candidate sets across all registered replicators.
pub struct BatchLoader {
    replicators: Arc<ReplicatorSet>,
}

enum Phase {
    NeverAttempted,
    NeedsSyncAgain,
}

impl BatchLoader {
    /// Create a loader over the given replicator set.
    pub fn new(replicators: Arc<ReplicatorSet>) -> Self {
        Self { replicators }
    }

    /// Phase 1: registries never attempted, at most `limit` candidates.
    pub async fn load_never_attempted(
        &self,
        ctx: &TickContext,
        limit: usize,
    ) -> Result<Vec<Candidate>, SyncError> {
        self.load_phase(ctx, limit, Phase::NeverAttempted).await
    }

    /// Phase 2: registries needing another attempt, at most `limit`.
    pub async fn load_needs_sync_again(
        &self,
        ctx: &TickContext,
        limit: usize,
    ) -> Result<Vec<Candidate>, SyncError> {
        self.load_phase(ctx, limit, Phase::NeedsSyncAgain).await
    }

    /// Pure read: queries every replicator, then interleaves the per-type
    /// results round-robin and truncates to `limit`.
    async fn load_phase(
        &self,
        ctx: &TickContext,
        limit: usize,
        phase: Phase,
    ) -> Result<Vec<Candidate>, SyncError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut pools: Vec<Vec<Candidate>> = Vec::with_capacity(self.replicators.len());
        for replicator in self.replicators.iter() {
            let except_ids = ctx.except_ids(replicator.replicable_name());
            let records = match phase {
                Phase::NeverAttempted => {
                    replicator
                        .find_registries_never_attempted_sync(limit, &except_ids)
                        .await?
                }
                Phase::NeedsSyncAgain => {
                    replicator
                        .find_registries_needs_sync_again(limit, &except_ids)
                        .await?
                }
            };
            debug!(
                replicable_name = replicator.replicable_name(),
                count = records.len(),
                "Loaded sync candidates"
            );
            pools.push(records.into_iter().map(Candidate::from).collect());
        }

        Ok(take_batch(pools, limit))
    }
}

/// Interleave per-type candidate pools round-robin, one candidate per type
/// per round in registration order, until `limit` is reached or all pools
/// drain. Types with fewer candidates simply drop out of later rounds.
fn take_batch(mut pools: Vec<Vec<Candidate>>, limit: usize) -> Vec<Candidate> {
    let mut batch = Vec::with_capacity(limit.min(pools.iter().map(Vec::len).sum()));
    let mut cursors: Vec<std::vec::IntoIter<Candidate>> =
        pools.drain(..).map(Vec::into_iter).collect();

    while batch.len() < limit {
        let mut exhausted = true;
        for cursor in cursors.iter_mut() {
            if let Some(candidate) = cursor.next() {
                exhausted = false;
                batch.push(candidate);
                if batch.len() == limit {
                    break;
                }
            }
        }
        if exhausted {
            break;
        }
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str, ids: std::ops::RangeInclusive<i64>) -> Vec<Candidate> {
        ids.map(|id| Candidate {
            replicable_name: name.to_string(),
            model_record_id: id,
        })
        .collect()
    }

    fn count_for(batch: &[Candidate], name: &str) -> usize {
        batch.iter().filter(|c| c.replicable_name == name).count()
    }

    #[test]
    fn test_take_batch_equal_split() {
        // Two types with 7 candidates each, limit 10: 5 from each
        let batch = take_batch(vec![pool("a", 1..=7), pool("b", 1..=7)], 10);

        assert_eq!(batch.len(), 10);
        assert_eq!(count_for(&batch, "a"), 5);
        assert_eq!(count_for(&batch, "b"), 5);
    }

    #[test]
    fn test_take_batch_interleaves_round_robin() {
        let batch = take_batch(vec![pool("a", 1..=2), pool("b", 1..=2)], 4);

        let names: Vec<&str> = batch.iter().map(|c| c.replicable_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_take_batch_short_pool_drops_out() {
        // Type a runs dry after 2; b fills the remainder
        let batch = take_batch(vec![pool("a", 1..=2), pool("b", 1..=8)], 6);

        assert_eq!(batch.len(), 6);
        assert_eq!(count_for(&batch, "a"), 2);
        assert_eq!(count_for(&batch, "b"), 4);
    }

    #[test]
    fn test_take_batch_remainder_favors_earlier_types() {
        let batch = take_batch(vec![pool("a", 1..=5), pool("b", 1..=5)], 5);

        assert_eq!(count_for(&batch, "a"), 3);
        assert_eq!(count_for(&batch, "b"), 2);
    }

    #[test]
    fn test_take_batch_never_exceeds_limit() {
        let batch = take_batch(
            vec![pool("a", 1..=50), pool("b", 1..=50), pool("c", 1..=50)],
            10,
        );
        assert_eq!(batch.len(), 10);
    }

    #[test]
    fn test_take_batch_exhausts_small_pools() {
        let batch = take_batch(vec![pool("a", 1..=1), pool("b", 1..=2)], 10);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_take_batch_empty() {
        assert!(take_batch(vec![], 10).is_empty());
        assert!(take_batch(vec![vec![], vec![]], 10).is_empty());
        assert!(take_batch(vec![pool("a", 1..=3)], 0).is_empty());
    }

    #[test]
    fn test_tick_context_except_ids_are_per_type() {
        use crate::dispatcher::ScheduledJob;
        use uuid::Uuid;

        let mut ctx = TickContext::new(10);
        ctx.record(ScheduledJob {
            replicable_name: "a".to_string(),
            model_record_id: 1,
            job_id: Uuid::new_v4(),
        });
        ctx.record(ScheduledJob {
            replicable_name: "b".to_string(),
            model_record_id: 2,
            job_id: Uuid::new_v4(),
        });

        assert_eq!(ctx.except_ids("a"), vec![1]);
        assert_eq!(ctx.except_ids("b"), vec![2]);
        assert!(ctx.except_ids("c").is_empty());
        assert!(ctx.is_scheduled("a", 1));
        assert!(!ctx.is_scheduled("a", 2));
        assert_eq!(ctx.scheduled_jobs().len(), 2);
        assert_eq!(ctx.db_retrieve_batch_size(), 10);
    }
}
