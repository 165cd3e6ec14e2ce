// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry store interfaces and backends.
//!
//! A registry row is the persisted sync/verification state for one
//! replicable resource instance on this site. Rows are created lazily when
//! a resource is first discovered as needing sync, mutated only by the
//! worker pool while a sync job runs, and deleted only when the source
//! resource itself is deleted.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryRegistryStore;
pub use self::sqlite::SqliteRegistryStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::SyncError;

/// Sync state of a registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Discovered but never attempted.
    Pending,
    /// A sync job has picked the row up.
    Started,
    /// The last sync attempt succeeded.
    Synced,
    /// The last sync attempt failed; `retry_at` gates the next attempt.
    Failed,
}

impl SyncState {
    /// Database string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Started => "started",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncState::Pending),
            "started" => Some(SyncState::Started),
            "synced" => Some(SyncState::Synced),
            "failed" => Some(SyncState::Failed),
            _ => None,
        }
    }
}

/// Verification state of a registry row, independent of sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    /// Not verified since the last successful sync.
    Pending,
    /// Verification in progress.
    Started,
    /// Checksum matched the primary.
    Succeeded,
    /// Checksum mismatch or blob missing; the row becomes a re-sync
    /// candidate (see [`RegistryStore::find_needs_sync_again`]).
    Failed,
}

impl VerificationState {
    /// Database string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Pending => "pending",
            VerificationState::Started => "started",
            VerificationState::Succeeded => "succeeded",
            VerificationState::Failed => "failed",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(VerificationState::Pending),
            "started" => Some(VerificationState::Started),
            "succeeded" => Some(VerificationState::Succeeded),
            "failed" => Some(VerificationState::Failed),
            _ => None,
        }
    }
}

/// Registry record from the store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RegistryRecord {
    /// Database primary key.
    pub id: i64,
    /// Resource type (e.g. "package_file", "job_artifact").
    pub replicable_name: String,
    /// Identifier of the underlying resource in the source system.
    pub model_record_id: i64,
    /// Sync state (pending, started, synced, failed).
    pub state: String,
    /// Verification state (pending, started, succeeded, failed).
    pub verification_state: String,
    /// Consecutive failed sync attempts since the last success.
    pub retry_count: i64,
    /// Error message from the last failed sync attempt.
    pub last_sync_failure: Option<String>,
    /// When the resource last synced successfully.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// When a sync job last picked the row up.
    pub last_sync_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the next attempt may be scheduled after a failure.
    pub retry_at: Option<DateTime<Utc>>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

impl RegistryRecord {
    /// Typed sync state, `None` if the stored string is unknown.
    pub fn sync_state(&self) -> Option<SyncState> {
        SyncState::parse(&self.state)
    }

    /// Typed verification state, `None` if the stored string is unknown.
    pub fn verification(&self) -> Option<VerificationState> {
        VerificationState::parse(&self.verification_state)
    }
}

/// Compute the earliest next attempt time after `retry_count` failures.
///
/// Capped exponential: 10s * 2^retry_count, at most one hour.
pub fn next_retry_at(retry_count: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    let exponent = retry_count.clamp(0, 10) as u32;
    let delay_secs = (10i64 << exponent).min(3600);
    now + ChronoDuration::seconds(delay_secs)
}

/// Registry store interface used by replicators and the worker pool.
///
/// The scheduler side only reads; the worker pool is the sole writer of a
/// given row while its sync job runs.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Create a registry row in `pending` state if none exists. Idempotent.
    async fn upsert_registry(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError>;

    /// Fetch a single registry row.
    async fn get_registry(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<Option<RegistryRecord>, SyncError>;

    /// Rows in `pending` state with no prior sync attempt, excluding
    /// `except_ids`, oldest first, at most `batch_size`.
    async fn find_never_attempted_sync(
        &self,
        replicable_name: &str,
        batch_size: usize,
        except_ids: &[i64],
    ) -> Result<Vec<RegistryRecord>, SyncError>;

    /// Rows eligible for another sync attempt, excluding `except_ids`,
    /// at most `batch_size`:
    /// - `failed` with `retry_at` due (or unset),
    /// - `synced` whose verification failed,
    /// - `started` whose last attempt predates `stale_before` (a job that
    ///   died without reporting back).
    async fn find_needs_sync_again(
        &self,
        replicable_name: &str,
        batch_size: usize,
        except_ids: &[i64],
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<RegistryRecord>, SyncError>;

    /// Transition a row to `started` and stamp the attempt time.
    async fn mark_sync_started(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError>;

    /// Record a successful sync: `synced`, retry bookkeeping cleared,
    /// verification reset to `pending`.
    async fn mark_synced(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError>;

    /// Record a failed sync: `failed`, `retry_count` incremented,
    /// `last_sync_failure` recorded, `retry_at` pushed out by the backoff
    /// curve ([`next_retry_at`]).
    async fn mark_sync_failed(
        &self,
        replicable_name: &str,
        model_record_id: i64,
        error: &str,
    ) -> Result<(), SyncError>;

    /// Transition verification to `started`.
    async fn mark_verification_started(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError>;

    /// Record a successful verification.
    async fn mark_verification_succeeded(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError>;

    /// Record a failed verification with a reason. The row becomes a
    /// re-sync candidate on the next tick.
    async fn mark_verification_failed(
        &self,
        replicable_name: &str,
        model_record_id: i64,
        reason: &str,
    ) -> Result<(), SyncError>;

    /// Count rows in a given sync state, optionally for one resource type.
    async fn count_registries(
        &self,
        replicable_name: Option<&str>,
        state: SyncState,
    ) -> Result<i64, SyncError>;

    /// Delete a registry row. Only called when the source resource itself
    /// was deleted on the primary (cascade).
    async fn delete_registry(
        &self,
        replicable_name: &str,
        model_record_id: i64,
    ) -> Result<(), SyncError>;
}
