// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Georep Core - Secondary-Site Replication Scheduler
//!
//! This crate schedules and executes resource replication on a secondary
//! site. A registry row tracks the sync lifecycle of every replicable
//! resource; a periodic scheduler turns eligible rows into bounded,
//! type-balanced batches of sync jobs; a worker pool pulls each resource
//! from the primary and records the outcome.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Primary Site                          │
//! │              (authoritative resource storage)               │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ pull
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Secondary Site (this crate)                 │
//! │                                                             │
//! │  ┌───────────────┐  tick  ┌──────────────┐                  │
//! │  │ SyncScheduler │───────►│ BatchLoader  │                  │
//! │  │ (guarded,     │        │ (two-phase,  │                  │
//! │  │  periodic)    │        │  round-robin)│                  │
//! │  └──────┬────────┘        └──────┬───────┘                  │
//! │         │ candidates             │ queries                  │
//! │         ▼                        ▼                          │
//! │  ┌───────────────┐        ┌──────────────┐                  │
//! │  │ JobDispatcher │        │ReplicatorSet │                  │
//! │  │ (dedup +      │        │ (one per     │                  │
//! │  │  bounded)     │        │  resource)   │                  │
//! │  └──────┬────────┘        └──────┬───────┘                  │
//! │         │ jobs                   │                          │
//! │         ▼                        ▼                          │
//! │  ┌───────────────┐        ┌──────────────┐                  │
//! │  │SyncWorkerPool │───────►│RegistryStore │                  │
//! │  │ (transfer +   │ marks  │ (SQLite /    │                  │
//! │  │  verify)      │        │  in-memory)  │                  │
//! │  └───────────────┘        └──────────────┘                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Registry State Machine
//!
//! ```text
//!              ┌─────────┐
//!              │ PENDING │
//!              └────┬────┘
//!                   │ scheduled, transfer starts
//!                   ▼
//!              ┌─────────┐
//!      ┌───────│ STARTED │────────┐
//!      │       └────┬────┘        │
//!      │            │             │ attempt abandoned
//! fail │    transfer│ ok          │ (stale timeout)
//!      │            │             │
//!      ▼            ▼             ▼
//! ┌─────────┐  ┌─────────┐   re-scheduled
//! │ FAILED  │  │ SYNCED  │
//! └────┬────┘  └────┬────┘
//!      │            │ verification fails
//!      │ retry_at   │
//!      │ reached    ▼
//!      └─────► re-scheduled
//! ```
//!
//! A `failed` row waits out an exponential backoff before it becomes
//! eligible again; a `synced` row whose verification failed is re-synced
//! on a later tick; a `started` row whose attempt is older than the stale
//! timeout is treated as abandoned and re-offered.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `GEOREP_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `GEOREP_SITE_ROLE` | No | `primary` | `primary` or `secondary` |
//! | `GEOREP_POLL_INTERVAL_SECS` | No | `5` | Scheduler tick interval |
//! | `GEOREP_BACKOFF_INTERVAL_SECS` | No | `60` | Idle backoff sleep |
//! | `GEOREP_BATCH_SIZE` | No | `100` | Max candidates loaded per tick |
//! | `GEOREP_MAX_CAPACITY` | No | `10` | Max concurrent transfers |
//! | `GEOREP_STALE_TIMEOUT_SECS` | No | `3600` | Abandoned-sync cutoff |
//! | `GEOREP_REPLICABLES` | No | empty | Comma-separated resource types |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`registry`]: Registry store trait plus SQLite and in-memory backends
//! - [`replicator`]: Per-resource-type replicator contract and registry
//! - [`batch`]: Two-phase, type-balanced candidate loading
//! - [`dispatcher`]: Candidate-to-job dispatch with per-tick dedup
//! - [`scheduler`]: The periodic scheduler loop and its strategy hook
//! - [`guard`]: Secondary-site execution guard
//! - [`executor`]: Transfer contract and the sync worker pool
//! - [`runtime`]: Embeddable runtime wiring everything together

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for replication operations.
pub mod error;

/// Registry store trait with SQLite and in-memory backends.
pub mod registry;

/// Embedded database migrations.
pub mod migrations;

/// Replicator contract and registration table.
pub mod replicator;

/// Two-phase, type-balanced candidate loading.
pub mod batch;

/// Candidate-to-job dispatch with per-tick dedup.
pub mod dispatcher;

/// The periodic scheduler loop and its strategy hook.
pub mod scheduler;

/// Secondary-site execution guard.
pub mod guard;

/// Transfer contract and the sync worker pool.
pub mod executor;

/// Embeddable runtime wiring scheduler, dispatcher and worker pool.
pub mod runtime;
