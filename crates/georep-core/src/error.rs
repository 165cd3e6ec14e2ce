// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for georep-core.

use thiserror::Error;

/// Replication scheduler errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A registry row was expected to exist but did not.
    #[error("Registry not found: {replicable_name}/{model_record_id}")]
    RegistryNotFound {
        /// Resource type of the missing registry.
        replicable_name: String,
        /// Identifier of the underlying resource.
        model_record_id: i64,
    },

    /// A resource transfer failed. Recorded into the registry row by the
    /// worker pool, never surfaced to the scheduler.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using [`SyncError`].
pub type Result<T> = std::result::Result<T, SyncError>;
