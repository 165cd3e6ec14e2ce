// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Role of the current node in the replication topology.
///
/// Replication is pulled by secondaries; the scheduler is a no-op on a
/// primary (see [`crate::guard::SecondaryGuard`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteRole {
    /// The authoritative site. Replication workers skip execution here.
    Primary,
    /// A replica site that pulls resources from the primary.
    Secondary,
}

impl SiteRole {
    /// String form used in configuration and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteRole::Primary => "primary",
            SiteRole::Secondary => "secondary",
        }
    }

    /// Parse a role from its configuration string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(SiteRole::Primary),
            "secondary" => Some(SiteRole::Secondary),
            _ => None,
        }
    }
}

/// Replication scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL or file path for the registry database.
    pub database_url: String,
    /// Role of this node (primary sites never schedule sync jobs).
    pub site_role: SiteRole,
    /// How often the scheduler tick fires.
    pub poll_interval: Duration,
    /// Sleep applied instead of `poll_interval` when the strategy backs off.
    pub backoff_interval: Duration,
    /// Maximum candidates retrieved from the registry store per tick.
    pub db_retrieve_batch_size: usize,
    /// Maximum concurrent sync transfers.
    pub max_capacity: usize,
    /// Age after which a row stuck in `started` is considered abandoned
    /// and becomes eligible for re-sync.
    pub stale_timeout: Duration,
    /// Replicable resource types handled by this site.
    pub replicable_names: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `GEOREP_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `GEOREP_SITE_ROLE`: `primary` or `secondary` (default: `primary`)
    /// - `GEOREP_POLL_INTERVAL_SECS`: scheduler tick interval (default: 5)
    /// - `GEOREP_BACKOFF_INTERVAL_SECS`: idle backoff sleep (default: 60)
    /// - `GEOREP_BATCH_SIZE`: max candidates loaded per tick (default: 100)
    /// - `GEOREP_MAX_CAPACITY`: max concurrent transfers (default: 10)
    /// - `GEOREP_STALE_TIMEOUT_SECS`: abandoned-sync cutoff (default: 3600)
    /// - `GEOREP_REPLICABLES`: comma-separated replicable names (default: empty)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("GEOREP_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("GEOREP_DATABASE_URL"))?;

        let site_role = match std::env::var("GEOREP_SITE_ROLE") {
            Ok(raw) => SiteRole::parse(&raw).ok_or(ConfigError::Invalid(
                "GEOREP_SITE_ROLE",
                "must be 'primary' or 'secondary'",
            ))?,
            Err(_) => SiteRole::Primary,
        };

        let poll_interval_secs: u64 = std::env::var("GEOREP_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("GEOREP_POLL_INTERVAL_SECS", "must be a positive integer")
            })?;

        let backoff_interval_secs: u64 = std::env::var("GEOREP_BACKOFF_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("GEOREP_BACKOFF_INTERVAL_SECS", "must be a positive integer")
            })?;

        let db_retrieve_batch_size: usize = std::env::var("GEOREP_BATCH_SIZE")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("GEOREP_BATCH_SIZE", "must be a positive integer"))?;

        let max_capacity: usize = std::env::var("GEOREP_MAX_CAPACITY")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("GEOREP_MAX_CAPACITY", "must be a positive integer")
            })?;

        let stale_timeout_secs: u64 = std::env::var("GEOREP_STALE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("GEOREP_STALE_TIMEOUT_SECS", "must be a positive integer")
            })?;

        let replicable_names = std::env::var("GEOREP_REPLICABLES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            database_url,
            site_role,
            poll_interval: Duration::from_secs(poll_interval_secs),
            backoff_interval: Duration::from_secs(backoff_interval_secs),
            db_retrieve_batch_size,
            max_capacity,
            stale_timeout: Duration::from_secs(stale_timeout_secs),
            replicable_names,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
