// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secondary-site guard.
//!
//! Replication is pulled from the primary by secondaries, so replication
//! workers must not run on a primary site. The guard wraps job execution:
//! on a non-secondary site it logs a structured skip message with the job
//! arguments and returns without executing the body. Pure and idempotent,
//! safe to apply on every invocation.

use std::sync::Arc;

use tracing::info;

use crate::config::SiteRole;

/// Answers whether this node is currently a secondary replication site.
pub trait SiteTopology: Send + Sync {
    /// True if the current site is a secondary.
    fn current_site_secondary(&self) -> bool;
}

/// Topology fixed at process start from configuration.
#[derive(Debug, Clone, Copy)]
pub struct StaticTopology {
    role: SiteRole,
}

impl StaticTopology {
    /// Topology with the given role.
    pub fn new(role: SiteRole) -> Self {
        Self { role }
    }

    /// Shorthand for a secondary site.
    pub fn secondary() -> Self {
        Self::new(SiteRole::Secondary)
    }

    /// Shorthand for a primary site.
    pub fn primary() -> Self {
        Self::new(SiteRole::Primary)
    }
}

impl SiteTopology for StaticTopology {
    fn current_site_secondary(&self) -> bool {
        self.role == SiteRole::Secondary
    }
}

/// Skip-execution wrapper for replication workers.
pub struct SecondaryGuard {
    topology: Arc<dyn SiteTopology>,
}

impl SecondaryGuard {
    /// Create a guard over the given topology.
    pub fn new(topology: Arc<dyn SiteTopology>) -> Self {
        Self { topology }
    }

    /// Run `f` only on a secondary site.
    ///
    /// On a non-secondary site, logs a structured skip message including
    /// the worker name and its arguments and returns `None` without
    /// executing `f`. Otherwise delegates unchanged.
    pub async fn execute<F, Fut, T>(
        &self,
        worker: &str,
        args: &serde_json::Value,
        f: F,
    ) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.topology.current_site_secondary() {
            info!(
                worker,
                args = %args,
                "Skipping execution, this node is not a secondary site"
            );
            return None;
        }

        Some(f().await)
    }
}
