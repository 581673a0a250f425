//! Work-Claiming Coordinator
//!
//! Lets any number of independent worker processes pull exclusive ownership
//! of pipeline work items from the shared queue. Claim uniqueness comes from
//! the store's locking primitive, not from in-process coordination, so the
//! guarantee holds across hosts with zero shared memory.

use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClaimsConfig;
use crate::domain::{Strategy, StrategyStatus};
use crate::error::{ForgeError, Result};
use crate::storage::WorkQueueStore;

/// Derive a claim-owner token for this process. Includes a random fragment
/// so a restarted process with a recycled pid does not inherit old claims;
/// those are recovered by the stale sweep instead.
pub fn worker_token() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}:{}:{}", host, std::process::id(), &nonce[..8])
}

/// Pure backpressure formula: zero below the limit, then a linear ramp
/// capped at `max_cooldown_seconds`.
pub fn backpressure_cooldown(
    depth: u64,
    limit: u64,
    base_seconds: u64,
    increment_seconds: u64,
    max_cooldown_seconds: u64,
) -> u64 {
    if depth < limit {
        return 0;
    }
    (base_seconds + (depth - limit) * increment_seconds).min(max_cooldown_seconds)
}

/// One claim coordinator per worker process
pub struct ClaimCoordinator<S> {
    store: Arc<S>,
    token: String,
    config: ClaimsConfig,
}

impl<S: WorkQueueStore> ClaimCoordinator<S> {
    pub fn new(store: Arc<S>, config: ClaimsConfig) -> Self {
        Self::with_token(store, config, worker_token())
    }

    pub fn with_token(store: Arc<S>, config: ClaimsConfig, token: String) -> Self {
        Self {
            store,
            token,
            config,
        }
    }

    /// This coordinator's owner token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Claim the next available item in `status`, or `None` when the queue
    /// is empty. Recovers stale claims system-wide first, so work abandoned
    /// by a crashed worker re-enters the queue on the next poll.
    pub async fn claim(&self, status: StrategyStatus) -> Result<Option<Strategy>> {
        let recovered = self.release_stale_claims().await?;
        if recovered > 0 {
            warn!(recovered, "recovered stale claims before claiming");
        }

        let item = self
            .store
            .try_claim_one(status, &self.token, Utc::now())
            .await?;

        if let Some(ref item) = item {
            debug!(id = item.id, status = %status, "claimed work item");
        }
        Ok(item)
    }

    /// Move a held item to `new_status` and release the claim. Returns false
    /// when the item is gone or this coordinator no longer owns it (e.g. the
    /// claim timed out and another worker took over). A transition the
    /// status machine forbids is an error and mutates nothing.
    pub async fn release(&self, id: i64, new_status: StrategyStatus) -> Result<bool> {
        let Some(item) = self.store.get_strategy(id).await? else {
            return Ok(false);
        };
        if item.processing_by.as_deref() != Some(self.token.as_str()) {
            debug!(id, "release refused: claim not held by this worker");
            return Ok(false);
        }
        if !item.status.can_transition_to(new_status) {
            return Err(ForgeError::InvalidStateTransition {
                from: item.status.to_string(),
                to: new_status.to_string(),
            });
        }

        // The store re-checks ownership in the same statement, so a claim
        // reclaimed between the read above and this write still fails closed.
        let released = self
            .store
            .release_claim(id, &self.token, new_status, Utc::now())
            .await?;
        if released {
            info!(id, status = %new_status, "released work item");
        }
        Ok(released)
    }

    /// Mark a held item FAILED, keeping the record and error for audit.
    pub async fn fail(&self, id: i64, error: &str) -> Result<bool> {
        let failed = self
            .store
            .fail_claim(id, &self.token, error, Utc::now())
            .await?;
        if failed {
            warn!(id, error, "work item failed");
        }
        Ok(failed)
    }

    /// Delete a held item whose payload is unsalvageable (e.g. rejected by
    /// validation). The error is logged since the record will not survive.
    pub async fn discard(&self, id: i64, error: &str) -> Result<bool> {
        let discarded = self.store.delete_claimed(id, &self.token).await?;
        if discarded {
            warn!(id, error, "discarded unsalvageable work item");
        }
        Ok(discarded)
    }

    /// Release every claim older than the configured timeout, leaving item
    /// statuses unchanged. Runs at the start of every claim; also callable
    /// directly for periodic sweeps.
    pub async fn release_stale_claims(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::seconds(self.config.timeout_seconds as i64);
        self.store.release_stale(cutoff).await
    }

    /// Release every claim held by this worker. Graceful-shutdown hook.
    pub async fn release_all_owned(&self) -> Result<u64> {
        let released = self.store.release_all_by_owner(&self.token).await?;
        if released > 0 {
            info!(released, token = %self.token, "released all claims held by this worker");
        }
        Ok(released)
    }

    /// Unclaimed item count per status, for monitoring and backpressure.
    pub async fn queue_depths(&self) -> Result<BTreeMap<StrategyStatus, i64>> {
        Ok(self.store.queue_depths().await?.into_iter().collect())
    }

    /// Producer cooldown for a queue at `depth` against `limit`, using the
    /// configured backpressure curve.
    pub fn backpressure_cooldown(&self, depth: u64, limit: u64) -> u64 {
        let bp = &self.config.backpressure;
        backpressure_cooldown(
            depth,
            limit,
            bp.base_seconds,
            bp.increment_seconds,
            bp.max_cooldown_seconds,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_below_limit_is_free() {
        assert_eq!(backpressure_cooldown(9, 10, 30, 2, 120), 0);
        assert_eq!(backpressure_cooldown(0, 10, 30, 2, 120), 0);
    }

    #[test]
    fn test_backpressure_ramps_linearly() {
        // At the limit the base kicks in
        assert_eq!(backpressure_cooldown(10, 10, 30, 2, 120), 30);
        assert_eq!(backpressure_cooldown(15, 10, 30, 2, 120), 40);
    }

    #[test]
    fn test_backpressure_is_capped() {
        assert_eq!(backpressure_cooldown(100, 10, 30, 2, 120), 120);
    }

    #[test]
    fn test_worker_tokens_are_distinct() {
        let a = worker_token();
        let b = worker_token();
        assert_ne!(a, b);
        assert_eq!(a.split(':').count(), 3);
    }
}
