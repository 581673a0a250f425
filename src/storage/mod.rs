//! Storage ports for the coordination core.
//!
//! The concurrency contract lives here: `try_claim_one` must hand any given
//! row to at most one caller, without blocking callers on each other's
//! locks. The Postgres adapter satisfies this with `FOR UPDATE SKIP LOCKED`;
//! the in-memory adapter with a compare-and-swap under one mutex.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::{
    EmergencyStop, NewStrategy, StopScope, Strategy, StrategyStatus, Subaccount, SubaccountStatus,
    Trade,
};
use crate::error::Result;

/// Shared work-queue surface used by the claim coordinator.
///
/// Every mutation both reads its precondition and writes the new state in a
/// single transaction; "no matching row" outcomes are `false`/`None`, never
/// errors.
#[async_trait]
pub trait WorkQueueStore: Send + Sync {
    async fn insert_strategy(&self, new: &NewStrategy) -> Result<i64>;

    async fn get_strategy(&self, id: i64) -> Result<Option<Strategy>>;

    /// Atomically claim the first available item in `status`, skipping rows
    /// concurrently locked by other claimants instead of waiting on them.
    async fn try_claim_one(
        &self,
        status: StrategyStatus,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Strategy>>;

    /// Move a held item to `new_status` and clear the claim. Returns false
    /// when the item is missing or `owner` no longer holds it.
    async fn release_claim(
        &self,
        id: i64,
        owner: &str,
        new_status: StrategyStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Mark a held item FAILED, recording the error for audit.
    async fn fail_claim(
        &self,
        id: i64,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete a held item outright (unsalvageable payload).
    async fn delete_claimed(&self, id: i64, owner: &str) -> Result<bool>;

    /// Clear every claim started before `cutoff`, leaving statuses intact.
    /// Returns the number of claims released.
    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Clear every claim held by `owner`. Returns the number released.
    async fn release_all_by_owner(&self, owner: &str) -> Result<u64>;

    /// Unclaimed item counts per status.
    async fn queue_depths(&self) -> Result<Vec<(StrategyStatus, i64)>>;
}

/// Shared control-plane surface used by the emergency stop controller, the
/// rotator, and the balance feed.
#[async_trait]
pub trait ControlStore: Send + Sync {
    async fn get_stop(&self, scope: StopScope, scope_id: &str) -> Result<Option<EmergencyStop>>;

    async fn active_stops(&self) -> Result<Vec<EmergencyStop>>;

    async fn upsert_stop(&self, stop: &EmergencyStop) -> Result<()>;

    /// Flip a stop to not-stopped and clear its reason/timestamps. Returns
    /// false when no active stop row existed.
    async fn clear_stop(&self, scope: StopScope, scope_id: &str, now: DateTime<Utc>)
        -> Result<bool>;

    /// Provision a capital slot if it does not exist. Returns true when a
    /// new slot was created.
    async fn upsert_subaccount(&self, id: i32, allocated_capital: Decimal) -> Result<bool>;

    async fn list_subaccounts(&self) -> Result<Vec<Subaccount>>;

    async fn get_subaccount(&self, id: i32) -> Result<Option<Subaccount>>;

    /// Single authoritative slot-status transition. Enforces
    /// `SubaccountStatus::can_transition_to`; returns false when the slot is
    /// missing or the transition is not permitted. Setting the current
    /// status again is a no-op success.
    async fn set_subaccount_status(
        &self,
        id: i32,
        to: SubaccountStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Bulk form of `set_subaccount_status` for stop actions and resets.
    /// Every (from, to) pair passed here must be a permitted transition.
    async fn transition_subaccounts(
        &self,
        from: &[SubaccountStatus],
        to: SubaccountStatus,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Attach (or with `None`, detach) the deployed strategy on a slot.
    async fn attach_strategy(
        &self,
        id: i32,
        strategy_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Apply one balance-feed update under the peak/daily-PnL invariants of
    /// [`Subaccount::apply_balance_update`].
    async fn apply_balance_update(
        &self,
        id: i32,
        current_balance: Decimal,
        pnl_delta: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Most recent closed trades for a strategy, newest first.
    async fn recent_closed_trades(&self, strategy_id: i64, limit: i64) -> Result<Vec<Trade>>;

    /// Timestamp of the last balance-feed update, if any.
    async fn heartbeat(&self) -> Result<Option<DateTime<Utc>>>;

    async fn touch_heartbeat(&self, now: DateTime<Utc>) -> Result<()>;
}
