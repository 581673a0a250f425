use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::{
    EmergencyStop, NewStrategy, StopScope, Strategy, StrategyStatus, Subaccount, SubaccountStatus,
    Trade,
};
use crate::error::Result;
use crate::storage::{ControlStore, WorkQueueStore};

/// In-process storage adapter with the same observable semantics as the
/// Postgres store. Claims are compare-and-swap under a single mutex, which
/// trivially satisfies the one-owner-per-row contract. Backs `--dry-run`
/// operation and the integration test suites.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_strategy_id: i64,
    strategies: BTreeMap<i64, Strategy>,
    subaccounts: BTreeMap<i32, Subaccount>,
    stops: BTreeMap<(StopScope, String), EmergencyStop>,
    trades: Vec<Trade>,
    heartbeat: Option<DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a fully-populated slot record. Test and dry-run
    /// seeding hook; production provisioning goes through
    /// [`ControlStore::upsert_subaccount`].
    pub async fn put_subaccount(&self, subaccount: Subaccount) {
        let mut inner = self.inner.lock().await;
        inner.subaccounts.insert(subaccount.id, subaccount);
    }

    /// Append a trade to the ledger. The ledger is read-only to the core, so
    /// only tests and dry-run feeds write here.
    pub async fn push_trade(&self, mut trade: Trade) {
        let mut inner = self.inner.lock().await;
        trade.id = inner.trades.len() as i64 + 1;
        inner.trades.push(trade);
    }

    /// Rewrite a claim's start timestamp, as if it had been taken earlier.
    /// Lets tests exercise the stale-claim boundary without waiting.
    pub async fn backdate_claim(&self, id: i64, started_at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.strategies.get_mut(&id) {
            Some(item) if item.processing_by.is_some() => {
                item.processing_started_at = Some(started_at);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl WorkQueueStore for MemoryStore {
    async fn insert_strategy(&self, new: &NewStrategy) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        inner.next_strategy_id += 1;
        let id = inner.next_strategy_id;
        let now = Utc::now();
        inner.strategies.insert(
            id,
            Strategy {
                id,
                name: new.name.clone(),
                status: new.status,
                code: new.code.clone(),
                params: new.params.clone(),
                processing_by: None,
                processing_started_at: None,
                last_error: None,
                status_changed_at: now,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get_strategy(&self, id: i64) -> Result<Option<Strategy>> {
        let inner = self.inner.lock().await;
        Ok(inner.strategies.get(&id).cloned())
    }

    async fn try_claim_one(
        &self,
        status: StrategyStatus,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Strategy>> {
        let mut inner = self.inner.lock().await;
        let candidate = inner
            .strategies
            .values()
            .find(|s| s.status == status && s.is_available())
            .map(|s| s.id);

        if let Some(item) = candidate.and_then(|id| inner.strategies.get_mut(&id)) {
            item.processing_by = Some(owner.to_string());
            item.processing_started_at = Some(now);
            item.updated_at = now;
            return Ok(Some(item.clone()));
        }
        Ok(None)
    }

    async fn release_claim(
        &self,
        id: i64,
        owner: &str,
        new_status: StrategyStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.strategies.get_mut(&id) {
            Some(item) if item.processing_by.as_deref() == Some(owner) => {
                item.status = new_status;
                item.processing_by = None;
                item.processing_started_at = None;
                item.last_error = None;
                item.status_changed_at = now;
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_claim(
        &self,
        id: i64,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.strategies.get_mut(&id) {
            Some(item) if item.processing_by.as_deref() == Some(owner) => {
                item.status = StrategyStatus::Failed;
                item.processing_by = None;
                item.processing_started_at = None;
                item.last_error = Some(error.to_string());
                item.status_changed_at = now;
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_claimed(&self, id: i64, owner: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let owned = matches!(
            inner.strategies.get(&id),
            Some(item) if item.processing_by.as_deref() == Some(owner)
        );
        if owned {
            inner.strategies.remove(&id);
        }
        Ok(owned)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut released = 0;
        for item in inner.strategies.values_mut() {
            if item.is_claim_stale(cutoff) {
                item.processing_by = None;
                item.processing_started_at = None;
                item.updated_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_all_by_owner(&self, owner: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut released = 0;
        for item in inner.strategies.values_mut() {
            if item.processing_by.as_deref() == Some(owner) {
                item.processing_by = None;
                item.processing_started_at = None;
                item.updated_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn queue_depths(&self) -> Result<Vec<(StrategyStatus, i64)>> {
        let inner = self.inner.lock().await;
        let mut depths: BTreeMap<StrategyStatus, i64> = BTreeMap::new();
        for item in inner.strategies.values().filter(|s| s.is_available()) {
            *depths.entry(item.status).or_default() += 1;
        }
        Ok(depths.into_iter().collect())
    }
}

#[async_trait]
impl ControlStore for MemoryStore {
    async fn get_stop(&self, scope: StopScope, scope_id: &str) -> Result<Option<EmergencyStop>> {
        let inner = self.inner.lock().await;
        Ok(inner.stops.get(&(scope, scope_id.to_string())).cloned())
    }

    async fn active_stops(&self) -> Result<Vec<EmergencyStop>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .stops
            .values()
            .filter(|s| s.is_stopped)
            .cloned()
            .collect())
    }

    async fn upsert_stop(&self, stop: &EmergencyStop) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .stops
            .insert((stop.scope, stop.scope_id.clone()), stop.clone());
        Ok(())
    }

    async fn clear_stop(
        &self,
        scope: StopScope,
        scope_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.stops.get_mut(&(scope, scope_id.to_string())) {
            Some(stop) if stop.is_stopped => {
                stop.is_stopped = false;
                stop.stop_reason = None;
                stop.stop_action = None;
                stop.stopped_at = None;
                stop.cooldown_until = None;
                stop.reset_trigger = None;
                stop.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_subaccount(&self, id: i32, allocated_capital: Decimal) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.subaccounts.contains_key(&id) {
            return Ok(false);
        }
        inner
            .subaccounts
            .insert(id, Subaccount::provisioned(id, allocated_capital, Utc::now()));
        Ok(true)
    }

    async fn list_subaccounts(&self) -> Result<Vec<Subaccount>> {
        let inner = self.inner.lock().await;
        Ok(inner.subaccounts.values().cloned().collect())
    }

    async fn get_subaccount(&self, id: i32) -> Result<Option<Subaccount>> {
        let inner = self.inner.lock().await;
        Ok(inner.subaccounts.get(&id).cloned())
    }

    async fn set_subaccount_status(
        &self,
        id: i32,
        to: SubaccountStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.subaccounts.get_mut(&id) else {
            return Ok(false);
        };
        if slot.status == to {
            return Ok(true);
        }
        if !slot.status.can_transition_to(to) {
            warn!(
                subaccount_id = id,
                from = %slot.status,
                to = %to,
                "refusing subaccount status transition"
            );
            return Ok(false);
        }
        slot.status = to;
        slot.updated_at = now;
        Ok(true)
    }

    async fn transition_subaccounts(
        &self,
        from: &[SubaccountStatus],
        to: SubaccountStatus,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut moved = 0;
        for slot in inner.subaccounts.values_mut() {
            if from.contains(&slot.status) {
                slot.status = to;
                slot.updated_at = now;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn attach_strategy(
        &self,
        id: i32,
        strategy_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.subaccounts.get_mut(&id) {
            Some(slot) => {
                slot.strategy_id = strategy_id;
                slot.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn apply_balance_update(
        &self,
        id: i32,
        current_balance: Decimal,
        pnl_delta: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.subaccounts.get_mut(&id) {
            Some(slot) => {
                slot.apply_balance_update(current_balance, pnl_delta, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn recent_closed_trades(&self, strategy_id: i64, limit: i64) -> Result<Vec<Trade>> {
        let inner = self.inner.lock().await;
        let mut closed: Vec<Trade> = inner
            .trades
            .iter()
            .filter(|t| t.strategy_id == strategy_id && t.is_closed())
            .cloned()
            .collect();
        closed.sort_by(|a, b| b.exit_time.cmp(&a.exit_time));
        closed.truncate(limit.max(0) as usize);
        Ok(closed)
    }

    async fn heartbeat(&self) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().await;
        Ok(inner.heartbeat)
    }

    async fn touch_heartbeat(&self, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.heartbeat = Some(now);
        Ok(())
    }
}
