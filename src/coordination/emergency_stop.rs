//! Multi-Scope Emergency Stop Controller
//!
//! Persistent circuit breaker evaluated across four scopes (portfolio,
//! subaccount, strategy, system). Logic is organized as condition-check →
//! idempotent-trigger → action-execution → scoped-reset; the store is the
//! single source of truth between calls.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RiskConfig;
use crate::domain::{
    consecutive_losses, EmergencyStop, ResetTrigger, StopAction, StopReset, StopScope,
    StopViolation, Subaccount, SubaccountStatus, TradePermission, DATA_FEED_SCOPE_ID,
    GLOBAL_SCOPE_ID,
};
use crate::error::{ForgeError, Result};
use crate::exchange::ExecutionClient;
use crate::storage::ControlStore;

/// Extra rows fetched beyond the streak threshold, so the scan can see the
/// first non-losing trade that ends the streak.
const STREAK_FETCH_BUFFER: u32 = 5;

/// Emergency stop controller. One instance per process; the check throttle
/// is per-instance, so each worker evaluates independently against the
/// shared stop state.
pub struct EmergencyStopController<S> {
    store: Arc<S>,
    client: Option<Arc<dyn ExecutionClient>>,
    config: RiskConfig,
    last_check: Mutex<Option<DateTime<Utc>>>,
}

impl<S: ControlStore> EmergencyStopController<S> {
    pub fn new(store: Arc<S>, config: RiskConfig) -> Self {
        Self {
            store,
            client: None,
            config,
            last_check: Mutex::new(None),
        }
    }

    /// Attach the trading-execution client used for `force_close`. Without
    /// one, force-close stops still mark slots STOPPED but skip the
    /// exchange call.
    pub fn with_execution_client(mut self, client: Arc<dyn ExecutionClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Evaluate every stop rule and return the newly-detected violations
    /// without persisting them. Throttled per instance: calls within
    /// `check_interval_seconds` of the previous one return nothing.
    pub async fn check_all_conditions(&self) -> Result<Vec<StopViolation>> {
        let now = Utc::now();
        {
            let mut last = self.last_check.lock().await;
            if let Some(prev) = *last {
                if now - prev < Duration::seconds(self.config.check_interval_seconds as i64) {
                    return Ok(Vec::new());
                }
            }
            *last = Some(now);
        }

        self.evaluate_conditions(now).await
    }

    /// Detect violations and persist a stop for each one. The periodic entry
    /// point for monitor loops.
    pub async fn run_checks(&self) -> Result<Vec<StopViolation>> {
        let violations = self.check_all_conditions().await?;
        for violation in &violations {
            self.trigger_stop(
                violation.scope,
                &violation.scope_id,
                &violation.reason,
                violation.action,
                violation.reset_trigger,
            )
            .await?;
        }
        Ok(violations)
    }

    async fn evaluate_conditions(&self, now: DateTime<Utc>) -> Result<Vec<StopViolation>> {
        let slots = self.store.list_subaccounts().await?;
        let today = now.date_naive();
        let mut violations = Vec::new();

        // Portfolio rules share one scope row; an active portfolio stop
        // suppresses both.
        if !self.is_stopped(StopScope::Portfolio, GLOBAL_SCOPE_ID).await? {
            violations.extend(check_daily_loss(&slots, &self.config, today));
            violations.extend(check_portfolio_drawdown(&slots, &self.config));
        }

        for slot in &slots {
            if self
                .is_stopped(StopScope::Subaccount, &slot.id.to_string())
                .await?
            {
                continue;
            }
            violations.extend(check_subaccount_drawdown(slot, &self.config));
        }

        for slot in &slots {
            let Some(strategy_id) = slot.strategy_id else {
                continue;
            };
            if self
                .is_stopped(StopScope::Strategy, &strategy_id.to_string())
                .await?
            {
                continue;
            }
            let streak = self.consecutive_losses(strategy_id).await?;
            if streak >= self.config.max_consecutive_losses {
                violations.push(StopViolation {
                    scope: StopScope::Strategy,
                    scope_id: strategy_id.to_string(),
                    reason: format!(
                        "strategy {} has {} consecutive losing trades (limit {})",
                        strategy_id, streak, self.config.max_consecutive_losses
                    ),
                    action: StopAction::HaltEntries,
                    reset_trigger: ResetTrigger::After24h,
                });
            }
        }

        if !self.is_stopped(StopScope::System, DATA_FEED_SCOPE_ID).await? {
            // No heartbeat row means the feed has never reported; the rule
            // only fires once data existed and then went quiet.
            if let Some(last_update) = self.store.heartbeat().await? {
                let age = (now - last_update).num_seconds();
                if age > self.config.data_stale_seconds as i64 {
                    violations.push(StopViolation {
                        scope: StopScope::System,
                        scope_id: DATA_FEED_SCOPE_ID.to_string(),
                        reason: format!(
                            "balance data stale: last update {}s ago (limit {}s)",
                            age, self.config.data_stale_seconds
                        ),
                        action: StopAction::HaltEntries,
                        reset_trigger: ResetTrigger::DataValid,
                    });
                }
            }
        }

        if !violations.is_empty() {
            warn!(count = violations.len(), "stop conditions violated");
        }
        Ok(violations)
    }

    /// Persist a stop and execute its action. Idempotent: an already-active
    /// stop for the same (scope, scope_id) is left untouched, original
    /// reason included, and `false` is returned.
    pub async fn trigger_stop(
        &self,
        scope: StopScope,
        scope_id: &str,
        reason: &str,
        action: StopAction,
        reset_trigger: ResetTrigger,
    ) -> Result<bool> {
        if let Some(existing) = self.store.get_stop(scope, scope_id).await? {
            if existing.is_stopped {
                debug!(
                    scope = %scope,
                    scope_id,
                    "stop already active, keeping original reason"
                );
                return Ok(false);
            }
        }

        let now = Utc::now();
        let cooldown_until = reset_trigger.cooldown_from(
            now,
            Duration::hours(self.config.portfolio_dd_cooldown_hours),
            Duration::hours(self.config.strategy_cooldown_hours),
        );

        let stop = EmergencyStop {
            scope,
            scope_id: scope_id.to_string(),
            is_stopped: true,
            stop_reason: Some(reason.to_string()),
            stop_action: Some(action),
            stopped_at: Some(now),
            cooldown_until,
            reset_trigger: Some(reset_trigger),
            updated_at: now,
        };
        self.store.upsert_stop(&stop).await?;

        error!(
            scope = %scope,
            scope_id,
            action = %action,
            reset_trigger = %reset_trigger,
            reason,
            "🚨 emergency stop triggered"
        );

        self.execute_action(scope, scope_id, reason, action).await?;
        Ok(true)
    }

    async fn execute_action(
        &self,
        scope: StopScope,
        scope_id: &str,
        reason: &str,
        action: StopAction,
    ) -> Result<()> {
        match action {
            StopAction::HaltEntries => {
                // Entry permission for the wider scopes is enforced by
                // callers through can_trade; only subaccount stops have a
                // direct side effect.
                if scope == StopScope::Subaccount {
                    let id = parse_subaccount_id(scope_id)?;
                    if self
                        .store
                        .set_subaccount_status(id, SubaccountStatus::Paused, Utc::now())
                        .await?
                    {
                        info!(subaccount_id = id, "subaccount paused");
                    } else {
                        warn!(subaccount_id = id, "could not pause subaccount");
                    }
                }
            }
            StopAction::ForceClose => {
                match &self.client {
                    Some(client) => {
                        if let Err(e) = client.emergency_close_positions(reason).await {
                            // Slots still get stopped; the exchange call is
                            // best-effort.
                            error!(error = %e, "emergency close-all failed");
                        } else {
                            info!("emergency close-all submitted");
                        }
                    }
                    None => {
                        warn!("no execution client configured, skipping close-all call");
                    }
                }

                let stopped = self
                    .store
                    .transition_subaccounts(
                        &[SubaccountStatus::Active],
                        SubaccountStatus::Stopped,
                        Utc::now(),
                    )
                    .await?;
                warn!(stopped, "active capital slots stopped");
            }
        }
        Ok(())
    }

    /// Aggregate the four stop states relevant to a (slot, strategy) pair.
    pub async fn can_trade(&self, subaccount_id: i32, strategy_id: i64) -> Result<TradePermission> {
        let lookups = [
            (StopScope::Portfolio, GLOBAL_SCOPE_ID.to_string()),
            (StopScope::System, DATA_FEED_SCOPE_ID.to_string()),
            (StopScope::Subaccount, subaccount_id.to_string()),
            (StopScope::Strategy, strategy_id.to_string()),
        ];

        let mut stops = Vec::with_capacity(lookups.len());
        for (scope, scope_id) in lookups {
            if let Some(stop) = self.store.get_stop(scope, &scope_id).await? {
                stops.push(stop);
            }
        }
        Ok(TradePermission::aggregate(&stops))
    }

    /// Scan active stops and clear every one whose reset condition now
    /// holds. Returns the stops that were cleared.
    pub async fn check_auto_resets(&self) -> Result<Vec<StopReset>> {
        let now = Utc::now();
        let mut resets = Vec::new();

        for stop in self.store.active_stops().await? {
            let Some(trigger) = stop.reset_trigger else {
                continue;
            };
            let due = match trigger {
                ResetTrigger::MidnightUtc | ResetTrigger::After24h => stop.cooldown_elapsed(now),
                ResetTrigger::Cooldown48hRotation => {
                    stop.cooldown_elapsed(now) && !self.has_blocking_live_loss().await?
                }
                ResetTrigger::DataValid => self.is_data_fresh(now).await?,
                // Cleared only by the rotator's explicit hook
                ResetTrigger::Rotation => false,
            };
            if !due {
                continue;
            }

            self.reset_stop(&stop, now).await?;
            resets.push(StopReset {
                scope: stop.scope,
                scope_id: stop.scope_id.clone(),
                reset_trigger: trigger,
            });
        }

        Ok(resets)
    }

    /// Rotator hook: after redeploying a slot, clear a rotation-triggered
    /// stop for that slot only.
    pub async fn reset_on_rotation(&self, subaccount_id: i32) -> Result<bool> {
        let scope_id = subaccount_id.to_string();
        let Some(stop) = self.store.get_stop(StopScope::Subaccount, &scope_id).await? else {
            return Ok(false);
        };
        if !stop.is_stopped || stop.reset_trigger != Some(ResetTrigger::Rotation) {
            return Ok(false);
        }

        self.reset_stop(&stop, Utc::now()).await?;
        Ok(true)
    }

    /// Operator hook: clear an active stop regardless of its reset policy.
    pub async fn reset_manual(&self, scope: StopScope, scope_id: &str) -> Result<bool> {
        let Some(stop) = self.store.get_stop(scope, scope_id).await? else {
            return Ok(false);
        };
        if !stop.is_stopped {
            return Ok(false);
        }
        self.reset_stop(&stop, Utc::now()).await?;
        Ok(true)
    }

    async fn reset_stop(&self, stop: &EmergencyStop, now: DateTime<Utc>) -> Result<()> {
        self.store.clear_stop(stop.scope, &stop.scope_id, now).await?;

        match stop.scope {
            StopScope::Subaccount => {
                let id = parse_subaccount_id(&stop.scope_id)?;
                if let Some(slot) = self.store.get_subaccount(id).await? {
                    if matches!(
                        slot.status,
                        SubaccountStatus::Paused | SubaccountStatus::Stopped
                    ) {
                        self.store
                            .set_subaccount_status(id, SubaccountStatus::Active, now)
                            .await?;
                    }
                }
            }
            StopScope::Portfolio => {
                let reactivated = self
                    .store
                    .transition_subaccounts(
                        &[SubaccountStatus::Paused, SubaccountStatus::Stopped],
                        SubaccountStatus::Active,
                        now,
                    )
                    .await?;
                info!(reactivated, "capital slots reactivated");
            }
            StopScope::Strategy | StopScope::System => {}
        }

        info!(scope = %stop.scope, scope_id = %stop.scope_id, "emergency stop reset");
        Ok(())
    }

    /// Balance-feed entry point: update a slot's balance fields and refresh
    /// the data-freshness heartbeat.
    pub async fn update_balances(
        &self,
        subaccount_id: i32,
        current_balance: Decimal,
        pnl_delta: Decimal,
    ) -> Result<bool> {
        let now = Utc::now();
        let updated = self
            .store
            .apply_balance_update(subaccount_id, current_balance, pnl_delta, now)
            .await?;
        if !updated {
            warn!(subaccount_id, "balance update for unknown subaccount");
        }
        self.store.touch_heartbeat(now).await?;
        Ok(updated)
    }

    /// Heartbeat-only refresh for balance polls that change nothing.
    pub async fn mark_data_fresh(&self) -> Result<()> {
        self.store.touch_heartbeat(Utc::now()).await
    }

    /// Losing streak for a strategy, counted newest-first over closed trades.
    pub async fn consecutive_losses(&self, strategy_id: i64) -> Result<u32> {
        let limit = (self.config.max_consecutive_losses + STREAK_FETCH_BUFFER) as i64;
        let trades = self.store.recent_closed_trades(strategy_id, limit).await?;
        Ok(consecutive_losses(&trades))
    }

    /// Currently-active stops, for status displays.
    pub async fn active_stops(&self) -> Result<Vec<EmergencyStop>> {
        self.store.active_stops().await
    }

    async fn is_stopped(&self, scope: StopScope, scope_id: &str) -> Result<bool> {
        Ok(self
            .store
            .get_stop(scope, scope_id)
            .await?
            .map(|s| s.is_stopped)
            .unwrap_or(false))
    }

    /// Does any deployed slot still carry a loss beyond the rotation
    /// threshold? Evaluated at check time: a loser deployed after the
    /// drawdown stop blocks the reset just the same.
    async fn has_blocking_live_loss(&self) -> Result<bool> {
        let slots = self.store.list_subaccounts().await?;
        Ok(slots.iter().any(|slot| {
            slot.is_deployed()
                && matches!(
                    slot.net_pnl(),
                    Some(pnl) if pnl < -self.config.rotation_loss_threshold
                )
        }))
    }

    async fn is_data_fresh(&self, now: DateTime<Utc>) -> Result<bool> {
        match self.store.heartbeat().await? {
            Some(last_update) => {
                Ok((now - last_update).num_seconds() <= self.config.data_stale_seconds as i64)
            }
            None => Ok(false),
        }
    }
}

fn parse_subaccount_id(scope_id: &str) -> Result<i32> {
    scope_id
        .parse()
        .map_err(|_| ForgeError::Validation(format!("invalid subaccount scope_id: {scope_id}")))
}

fn check_daily_loss(
    slots: &[Subaccount],
    config: &RiskConfig,
    today: NaiveDate,
) -> Option<StopViolation> {
    let total_allocated: Decimal = slots.iter().map(|s| s.allocated_capital).sum();
    if total_allocated <= Decimal::ZERO {
        return None;
    }

    // Only PnL accumulated for the current UTC day counts; a slot that has
    // not been updated today still carries yesterday's figure.
    let daily_pnl: Decimal = slots
        .iter()
        .filter(|s| s.daily_pnl_reset_date == Some(today))
        .map(|s| s.daily_pnl_usd)
        .sum();
    if daily_pnl >= Decimal::ZERO {
        return None;
    }

    let loss_pct = -daily_pnl / total_allocated;
    if loss_pct < config.max_daily_loss {
        return None;
    }

    Some(StopViolation {
        scope: StopScope::Portfolio,
        scope_id: GLOBAL_SCOPE_ID.to_string(),
        reason: format!(
            "daily loss {}% of allocated capital (limit {}%)",
            (loss_pct * dec!(100)).round_dp(2),
            (config.max_daily_loss * dec!(100)).round_dp(2)
        ),
        action: StopAction::HaltEntries,
        reset_trigger: ResetTrigger::MidnightUtc,
    })
}

fn check_portfolio_drawdown(slots: &[Subaccount], config: &RiskConfig) -> Option<StopViolation> {
    let relevant: Vec<&Subaccount> = slots
        .iter()
        .filter(|s| matches!(s.status, SubaccountStatus::Active | SubaccountStatus::Paused))
        .collect();

    let peak: Decimal = relevant.iter().filter_map(|s| s.peak_balance).sum();
    let current: Decimal = relevant.iter().filter_map(|s| s.current_balance).sum();
    if peak <= Decimal::ZERO {
        return None;
    }

    let drawdown = (peak - current) / peak;
    if drawdown < config.max_portfolio_drawdown {
        return None;
    }

    Some(StopViolation {
        scope: StopScope::Portfolio,
        scope_id: GLOBAL_SCOPE_ID.to_string(),
        reason: format!(
            "portfolio drawdown {}% from peak (limit {}%)",
            (drawdown * dec!(100)).round_dp(2),
            (config.max_portfolio_drawdown * dec!(100)).round_dp(2)
        ),
        action: StopAction::ForceClose,
        reset_trigger: ResetTrigger::Cooldown48hRotation,
    })
}

fn check_subaccount_drawdown(slot: &Subaccount, config: &RiskConfig) -> Option<StopViolation> {
    let drawdown = slot.drawdown()?;
    if drawdown < config.max_subaccount_drawdown {
        return None;
    }

    Some(StopViolation {
        scope: StopScope::Subaccount,
        scope_id: slot.id.to_string(),
        reason: format!(
            "subaccount {} drawdown {}% from peak (limit {}%)",
            slot.id,
            (drawdown * dec!(100)).round_dp(2),
            (config.max_subaccount_drawdown * dec!(100)).round_dp(2)
        ),
        action: StopAction::HaltEntries,
        reset_trigger: ResetTrigger::Rotation,
    })
}
