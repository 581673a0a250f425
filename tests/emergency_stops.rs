//! Emergency stop controller against the in-memory store: rule scenarios,
//! idempotent triggering, permission aggregation, and reset policies.

use async_trait::async_trait;
use chrono::{Duration, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};

use stratforge::adapters::MemoryStore;
use stratforge::config::{AppConfig, RiskConfig};
use stratforge::coordination::EmergencyStopController;
use stratforge::domain::{
    EmergencyStop, ResetTrigger, StopAction, StopScope, Subaccount, SubaccountStatus, Trade,
    GLOBAL_SCOPE_ID,
};
use stratforge::error::Result;
use stratforge::exchange::ExecutionClient;
use stratforge::storage::ControlStore;

fn risk() -> RiskConfig {
    AppConfig::default_config().risk
}

fn controller(store: &Arc<MemoryStore>) -> EmergencyStopController<MemoryStore> {
    EmergencyStopController::new(store.clone(), risk())
}

struct SlotSpec {
    id: i32,
    status: SubaccountStatus,
    allocated: Decimal,
    current: Option<Decimal>,
    peak: Option<Decimal>,
    daily_pnl: Decimal,
    strategy_id: Option<i64>,
}

impl SlotSpec {
    fn new(id: i32, status: SubaccountStatus, allocated: Decimal) -> Self {
        Self {
            id,
            status,
            allocated,
            current: None,
            peak: None,
            daily_pnl: Decimal::ZERO,
            strategy_id: None,
        }
    }

    fn balances(mut self, current: Decimal, peak: Decimal) -> Self {
        self.current = Some(current);
        self.peak = Some(peak);
        self
    }

    fn daily_pnl(mut self, pnl: Decimal) -> Self {
        self.daily_pnl = pnl;
        self
    }

    fn deployed(mut self, strategy_id: i64) -> Self {
        self.strategy_id = Some(strategy_id);
        self
    }
}

async fn seed_slot(store: &Arc<MemoryStore>, spec: SlotSpec) {
    let now = Utc::now();
    let mut slot = Subaccount::provisioned(spec.id, spec.allocated, now);
    slot.status = spec.status;
    slot.current_balance = spec.current;
    slot.peak_balance = spec.peak;
    slot.daily_pnl_usd = spec.daily_pnl;
    slot.daily_pnl_reset_date = Some(now.date_naive());
    slot.strategy_id = spec.strategy_id;
    store.put_subaccount(slot).await;
}

async fn seed_losing_streak(store: &Arc<MemoryStore>, strategy_id: i64, losses: usize) {
    let base = Utc::now() - Duration::hours(losses as i64 + 2);

    // Oldest trade is a winner; everything after it loses
    store
        .push_trade(Trade {
            id: 0,
            strategy_id,
            subaccount_id: Some(1),
            entry_time: base - Duration::hours(1),
            exit_time: Some(base),
            pnl_usd: Some(dec!(12)),
        })
        .await;

    for i in 0..losses {
        let exit = base + Duration::hours(i as i64 + 1);
        store
            .push_trade(Trade {
                id: 0,
                strategy_id,
                subaccount_id: Some(1),
                entry_time: exit - Duration::minutes(30),
                exit_time: Some(exit),
                pnl_usd: Some(dec!(-4)),
            })
            .await;
    }
}

/// Hand-rolled execution client recording close-all invocations
#[derive(Default)]
struct RecordingClient {
    reasons: Mutex<Vec<String>>,
}

#[async_trait]
impl ExecutionClient for RecordingClient {
    fn is_dry_run(&self) -> bool {
        true
    }

    async fn emergency_close_positions(&self, reason: &str) -> Result<()> {
        self.reasons.lock().unwrap().push(reason.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn daily_loss_halts_the_portfolio_until_midnight() {
    let store = Arc::new(MemoryStore::new());
    // $1000 allocated, $105 lost today = 10.5% >= 10%
    seed_slot(
        &store,
        SlotSpec::new(1, SubaccountStatus::Active, dec!(500)).daily_pnl(dec!(-55)),
    )
    .await;
    seed_slot(
        &store,
        SlotSpec::new(2, SubaccountStatus::Active, dec!(500)).daily_pnl(dec!(-50)),
    )
    .await;

    let controller = controller(&store);
    let violations = controller.run_checks().await.unwrap();

    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].scope, StopScope::Portfolio);
    assert_eq!(violations[0].action, StopAction::HaltEntries);
    assert_eq!(violations[0].reset_trigger, ResetTrigger::MidnightUtc);

    let stop = store
        .get_stop(StopScope::Portfolio, GLOBAL_SCOPE_ID)
        .await
        .unwrap()
        .unwrap();
    assert!(stop.is_stopped);
    let cooldown = stop.cooldown_until.unwrap();
    assert!(cooldown > Utc::now());
    assert_eq!(cooldown.time(), NaiveTime::MIN);

    let permission = controller.can_trade(1, 99).await.unwrap();
    assert!(!permission.allowed);
    assert_eq!(permission.blocked_by, vec!["portfolio"]);
}

#[tokio::test]
async fn checks_are_throttled_per_controller_instance() {
    let store = Arc::new(MemoryStore::new());
    seed_slot(
        &store,
        SlotSpec::new(1, SubaccountStatus::Active, dec!(500)).daily_pnl(dec!(-500)),
    )
    .await;

    let controller = controller(&store);
    assert_eq!(controller.check_all_conditions().await.unwrap().len(), 1);
    // Within check_interval_seconds the same instance reports nothing
    assert!(controller.check_all_conditions().await.unwrap().is_empty());
}

#[tokio::test]
async fn portfolio_drawdown_force_closes_and_stops_active_slots() {
    let store = Arc::new(MemoryStore::new());
    // Aggregate peak 10000 vs current 7800 = 22% >= 20%; per-slot 22% < 25%
    seed_slot(
        &store,
        SlotSpec::new(1, SubaccountStatus::Active, dec!(5000)).balances(dec!(3900), dec!(5000)),
    )
    .await;
    seed_slot(
        &store,
        SlotSpec::new(2, SubaccountStatus::Active, dec!(5000)).balances(dec!(3900), dec!(5000)),
    )
    .await;

    let client = Arc::new(RecordingClient::default());
    let controller = EmergencyStopController::new(store.clone(), risk())
        .with_execution_client(client.clone());

    let before = Utc::now();
    let violations = controller.run_checks().await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].action, StopAction::ForceClose);
    assert_eq!(violations[0].reset_trigger, ResetTrigger::Cooldown48hRotation);

    // Exchange close-all was invoked with the persisted reason
    let reasons = client.reasons.lock().unwrap().clone();
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].contains("drawdown"));

    // Every ACTIVE slot is stopped
    for slot in store.list_subaccounts().await.unwrap() {
        assert_eq!(slot.status, SubaccountStatus::Stopped);
    }

    let stop = store
        .get_stop(StopScope::Portfolio, GLOBAL_SCOPE_ID)
        .await
        .unwrap()
        .unwrap();
    let cooldown = stop.cooldown_until.unwrap();
    let delta = cooldown - (before + Duration::hours(48));
    assert!(delta.num_seconds().abs() < 10);
}

#[tokio::test]
async fn subaccount_drawdown_pauses_only_that_slot() {
    let store = Arc::new(MemoryStore::new());
    // 30% >= 25% on slot 3; slot 4 healthy
    seed_slot(
        &store,
        SlotSpec::new(3, SubaccountStatus::Active, dec!(500)).balances(dec!(420), dec!(600)),
    )
    .await;
    seed_slot(
        &store,
        SlotSpec::new(4, SubaccountStatus::Active, dec!(500)).balances(dec!(590), dec!(600)),
    )
    .await;

    let controller = controller(&store);
    let violations = controller.run_checks().await.unwrap();

    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].scope, StopScope::Subaccount);
    assert_eq!(violations[0].scope_id, "3");
    assert_eq!(violations[0].reset_trigger, ResetTrigger::Rotation);

    let slots = store.list_subaccounts().await.unwrap();
    assert_eq!(slots[0].status, SubaccountStatus::Paused);
    assert_eq!(slots[1].status, SubaccountStatus::Active);
}

#[tokio::test]
async fn consecutive_losses_halt_the_strategy_for_24h() {
    let store = Arc::new(MemoryStore::new());
    // Provision the slot the way the rotator would: create, activate, deploy
    assert!(store.upsert_subaccount(1, dec!(500)).await.unwrap());
    assert!(store
        .set_subaccount_status(1, SubaccountStatus::Active, Utc::now())
        .await
        .unwrap());
    assert!(store.attach_strategy(1, Some(7), Utc::now()).await.unwrap());
    seed_losing_streak(&store, 7, 10).await;

    let controller = controller(&store);
    assert_eq!(controller.consecutive_losses(7).await.unwrap(), 10);

    let before = Utc::now();
    let violations = controller.run_checks().await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].scope, StopScope::Strategy);
    assert_eq!(violations[0].scope_id, "7");
    assert_eq!(violations[0].reset_trigger, ResetTrigger::After24h);

    let stop = store
        .get_stop(StopScope::Strategy, "7")
        .await
        .unwrap()
        .unwrap();
    let delta = stop.cooldown_until.unwrap() - (before + Duration::hours(24));
    assert!(delta.num_seconds().abs() < 10);

    let permission = controller.can_trade(1, 7).await.unwrap();
    assert!(!permission.allowed);
    assert_eq!(permission.blocked_by, vec!["strategy_7"]);
}

#[tokio::test]
async fn nine_losses_do_not_trip_a_ten_loss_limit() {
    let store = Arc::new(MemoryStore::new());
    seed_slot(
        &store,
        SlotSpec::new(1, SubaccountStatus::Active, dec!(500)).deployed(7),
    )
    .await;
    seed_losing_streak(&store, 7, 9).await;

    let controller = controller(&store);
    assert!(controller.run_checks().await.unwrap().is_empty());
}

#[tokio::test]
async fn trigger_is_idempotent_and_keeps_the_first_reason() {
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&store);

    assert!(controller
        .trigger_stop(
            StopScope::Strategy,
            "42",
            "first reason",
            StopAction::HaltEntries,
            ResetTrigger::After24h,
        )
        .await
        .unwrap());
    assert!(!controller
        .trigger_stop(
            StopScope::Strategy,
            "42",
            "second reason",
            StopAction::HaltEntries,
            ResetTrigger::After24h,
        )
        .await
        .unwrap());

    let stops = store.active_stops().await.unwrap();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].stop_reason.as_deref(), Some("first reason"));
}

#[tokio::test]
async fn can_trade_aggregates_every_blocking_scope() {
    let store = Arc::new(MemoryStore::new());
    seed_slot(&store, SlotSpec::new(3, SubaccountStatus::Active, dec!(500))).await;

    let controller = controller(&store);
    controller
        .trigger_stop(
            StopScope::Subaccount,
            "3",
            "slot drawdown",
            StopAction::HaltEntries,
            ResetTrigger::Rotation,
        )
        .await
        .unwrap();
    controller
        .trigger_stop(
            StopScope::Strategy,
            "42",
            "losing streak",
            StopAction::HaltEntries,
            ResetTrigger::After24h,
        )
        .await
        .unwrap();

    let permission = controller.can_trade(3, 42).await.unwrap();
    assert!(!permission.allowed);
    assert!(permission.blocked_by.contains(&"subaccount_3".to_string()));
    assert!(permission.blocked_by.contains(&"strategy_42".to_string()));
    assert_eq!(permission.reasons.len(), 2);
    // The 24h strategy cooldown is the latest one
    let cooldown = permission.cooldown_until.unwrap();
    assert!(cooldown > Utc::now() + Duration::hours(23));

    // An unaffected pair still trades
    let other = controller.can_trade(4, 99).await.unwrap();
    assert!(other.allowed);
}

#[tokio::test]
async fn auto_reset_clears_elapsed_cooldowns_only() {
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&store);
    let now = Utc::now();

    for (scope_id, cooldown_until) in [
        ("7", now - Duration::seconds(1)),
        ("8", now + Duration::hours(1)),
    ] {
        store
            .upsert_stop(&EmergencyStop {
                scope: StopScope::Strategy,
                scope_id: scope_id.to_string(),
                is_stopped: true,
                stop_reason: Some("losing streak".to_string()),
                stop_action: Some(StopAction::HaltEntries),
                stopped_at: Some(now - Duration::hours(24)),
                cooldown_until: Some(cooldown_until),
                reset_trigger: Some(ResetTrigger::After24h),
                updated_at: now,
            })
            .await
            .unwrap();
    }

    let resets = controller.check_auto_resets().await.unwrap();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].scope_id, "7");

    let cleared = store.get_stop(StopScope::Strategy, "7").await.unwrap().unwrap();
    assert!(!cleared.is_stopped);
    assert!(cleared.stop_reason.is_none());
    assert!(cleared.cooldown_until.is_none());

    let held = store.get_stop(StopScope::Strategy, "8").await.unwrap().unwrap();
    assert!(held.is_stopped);
}

#[tokio::test]
async fn portfolio_drawdown_reset_waits_for_losing_deployments() {
    let store = Arc::new(MemoryStore::new());
    // Deployed slot bleeding $300 against a $250 rotation threshold
    seed_slot(
        &store,
        SlotSpec::new(1, SubaccountStatus::Stopped, dec!(500))
            .balances(dec!(200), dec!(500))
            .deployed(7),
    )
    .await;

    let controller = controller(&store);
    let now = Utc::now();
    store
        .upsert_stop(&EmergencyStop {
            scope: StopScope::Portfolio,
            scope_id: GLOBAL_SCOPE_ID.to_string(),
            is_stopped: true,
            stop_reason: Some("portfolio drawdown".to_string()),
            stop_action: Some(StopAction::ForceClose),
            stopped_at: Some(now - Duration::hours(49)),
            cooldown_until: Some(now - Duration::hours(1)),
            reset_trigger: Some(ResetTrigger::Cooldown48hRotation),
            updated_at: now,
        })
        .await
        .unwrap();

    // Cooldown elapsed but the loser blocks the reset
    assert!(controller.check_auto_resets().await.unwrap().is_empty());

    // Balance recovers to a tolerable loss; reset proceeds and slots rejoin
    controller.update_balances(1, dec!(400), dec!(200)).await.unwrap();
    let resets = controller.check_auto_resets().await.unwrap();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].scope, StopScope::Portfolio);

    let slot = store.get_subaccount(1).await.unwrap().unwrap();
    assert_eq!(slot.status, SubaccountStatus::Active);
}

#[tokio::test]
async fn stale_balance_feed_halts_and_recovers_via_data_valid() {
    let store = Arc::new(MemoryStore::new());
    seed_slot(&store, SlotSpec::new(1, SubaccountStatus::Active, dec!(500))).await;
    // Feed last reported 2000s ago against a 900s limit
    store
        .touch_heartbeat(Utc::now() - Duration::seconds(2000))
        .await
        .unwrap();

    let controller = controller(&store);
    let violations = controller.run_checks().await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].scope, StopScope::System);
    assert_eq!(violations[0].reset_trigger, ResetTrigger::DataValid);

    let permission = controller.can_trade(1, 1).await.unwrap();
    assert_eq!(permission.blocked_by, vec!["system"]);
    assert!(permission.cooldown_until.is_none());

    // Stop holds while the feed stays quiet
    assert!(controller.check_auto_resets().await.unwrap().is_empty());

    controller.mark_data_fresh().await.unwrap();
    let resets = controller.check_auto_resets().await.unwrap();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].scope, StopScope::System);
}

#[tokio::test]
async fn silent_feed_that_never_reported_does_not_trip() {
    let store = Arc::new(MemoryStore::new());
    seed_slot(&store, SlotSpec::new(1, SubaccountStatus::Active, dec!(500))).await;

    let controller = controller(&store);
    assert!(controller.run_checks().await.unwrap().is_empty());
}

#[tokio::test]
async fn rotation_reset_clears_only_rotation_stops() {
    let store = Arc::new(MemoryStore::new());
    seed_slot(
        &store,
        SlotSpec::new(3, SubaccountStatus::Active, dec!(500)).balances(dec!(420), dec!(600)),
    )
    .await;

    let controller = controller(&store);
    controller.run_checks().await.unwrap();
    assert_eq!(
        store.get_subaccount(3).await.unwrap().unwrap().status,
        SubaccountStatus::Paused
    );

    // The auto-reset sweep never clears rotation stops
    assert!(controller.check_auto_resets().await.unwrap().is_empty());

    assert!(controller.reset_on_rotation(3).await.unwrap());
    assert_eq!(
        store.get_subaccount(3).await.unwrap().unwrap().status,
        SubaccountStatus::Active
    );
    // Nothing left to reset
    assert!(!controller.reset_on_rotation(3).await.unwrap());
}

#[tokio::test]
async fn rotation_reset_ignores_time_based_stops() {
    let store = Arc::new(MemoryStore::new());
    seed_slot(&store, SlotSpec::new(5, SubaccountStatus::Active, dec!(500))).await;

    let controller = controller(&store);
    controller
        .trigger_stop(
            StopScope::Subaccount,
            "5",
            "manual pause",
            StopAction::HaltEntries,
            ResetTrigger::After24h,
        )
        .await
        .unwrap();

    assert!(!controller.reset_on_rotation(5).await.unwrap());
    let stop = store.get_stop(StopScope::Subaccount, "5").await.unwrap().unwrap();
    assert!(stop.is_stopped);
}

#[tokio::test]
async fn balance_updates_refresh_the_heartbeat() {
    let store = Arc::new(MemoryStore::new());
    seed_slot(&store, SlotSpec::new(1, SubaccountStatus::Active, dec!(500))).await;

    let controller = controller(&store);
    assert!(store.heartbeat().await.unwrap().is_none());

    assert!(controller.update_balances(1, dec!(510), dec!(10)).await.unwrap());
    let heartbeat = store.heartbeat().await.unwrap().unwrap();
    assert!(Utc::now() - heartbeat < Duration::seconds(5));

    let slot = store.get_subaccount(1).await.unwrap().unwrap();
    assert_eq!(slot.current_balance, Some(dec!(510)));
    assert_eq!(slot.peak_balance, Some(dec!(510)));
    assert_eq!(slot.daily_pnl_usd, dec!(10));
}
