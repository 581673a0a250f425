use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, warn};

use crate::domain::{
    EmergencyStop, NewStrategy, ResetTrigger, StopAction, StopScope, Strategy, StrategyStatus,
    Subaccount, SubaccountStatus, Trade,
};
use crate::error::{ForgeError, Result};
use crate::storage::{ControlStore, WorkQueueStore};

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn strategy_from_row(row: &PgRow) -> Result<Strategy> {
    let status: String = row.get("status");
    Ok(Strategy {
        id: row.get("id"),
        name: row.get("name"),
        status: StrategyStatus::try_from(status.as_str()).map_err(ForgeError::UnknownStatus)?,
        code: row.get("code"),
        params: row.get("params"),
        processing_by: row.get("processing_by"),
        processing_started_at: row.get("processing_started_at"),
        last_error: row.get("last_error"),
        status_changed_at: row.get("status_changed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn subaccount_from_row(row: &PgRow) -> Result<Subaccount> {
    let status: String = row.get("status");
    Ok(Subaccount {
        id: row.get("id"),
        status: SubaccountStatus::try_from(status.as_str()).map_err(ForgeError::UnknownStatus)?,
        allocated_capital: row.get("allocated_capital"),
        current_balance: row.get("current_balance"),
        peak_balance: row.get("peak_balance"),
        peak_balance_updated_at: row.get("peak_balance_updated_at"),
        daily_pnl_usd: row.get("daily_pnl_usd"),
        daily_pnl_reset_date: row.get("daily_pnl_reset_date"),
        strategy_id: row.get("strategy_id"),
        updated_at: row.get("updated_at"),
    })
}

fn stop_from_row(row: &PgRow) -> Result<EmergencyStop> {
    let scope: String = row.get("scope");
    Ok(EmergencyStop {
        scope: StopScope::try_from(scope.as_str()).map_err(ForgeError::UnknownStatus)?,
        scope_id: row.get("scope_id"),
        is_stopped: row.get("is_stopped"),
        stop_reason: row.get("stop_reason"),
        stop_action: row
            .get::<Option<String>, _>("stop_action")
            .and_then(|s| StopAction::try_from(s.as_str()).ok()),
        stopped_at: row.get("stopped_at"),
        cooldown_until: row.get("cooldown_until"),
        reset_trigger: row
            .get::<Option<String>, _>("reset_trigger")
            .and_then(|s| ResetTrigger::try_from(s.as_str()).ok()),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl WorkQueueStore for PostgresStore {
    async fn insert_strategy(&self, new: &NewStrategy) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO strategies (name, status, code, params)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&new.name)
        .bind(new.status.as_str())
        .bind(&new.code)
        .bind(&new.params)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn get_strategy(&self, id: i64) -> Result<Option<Strategy>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, status, code, params, processing_by, processing_started_at,
                   last_error, status_changed_at, created_at, updated_at
            FROM strategies WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(strategy_from_row).transpose()
    }

    async fn try_claim_one(
        &self,
        status: StrategyStatus,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Strategy>> {
        // Single statement so the row lock and the ownership write commit
        // together; SKIP LOCKED keeps concurrent claimants from queueing on
        // each other's candidate rows.
        let row = sqlx::query(
            r#"
            UPDATE strategies SET
                processing_by = $2,
                processing_started_at = $3,
                updated_at = $3
            WHERE id = (
                SELECT id FROM strategies
                WHERE status = $1 AND processing_by IS NULL
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, name, status, code, params, processing_by, processing_started_at,
                      last_error, status_changed_at, created_at, updated_at
            "#,
        )
        .bind(status.as_str())
        .bind(owner)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(strategy_from_row).transpose()
    }

    async fn release_claim(
        &self,
        id: i64,
        owner: &str,
        new_status: StrategyStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE strategies SET
                status = $3,
                processing_by = NULL,
                processing_started_at = NULL,
                last_error = NULL,
                status_changed_at = $4,
                updated_at = $4
            WHERE id = $1 AND processing_by = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(new_status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_claim(
        &self,
        id: i64,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE strategies SET
                status = $3,
                processing_by = NULL,
                processing_started_at = NULL,
                last_error = $4,
                status_changed_at = $5,
                updated_at = $5
            WHERE id = $1 AND processing_by = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(StrategyStatus::Failed.as_str())
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_claimed(&self, id: i64, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM strategies WHERE id = $1 AND processing_by = $2")
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE strategies SET
                processing_by = NULL,
                processing_started_at = NULL,
                updated_at = NOW()
            WHERE processing_by IS NOT NULL AND processing_started_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn release_all_by_owner(&self, owner: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE strategies SET
                processing_by = NULL,
                processing_started_at = NULL,
                updated_at = NOW()
            WHERE processing_by = $1
            "#,
        )
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn queue_depths(&self) -> Result<Vec<(StrategyStatus, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) as depth
            FROM strategies
            WHERE processing_by IS NULL
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut depths = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            match StrategyStatus::try_from(status.as_str()) {
                Ok(parsed) => depths.push((parsed, row.get("depth"))),
                Err(_) => warn!(status, "skipping unknown status in queue depths"),
            }
        }

        Ok(depths)
    }
}

#[async_trait]
impl ControlStore for PostgresStore {
    async fn get_stop(&self, scope: StopScope, scope_id: &str) -> Result<Option<EmergencyStop>> {
        let row = sqlx::query(
            r#"
            SELECT scope, scope_id, is_stopped, stop_reason, stop_action,
                   stopped_at, cooldown_until, reset_trigger, updated_at
            FROM emergency_stops
            WHERE scope = $1 AND scope_id = $2
            "#,
        )
        .bind(scope.as_str())
        .bind(scope_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(stop_from_row).transpose()
    }

    async fn active_stops(&self) -> Result<Vec<EmergencyStop>> {
        let rows = sqlx::query(
            r#"
            SELECT scope, scope_id, is_stopped, stop_reason, stop_action,
                   stopped_at, cooldown_until, reset_trigger, updated_at
            FROM emergency_stops
            WHERE is_stopped
            ORDER BY scope, scope_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(stop_from_row).collect()
    }

    async fn upsert_stop(&self, stop: &EmergencyStop) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO emergency_stops (
                scope, scope_id, is_stopped, stop_reason, stop_action,
                stopped_at, cooldown_until, reset_trigger, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (scope, scope_id) DO UPDATE SET
                is_stopped = EXCLUDED.is_stopped,
                stop_reason = EXCLUDED.stop_reason,
                stop_action = EXCLUDED.stop_action,
                stopped_at = EXCLUDED.stopped_at,
                cooldown_until = EXCLUDED.cooldown_until,
                reset_trigger = EXCLUDED.reset_trigger,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(stop.scope.as_str())
        .bind(&stop.scope_id)
        .bind(stop.is_stopped)
        .bind(&stop.stop_reason)
        .bind(stop.stop_action.map(|a| a.as_str()))
        .bind(stop.stopped_at)
        .bind(stop.cooldown_until)
        .bind(stop.reset_trigger.map(|t| t.as_str()))
        .bind(stop.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_stop(
        &self,
        scope: StopScope,
        scope_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE emergency_stops SET
                is_stopped = FALSE,
                stop_reason = NULL,
                stop_action = NULL,
                stopped_at = NULL,
                cooldown_until = NULL,
                reset_trigger = NULL,
                updated_at = $3
            WHERE scope = $1 AND scope_id = $2 AND is_stopped
            "#,
        )
        .bind(scope.as_str())
        .bind(scope_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_subaccount(&self, id: i32, allocated_capital: Decimal) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO subaccounts (id, status, allocated_capital)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(SubaccountStatus::Inactive.as_str())
        .bind(allocated_capital)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_subaccounts(&self) -> Result<Vec<Subaccount>> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, allocated_capital, current_balance, peak_balance,
                   peak_balance_updated_at, daily_pnl_usd, daily_pnl_reset_date,
                   strategy_id, updated_at
            FROM subaccounts
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(subaccount_from_row).collect()
    }

    async fn get_subaccount(&self, id: i32) -> Result<Option<Subaccount>> {
        let row = sqlx::query(
            r#"
            SELECT id, status, allocated_capital, current_balance, peak_balance,
                   peak_balance_updated_at, daily_pnl_usd, daily_pnl_reset_date,
                   strategy_id, updated_at
            FROM subaccounts WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(subaccount_from_row).transpose()
    }

    async fn set_subaccount_status(
        &self,
        id: i32,
        to: SubaccountStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status FROM subaccounts WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let current: String = row.get("status");
        let current =
            SubaccountStatus::try_from(current.as_str()).map_err(ForgeError::UnknownStatus)?;

        if current == to {
            return Ok(true);
        }
        if !current.can_transition_to(to) {
            warn!(
                subaccount_id = id,
                from = %current,
                to = %to,
                "refusing subaccount status transition"
            );
            return Ok(false);
        }

        sqlx::query("UPDATE subaccounts SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(to.as_str())
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn transition_subaccounts(
        &self,
        from: &[SubaccountStatus],
        to: SubaccountStatus,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        let result = sqlx::query(
            r#"
            UPDATE subaccounts SET status = $1, updated_at = $2
            WHERE status = ANY($3)
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(&from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn attach_strategy(
        &self,
        id: i32,
        strategy_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subaccounts SET strategy_id = $2, updated_at = $3 WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(strategy_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn apply_balance_update(
        &self,
        id: i32,
        current_balance: Decimal,
        pnl_delta: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        // Mirrors Subaccount::apply_balance_update; the CASE expressions keep
        // the read-precondition and write in one atomic statement.
        let result = sqlx::query(
            r#"
            UPDATE subaccounts SET
                current_balance = $2,
                peak_balance = CASE
                    WHEN peak_balance IS NULL OR $2 > peak_balance THEN $2
                    ELSE peak_balance
                END,
                peak_balance_updated_at = $4,
                daily_pnl_usd = CASE
                    WHEN daily_pnl_reset_date IS NULL OR daily_pnl_reset_date <> $5 THEN $3
                    ELSE daily_pnl_usd + $3
                END,
                daily_pnl_reset_date = $5,
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(current_balance)
        .bind(pnl_delta)
        .bind(now)
        .bind(now.date_naive())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn recent_closed_trades(&self, strategy_id: i64, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            r#"
            SELECT id, strategy_id, subaccount_id, entry_time, exit_time, pnl_usd
            FROM trades
            WHERE strategy_id = $1 AND exit_time IS NOT NULL
            ORDER BY exit_time DESC
            LIMIT $2
            "#,
        )
        .bind(strategy_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let trades = rows
            .iter()
            .map(|row| Trade {
                id: row.get("id"),
                strategy_id: row.get("strategy_id"),
                subaccount_id: row.get("subaccount_id"),
                entry_time: row.get("entry_time"),
                exit_time: row.get("exit_time"),
                pnl_usd: row.get("pnl_usd"),
            })
            .collect();

        Ok(trades)
    }

    async fn heartbeat(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_update_at FROM balance_feed_heartbeat WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("last_update_at")))
    }

    async fn touch_heartbeat(&self, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO balance_feed_heartbeat (id, last_update_at)
            VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET last_update_at = EXCLUDED.last_update_at
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
