use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capital slot states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubaccountStatus {
    /// Trading normally
    Active,
    /// New entries halted, positions kept
    Paused,
    /// Force-closed, awaiting operator or auto-reset
    Stopped,
    /// Provisioned but not in rotation
    Inactive,
}

impl SubaccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubaccountStatus::Active => "ACTIVE",
            SubaccountStatus::Paused => "PAUSED",
            SubaccountStatus::Stopped => "STOPPED",
            SubaccountStatus::Inactive => "INACTIVE",
        }
    }

    /// Single authoritative transition check for slot status. Both the stop
    /// controller and the rotator mutate slots through this predicate.
    pub fn can_transition_to(&self, target: SubaccountStatus) -> bool {
        use SubaccountStatus::*;

        match (self, target) {
            (Active, Paused) => true,
            (Active, Stopped) => true,
            (Active, Inactive) => true,

            (Paused, Active) => true,
            (Paused, Stopped) => true,
            (Paused, Inactive) => true,

            (Stopped, Active) => true,
            (Stopped, Inactive) => true,

            (Inactive, Active) => true,

            _ => false,
        }
    }

    /// May this slot accept new trade entries?
    pub fn can_accept_entries(&self) -> bool {
        matches!(self, SubaccountStatus::Active)
    }
}

impl fmt::Display for SubaccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for SubaccountStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(SubaccountStatus::Active),
            "PAUSED" => Ok(SubaccountStatus::Paused),
            "STOPPED" => Ok(SubaccountStatus::Stopped),
            "INACTIVE" => Ok(SubaccountStatus::Inactive),
            _ => Err(format!("Unknown subaccount status: {}", s)),
        }
    }
}

/// A fixed-identity trading account holding one deployed strategy at a time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subaccount {
    pub id: i32,
    pub status: SubaccountStatus,
    pub allocated_capital: Decimal,
    /// Null until the slot has been funded
    pub current_balance: Option<Decimal>,
    /// High-water mark; never decreases once set
    pub peak_balance: Option<Decimal>,
    pub peak_balance_updated_at: Option<DateTime<Utc>>,
    pub daily_pnl_usd: Decimal,
    pub daily_pnl_reset_date: Option<NaiveDate>,
    /// Work item currently deployed to this slot
    pub strategy_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl Subaccount {
    pub fn provisioned(id: i32, allocated_capital: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: SubaccountStatus::Inactive,
            allocated_capital,
            current_balance: None,
            peak_balance: None,
            peak_balance_updated_at: None,
            daily_pnl_usd: Decimal::ZERO,
            daily_pnl_reset_date: None,
            strategy_id: None,
            updated_at: now,
        }
    }

    pub fn is_deployed(&self) -> bool {
        self.strategy_id.is_some()
    }

    /// Drawdown from peak as a fraction, when both balances are known
    pub fn drawdown(&self) -> Option<Decimal> {
        let peak = self.peak_balance?;
        let current = self.current_balance?;
        if peak <= Decimal::ZERO {
            return None;
        }
        Some((peak - current) / peak)
    }

    /// Net PnL of the current deployment against allocated capital
    pub fn net_pnl(&self) -> Option<Decimal> {
        Some(self.current_balance? - self.allocated_capital)
    }

    /// Apply a balance-feed update: peak rises but never falls, and the
    /// daily PnL accumulator restarts on the first update of each UTC day.
    pub fn apply_balance_update(
        &mut self,
        current_balance: Decimal,
        pnl_delta: Decimal,
        now: DateTime<Utc>,
    ) {
        let today = now.date_naive();

        self.current_balance = Some(current_balance);
        if self.peak_balance.map_or(true, |peak| current_balance > peak) {
            self.peak_balance = Some(current_balance);
        }
        self.peak_balance_updated_at = Some(now);

        self.daily_pnl_usd = match self.daily_pnl_reset_date {
            Some(date) if date == today => self.daily_pnl_usd + pnl_delta,
            _ => pnl_delta,
        };
        self.daily_pnl_reset_date = Some(today);
        self.updated_at = now;
    }
}
