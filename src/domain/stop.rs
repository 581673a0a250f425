use chrono::{DateTime, Days, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope ID for portfolio-wide stops
pub const GLOBAL_SCOPE_ID: &str = "global";
/// Scope ID for data-feed (system) stops
pub const DATA_FEED_SCOPE_ID: &str = "data_feed";

/// Blast radius of an emergency stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopScope {
    Portfolio,
    Subaccount,
    Strategy,
    System,
}

impl StopScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopScope::Portfolio => "portfolio",
            StopScope::Subaccount => "subaccount",
            StopScope::Strategy => "strategy",
            StopScope::System => "system",
        }
    }
}

impl fmt::Display for StopScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StopScope {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "portfolio" => Ok(StopScope::Portfolio),
            "subaccount" => Ok(StopScope::Subaccount),
            "strategy" => Ok(StopScope::Strategy),
            "system" => Ok(StopScope::System),
            _ => Err(format!("Unknown stop scope: {}", s)),
        }
    }
}

/// What a stop does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAction {
    /// Block new trade entries; open positions ride
    HaltEntries,
    /// Close every open position and stop all active slots
    ForceClose,
}

impl StopAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopAction::HaltEntries => "halt_entries",
            StopAction::ForceClose => "force_close",
        }
    }
}

impl fmt::Display for StopAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StopAction {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "halt_entries" => Ok(StopAction::HaltEntries),
            "force_close" => Ok(StopAction::ForceClose),
            _ => Err(format!("Unknown stop action: {}", s)),
        }
    }
}

/// Policy that determines how a stop is cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetTrigger {
    /// Clears at the next UTC midnight
    MidnightUtc,
    /// Clears after a fixed cooldown, and only once no deployed slot is
    /// still carrying an outsized loss
    Cooldown48hRotation,
    /// Clears only when the rotator redeploys the slot
    Rotation,
    /// Clears after a fixed cooldown
    After24h,
    /// Clears when the balance feed is fresh again
    DataValid,
}

impl ResetTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetTrigger::MidnightUtc => "midnight_utc",
            ResetTrigger::Cooldown48hRotation => "cooldown_48h_rotation",
            ResetTrigger::Rotation => "rotation",
            ResetTrigger::After24h => "24h",
            ResetTrigger::DataValid => "data_valid",
        }
    }

    /// Cooldown horizon for a stop triggered at `now`. `None` means the
    /// trigger has no time component (rotation / data freshness).
    pub fn cooldown_from(
        &self,
        now: DateTime<Utc>,
        portfolio_dd_cooldown: Duration,
        strategy_cooldown: Duration,
    ) -> Option<DateTime<Utc>> {
        match self {
            ResetTrigger::MidnightUtc => Some(next_utc_midnight(now)),
            ResetTrigger::Cooldown48hRotation => Some(now + portfolio_dd_cooldown),
            ResetTrigger::After24h => Some(now + strategy_cooldown),
            ResetTrigger::Rotation | ResetTrigger::DataValid => None,
        }
    }
}

impl fmt::Display for ResetTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ResetTrigger {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "midnight_utc" => Ok(ResetTrigger::MidnightUtc),
            "cooldown_48h_rotation" => Ok(ResetTrigger::Cooldown48hRotation),
            "rotation" => Ok(ResetTrigger::Rotation),
            "24h" => Ok(ResetTrigger::After24h),
            "data_valid" => Ok(ResetTrigger::DataValid),
            _ => Err(format!("Unknown reset trigger: {}", s)),
        }
    }
}

/// First instant of the next UTC calendar day
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Days::new(1);
    Utc.from_utc_datetime(&tomorrow.and_time(NaiveTime::MIN))
}

/// Monitoring key for a stop, e.g. `portfolio`, `subaccount_3`, `strategy_42`
pub fn scope_key(scope: StopScope, scope_id: &str) -> String {
    match scope {
        StopScope::Portfolio => "portfolio".to_string(),
        StopScope::System => "system".to_string(),
        StopScope::Subaccount => format!("subaccount_{}", scope_id),
        StopScope::Strategy => format!("strategy_{}", scope_id),
    }
}

/// Persistent circuit-breaker state, one row per (scope, scope_id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyStop {
    pub scope: StopScope,
    pub scope_id: String,
    pub is_stopped: bool,
    pub stop_reason: Option<String>,
    pub stop_action: Option<StopAction>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub reset_trigger: Option<ResetTrigger>,
    pub updated_at: DateTime<Utc>,
}

impl EmergencyStop {
    pub fn scope_key(&self) -> String {
        scope_key(self.scope, &self.scope_id)
    }

    /// Has the time component of this stop's reset policy elapsed?
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.cooldown_until, Some(until) if now >= until)
    }
}

/// A newly-detected rule violation, not yet persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopViolation {
    pub scope: StopScope,
    pub scope_id: String,
    pub reason: String,
    pub action: StopAction,
    pub reset_trigger: ResetTrigger,
}

/// A stop cleared by the auto-reset sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopReset {
    pub scope: StopScope,
    pub scope_id: String,
    pub reset_trigger: ResetTrigger,
}

/// Aggregated answer to "may this (slot, strategy) pair trade right now?"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePermission {
    pub allowed: bool,
    /// Scope keys of the stops blocking entry
    pub blocked_by: Vec<String>,
    pub reasons: Vec<String>,
    /// Latest cooldown among the blocking stops
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl TradePermission {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            blocked_by: Vec::new(),
            reasons: Vec::new(),
            cooldown_until: None,
        }
    }

    /// Fold a set of stop states into a single permission answer
    pub fn aggregate(stops: &[EmergencyStop]) -> Self {
        let mut permission = Self::allowed();

        for stop in stops.iter().filter(|s| s.is_stopped) {
            permission.allowed = false;
            permission.blocked_by.push(stop.scope_key());
            if let Some(reason) = &stop.stop_reason {
                permission.reasons.push(reason.clone());
            }
            permission.cooldown_until = match (permission.cooldown_until, stop.cooldown_until) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }

        permission
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stop(scope: StopScope, scope_id: &str, stopped: bool) -> EmergencyStop {
        EmergencyStop {
            scope,
            scope_id: scope_id.to_string(),
            is_stopped: stopped,
            stop_reason: stopped.then(|| format!("{} stopped", scope)),
            stop_action: Some(StopAction::HaltEntries),
            stopped_at: stopped.then(Utc::now),
            cooldown_until: None,
            reset_trigger: Some(ResetTrigger::After24h),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_next_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 22, 45, 10).unwrap();
        let midnight = next_utc_midnight(now);
        assert_eq!(
            midnight,
            Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 0).unwrap()
        );

        // Month rollover
        let eom = Utc.with_ymd_and_hms(2024, 1, 31, 5, 0, 0).unwrap();
        assert_eq!(
            next_utc_midnight(eom),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_cooldown_from() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let dd = Duration::hours(48);
        let strat = Duration::hours(24);

        assert_eq!(
            ResetTrigger::Cooldown48hRotation.cooldown_from(now, dd, strat),
            Some(now + Duration::hours(48))
        );
        assert_eq!(
            ResetTrigger::After24h.cooldown_from(now, dd, strat),
            Some(now + Duration::hours(24))
        );
        assert_eq!(
            ResetTrigger::MidnightUtc.cooldown_from(now, dd, strat),
            Some(Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 0).unwrap())
        );
        assert_eq!(ResetTrigger::Rotation.cooldown_from(now, dd, strat), None);
        assert_eq!(ResetTrigger::DataValid.cooldown_from(now, dd, strat), None);
    }

    #[test]
    fn test_scope_keys() {
        assert_eq!(scope_key(StopScope::Portfolio, GLOBAL_SCOPE_ID), "portfolio");
        assert_eq!(scope_key(StopScope::System, DATA_FEED_SCOPE_ID), "system");
        assert_eq!(scope_key(StopScope::Subaccount, "3"), "subaccount_3");
        assert_eq!(scope_key(StopScope::Strategy, "42"), "strategy_42");
    }

    #[test]
    fn test_aggregate_all_clear() {
        let stops = vec![
            stop(StopScope::Portfolio, GLOBAL_SCOPE_ID, false),
            stop(StopScope::Subaccount, "3", false),
        ];
        let permission = TradePermission::aggregate(&stops);
        assert!(permission.allowed);
        assert!(permission.blocked_by.is_empty());
        assert!(permission.cooldown_until.is_none());
    }

    #[test]
    fn test_aggregate_collects_all_blockers() {
        let mut strategy_stop = stop(StopScope::Strategy, "42", true);
        strategy_stop.cooldown_until = Some(Utc::now() + Duration::hours(24));
        let mut sub_stop = stop(StopScope::Subaccount, "3", true);
        sub_stop.cooldown_until = Some(Utc::now() + Duration::hours(1));

        let stops = vec![sub_stop, strategy_stop.clone()];
        let permission = TradePermission::aggregate(&stops);

        assert!(!permission.allowed);
        assert_eq!(permission.blocked_by, vec!["subaccount_3", "strategy_42"]);
        assert_eq!(permission.reasons.len(), 2);
        // Latest cooldown wins
        assert_eq!(permission.cooldown_until, strategy_stop.cooldown_until);
    }

    #[test]
    fn test_reset_trigger_round_trip() {
        for trigger in [
            ResetTrigger::MidnightUtc,
            ResetTrigger::Cooldown48hRotation,
            ResetTrigger::Rotation,
            ResetTrigger::After24h,
            ResetTrigger::DataValid,
        ] {
            assert_eq!(ResetTrigger::try_from(trigger.as_str()).unwrap(), trigger);
        }
    }
}
