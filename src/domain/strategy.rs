use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages for a generated strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StrategyStatus {
    /// Freshly generated, awaiting validation
    Generated,
    /// Passed validation, awaiting backtest
    Validated,
    /// Backtest complete, awaiting scoring
    Backtested,
    /// Scored, eligible for deployment
    Scored,
    /// Deployed to a capital slot
    Live,
    /// Taken out of rotation
    Retired,
    /// Unrecoverable pipeline failure
    Failed,
}

impl StrategyStatus {
    pub const ALL: [StrategyStatus; 7] = [
        StrategyStatus::Generated,
        StrategyStatus::Validated,
        StrategyStatus::Backtested,
        StrategyStatus::Scored,
        StrategyStatus::Live,
        StrategyStatus::Retired,
        StrategyStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Generated => "GENERATED",
            StrategyStatus::Validated => "VALIDATED",
            StrategyStatus::Backtested => "BACKTESTED",
            StrategyStatus::Scored => "SCORED",
            StrategyStatus::Live => "LIVE",
            StrategyStatus::Retired => "RETIRED",
            StrategyStatus::Failed => "FAILED",
        }
    }

    /// Check if this status can transition to another status
    pub fn can_transition_to(&self, target: StrategyStatus) -> bool {
        use StrategyStatus::*;

        match (self, target) {
            (Generated, Validated) => true,
            (Generated, Failed) => true,

            (Validated, Backtested) => true,
            (Validated, Failed) => true,

            (Backtested, Scored) => true,
            (Backtested, Failed) => true,

            // Scored strategies either deploy or fall short of the bar
            (Scored, Live) => true,
            (Scored, Retired) => true,
            (Scored, Failed) => true,

            (Live, Retired) => true,

            // Retired and Failed are terminal
            _ => false,
        }
    }

    /// Get valid next statuses from the current status
    pub fn valid_transitions(&self) -> Vec<StrategyStatus> {
        use StrategyStatus::*;

        match self {
            Generated => vec![Validated, Failed],
            Validated => vec![Backtested, Failed],
            Backtested => vec![Scored, Failed],
            Scored => vec![Live, Retired, Failed],
            Live => vec![Retired],
            Retired | Failed => vec![],
        }
    }

    /// Is this a terminal status?
    pub fn is_terminal(&self) -> bool {
        matches!(self, StrategyStatus::Retired | StrategyStatus::Failed)
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StrategyStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "GENERATED" => Ok(StrategyStatus::Generated),
            "VALIDATED" => Ok(StrategyStatus::Validated),
            "BACKTESTED" => Ok(StrategyStatus::Backtested),
            "SCORED" => Ok(StrategyStatus::Scored),
            "LIVE" => Ok(StrategyStatus::Live),
            "RETIRED" => Ok(StrategyStatus::Retired),
            "FAILED" => Ok(StrategyStatus::Failed),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// A unit of pipeline work. The payload fields (code, params) are opaque to
/// the coordination core; workers read and write them through their own
/// collaborator contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub status: StrategyStatus,
    pub code: Option<String>,
    pub params: serde_json::Value,
    /// Token of the worker currently holding this item, if any.
    /// Set if and only if `processing_started_at` is set.
    pub processing_by: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Strategy {
    /// Available for claiming: nobody holds it
    pub fn is_available(&self) -> bool {
        self.processing_by.is_none()
    }

    /// Claim held longer than the cutoff allows, presumed abandoned
    pub fn is_claim_stale(&self, cutoff: DateTime<Utc>) -> bool {
        matches!(self.processing_started_at, Some(started) if started < cutoff)
    }
}

/// Insert payload for a new work item
#[derive(Debug, Clone)]
pub struct NewStrategy {
    pub name: String,
    pub status: StrategyStatus,
    pub code: Option<String>,
    pub params: serde_json::Value,
}

impl NewStrategy {
    pub fn generated(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            status: StrategyStatus::Generated,
            code: None,
            params,
        }
    }
}
