use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A trade executed by a deployed strategy. Read-only to this core; the live
/// executor appends rows and the stop controller only counts loss streaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub strategy_id: i64,
    pub subaccount_id: Option<i32>,
    pub entry_time: DateTime<Utc>,
    /// Null while the position is open
    pub exit_time: Option<DateTime<Utc>>,
    pub pnl_usd: Option<Decimal>,
}

impl Trade {
    pub fn is_closed(&self) -> bool {
        self.exit_time.is_some()
    }

    pub fn is_loss(&self) -> bool {
        matches!(self.pnl_usd, Some(pnl) if pnl < Decimal::ZERO)
    }
}

/// Count the losing streak from the most recent trade backward, stopping at
/// the first non-negative result. `recent` must hold closed trades ordered
/// newest first.
pub fn consecutive_losses(recent: &[Trade]) -> u32 {
    let mut streak = 0;
    for trade in recent {
        if trade.is_loss() {
            streak += 1;
        } else {
            break;
        }
    }
    streak
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn closed(pnl: Decimal) -> Trade {
        Trade {
            id: 0,
            strategy_id: 1,
            subaccount_id: Some(1),
            entry_time: Utc::now(),
            exit_time: Some(Utc::now()),
            pnl_usd: Some(pnl),
        }
    }

    #[test]
    fn test_streak_stops_at_first_winner() {
        // Newest first: three losses, then a win, then another loss
        let trades = vec![
            closed(dec!(-5)),
            closed(dec!(-2)),
            closed(dec!(-8)),
            closed(dec!(3)),
            closed(dec!(-1)),
        ];
        assert_eq!(consecutive_losses(&trades), 3);
    }

    #[test]
    fn test_streak_zero_when_latest_trade_won() {
        let trades = vec![closed(dec!(4)), closed(dec!(-5)), closed(dec!(-5))];
        assert_eq!(consecutive_losses(&trades), 0);
    }

    #[test]
    fn test_breakeven_ends_streak() {
        let trades = vec![closed(dec!(-1)), closed(dec!(0)), closed(dec!(-9))];
        assert_eq!(consecutive_losses(&trades), 1);
    }

    #[test]
    fn test_all_losses() {
        let trades: Vec<Trade> = (0..10).map(|_| closed(dec!(-1))).collect();
        assert_eq!(consecutive_losses(&trades), 10);
        assert_eq!(consecutive_losses(&[]), 0);
    }
}
