use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::domain::{EmergencyStop, StrategyStatus, Subaccount, TradePermission};

#[derive(Parser)]
#[command(name = "stratforge")]
#[command(version = "0.1.0")]
#[command(about = "Strategy-factory coordination core", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory
    #[arg(short, long, default_value = "config")]
    pub config: String,

    /// Use the in-memory store instead of PostgreSQL (no state survives exit)
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run database migrations
    Migrate,
    /// Run the periodic risk monitor (stop checks, auto-resets, stale sweeps)
    Monitor,
    /// Show queue depths, active stops, and capital slots
    Status,
    /// Release stale claims once
    Sweep,
    /// Emergency stop operations
    Stop {
        #[command(subcommand)]
        command: StopCommands,
    },
    /// Check whether a (subaccount, strategy) pair may trade
    CanTrade {
        /// Capital slot ID
        #[arg(short, long)]
        subaccount: i32,
        /// Strategy (work item) ID
        #[arg(short = 't', long)]
        strategy: i64,
    },
    /// Provision capital slots 1..=count
    SeedSlots {
        /// Number of slots
        #[arg(long, default_value = "4")]
        count: i32,
        /// Allocated capital per slot (USD)
        #[arg(long, default_value = "500")]
        capital: Decimal,
    },
}

#[derive(Subcommand)]
pub enum StopCommands {
    /// List active stops
    List,
    /// Trigger a stop manually
    Trigger {
        /// Scope: portfolio | subaccount | strategy | system
        #[arg(long)]
        scope: String,
        /// Scope ID: "global", a subaccount/strategy ID, or "data_feed"
        #[arg(long, default_value = "global")]
        scope_id: String,
        /// Human-readable reason, persisted with the stop
        #[arg(long)]
        reason: String,
        /// Action: halt_entries | force_close
        #[arg(long, default_value = "halt_entries")]
        action: String,
        /// Reset policy: midnight_utc | cooldown_48h_rotation | rotation | 24h | data_valid
        #[arg(long, default_value = "24h")]
        reset_trigger: String,
    },
    /// Clear an active stop manually
    Reset {
        #[arg(long)]
        scope: String,
        #[arg(long, default_value = "global")]
        scope_id: String,
    },
}

pub fn print_status(
    depths: &BTreeMap<StrategyStatus, i64>,
    stops: &[EmergencyStop],
    slots: &[Subaccount],
) {
    println!("=== Queue depths (unclaimed) ===");
    if depths.is_empty() {
        println!("  (empty)");
    }
    for (status, depth) in depths {
        println!("  {:<12} {}", status.to_string(), depth);
    }

    println!();
    print_stops(stops);

    println!();
    println!("=== Capital slots ===");
    if slots.is_empty() {
        println!("  (none provisioned)");
    }
    for slot in slots {
        println!(
            "  #{:<3} {:<9} allocated={} balance={} peak={} daily_pnl={} strategy={}",
            slot.id,
            slot.status.to_string(),
            slot.allocated_capital,
            format_opt(slot.current_balance),
            format_opt(slot.peak_balance),
            slot.daily_pnl_usd,
            slot.strategy_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}

pub fn print_stops(stops: &[EmergencyStop]) {
    println!("=== Active stops ===");
    if stops.is_empty() {
        println!("  (none)");
    }
    for stop in stops {
        println!(
            "  {:<16} action={} reset={} cooldown_until={} reason={}",
            stop.scope_key(),
            stop.stop_action
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            stop.reset_trigger
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            stop.cooldown_until
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            stop.stop_reason.as_deref().unwrap_or("-"),
        );
    }
}

pub fn print_permission(permission: &TradePermission) {
    if permission.allowed {
        println!("ALLOWED");
        return;
    }
    println!("BLOCKED by {}", permission.blocked_by.join(", "));
    for reason in &permission.reasons {
        println!("  - {}", reason);
    }
    if let Some(until) = permission.cooldown_until {
        println!("  cooldown until {}", until.to_rfc3339());
    }
}

fn format_opt(value: Option<Decimal>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}
