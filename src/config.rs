use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub claims: ClaimsConfig,
    pub risk: RiskConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Work-claiming configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimsConfig {
    /// Seconds a claim may be held before it is presumed abandoned.
    /// Must exceed the slowest legitimate unit of pipeline work plus margin.
    #[serde(default = "default_claim_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
}

fn default_claim_timeout() -> u64 {
    900
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_claim_timeout(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

/// Producer slow-down when a downstream queue is saturated
#[derive(Debug, Clone, Deserialize)]
pub struct BackpressureConfig {
    /// Cooldown applied as soon as a queue reaches its limit (seconds)
    #[serde(default = "default_backpressure_base")]
    pub base_seconds: u64,
    /// Additional cooldown per item over the limit (seconds)
    #[serde(default = "default_backpressure_increment")]
    pub increment_seconds: u64,
    /// Upper bound on the computed cooldown (seconds)
    #[serde(default = "default_backpressure_max")]
    pub max_cooldown_seconds: u64,
}

fn default_backpressure_base() -> u64 {
    30
}

fn default_backpressure_increment() -> u64 {
    2
}

fn default_backpressure_max() -> u64 {
    120
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_backpressure_base(),
            increment_seconds: default_backpressure_increment(),
            max_cooldown_seconds: default_backpressure_max(),
        }
    }
}

/// Emergency-stop thresholds. The thresholds themselves carry no defaults:
/// a deployment that does not state its risk limits must not start.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Aggregate daily loss that halts new entries, as a fraction of
    /// total allocated capital (e.g. 0.10 = 10%)
    pub max_daily_loss: Decimal,
    /// Aggregate drawdown from peak that force-closes all positions (fraction)
    pub max_portfolio_drawdown: Decimal,
    /// Per-slot drawdown from peak that pauses the slot (fraction)
    pub max_subaccount_drawdown: Decimal,
    /// Consecutive losing trades that halt a strategy
    pub max_consecutive_losses: u32,
    /// Seconds without a balance-feed update before trading halts
    pub data_stale_seconds: u64,
    /// Deployment loss (USD) that blocks the portfolio-drawdown reset
    pub rotation_loss_threshold: Decimal,
    /// Minimum seconds between condition evaluations on one controller instance
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    /// Cooldown after a portfolio-drawdown stop (hours)
    #[serde(default = "default_portfolio_dd_cooldown")]
    pub portfolio_dd_cooldown_hours: i64,
    /// Cooldown after a consecutive-loss stop (hours)
    #[serde(default = "default_strategy_cooldown")]
    pub strategy_cooldown_hours: i64,
}

fn default_check_interval() -> u64 {
    60
}

fn default_portfolio_dd_cooldown() -> i64 {
    48
}

fn default_strategy_cooldown() -> i64 {
    24
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between monitor ticks (risk checks, auto-resets, stale sweeps)
    #[serde(default = "default_monitor_tick")]
    pub tick_seconds: u64,
}

fn default_monitor_tick() -> u64 {
    15
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_monitor_tick(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("STRATFORGE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (STRATFORGE_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("STRATFORGE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a default configuration for CLI dry runs and tests
    pub fn default_config() -> Self {
        use rust_decimal_macros::dec;

        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/stratforge".to_string(),
                max_connections: 5,
            },
            claims: ClaimsConfig::default(),
            risk: RiskConfig {
                max_daily_loss: dec!(0.10),
                max_portfolio_drawdown: dec!(0.20),
                max_subaccount_drawdown: dec!(0.25),
                max_consecutive_losses: 10,
                data_stale_seconds: 900,
                rotation_loss_threshold: dec!(250),
                check_interval_seconds: 60,
                portfolio_dd_cooldown_hours: 48,
                strategy_cooldown_hours: 24,
            },
            monitor: MonitorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("max_daily_loss", self.risk.max_daily_loss),
            ("max_portfolio_drawdown", self.risk.max_portfolio_drawdown),
            ("max_subaccount_drawdown", self.risk.max_subaccount_drawdown),
        ] {
            if value <= Decimal::ZERO || value >= Decimal::ONE {
                errors.push(format!("{name} must be between 0 and 1, got {value}"));
            }
        }

        if self.risk.max_consecutive_losses == 0 {
            errors.push("max_consecutive_losses must be at least 1".to_string());
        }

        if self.risk.rotation_loss_threshold <= Decimal::ZERO {
            errors.push("rotation_loss_threshold must be positive".to_string());
        }

        if self.risk.data_stale_seconds == 0 {
            errors.push("data_stale_seconds must be positive".to_string());
        }

        if self.risk.portfolio_dd_cooldown_hours <= 0 || self.risk.strategy_cooldown_hours <= 0 {
            errors.push("cooldown hours must be positive".to_string());
        }

        if self.claims.timeout_seconds < 60 {
            errors.push(format!(
                "claims.timeout_seconds {} is shorter than any realistic unit of work",
                self.claims.timeout_seconds
            ));
        }

        let bp = &self.claims.backpressure;
        if bp.max_cooldown_seconds < bp.base_seconds {
            errors.push("backpressure max_cooldown_seconds must be >= base_seconds".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_config_is_valid() {
        assert!(AppConfig::default_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_ratios() {
        let mut cfg = AppConfig::default_config();
        cfg.risk.max_daily_loss = dec!(1.5);
        cfg.risk.max_portfolio_drawdown = Decimal::ZERO;

        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("max_daily_loss"));
        assert!(errors[1].contains("max_portfolio_drawdown"));
    }

    #[test]
    fn validate_rejects_short_claim_timeout() {
        let mut cfg = AppConfig::default_config();
        cfg.claims.timeout_seconds = 5;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("timeout_seconds")));
    }

    #[test]
    fn validate_rejects_inverted_backpressure_bounds() {
        let mut cfg = AppConfig::default_config();
        cfg.claims.backpressure.base_seconds = 200;
        cfg.claims.backpressure.max_cooldown_seconds = 100;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("max_cooldown_seconds")));
    }
}
