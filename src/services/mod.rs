pub mod monitor;

pub use monitor::RiskMonitor;
