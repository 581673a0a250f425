pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod services;
pub mod storage;

pub use config::AppConfig;
pub use coordination::{
    ClaimCoordinator, EmergencyStopController, GracefulShutdown, ShutdownSignal,
};
pub use error::{ForgeError, Result};
pub use exchange::{ExecutionClient, NoopExecutionClient};
pub use services::RiskMonitor;
pub use storage::{ControlStore, WorkQueueStore};
