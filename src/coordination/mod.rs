//! Coordination Layer
//!
//! The two subsystems that let many crash-prone worker processes share one
//! work queue and one pool of live capital:
//! - Work-claiming coordinator with timeout recovery and backpressure
//! - Multi-scope emergency stop controller
//! - Graceful shutdown handling for worker processes

pub mod claims;
pub mod emergency_stop;
pub mod shutdown;

pub use claims::{backpressure_cooldown, worker_token, ClaimCoordinator};
pub use emergency_stop::EmergencyStopController;
pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownPhase, ShutdownSignal,
};
