use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::MonitorConfig;
use crate::coordination::{ClaimCoordinator, EmergencyStopController, GracefulShutdown};
use crate::error::Result;
use crate::storage::{ControlStore, WorkQueueStore};

/// Periodic safety loop: evaluates stop conditions, clears expired stops,
/// and sweeps stale claims. Errors on a tick are logged and the loop keeps
/// going; the next tick retries against the shared store.
pub struct RiskMonitor<S> {
    claims: Arc<ClaimCoordinator<S>>,
    controller: Arc<EmergencyStopController<S>>,
    config: MonitorConfig,
}

impl<S> RiskMonitor<S>
where
    S: WorkQueueStore + ControlStore + 'static,
{
    pub fn new(
        claims: Arc<ClaimCoordinator<S>>,
        controller: Arc<EmergencyStopController<S>>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            claims,
            controller,
            config,
        }
    }

    /// Run until a shutdown signal arrives, then hand this process's claims
    /// back to the queue.
    pub async fn run(&self, shutdown: Arc<GracefulShutdown>) -> Result<()> {
        let mut signals = shutdown.subscribe();
        let mut ticker = interval(Duration::from_secs(self.config.tick_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(tick_seconds = self.config.tick_seconds, "risk monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                signal = signals.recv() => {
                    match signal {
                        Ok(signal) => info!(%signal, "risk monitor stopping"),
                        Err(_) => warn!("shutdown channel closed, risk monitor stopping"),
                    }
                    break;
                }
            }
        }

        let claims = self.claims.clone();
        shutdown
            .execute(
                || Box::pin(async {}),
                move || {
                    Box::pin(async move {
                        claims
                            .release_all_owned()
                            .await
                            .map_err(|e| e.to_string())
                    })
                },
            )
            .await;

        Ok(())
    }

    async fn tick(&self) {
        match self.controller.run_checks().await {
            Ok(violations) if !violations.is_empty() => {
                warn!(count = violations.len(), "emergency stops triggered");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "stop condition check failed"),
        }

        match self.controller.check_auto_resets().await {
            Ok(resets) if !resets.is_empty() => {
                info!(count = resets.len(), "emergency stops auto-reset");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "auto-reset check failed"),
        }

        match self.claims.release_stale_claims().await {
            Ok(released) if released > 0 => {
                warn!(released, "stale claims recovered");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "stale claim sweep failed"),
        }
    }
}
