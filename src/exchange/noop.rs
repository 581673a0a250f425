use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::exchange::ExecutionClient;

/// Execution client for dry runs: acknowledges close-all requests without
/// touching an exchange.
#[derive(Debug, Default)]
pub struct NoopExecutionClient;

#[async_trait]
impl ExecutionClient for NoopExecutionClient {
    fn is_dry_run(&self) -> bool {
        true
    }

    async fn emergency_close_positions(&self, reason: &str) -> Result<()> {
        warn!(reason, "dry-run: close-all acknowledged, no exchange call made");
        Ok(())
    }
}
