use async_trait::async_trait;

use crate::error::Result;

/// Trading-execution capability the stop controller depends on. Live order
/// routing is owned by a collaborator process; the only capability this core
/// ever invokes is the emergency close-all.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    fn is_dry_run(&self) -> bool;

    /// Close every open position across all capital slots. `reason` is the
    /// persisted stop reason, passed through for the exchange-side audit log.
    async fn emergency_close_positions(&self, reason: &str) -> Result<()>;
}
