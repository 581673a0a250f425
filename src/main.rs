use clap::Parser;
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use stratforge::adapters::{MemoryStore, PostgresStore};
use stratforge::cli::{self, Cli, Commands, StopCommands};
use stratforge::config::{AppConfig, LoggingConfig};
use stratforge::coordination::{
    install_signal_handlers, ClaimCoordinator, EmergencyStopController, GracefulShutdown,
};
use stratforge::domain::{ResetTrigger, StopAction, StopScope, DATA_FEED_SCOPE_ID, GLOBAL_SCOPE_ID};
use stratforge::error::{ForgeError, Result};
use stratforge::exchange::{ExecutionClient, NoopExecutionClient};
use stratforge::services::RiskMonitor;
use stratforge::storage::{ControlStore, WorkQueueStore};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let config = if args.dry_run {
        AppConfig::default_config()
    } else {
        AppConfig::load_from(&args.config)?
    };

    init_logging(&config.logging);

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("config: {}", e);
        }
        return Err(ForgeError::InvalidConfig(errors.join("; ")));
    }

    if args.dry_run {
        let store = Arc::new(MemoryStore::new());
        let client: Arc<dyn ExecutionClient> = Arc::new(NoopExecutionClient);
        run_command(store, Some(client), config, args.command).await
    } else {
        let store = Arc::new(
            PostgresStore::new(&config.database.url, config.database.max_connections).await?,
        );
        if matches!(args.command, Commands::Migrate) {
            store.migrate().await?;
            return Ok(());
        }
        // The close-all capability is owned by the live-trading executor;
        // stops triggered here still mark slots STOPPED without it.
        run_command(store, None, config, args.command).await
    }
}

async fn run_command<S>(
    store: Arc<S>,
    client: Option<Arc<dyn ExecutionClient>>,
    config: AppConfig,
    command: Commands,
) -> Result<()>
where
    S: WorkQueueStore + ControlStore + Send + Sync + 'static,
{
    let claims = Arc::new(ClaimCoordinator::new(store.clone(), config.claims.clone()));
    let mut controller = EmergencyStopController::new(store.clone(), config.risk.clone());
    if let Some(client) = client {
        controller = controller.with_execution_client(client);
    }
    let controller = Arc::new(controller);

    match command {
        Commands::Migrate => {
            warn!("migrate is only meaningful against PostgreSQL");
            Ok(())
        }
        Commands::Monitor => {
            let shutdown = Arc::new(GracefulShutdown::with_defaults());
            install_signal_handlers(shutdown.clone()).await;

            let monitor = RiskMonitor::new(claims, controller, config.monitor.clone());
            monitor.run(shutdown).await
        }
        Commands::Status => {
            let depths = claims.queue_depths().await?;
            let stops = controller.active_stops().await?;
            let slots = store.list_subaccounts().await?;
            cli::print_status(&depths, &stops, &slots);
            Ok(())
        }
        Commands::Sweep => {
            let released = claims.release_stale_claims().await?;
            println!("Released {} stale claims", released);
            Ok(())
        }
        Commands::Stop { command } => run_stop_command(&controller, command).await,
        Commands::CanTrade {
            subaccount,
            strategy,
        } => {
            let permission = controller.can_trade(subaccount, strategy).await?;
            cli::print_permission(&permission);
            Ok(())
        }
        Commands::SeedSlots { count, capital } => {
            let mut created = 0;
            for id in 1..=count {
                if store.upsert_subaccount(id, capital).await? {
                    created += 1;
                }
            }
            println!("Provisioned {} new slots ({} requested)", created, count);
            Ok(())
        }
    }
}

async fn run_stop_command<S: ControlStore>(
    controller: &EmergencyStopController<S>,
    command: StopCommands,
) -> Result<()> {
    match command {
        StopCommands::List => {
            let stops = controller.active_stops().await?;
            cli::print_stops(&stops);
            Ok(())
        }
        StopCommands::Trigger {
            scope,
            scope_id,
            reason,
            action,
            reset_trigger,
        } => {
            let scope = StopScope::try_from(scope.as_str()).map_err(ForgeError::Validation)?;
            let action = StopAction::try_from(action.as_str()).map_err(ForgeError::Validation)?;
            let reset_trigger =
                ResetTrigger::try_from(reset_trigger.as_str()).map_err(ForgeError::Validation)?;
            let scope_id = normalize_scope_id(scope, scope_id);

            let triggered = controller
                .trigger_stop(scope, &scope_id, &reason, action, reset_trigger)
                .await?;
            if triggered {
                println!("Stop triggered for {}/{}", scope, scope_id);
            } else {
                println!("Stop already active for {}/{}", scope, scope_id);
            }
            Ok(())
        }
        StopCommands::Reset { scope, scope_id } => {
            let scope = StopScope::try_from(scope.as_str()).map_err(ForgeError::Validation)?;
            let scope_id = normalize_scope_id(scope, scope_id);
            if controller.reset_manual(scope, &scope_id).await? {
                println!("Stop reset for {}/{}", scope, scope_id);
            } else {
                println!("No active stop for {}/{}", scope, scope_id);
            }
            Ok(())
        }
    }
}

// The system scope lives under "data_feed", not the CLI's "global" default.
fn normalize_scope_id(scope: StopScope, scope_id: String) -> String {
    if scope == StopScope::System && scope_id == GLOBAL_SCOPE_ID {
        DATA_FEED_SCOPE_ID.to_string()
    } else {
        scope_id
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
