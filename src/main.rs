//! # Sync Engine Main Entry Point
//!
//! `serve` (the default) migrates, then runs the HTTP surface and the
//! dispatcher loop. `migrate` and `dispatch-once` support cron-style operation.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sync_engine::{
    adapters::AdapterRegistry,
    config::{AppConfig, ConfigLoader},
    db,
    server::{Engine, run_server},
    telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "sync-engine")]
#[command(about = "Sync queue dispatcher and orchestration service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default)]
enum Commands {
    /// Apply migrations, then serve HTTP and run the dispatcher until Ctrl-C
    #[default]
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Run a single dispatch cycle and print its statistics as JSON
    DispatchOnce,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config = ConfigLoader::new()
        .load()
        .context("Failed to load configuration")?;
    telemetry::init_tracing(&config).context("Failed to initialize tracing")?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let conn = db::init_pool(&config).await?;

    match cli.command.unwrap_or_default() {
        Commands::Serve => {
            db::migrate(&conn).await?;
            run_server(config, conn).await
        }
        Commands::Migrate => {
            db::migrate(&conn).await?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        Commands::DispatchOnce => dispatch_once(config, conn).await,
    }
}

async fn dispatch_once(config: AppConfig, conn: sea_orm::DatabaseConnection) -> Result<()> {
    let registry = AdapterRegistry::from_config(&config).context("Failed to build adapters")?;
    let engine = Engine::new(config, conn, registry);

    let stats = engine
        .dispatcher
        .tick(Utc::now())
        .await
        .context("Dispatch cycle failed")?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
