use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use samops_storage::{OpportunityStore, PgStore};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "samops-cli")]
#[command(about = "SAM opportunity sync & search command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass against SAM.gov.
    Sync,
    /// Serve the read-only query API.
    Serve,
    /// Create tables and indexes if missing.
    Migrate,
    /// Remove rows whose response date has passed.
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = samops_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} window={}..{} pages={} seen={} upserted={}",
                summary.run_id,
                summary.posted_from,
                summary.posted_to,
                summary.pages_fetched,
                summary.records_seen,
                summary.rows_upserted
            );
            if let Some(deleted) = summary.expired_deleted {
                println!("expired removed: {deleted}");
            }
        }
        Commands::Serve => {
            let store = connect_store().await?;
            // keep serving even if the database isn't ready yet; /health
            // reports reachability
            if let Err(err) = store.ensure_schema().await {
                warn!(error = %err, "schema bootstrap failed at startup");
            }
            let admin_token = std::env::var("ADMIN_TOKEN").ok().filter(|v| !v.is_empty());
            let state = samops_web::AppState::new(Arc::new(store), admin_token);
            samops_web::serve_from_env(state).await?;
        }
        Commands::Migrate => {
            let store = connect_store().await?;
            store.ensure_schema().await?;
            println!("schema ensured");
        }
        Commands::Cleanup => {
            let store = connect_store().await?;
            let deleted = store.delete_expired().await?;
            println!("expired removed: {deleted}");
        }
    }

    Ok(())
}

async fn connect_store() -> Result<PgStore> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    Ok(PgStore::connect(&database_url).await?)
}
