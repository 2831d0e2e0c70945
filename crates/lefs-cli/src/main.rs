use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lefs_core::ContractRow;
use lefs_storage::{ContractStore, PgContractStore};
use lefs_sync::{SyncConfig, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "lefs")]
#[command(about = "Leasing encumbrance filing sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the next unsynced day(s) of filings.
    Sync {
        /// Catch up on at most this many days.
        #[arg(long, default_value_t = 1)]
        days: u32,
    },
    /// Pull details for filings that are not enriched yet.
    Enrich {
        #[arg(long)]
        limit: Option<i64>,
    },
    Migrate,
    /// Print one stored filing as JSON.
    Show { guid: String },
    /// Run sync and enrichment on the configured cron until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "lefs=info,lefs_sync=info,lefs_storage=info,lefs_adapters=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { days: 1 }) {
        Commands::Sync { days } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let report = pipeline.sync(days).await?;
            for window in &report.windows {
                println!(
                    "synced {}: run_id={} found={} inserted={} skipped={} duplicates={}",
                    window.window_day,
                    window.run_id,
                    window.found,
                    window.inserted,
                    window.skipped,
                    window.duplicates
                );
            }
            if let Some(next_day) = report.up_to_date {
                println!("up to date: next window {next_day} is not over yet");
            }
        }
        Commands::Enrich { limit } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.enrich(limit).await?;
            println!(
                "enrichment complete: run_id={} candidates={} enriched={} not_ready={} empty={}",
                summary.run_id, summary.candidates, summary.enriched, summary.not_ready, summary.empty
            );
        }
        Commands::Migrate => {
            let store = PgContractStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Show { guid } => {
            let store = PgContractStore::connect(&config.database_url).await?;
            let row: Option<ContractRow> = store.find_by_guid(&guid).await?;
            let row = row.with_context(|| format!("no contract with guid {guid}"))?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            lefs_sync::run_scheduler_until_ctrl_c(pipeline).await?;
        }
    }

    Ok(())
}
