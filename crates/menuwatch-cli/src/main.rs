use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use menuwatch_adapters::load_site_registry;
use menuwatch_storage::{MemoryStore, SheetApiClient};
use menuwatch_sync::{build_scheduler, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "menuwatch")]
#[command(about = "Restaurant menu scraper and catalog reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape-and-reconcile cycle immediately.
    Run {
        /// Compute the diff and write reports without touching the store.
        #[arg(long)]
        dry_run: bool,
    },
    /// Keep running on the configured cron schedule until interrupted.
    Watch,
}

fn build_pipeline(config: SyncConfig, dry_run: bool) -> Result<SyncPipeline> {
    let registry = load_site_registry(&config.sites_path)
        .with_context(|| format!("loading site registry {}", config.sites_path.display()))?;

    if dry_run {
        let store = Arc::new(MemoryStore::default());
        info!("dry run: reconciling against an empty in-memory store");
        return SyncPipeline::new(config, registry, store.clone(), store);
    }

    let client = Arc::new(SheetApiClient::new(config.sheet_api_config())?);
    SyncPipeline::new(config, registry, client.clone(), client)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => {
            let pipeline = build_pipeline(config, dry_run)?;
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} sites={} fetched={} appended={} updated={} deleted={} diffs={} report={}",
                summary.run_id,
                summary.sites,
                summary.fetched_records,
                summary.appended,
                summary.updated,
                summary.deleted,
                summary.diffs,
                summary.report_dir
            );
        }
        Commands::Watch => {
            let cron = config.cron.clone();
            let pipeline = Arc::new(build_pipeline(config, false)?);
            let mut scheduler = build_scheduler(pipeline, &cron).await?;
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
