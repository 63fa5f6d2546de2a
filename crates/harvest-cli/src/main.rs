use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use harvest_sync::HarvestConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "harvest")]
#[command(about = "Incrementally copy bazaraki listings into the analytics store")]
struct Cli {
    /// YAML feed registry; the built-in sale feeds are used when absent.
    #[arg(long, global = true, env = "HARVEST_FEEDS_FILE")]
    feeds: Option<PathBuf>,

    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest every feed to exhaustion (default).
    Sync,
    /// Only create or extend the items table.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("harvest aborted: {err:#}");
        return Err(err);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = HarvestConfig::from_env_with_feeds(cli.feeds.as_deref())?;
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = harvest_sync::run_harvest(&config).await?;
            for feed in &summary.feeds {
                println!(
                    "{}: pages={} fetched={} new={} inserted={} skipped={}",
                    feed.feed, feed.pages, feed.fetched, feed.new, feed.inserted, feed.skipped
                );
            }
            println!(
                "harvest complete: run_id={} inserted={} skipped={}",
                summary.run_id,
                summary.inserted(),
                summary.skipped()
            );
        }
        Commands::Migrate => {
            let report = harvest_sync::run_migrate(&config).await?;
            let failed = report.failed_columns();
            if failed.is_empty() {
                info!("schema up to date");
            } else {
                info!(?failed, "schema ensured with column failures");
            }
        }
    }

    Ok(())
}
