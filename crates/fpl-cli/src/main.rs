use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fpl_feed::{FeedSource, FileFeed};
use fpl_storage::{MemoryStore, StoreGateway};
use fpl_sync::{Reconciler, SyncConfig, SyncRunSummary};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fpl-cli")]
#[command(about = "FPL feed sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one feed-to-store sync.
    Sync {
        /// Replay captured payloads from this directory instead of calling the live feed.
        #[arg(long)]
        feed_dir: Option<PathBuf>,
        /// Sync into a throwaway in-memory store instead of the configured database.
        #[arg(long)]
        memory: bool,
    },
    /// Apply pending database migrations.
    Migrate,
    /// Serve the HTTP api.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        feed_dir: None,
        memory: false,
    }) {
        Commands::Sync { feed_dir, memory } => {
            let summary = run_sync(feed_dir, memory).await?;
            println!(
                "sync complete: run_id={} teams={} players(inserted={} updated={} skipped={}) fixtures={} chips={}",
                summary.run_id,
                summary.teams.upserted,
                summary.players.inserted,
                summary.players.updated,
                summary.players.skipped,
                summary.fixtures.upserted,
                summary.chips.upserted
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            config.connect_store().await?;
            println!("migrations applied ({})", config.database_kind);
        }
        Commands::Serve => {
            fpl_web::serve_from_env().await?;
        }
    }

    Ok(())
}

async fn run_sync(feed_dir: Option<PathBuf>, memory: bool) -> Result<SyncRunSummary> {
    if feed_dir.is_none() && !memory {
        return fpl_sync::run_sync_once_from_env().await;
    }

    let config = SyncConfig::from_env();
    let feed: Arc<dyn FeedSource> = match feed_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "replaying captured feed");
            Arc::new(FileFeed::new(dir))
        }
        None => Arc::new(config.http_feed().context("building feed client")?),
    };
    let store: Arc<dyn StoreGateway> = if memory {
        Arc::new(MemoryStore::new())
    } else {
        config.connect_store().await?
    };

    let reconciler = Reconciler::new(feed, store).with_tracked_fields(config.tracked_fields);
    Ok(reconciler.run_sync().await?)
}
