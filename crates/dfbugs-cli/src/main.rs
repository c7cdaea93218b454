use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use dfbugs_core::format_bug_post;
use dfbugs_publish::{BlueskyPublisher, PublishConfig, Publisher};
use dfbugs_storage::BugStore;
use dfbugs_sync::default_db_path;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dfbugs")]
#[command(about = "Dwarf Fortress bug tracker sync + Bluesky poster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download the tracker CSV export and reconcile the local database.
    Sync,
    /// Publish one randomly selected bug to Bluesky.
    Post,
}

/// Selection-side configuration for the `post` command.
#[derive(Debug, Clone)]
struct PostConfig {
    db_path: PathBuf,
    tracker_base: String,
    status_filter: Vec<String>,
}

impl PostConfig {
    fn from_env() -> Self {
        Self {
            db_path: std::env::var("DFBUGS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_db_path()),
            tracker_base: std::env::var("DFBUGS_TRACKER_BASE")
                .unwrap_or_else(|_| "https://dwarffortressbugtracker.com".to_string()),
            // Disabled unless DFBUGS_STATUS_FILTER lists statuses explicitly,
            // e.g. "new,confirmed,acknowledged,feedback" to post open bugs only.
            status_filter: std::env::var("DFBUGS_STATUS_FILTER")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync => {
            let summary = dfbugs_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} added={} updated={} total={}",
                summary.run_id, summary.added, summary.updated, summary.total
            );
        }
        Commands::Post => post_random().await?,
    }

    Ok(())
}

async fn post_random() -> Result<()> {
    let config = PostConfig::from_env();

    let store = BugStore::open_existing(&config.db_path).await?;
    let bug = store
        .select_random(&config.status_filter)
        .await?
        .ok_or_else(|| anyhow!("no bugs stored; run `dfbugs sync` first"))?;
    println!("selected bug #{}: {}", bug.id, bug.summary);

    let post = format_bug_post(&bug, &config.tracker_base);
    println!("post text ({} bytes):", post.text().len());
    println!("{}", post.text());

    let publisher = BlueskyPublisher::new(PublishConfig::from_env()?)?;
    let post_ref = publisher.publish(&post).await?;
    println!("posted: {}", post_ref.uri);
    Ok(())
}
