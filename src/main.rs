//! Roster Cache - fetch and cache a remote HTML page
//!
//! Prints the current copy of the page, reports the cache state, or keeps the
//! cache warm in the background until interrupted.

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use roster_cache::cache::{PersistentStore, SingleFlightCache};
use roster_cache::cli::{CacheSettings, Cli, Command};
use roster_cache::fetch::HttpFetcher;
use roster_cache::logging;
use roster_cache::refresh::RefreshScheduler;

/// Builds the cache described by `settings`
fn build_cache(settings: &CacheSettings) -> Result<SingleFlightCache, Box<dyn std::error::Error>> {
    let fetcher = HttpFetcher::with_timeout(settings.request_timeout)?;
    let store = PersistentStore::with_path(settings.cache_path.clone());
    Ok(SingleFlightCache::new(
        settings.source_url.clone(),
        settings.reload_interval,
        Arc::new(fetcher),
        store,
    ))
}

/// Warms the cache, then refreshes on schedule until Ctrl-C
async fn watch(cache: SingleFlightCache, settings: &CacheSettings) -> io::Result<()> {
    let scheduler = RefreshScheduler::new(cache, settings.reload_interval);
    scheduler.tick().await;
    scheduler.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    scheduler.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = CacheSettings::from_cli(cli)?;
    logging::init_logging(settings.verbose);

    let cache = build_cache(&settings)?;

    match settings.command {
        Command::Fetch => {
            let document = cache.get().await?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(document.as_bytes())?;
            stdout.flush()?;
        }
        Command::Status => {
            let status = cache.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Watch => {
            watch(cache, &settings).await?;
        }
    }

    Ok(())
}
