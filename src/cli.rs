//! Command-line interface parsing for Roster Cache
//!
//! This module handles parsing of CLI arguments using clap, with environment
//! variable fallbacks, and turns them into the settings the cache runs with.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::cache::{PersistentStore, CACHE_FILE_NAME};
use crate::fetch::DEFAULT_TIMEOUT;

/// Page fetched when no URL is given
pub const DEFAULT_SOURCE_URL: &str = "http://roster.transithistory.org/";

/// Cache lifetime when RELOAD_TIME_HOURS is missing or unusable
pub const DEFAULT_RELOAD_HOURS: u64 = 6;

/// Error types for CLI argument handling
#[derive(Debug, Error)]
pub enum CliError {
    /// The source URL could not be parsed
    #[error("Invalid source URL: '{0}'")]
    InvalidUrl(String),

    /// The request timeout must be at least one second
    #[error("Invalid timeout: {0} seconds. Use a value of 1 or more")]
    InvalidTimeout(u64),
}

/// Roster Cache - fetch and cache the transit roster page
#[derive(Parser, Debug)]
#[command(name = "roster-cache")]
#[command(about = "Fetch, cache and serve the transit roster page")]
#[command(version)]
pub struct Cli {
    /// URL of the page to cache
    #[arg(long, global = true, env = "ROSTER_URL", default_value = DEFAULT_SOURCE_URL)]
    pub url: String,

    /// File the fetched page is persisted to
    ///
    /// Defaults to cached.html in the user cache directory.
    #[arg(long, global = true, env = "ROSTER_CACHE_FILE", value_name = "PATH")]
    pub cache_file: Option<PathBuf>,

    /// Hours a fetched page stays fresh; also the background refresh interval
    ///
    /// Missing, zero, negative or non-numeric values fall back to 6.
    #[arg(long, global = true, env = "RELOAD_TIME_HOURS", value_name = "HOURS")]
    pub reload_hours: Option<String>,

    /// Seconds before a single request gives up
    #[arg(long, global = true, value_name = "SECS", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub timeout_secs: u64,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// What to do once the cache is set up
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    /// Print the current page to stdout (default)
    #[default]
    Fetch,
    /// Print the cache state as JSON without fetching
    Status,
    /// Keep the cache warm in the background until Ctrl-C
    Watch,
}

/// Settings derived from CLI arguments and environment
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Page to cache
    pub source_url: String,
    /// Persisted copy of the page
    pub cache_path: PathBuf,
    /// Freshness window and refresh interval
    pub reload_interval: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Selected subcommand
    pub command: Command,
    /// Whether debug logging was requested
    pub verbose: bool,
}

/// Parses the reload interval in hours, falling back to the default.
///
/// # Arguments
/// * `value` - Raw value from `--reload-hours` or RELOAD_TIME_HOURS
///
/// # Returns
/// The parsed interval, or 6 hours for missing, zero, negative,
/// non-finite or non-numeric input
pub fn parse_reload_hours(value: Option<&str>) -> Duration {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|hours| hours.is_finite() && *hours > 0.0)
        .and_then(|hours| Duration::try_from_secs_f64(hours * 3600.0).ok())
        .unwrap_or(Duration::from_secs(DEFAULT_RELOAD_HOURS * 3600))
}

/// Default location of the persisted page
pub fn default_cache_path() -> PathBuf {
    PersistentStore::new()
        .map(|store| store.path().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(CACHE_FILE_NAME))
}

impl CacheSettings {
    /// Creates CacheSettings from parsed CLI arguments.
    ///
    /// # Arguments
    /// * `cli` - The parsed CLI struct
    ///
    /// # Returns
    /// * `Ok(CacheSettings)` with defaults filled in
    /// * `Err(CliError)` if the URL or timeout is invalid
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        reqwest::Url::parse(&cli.url).map_err(|_| CliError::InvalidUrl(cli.url.clone()))?;
        if cli.timeout_secs == 0 {
            return Err(CliError::InvalidTimeout(cli.timeout_secs));
        }

        Ok(CacheSettings {
            source_url: cli.url.clone(),
            cache_path: cli.cache_file.clone().unwrap_or_else(default_cache_path),
            reload_interval: parse_reload_hours(cli.reload_hours.as_deref()),
            request_timeout: Duration::from_secs(cli.timeout_secs),
            command: cli.command.unwrap_or_default(),
            verbose: cli.verbose,
        })
    }
}
