//! Estate-Watch main entry point
//!
//! This is the command-line runner for the Estate-Watch listing watcher.

use clap::Parser;
use estate_watch::config::{load_config_with_hash, Config};
use estate_watch::crawler::Orchestrator;
use estate_watch::notify::LogObserver;
use estate_watch::storage::{lock_store, open_storage};
use estate_watch::SessionId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Estate-Watch: a polling real-estate listing watcher
///
/// Estate-Watch polls a search-results page, fetches every listing it has
/// not seen before, stores it in SQLite and logs what is new.
#[derive(Parser, Debug)]
#[command(name = "estate-watch")]
#[command(version)]
#[command(about = "A polling real-estate listing watcher", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Session id reported with every notification
    #[arg(long, default_value_t = 0)]
    session: SessionId,

    /// Run a single polling iteration and exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats"])]
    once: bool,

    /// Validate config and show the search that would be polled
    #[arg(long, conflicts_with_all = ["once", "stats"])]
    dry_run: bool,

    /// Show stored listings and exit
    #[arg(long, conflicts_with_all = ["once", "dry_run"])]
    stats: bool,

    /// Number of recent listings shown by --stats
    #[arg(long, default_value_t = 10, requires = "stats")]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let config = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            cfg
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if cli.dry_run {
        handle_dry_run(&config)?;
    } else if cli.stats {
        handle_stats(&config, cli.limit)?;
    } else if cli.once {
        handle_once(&config, cli.session).await?;
    } else {
        handle_watch(&config, cli.session).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("estate_watch=info,warn"),
            1 => EnvFilter::new("estate_watch=debug,info"),
            2 => EnvFilter::new("estate_watch=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the resolved configuration
fn handle_dry_run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let scraper = &config.scraper;
    let mut index_url = scraper.index_url()?;
    index_url.query_pairs_mut().extend_pairs(config.search.iter());

    println!("=== Estate-Watch Dry Run ===\n");

    println!("Search:");
    println!("  Index URL: {}", index_url);
    for (key, value) in &config.search {
        println!("  {} = {}", key, value);
    }

    println!("\nScraper:");
    println!(
        "  Retries: {} (index), {} (detail)",
        scraper.max_retries, scraper.detail_max_retries
    );
    println!("  Request timeout: {}s", scraper.request_timeout_secs);
    println!("  Inter-request delay: {}ms", scraper.inter_request_delay_ms);
    println!(
        "  429 backoff: {}ms x {}",
        scraper.backoff_base_ms, scraper.backoff_factor
    );
    println!("  Concurrent detail fetches: {}", scraper.concurrency_limit);
    println!(
        "  Poll interval: {}-{}ms",
        scraper.poll_interval_min_ms, scraper.poll_interval_max_ms
    );
    println!(
        "  Gives up after {} failed iterations",
        scraper.max_consecutive_failures
    );

    println!("\nProxies ({}):", config.proxy.addresses.len());
    println!(
        "  Direct egress probability: {}",
        config.proxy.direct_probability
    );

    println!("\nOutput:");
    println!("  Database: {}", config.output.database_path);

    println!("\n✓ Configuration is valid");

    Ok(())
}

/// Handles the --stats mode: shows the stored listing count and the newest ones
fn handle_stats(config: &Config, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    println!("Database: {}\n", config.output.database_path);

    let store = open_storage(Path::new(&config.output.database_path))?;
    let store = lock_store(&store)?;

    println!("Stored listings: {}", store.count()?);

    let recent = store.recent(limit)?;
    if !recent.is_empty() {
        println!("\nMost recent:");
        for listing in recent {
            println!("  {}", listing);
        }
    }

    Ok(())
}

fn build_orchestrator(
    config: &Config,
    session: SessionId,
) -> Result<Orchestrator, Box<dyn std::error::Error>> {
    let store = open_storage(Path::new(&config.output.database_path))?;
    Ok(Orchestrator::from_config(
        session,
        config,
        store,
        Arc::new(LogObserver),
    )?)
}

/// Handles the --once mode: a single iteration
async fn handle_once(config: &Config, session: SessionId) -> Result<(), Box<dyn std::error::Error>> {
    let orchestrator = build_orchestrator(config, session)?;

    match orchestrator.run_once().await {
        Ok(staged) => {
            tracing::info!("Iteration finished, {} new listing(s)", staged);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Iteration failed: {}", e);
            Err(e.into())
        }
    }
}

/// Handles the default mode: polls until Ctrl-C or a terminal error
async fn handle_watch(config: &Config, session: SessionId) -> Result<(), Box<dyn std::error::Error>> {
    let mut orchestrator = build_orchestrator(config, session)?;
    orchestrator.start()?;
    tracing::info!("Watching, press Ctrl-C to stop");

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Interrupt received, stopping");
            orchestrator.stop().await
        }
        result = orchestrator.join() => result,
    };

    match result {
        Ok(()) => {
            tracing::info!("Stopped");
            Ok(())
        }
        Err(e) => {
            tracing::error!("Session failed: {}", e);
            Err(e.into())
        }
    }
}
