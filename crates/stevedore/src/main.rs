//! stevedore - bulk content loader for sharded document stores
//!
//! # Usage
//!
//! ```bash
//! # Load everything under input.path
//! stevedore -c load.yaml
//!
//! # Validate configuration
//! stevedore -c load.yaml validate
//!
//! # Check connectivity and shard topology
//! stevedore -c load.yaml check
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stevedore::{
    collect_files, plan_splits, DirectorySource, HttpStoreConnector, InputSplit, LoadConfig,
    LoadRunner, StoreConnector,
};

#[derive(Parser)]
#[command(name = "stevedore")]
#[command(version, about = "Bulk content loader for sharded document stores")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "load.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load documents from the configured input (default)
    Run,
    /// Validate configuration file
    Validate,
    /// Check connectivity, capabilities, and shard topology
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = LoadConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_load(config).await,
        Commands::Validate => validate_config(config),
        Commands::Check => check_store(config).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn run_load(config: LoadConfig) -> Result<()> {
    let started = Instant::now();

    let files = collect_files(&config.input.path)
        .with_context(|| format!("Failed to enumerate {}", config.input.path.display()))?;
    if files.is_empty() {
        warn!(path = %config.input.path.display(), "input directory holds no files");
        return Ok(());
    }
    info!(files = files.len(), "input enumerated");

    let root = config.input.path.clone();
    let uri_prefix = config.input.uri_prefix.clone();
    let uri_suffix = config.input.uri_suffix.clone();
    let splits: Vec<InputSplit> = plan_splits(files, config.workers.thread_count)
        .into_iter()
        .enumerate()
        .map(|(index, files)| {
            let size: u64 = files.iter().map(|(_, size)| size).sum();
            let source = DirectorySource::new(root.clone(), files)
                .with_uri_transform(uri_prefix.clone(), uri_suffix.clone());
            InputSplit::new(format!("split-{}", index), size, Box::new(source))
        })
        .collect();

    let connector = Arc::new(HttpStoreConnector::new(&config.store)?);
    let runner = LoadRunner::new(connector, config);

    // first ctrl-c requests a graceful stop; workers finish their current
    // record, retries stop re-issuing, and open transactions are drained
    let shutdown = runner.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested, draining workers");
            shutdown.store(true, Ordering::SeqCst);
        }
    });

    let report = runner.run(splits).await?;

    info!(
        committed = report.counters.committed,
        failed = report.counters.failed,
        splits_failed = report.splits_failed(),
        elapsed_secs = started.elapsed().as_secs(),
        "done"
    );
    for split in &report.splits {
        info!(
            split = %split.name,
            status = %split.status,
            committed = split.counters.committed,
            failed = split.counters.failed,
            "split outcome"
        );
    }

    // best-effort completion: per-record failures do not change the exit
    // status, a structural failure already returned Err above
    Ok(())
}

fn validate_config(config: LoadConfig) -> Result<()> {
    config.validate()?;
    println!("Configuration is valid");
    println!("  hosts: {:?}", config.store.hosts);
    println!(
        "  batch_size: {}, txn_size: {}",
        config.batch.batch_size, config.batch.txn_size
    );
    println!(
        "  fastload: {}, restrict_hosts: {}",
        config.store.fastload, config.store.restrict_hosts
    );
    println!(
        "  thread_count: {}, min_threads: {}",
        config.workers.thread_count, config.workers.min_threads
    );
    Ok(())
}

async fn check_store(config: LoadConfig) -> Result<()> {
    let connector = HttpStoreConnector::new(&config.store)?;

    let capabilities = connector
        .capabilities()
        .await
        .context("Capabilities check failed")?;
    println!("✓ store reachable");
    println!("  multi_doc_batch: {}", capabilities.multi_doc_batch);

    match connector.topology().await {
        Ok(shards) => {
            println!("✓ topology: {} shards", shards.len());
            for shard in &shards {
                println!("  {} → {:?}", shard.id, shard.hosts);
            }
        }
        Err(e) => {
            println!("✗ topology unavailable: {}", e);
            if config.store.fastload && config.store.shards.is_empty() {
                anyhow::bail!("fastload is enabled but no shard map is available");
            }
        }
    }

    Ok(())
}
