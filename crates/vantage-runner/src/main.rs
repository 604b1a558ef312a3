//! Vantage runner - drives one view process over file-backed market data.
//!
//! # Usage
//!
//! ```bash
//! # Replay recorded ticks as live data
//! vantage-runner --config config/vantage.toml
//!
//! # Value the portfolio against a persisted snapshot
//! vantage-runner --config config/vantage.toml --snapshot close-2024-02-29
//!
//! # Run ten cycles, then persist the latest live values
//! vantage-runner --max-cycles 10 --save-snapshot intraday
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vantage_engine::{
    Clock, InMemoryLiveDataProvider, ManualClock, StaticViewCompiler, ViewExecutionOptions,
    ViewProcess, ViewProcessEvent,
};
use vantage_ext_file::{CsvTickReplay, FileMarketDataResolver, JsonSnapshotStore, StoredSnapshot};

mod config;
mod demo;
mod output;

use config::RunnerConfig;

/// Vantage - live view cycle runner
#[derive(Parser)]
#[command(name = "vantage-runner")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "VANTAGE_CONFIG", default_value = "config/vantage.toml")]
    config: String,

    /// Run against a persisted snapshot instead of live data
    #[arg(long)]
    snapshot: Option<String>,

    /// Stop after this many completed cycles
    #[arg(long)]
    max_cycles: Option<u64>,

    /// Persist the final live values under this snapshot id
    #[arg(long)]
    save_snapshot: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,vantage=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Vantage runner v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = if Path::new(&cli.config).exists() {
        info!("Loading configuration from {}", cli.config);
        RunnerConfig::from_file(&cli.config)
            .with_context(|| format!("reading {}", cli.config))?
    } else {
        info!("Using default configuration");
        RunnerConfig::default()
    };
    if config.positions.is_empty() {
        config.positions = demo::default_positions();
    }
    if let Some(snapshot_id) = cli.snapshot.clone() {
        config.execution.market_data_snapshot_id = Some(snapshot_id);
    }

    // Market data: the replay is the default live source, its clock follows the recording
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let feed = Arc::new(InMemoryLiveDataProvider::new("replay").with_clock(clock.clone()));
    let replay = match &config.ticks_file {
        Some(path) => CsvTickReplay::new(path, feed)?,
        None => CsvTickReplay::from_reader(std::io::empty(), feed)?,
    };
    let replay = Arc::new(replay.with_clock(clock.clone()));
    if let Some(start) = replay.peek_timestamp() {
        clock.set(start);
    }
    // The first batch primes the feed before the initial cycle
    replay.advance();

    let store = JsonSnapshotStore::open(&config.snapshot_store)?;
    let resolver = FileMarketDataResolver::new(replay.clone()).with_snapshot_store(store.clone());

    // Build the view process
    let graph = demo::portfolio_graph(&config.view_name, &config.positions)?;
    let process = ViewProcess::builder(config.view_name.as_str())
        .with_compiler(Arc::new(StaticViewCompiler::new(config.view_name.as_str(), vec![graph])))
        .with_resolver(Arc::new(resolver))
        .with_functions(demo::functions(&config.positions)?)
        .with_options(ViewExecutionOptions::from_config(&config.execution, clock.clone()))
        .with_config(config.engine.clone())
        .with_clock(clock.clone())
        .build()?;

    let mut events = process.subscribe();
    process.start().await?;

    let portfolio = demo::portfolio_target(&config.view_name);
    let mut replay_timer =
        tokio::time::interval(Duration::from_millis(config.replay_interval_ms.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut completed = 0u64;

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for interrupt");
                }
                info!("Interrupted, stopping view process");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = output::summarize(&event, &portfolio) {
                        println!("{}", line);
                    }
                    match event {
                        ViewProcessEvent::CycleCompleted { .. } => {
                            completed += 1;
                            if cli.max_cycles.is_some_and(|max| completed >= max) {
                                info!(completed, "Cycle limit reached");
                                break;
                            }
                        }
                        ViewProcessEvent::ProcessTerminated { .. } => break,
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event listener lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = replay_timer.tick(), if !replay.is_exhausted() => {
                replay.advance();
            }
        }
    }

    process.stop().await;
    let stats = process.statistics();
    info!(
        cycles_completed = stats.cycles_completed,
        cycles_failed = stats.cycles_failed,
        average_ms = ?stats.average_duration().map(|d| d.as_millis()),
        "Run finished"
    );

    if let Some(snapshot_id) = cli.save_snapshot {
        let requirements = demo::market_data_requirements(&config.positions)?;
        let snapshot =
            StoredSnapshot::capture(snapshot_id, replay.as_ref(), &requirements, clock.now())?;
        let path = store.save(&snapshot)?;
        println!("saved {} value(s) to {}", snapshot.values.len(), path.display());
    }

    Ok(())
}
