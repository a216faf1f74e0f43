//! results_aggregator - persist violations from the results channel and keep
//! live per-stream aggregates.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use toolguard::pipeline::{ConsumerOptions, ResultsConsumer};
use toolguard::{
    AggregationCache, MqttConnector, PipelineConfig, Shutdown, SqliteViolationStore, Topics,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Store tool-not-used violations and maintain live stream aggregates"
)]
struct Args {
    /// SQLite database path (overrides configuration).
    #[arg(long)]
    db: Option<PathBuf>,

    /// MQTT client id (persistent session key). Defaults to prefix-results-pid.
    #[arg(long, env = "TOOLGUARD_CLIENT_ID")]
    client_id: Option<String>,

    /// Seconds between aggregate statistics log lines; 0 disables them.
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    /// Longest a single receive blocks, in milliseconds.
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = PipelineConfig::load()?;
    if let Some(db) = args.db {
        cfg.db_path = db;
    }
    let store = SqliteViolationStore::open(&cfg.db_path)
        .with_context(|| format!("failed to open {}", cfg.db_path.display()))?;
    log::info!("writing violations to {}", cfg.db_path.display());

    let shutdown = Shutdown::new();
    shutdown.install_ctrlc_handler()?;
    let cache = Arc::new(AggregationCache::new());

    let reporter = if args.stats_interval > 0 {
        let cache = Arc::clone(&cache);
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(args.stats_interval);
        Some(
            std::thread::Builder::new()
                .name("stats".into())
                .spawn(move || {
                    while !shutdown.wait(interval) {
                        let stats = cache.statistics();
                        log::info!(
                            "aggregates: {} streams, {} frames, {} violations {:?}",
                            stats.streams,
                            stats.frames,
                            stats.violations,
                            stats.by_stream
                        );
                    }
                })
                .map_err(|e| anyhow!("failed to spawn stats reporter: {}", e))?,
        )
    } else {
        None
    };

    let connector = Arc::new(MqttConnector::new(cfg.broker.clone())?);
    let client_id = args
        .client_id
        .unwrap_or_else(|| cfg.broker.client_id_for("results"));
    let options = ConsumerOptions::new(client_id, cfg.broker.results_group.clone(), shutdown.clone())
        .with_backoff(cfg.retry.clone())
        .with_poll_interval(Duration::from_millis(args.poll_ms.max(1)));

    let mut consumer = ResultsConsumer::new(
        connector,
        Topics::new(cfg.broker.topic_prefix.clone()),
        Box::new(store),
        cache,
        options,
    );
    let outcome = consumer.run();

    shutdown.trigger();
    if let Some(handle) = reporter {
        let _ = handle.join();
    }
    let stats = outcome.map_err(|e| anyhow!("results aggregator stopped: {}", e))?;
    log::info!(
        "handled {} results: {} records stored, {} duplicates, {} discarded",
        stats.messages,
        stats.inserted,
        stats.duplicates,
        stats.discarded
    );
    Ok(())
}
