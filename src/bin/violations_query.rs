//! violations_query - print read-only views of the violation store as JSON.
//!
//! Live aggregates are held in the aggregator's memory, so this tool only
//! reports their absence; everything durable comes from the store.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use toolguard::query::DEFAULT_VIOLATION_LIMIT;
use toolguard::{AggregationCache, PipelineConfig, QueryService, SqliteViolationStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Query stored tool-not-used violations")]
struct Args {
    /// SQLite database path (overrides configuration).
    #[arg(long, env = "TOOLGUARD_DB_PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store reachability.
    Health,
    /// Streams with stored violations, most first.
    Streams,
    /// Newest violations of one stream.
    Violations {
        stream: String,
        #[arg(long, default_value_t = DEFAULT_VIOLATION_LIMIT)]
        limit: usize,
    },
    /// Totals and first/last violation time of one stream.
    Summary { stream: String },
    /// One violation record by id.
    Violation { id: i64 },
    /// Totals by type and stream count.
    Stats,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut cfg = PipelineConfig::load()?;
    if let Some(db) = args.db {
        cfg.db_path = db;
    }
    if !cfg.db_path.exists() {
        return Err(anyhow!("database {} does not exist", cfg.db_path.display()));
    }
    let store = SqliteViolationStore::open(&cfg.db_path)
        .with_context(|| format!("failed to open {}", cfg.db_path.display()))?;
    let service = QueryService::new(Box::new(store), Arc::new(AggregationCache::new()));

    match args.command {
        Command::Health => print_json(&service.health()),
        Command::Streams => print_json(&service.streams()?),
        Command::Violations { stream, limit } => {
            print_json(&service.stream_violations(&stream, limit)?)
        }
        Command::Summary { stream } => print_json(&service.stream_summary(&stream)?),
        Command::Violation { id } => print_json(&service.violation(id)?),
        Command::Stats => print_json(&service.statistics()?),
    }
}
