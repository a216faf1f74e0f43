//! violation_worker - consume frames, detect, apply the violation rules and
//! publish per-frame results.
//!
//! Run several instances against the same broker to scale out; they share
//! the work queue through the configured worker group.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use toolguard::pipeline::{ConsumerOptions, WorkConsumer};
use toolguard::{DetectorRegistry, MqttConnector, PipelineConfig, Shutdown, Topics};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Consume frames and publish detections and tool-not-used violations"
)]
struct Args {
    /// MQTT client id (persistent session key). Defaults to prefix-worker-pid.
    #[arg(long, env = "TOOLGUARD_CLIENT_ID")]
    client_id: Option<String>,

    /// Detector backend (overrides configuration).
    #[arg(long)]
    detector: Option<String>,

    /// Fixture detections for the stub backend.
    #[arg(long, env = "TOOLGUARD_FIXTURE_PATH")]
    fixture: Option<PathBuf>,

    /// Longest a single receive blocks, in milliseconds.
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,

    /// List detector backends compiled into this build and exit.
    #[arg(long)]
    list_detectors: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let registry = DetectorRegistry::with_builtin();
    if args.list_detectors {
        for name in registry.list() {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut cfg = PipelineConfig::load()?;
    if let Some(backend) = args.detector {
        cfg.detector.backend = backend;
    }
    if let Some(path) = args.fixture {
        cfg.detector.fixture_path = Some(path);
    }
    let detector = registry.build_configured(&cfg.detector)?;

    let shutdown = Shutdown::new();
    shutdown.install_ctrlc_handler()?;

    let connector = Arc::new(MqttConnector::new(cfg.broker.clone())?);
    let client_id = args
        .client_id
        .unwrap_or_else(|| cfg.broker.client_id_for("worker"));
    let options = ConsumerOptions::new(client_id, cfg.broker.worker_group.clone(), shutdown)
        .with_backoff(cfg.retry.clone())
        .with_poll_interval(Duration::from_millis(args.poll_ms.max(1)));

    log::info!(
        "broker {} prefix {} group {}; {} zones; thresholds {:?}",
        cfg.broker.addr,
        cfg.broker.topic_prefix,
        cfg.broker.worker_group,
        cfg.zones.len(),
        cfg.thresholds
    );
    let mut worker = WorkConsumer::new(
        connector,
        Topics::new(cfg.broker.topic_prefix.clone()),
        Arc::new(cfg.engine()),
        detector,
        options,
    );
    let stats = worker
        .run()
        .map_err(|e| anyhow!("violation worker stopped: {}", e))?;
    log::info!(
        "processed {} frames, {} violations, {} discarded, {} requeued",
        stats.frames,
        stats.violations,
        stats.discarded,
        stats.requeued
    );
    Ok(())
}
