//! demo - single-process end-to-end run over the in-memory broker.
//!
//! Publishes a synthetic stream whose stub detections cycle through three
//! situations (bare hand on the item, hand holding the scooper, hand outside
//! the zone), takes the detector down and drops every broker connection
//! halfway through, then prints what the query views report.

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use toolguard::detect::DetectorSwitch;
use toolguard::pipeline::Session;
use toolguard::query::QueryService;
use toolguard::transport::wire::encode_frame;
use toolguard::transport::Subscription;
use toolguard::{
    AggregationCache, BBox, Backoff, Detection, Detector, Frame, FrameEncoding, FrameMeta,
    InMemoryBroker, InMemoryViolationStore, Orchestrator, PipelineConfig, Shutdown,
    SqliteViolationStore, StubBackend, Supervisor, Topics, ViolationStore, Zone,
};

const STREAM_ID: &str = "demo_line";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of frames to publish.
    #[arg(long, default_value_t = 30)]
    frames: u64,
    /// Frames per second of the synthetic stream.
    #[arg(long, default_value_t = 5)]
    fps: u64,
    /// Competing worker instances.
    #[arg(long, default_value_t = 2)]
    workers: usize,
    /// Store violations in this SQLite file instead of memory.
    #[arg(long)]
    db: Option<PathBuf>,
    /// Skip the detector outage and broker drop.
    #[arg(long)]
    no_faults: bool,
}

fn scripted_detections(frame_id: u64) -> Vec<Detection> {
    let item = Detection::new("pizza", 0.92, BBox::new(120.0, 160.0, 280.0, 320.0));
    match frame_id % 3 {
        // Bare hand on the pizza inside the zone.
        1 => vec![
            Detection::new("hand", 0.95, BBox::new(100.0, 150.0, 200.0, 300.0)),
            item,
        ],
        // Same, but holding the scooper.
        2 => vec![
            Detection::new("hand", 0.95, BBox::new(100.0, 150.0, 200.0, 300.0)),
            Detection::new("scooper", 0.87, BBox::new(190.0, 140.0, 260.0, 310.0)),
            item,
        ],
        // Hand outside the zone.
        _ => vec![
            Detection::new("hand", 0.93, BBox::new(400.0, 150.0, 500.0, 300.0)),
            Detection::new("pizza", 0.9, BBox::new(380.0, 160.0, 560.0, 320.0)),
        ],
    }
}

fn stub_for(frames: u64) -> StubBackend {
    (1..=frames).fold(StubBackend::default(), |stub, id| {
        stub.with_frame(id, scripted_detections(id))
    })
}

#[derive(Serialize)]
struct Report<T: Serialize, U: Serialize> {
    expected_violations: u64,
    statistics: T,
    latest: U,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.fps == 0 || args.frames == 0 || args.workers == 0 {
        return Err(anyhow!("frames, fps and workers must be >= 1"));
    }

    let mut cfg = PipelineConfig::default();
    cfg.zones = vec![Zone::new("prep", BBox::new(0.0, 0.0, 320.0, 480.0))];
    cfg.retry = Backoff {
        initial: Duration::from_millis(50),
        max: Duration::from_millis(500),
        max_attempts: 20,
        ..Backoff::default()
    };
    cfg.broker.client_id = None;

    let broker = InMemoryBroker::new();
    let cache = Arc::new(AggregationCache::new());
    let memory_store = InMemoryViolationStore::new();
    let (consumer_store, query_store): (Box<dyn ViolationStore>, Box<dyn ViolationStore>) =
        match &args.db {
            Some(path) => (
                Box::new(SqliteViolationStore::open(path)?),
                Box::new(SqliteViolationStore::open(path)?),
            ),
            None => (Box::new(memory_store.clone()), Box::new(memory_store)),
        };

    let switches: Arc<Mutex<Vec<DetectorSwitch>>> = Arc::new(Mutex::new(Vec::new()));
    let shutdown = Shutdown::new();
    shutdown.install_ctrlc_handler()?;
    let orchestrator = {
        let switches = Arc::clone(&switches);
        Orchestrator::start(
            Arc::new(broker.clone()),
            &cfg,
            args.workers,
            move |_| {
                let stub = stub_for(args.frames);
                if let Ok(mut s) = switches.lock() {
                    s.push(stub.switch());
                }
                Ok(Box::new(stub) as Box<dyn Detector>)
            },
            consumer_store,
            Arc::clone(&cache),
            shutdown.clone(),
        )?
    };

    let topics = Topics::new(cfg.broker.topic_prefix.clone());
    let mut publisher = Session::new(
        Arc::new(broker.clone()),
        "demo-publisher",
        Vec::new(),
        Supervisor::new(cfg.retry.clone(), shutdown.clone()),
    );
    for frame_id in 1..=args.frames {
        if shutdown.is_triggered() {
            break;
        }
        let meta = FrameMeta {
            stream_id: STREAM_ID.to_string(),
            frame_id,
            timestamp_ms: (frame_id - 1) * 1000 / args.fps,
        };
        let frame = Frame::new(meta, 640, 480, FrameEncoding::Jpeg, vec![0xff, 0xd8, 0xff, 0xd9])?;
        publisher.publish_with_retry(&topics.frames(STREAM_ID), &encode_frame(&frame)?)?;

        if !args.no_faults && frame_id == args.frames / 2 {
            log::info!("demo: taking detectors down for 300ms");
            let down: Vec<DetectorSwitch> = switches.lock().map(|s| s.clone()).unwrap_or_default();
            for s in &down {
                s.set_available(false);
            }
            std::thread::sleep(Duration::from_millis(300));
            for s in &down {
                s.set_available(true);
            }
            log::info!("demo: dropping every broker connection");
            broker.sever_connections();
        }
    }

    let queues = [
        Subscription::new(topics.all_frames(), cfg.broker.worker_group.clone()),
        Subscription::new(topics.all_results(), cfg.broker.results_group.clone()),
    ];
    let started = Instant::now();
    let mut quiet_checks = 0;
    while quiet_checks < 3 && started.elapsed() < DRAIN_TIMEOUT && !shutdown.is_triggered() {
        let pending: usize = queues
            .iter()
            .map(|q| broker.ready_count(q) + broker.unacked_count(q))
            .sum();
        quiet_checks = if pending == 0 { quiet_checks + 1 } else { 0 };
        std::thread::sleep(Duration::from_millis(100));
    }
    publisher.disconnect();
    orchestrator.stop()?;

    let query = QueryService::new(query_store, cache);
    let report = Report {
        expected_violations: (1..=args.frames).filter(|id| id % 3 == 1).count() as u64,
        statistics: query.statistics()?,
        latest: query.latest_detection(STREAM_ID)?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
