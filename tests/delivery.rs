use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use toolguard::detect::DetectorSwitch;
use toolguard::pipeline::Session;
use toolguard::transport::wire::encode_frame;
use toolguard::transport::Subscription;
use toolguard::{
    AggregationCache, BBox, Backoff, Detection, Detector, Frame, FrameEncoding, FrameMeta,
    InMemoryBroker, Orchestrator, PipelineConfig, Shutdown, SqliteViolationStore, StubBackend,
    Supervisor, Topics, ViolationStore, ViolationType, Zone,
};

const STREAM: &str = "line_1";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(20);

fn config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.zones = vec![Zone::new("prep", BBox::new(0.0, 0.0, 640.0, 480.0))];
    cfg.retry = Backoff {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(100),
        max_attempts: 50,
        ..Backoff::default()
    };
    cfg.broker.topic_prefix = "tg".into();
    cfg
}

fn touching() -> Vec<Detection> {
    vec![
        Detection::new("hand", 0.95, BBox::new(100.0, 150.0, 200.0, 300.0)),
        Detection::new("pizza", 0.92, BBox::new(120.0, 160.0, 280.0, 320.0)),
    ]
}

fn publish_frames(broker: &InMemoryBroker, cfg: &PipelineConfig, ids: impl Iterator<Item = u64>) {
    let topics = Topics::new(cfg.broker.topic_prefix.clone());
    let mut publisher = Session::new(
        Arc::new(broker.clone()),
        "publisher",
        Vec::new(),
        Supervisor::new(cfg.retry.clone(), Shutdown::new()),
    );
    for id in ids {
        let meta = FrameMeta {
            stream_id: STREAM.into(),
            frame_id: id,
            timestamp_ms: id * 200,
        };
        let frame = Frame::new(meta, 640, 480, FrameEncoding::Jpeg, vec![0xff, 0xd8]).unwrap();
        publisher
            .publish_with_retry(&topics.frames(STREAM), &encode_frame(&frame).unwrap())
            .unwrap();
    }
    publisher.disconnect();
}

/// Wait until both channels have been quiet for a few consecutive checks.
fn drain(broker: &InMemoryBroker, cfg: &PipelineConfig) {
    let topics = Topics::new(cfg.broker.topic_prefix.clone());
    let queues = [
        Subscription::new(topics.all_frames(), cfg.broker.worker_group.clone()),
        Subscription::new(topics.all_results(), cfg.broker.results_group.clone()),
    ];
    let started = Instant::now();
    let mut quiet = 0;
    while quiet < 3 {
        assert!(started.elapsed() < DRAIN_TIMEOUT, "pipeline did not drain");
        let pending: usize = queues
            .iter()
            .map(|q| broker.ready_count(q) + broker.unacked_count(q))
            .sum();
        quiet = if pending == 0 { quiet + 1 } else { 0 };
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn start(
    broker: &InMemoryBroker,
    cfg: &PipelineConfig,
    workers: usize,
    store: Box<dyn ViolationStore>,
    cache: Arc<AggregationCache>,
    switches: Arc<Mutex<Vec<DetectorSwitch>>>,
) -> Orchestrator {
    Orchestrator::start(
        Arc::new(broker.clone()),
        cfg,
        workers,
        move |_| {
            let stub = StubBackend::new(touching());
            switches.lock().unwrap().push(stub.switch());
            Ok(Box::new(stub) as Box<dyn Detector>)
        },
        store,
        cache,
        Shutdown::new(),
    )
    .unwrap()
}

#[test]
fn every_frame_is_stored_once_across_competing_workers() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("violations.db");
    let cfg = config();
    let broker = InMemoryBroker::new();
    let cache = Arc::new(AggregationCache::new());
    let orchestrator = start(
        &broker,
        &cfg,
        3,
        Box::new(SqliteViolationStore::open(&db).unwrap()),
        Arc::clone(&cache),
        Arc::new(Mutex::new(Vec::new())),
    );

    publish_frames(&broker, &cfg, 1..=20);
    drain(&broker, &cfg);
    orchestrator.stop().unwrap();

    let store = SqliteViolationStore::open(&db).unwrap();
    assert_eq!(store.count_for_stream(STREAM).unwrap(), 20);
    let stats = store.statistics().unwrap();
    assert_eq!(stats.records, 20);
    assert_eq!(stats.by_type.get(&ViolationType::ToolNotUsed), Some(&20));

    let live = cache.statistics();
    assert_eq!(live.frames, 20);
    assert_eq!(live.violations, 20);
}

#[test]
fn dropped_connections_and_redelivery_do_not_lose_or_double_count() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("violations.db");
    let cfg = config();
    let broker = InMemoryBroker::new();
    let cache = Arc::new(AggregationCache::new());
    let orchestrator = start(
        &broker,
        &cfg,
        2,
        Box::new(SqliteViolationStore::open(&db).unwrap()),
        Arc::clone(&cache),
        Arc::new(Mutex::new(Vec::new())),
    );

    publish_frames(&broker, &cfg, 1..=10);
    broker.sever_connections();
    broker.refuse_next_connects(2);
    publish_frames(&broker, &cfg, 11..=20);
    broker.sever_connections();
    drain(&broker, &cfg);
    orchestrator.stop().unwrap();

    let store = SqliteViolationStore::open(&db).unwrap();
    assert_eq!(store.count_for_stream(STREAM).unwrap(), 20);
    assert_eq!(store.statistics().unwrap().records, 20);
    // Redelivered results reach the cache but add nothing to its counters.
    assert_eq!(cache.statistics().violations, 20);
    let latest = cache.read(STREAM).unwrap();
    assert_eq!(latest.violation_count, 20);
    assert_eq!(latest.detections.len(), 2);
}

#[test]
fn detector_outage_holds_frames_until_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("violations.db");
    let cfg = config();
    let broker = InMemoryBroker::new();
    let cache = Arc::new(AggregationCache::new());
    let switches = Arc::new(Mutex::new(Vec::new()));
    let orchestrator = start(
        &broker,
        &cfg,
        1,
        Box::new(SqliteViolationStore::open(&db).unwrap()),
        Arc::clone(&cache),
        Arc::clone(&switches),
    );

    let down: Vec<DetectorSwitch> = switches.lock().unwrap().clone();
    for s in &down {
        s.set_available(false);
    }
    publish_frames(&broker, &cfg, 1..=5);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(
        SqliteViolationStore::open(&db).unwrap().count_for_stream(STREAM).unwrap(),
        0
    );

    for s in &down {
        s.set_available(true);
    }
    drain(&broker, &cfg);
    orchestrator.stop().unwrap();

    let store = SqliteViolationStore::open(&db).unwrap();
    assert_eq!(store.count_for_stream(STREAM).unwrap(), 5);
    let newest = store.by_stream(STREAM, 1).unwrap();
    assert_eq!(newest[0].frame_id, 5);
}
