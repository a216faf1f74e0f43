use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use toolguard::geometry::Anchor;
use toolguard::PipelineConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "TOOLGUARD_CONFIG",
        "TOOLGUARD_BROKER_ADDR",
        "TOOLGUARD_DB_PATH",
        "TOOLGUARD_CONF_THRESHOLD",
        "TOOLGUARD_IOU_THRESHOLD",
        "TOOLGUARD_POSSESSION_OVERLAP",
        "TOOLGUARD_TOUCH_OVERLAP",
        "TOOLGUARD_ZONES",
        "TOOLGUARD_DETECTOR",
        "TOOLGUARD_MODEL_PATH",
    ] {
        std::env::remove_var(key);
    }
}

fn temp_config(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_any_configuration() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("load defaults");
    assert_eq!(cfg.thresholds.conf, 0.3);
    assert_eq!(cfg.thresholds.iou, 0.45);
    assert_eq!(cfg.thresholds.possession, 0.05);
    assert_eq!(cfg.thresholds.touch, 0.1);
    assert_eq!(cfg.anchor, Anchor::Center);
    assert_eq!(cfg.zones.len(), 1);
    assert_eq!(cfg.broker.addr, "mqtt://127.0.0.1:1883");
    assert_eq!(cfg.broker.topic_prefix, "toolguard");
    assert_eq!(cfg.db_path.to_str(), Some("violations.db"));
    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(cfg.retry.max_attempts, 8);
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(
        ".json",
        r#"{
            "db_path": "/var/lib/toolguard/prod.db",
            "engine": { "conf_threshold": 0.5, "touch_overlap": 0.2, "anchor": "bottom_center" },
            "zones": [
                { "name": "prep-left", "rect": [0, 0, 300, 480] },
                { "rect": [340, 0, 640, 480] }
            ],
            "labels": { "hands": ["hand"], "items": ["pizza", "dough"], "tools": ["scooper"] },
            "broker": { "addr": "mqtts://broker.local:8883", "topic_prefix": "store7", "worker_group": "w" },
            "retry": { "initial_ms": 100, "max_ms": 2000, "max_attempts": 3 }
        }"#,
    );
    std::env::set_var("TOOLGUARD_CONFIG", file.path());
    std::env::set_var("TOOLGUARD_TOUCH_OVERLAP", "0.15");
    std::env::set_var("TOOLGUARD_DB_PATH", "override.db");

    let cfg = PipelineConfig::load().expect("load config");
    assert_eq!(cfg.thresholds.conf, 0.5);
    assert_eq!(cfg.thresholds.touch, 0.15);
    assert_eq!(cfg.thresholds.iou, 0.45);
    assert_eq!(cfg.anchor, Anchor::BottomCenter);
    assert_eq!(cfg.zones.len(), 2);
    assert_eq!(cfg.zones[0].name, "prep-left");
    assert_eq!(cfg.labels.items, vec!["pizza", "dough"]);
    assert_eq!(cfg.broker.addr, "mqtts://broker.local:8883");
    assert_eq!(cfg.broker.topic_prefix, "store7");
    assert_eq!(cfg.broker.worker_group, "w");
    assert_eq!(cfg.db_path.to_str(), Some("override.db"));
    assert_eq!(cfg.retry.initial, Duration::from_millis(100));
    assert_eq!(cfg.retry.max_attempts, 3);

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(
        ".toml",
        r#"
        [engine]
        iou_threshold = 0.6

        [[zones]]
        name = "counter"
        rect = [10.0, 10.0, 100.0, 100.0]

        [detector]
        backend = "stub"
        "#,
    );
    std::env::set_var("TOOLGUARD_CONFIG", file.path());
    std::env::set_var("TOOLGUARD_ZONES", "0,0,50,50; 60,0,120,50");

    let cfg = PipelineConfig::load().expect("load config");
    assert_eq!(cfg.thresholds.iou, 0.6);
    assert_eq!(cfg.zones.len(), 2);
    assert_eq!(cfg.zones[1].rect.x1, 60.0);

    clear_env();
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();

    for (key, value) in [
        ("TOOLGUARD_CONF_THRESHOLD", "1.5"),
        ("TOOLGUARD_TOUCH_OVERLAP", "abc"),
        ("TOOLGUARD_ZONES", "10,10,5,50"),
        ("TOOLGUARD_ZONES", "1,2,3"),
    ] {
        clear_env();
        std::env::set_var(key, value);
        assert!(PipelineConfig::load().is_err(), "{}={} should fail", key, value);
    }

    clear_env();
    let file = temp_config(
        ".json",
        r#"{ "labels": { "hands": ["hand"], "items": ["hand"], "tools": ["scooper"] } }"#,
    );
    std::env::set_var("TOOLGUARD_CONFIG", file.path());
    assert!(PipelineConfig::load().is_err());

    clear_env();
}
