use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{RoleLabels, Thresholds, ViolationEngine};
use crate::geometry::{Anchor, BBox, Zone};
use crate::supervisor::Backoff;

const DEFAULT_DB_PATH: &str = "violations.db";
const DEFAULT_BROKER_ADDR: &str = "mqtt://127.0.0.1:1883";
const DEFAULT_TOPIC_PREFIX: &str = "toolguard";
const DEFAULT_WORKER_GROUP: &str = "violation-workers";
const DEFAULT_RESULTS_GROUP: &str = "results-aggregators";
const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
const DEFAULT_SESSION_EXPIRY_SECS: u32 = 60 * 60;
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.25;
const DEFAULT_ZONE: [f32; 4] = [0.0, 0.0, 640.0, 480.0];
const DEFAULT_ZONE_NAME: &str = "default";

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    db_path: Option<PathBuf>,
    engine: Option<EngineConfigFile>,
    zones: Option<Vec<ZoneConfigFile>>,
    labels: Option<LabelsConfigFile>,
    broker: Option<BrokerConfigFile>,
    detector: Option<DetectorConfigFile>,
    retry: Option<RetryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    conf_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    possession_overlap: Option<f32>,
    touch_overlap: Option<f32>,
    anchor: Option<Anchor>,
}

#[derive(Debug, Deserialize)]
struct ZoneConfigFile {
    name: Option<String>,
    rect: [f32; 4],
}

#[derive(Debug, Deserialize, Default)]
struct LabelsConfigFile {
    hands: Option<Vec<String>>,
    items: Option<Vec<String>>,
    tools: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct BrokerConfigFile {
    addr: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    worker_group: Option<String>,
    results_group: Option<String>,
    keep_alive_secs: Option<u64>,
    session_expiry_secs: Option<u32>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    fixture_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    labels: Option<Vec<String>>,
    score_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RetryConfigFile {
    initial_ms: Option<u64>,
    max_ms: Option<u64>,
    multiplier: Option<f64>,
    max_attempts: Option<u32>,
    jitter: Option<f64>,
}

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    pub thresholds: Thresholds,
    pub anchor: Anchor,
    pub zones: Vec<Zone>,
    pub labels: RoleLabels,
    pub broker: BrokerSettings,
    pub detector: DetectorSettings,
    pub retry: Backoff,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub addr: String,
    pub topic_prefix: String,
    /// Defaults to `<prefix>-<binary>-<pid>` when unset.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Shared subscription group for competing consumers.
    pub worker_group: String,
    /// Shared subscription group for results aggregators.
    pub results_group: String,
    pub keep_alive: Duration,
    pub session_expiry_secs: u32,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_BROKER_ADDR.to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            client_id: None,
            username: None,
            password: None,
            worker_group: DEFAULT_WORKER_GROUP.to_string(),
            results_group: DEFAULT_RESULTS_GROUP.to_string(),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            session_expiry_secs: DEFAULT_SESSION_EXPIRY_SECS,
            tls_ca_path: None,
            tls_client_cert_path: None,
            tls_client_key_path: None,
        }
    }
}

impl BrokerSettings {
    /// Configured client id, or one derived from the prefix, role and pid.
    pub fn client_id_for(&self, role: &str) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}-{}", self.topic_prefix, role, std::process::id()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    /// Fixture detections for the stub backend.
    pub fixture_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    /// Model class index to label.
    pub labels: Vec<String>,
    pub score_threshold: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR.to_string(),
            model_path: None,
            fixture_path: None,
            input_width: DEFAULT_MODEL_INPUT,
            input_height: DEFAULT_MODEL_INPUT,
            labels: RoleLabels::default().all(),
            score_threshold: DEFAULT_SCORE_THRESHOLD,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            thresholds: Thresholds::default(),
            anchor: Anchor::default(),
            zones: vec![Zone::new(DEFAULT_ZONE_NAME, BBox::from(DEFAULT_ZONE))],
            labels: RoleLabels::default(),
            broker: BrokerSettings::default(),
            detector: DetectorSettings::default(),
            retry: Backoff::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from `TOOLGUARD_CONFIG` (if set), then environment overrides,
    /// then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TOOLGUARD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let defaults = Self::default();
        let engine = file.engine.unwrap_or_default();
        let thresholds = Thresholds {
            conf: engine.conf_threshold.unwrap_or(defaults.thresholds.conf),
            iou: engine.iou_threshold.unwrap_or(defaults.thresholds.iou),
            possession: engine
                .possession_overlap
                .unwrap_or(defaults.thresholds.possession),
            touch: engine.touch_overlap.unwrap_or(defaults.thresholds.touch),
        };
        let zones = match file.zones {
            Some(zones) => zones
                .into_iter()
                .enumerate()
                .map(|(i, z)| {
                    Zone::new(
                        z.name.unwrap_or_else(|| format!("zone-{}", i + 1)),
                        BBox::from(z.rect),
                    )
                })
                .collect(),
            None => defaults.zones,
        };
        let labels_file = file.labels.unwrap_or_default();
        let labels = RoleLabels {
            hands: labels_file.hands.unwrap_or(defaults.labels.hands),
            items: labels_file.items.unwrap_or(defaults.labels.items),
            tools: labels_file.tools.unwrap_or(defaults.labels.tools),
        };

        let broker_file = file.broker.unwrap_or_default();
        let broker_defaults = defaults.broker;
        let broker = BrokerSettings {
            addr: broker_file.addr.unwrap_or(broker_defaults.addr),
            topic_prefix: broker_file
                .topic_prefix
                .unwrap_or(broker_defaults.topic_prefix),
            client_id: broker_file.client_id,
            username: broker_file.username,
            password: broker_file.password,
            worker_group: broker_file
                .worker_group
                .unwrap_or(broker_defaults.worker_group),
            results_group: broker_file
                .results_group
                .unwrap_or(broker_defaults.results_group),
            keep_alive: broker_file
                .keep_alive_secs
                .map(Duration::from_secs)
                .unwrap_or(broker_defaults.keep_alive),
            session_expiry_secs: broker_file
                .session_expiry_secs
                .unwrap_or(broker_defaults.session_expiry_secs),
            tls_ca_path: broker_file.tls_ca_path,
            tls_client_cert_path: broker_file.tls_client_cert_path,
            tls_client_key_path: broker_file.tls_client_key_path,
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            model_path: detector_file.model_path,
            fixture_path: detector_file.fixture_path,
            input_width: detector_file.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
            input_height: detector_file.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
            labels: detector_file.labels.unwrap_or_else(|| labels.all()),
            score_threshold: detector_file
                .score_threshold
                .unwrap_or(DEFAULT_SCORE_THRESHOLD),
        };

        let retry_file = file.retry.unwrap_or_default();
        let retry = Backoff {
            initial: retry_file
                .initial_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial),
            max: retry_file
                .max_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max),
            multiplier: retry_file.multiplier.unwrap_or(defaults.retry.multiplier),
            max_attempts: retry_file
                .max_attempts
                .unwrap_or(defaults.retry.max_attempts),
            jitter: retry_file.jitter.unwrap_or(defaults.retry.jitter),
        };

        Self {
            db_path: file.db_path.unwrap_or(defaults.db_path),
            thresholds,
            anchor: engine.anchor.unwrap_or(defaults.anchor),
            zones,
            labels,
            broker,
            detector,
            retry,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_non_empty("TOOLGUARD_BROKER_ADDR") {
            self.broker.addr = addr;
        }
        if let Some(path) = env_non_empty("TOOLGUARD_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(v) = env_f32("TOOLGUARD_CONF_THRESHOLD")? {
            self.thresholds.conf = v;
        }
        if let Some(v) = env_f32("TOOLGUARD_IOU_THRESHOLD")? {
            self.thresholds.iou = v;
        }
        if let Some(v) = env_f32("TOOLGUARD_POSSESSION_OVERLAP")? {
            self.thresholds.possession = v;
        }
        if let Some(v) = env_f32("TOOLGUARD_TOUCH_OVERLAP")? {
            self.thresholds.touch = v;
        }
        if let Some(zones) = env_non_empty("TOOLGUARD_ZONES") {
            self.zones = parse_zones(&zones)?;
        }
        if let Some(backend) = env_non_empty("TOOLGUARD_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_non_empty("TOOLGUARD_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        for (name, value) in [
            ("conf_threshold", self.thresholds.conf),
            ("iou_threshold", self.thresholds.iou),
            ("possession_overlap", self.thresholds.possession),
            ("touch_overlap", self.thresholds.touch),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }

        if self.zones.is_empty() {
            return Err(anyhow!("at least one zone must be configured"));
        }
        for zone in &self.zones {
            if !zone.rect.is_valid() {
                return Err(anyhow!(
                    "zone '{}' must satisfy x2 > x1 and y2 > y1, got {:?}",
                    zone.name,
                    <[f32; 4]>::from(zone.rect)
                ));
            }
        }

        let mut seen = HashSet::new();
        for (role, labels) in [
            ("hands", &mut self.labels.hands),
            ("items", &mut self.labels.items),
            ("tools", &mut self.labels.tools),
        ] {
            labels.retain(|l| !l.trim().is_empty());
            if labels.is_empty() {
                return Err(anyhow!("label set '{}' must not be empty", role));
            }
            for label in labels.iter() {
                if !seen.insert(label.clone()) {
                    return Err(anyhow!(
                        "label '{}' is assigned to more than one role",
                        label
                    ));
                }
            }
        }

        if self.broker.topic_prefix.is_empty()
            || self
                .broker
                .topic_prefix
                .contains(|c| matches!(c, '+' | '#'))
        {
            return Err(anyhow!(
                "topic prefix must be non-empty and free of MQTT wildcards"
            ));
        }
        if self.retry.max_attempts < 1 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(anyhow!("retry.multiplier must be >= 1"));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(anyhow!("retry.jitter must be within [0, 1)"));
        }
        Ok(())
    }

    /// Engine built from the configured zones, thresholds, anchor and labels.
    pub fn engine(&self) -> ViolationEngine {
        ViolationEngine::new(self.zones.clone(), self.thresholds)
            .with_anchor(self.anchor)
            .with_labels(self.labels.clone())
    }
}

/// Parse `x1,y1,x2,y2;x1,y1,x2,y2`.
pub fn parse_zones(value: &str) -> Result<Vec<Zone>> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(i, entry)| {
            let coords: Vec<f32> = entry
                .split(',')
                .map(|c| {
                    c.trim()
                        .parse::<f32>()
                        .map_err(|_| anyhow!("invalid zone coordinate '{}' in '{}'", c, entry))
                })
                .collect::<Result<_>>()?;
            let rect: [f32; 4] = coords
                .try_into()
                .map_err(|_| anyhow!("zone '{}' must have exactly four coordinates", entry))?;
            Ok(Zone::new(format!("zone-{}", i + 1), BBox::from(rect)))
        })
        .collect()
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_f32(key: &str) -> Result<Option<f32>> {
    match env_non_empty(key) {
        Some(raw) => raw
            .trim()
            .parse::<f32>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a number, got '{}'", key, raw)),
        None => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.zones.len(), 1);
        assert_eq!(cfg.detector.labels, vec!["hand", "pizza", "scooper"]);
    }

    #[test]
    fn parses_zone_list() {
        let zones = parse_zones("0,0,100,100; 200,200,300,400").unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[1].rect, BBox::new(200.0, 200.0, 300.0, 400.0));
        assert!(parse_zones("0,0,100").is_err());
        assert!(parse_zones("0,0,a,100").is_err());
    }

    #[test]
    fn rejects_inverted_zone() {
        let mut cfg = PipelineConfig {
            zones: vec![Zone::new("bad", BBox::new(100.0, 0.0, 50.0, 10.0))],
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_overlapping_label_sets() {
        let mut cfg = PipelineConfig::default();
        cfg.labels.tools.push("hand".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("more than one role"));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut cfg = PipelineConfig::default();
        cfg.thresholds.touch = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_attempts() {
        let mut cfg = PipelineConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }
}
