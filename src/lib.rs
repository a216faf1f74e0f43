//! toolguard
//!
//! Turns per-frame object detections into "tool not used" violation events
//! and moves them through an at-least-once pipeline.
//!
//! # Architecture
//!
//! ```text
//! frames/<stream> --> WorkConsumer (Detector -> ViolationEngine) --> results/<stream>
//! results/<stream> --> ResultsConsumer --> ViolationStore (durable)
//!                                      \-> AggregationCache (live)
//! ViolationStore + AggregationCache --> QueryService (read-only)
//! ```
//!
//! # Module Structure
//!
//! - `geometry`: boxes, overlap measures, anchor points
//! - `frame`, `detect`: frame data model and the detector capability
//! - `engine`, `violation`: the violation rules and their output
//! - `transport`, `supervisor`: durable messaging and reconnect policy
//! - `storage`, `cache`, `query`: persistence, live aggregates, read views
//! - `pipeline`: the consumers and the in-process orchestrator
//! - `config`, `error`: configuration surface and error kinds

use anyhow::{anyhow, Result};
use regex::Regex;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod cache;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod pipeline;
pub mod query;
pub mod storage;
pub mod supervisor;
pub mod transport;
pub mod violation;

pub use cache::{AggregationCache, CacheStatistics, StreamSnapshot, TypeCounts};
pub use config::PipelineConfig;
pub use detect::{Detection, Detector, DetectorRegistry, StubBackend};
pub use engine::{evaluate, Assessment, RoleLabels, Thresholds, ViolationEngine};
pub use error::{
    DetectorError, PipelineError, PipelineResult, StoreError, TransportError, WireError,
};
pub use frame::{Frame, FrameEncoding, FrameMeta};
pub use geometry::{Anchor, BBox, Point, Zone};
pub use pipeline::{ConsumerOptions, Orchestrator, ResultsConsumer, StepOutcome, WorkConsumer};
pub use query::{QueryError, QueryService};
pub use storage::{
    InMemoryViolationStore, InsertOutcome, NewViolationRecord, SqliteViolationStore,
    ViolationRecord, ViolationStore,
};
pub use supervisor::{Backoff, ConnectionState, Shutdown, Supervisor};
pub use transport::{Connector, InMemoryBroker, MqttConnector, Topics, Transport};
pub use violation::{RoleBoxes, Violation, ViolationType};

pub const MAX_STREAM_ID_LEN: usize = 128;

/// Stream ids become topic segments and store keys: ASCII letters, digits,
/// `_`, `.` and `-`, 1 to 128 characters, and never `.` or `..`.
pub fn validate_stream_id(stream_id: &str) -> Result<()> {
    static STREAM_ID_RE: OnceLock<Regex> = OnceLock::new();
    let re = STREAM_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]{1,128}$").unwrap());
    if !re.is_match(stream_id) || stream_id == "." || stream_id == ".." {
        return Err(anyhow!(
            "invalid stream id '{}': expected 1-{} of [A-Za-z0-9_.-]",
            stream_id.escape_default(),
            MAX_STREAM_ID_LEN
        ));
    }
    Ok(())
}

/// Wall-clock milliseconds since the Unix epoch; 0 if the clock is before it.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids() {
        for ok in ["line_1", "cam-02.left", "A"] {
            assert!(validate_stream_id(ok).is_ok(), "{}", ok);
        }
        let long = "x".repeat(129);
        for bad in ["", ".", "a/b", "a+b", "#", "..", "café", long.as_str()] {
            assert!(validate_stream_id(bad).is_err(), "{}", bad);
        }
    }
}
