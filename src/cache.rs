//! Aggregation cache: per-stream latest detections and running violation
//! counters.
//!
//! One writer (the results consumer) and any number of readers share a
//! single `RwLock`. A stream's entry is replaced under the write lock, so a
//! reader sees either the previous snapshot or the new one, never a mix.
//! The cache is process-local and starts empty; the violation store is the
//! durable record.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::detect::Detection;
use crate::violation::ViolationType;

/// Violations per type, as added by one update.
pub type TypeCounts = BTreeMap<ViolationType, u64>;

/// What the cache knows about one stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamSnapshot {
    pub stream_id: String,
    /// Frame of the most recent update; last write wins.
    pub frame_id: u64,
    pub timestamp_ms: u64,
    pub detections: Vec<Detection>,
    /// Running total, never decremented.
    pub violation_count: u64,
    pub frames_seen: u64,
    pub updated_at_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatistics {
    pub streams: u64,
    pub frames: u64,
    pub violations: u64,
    pub by_type: TypeCounts,
    pub by_stream: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct CacheState {
    streams: HashMap<String, StreamSnapshot>,
    by_type: TypeCounts,
}

#[derive(Debug, Default)]
pub struct AggregationCache {
    state: RwLock<CacheState>,
}

impl AggregationCache {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking writer leaves whole entries behind, never torn ones, so
    // poisoned state is still consistent.
    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Replace the stream's detections snapshot and add `delta` to its
    /// counters. Creates the entry on first sight of the stream.
    pub fn update(
        &self,
        stream_id: &str,
        frame_id: u64,
        timestamp_ms: u64,
        detections: Vec<Detection>,
        delta: &TypeCounts,
    ) {
        let added: u64 = delta.values().sum();
        let now = crate::now_ms();
        let mut state = self.write_state();
        let previous = state.streams.get(stream_id);
        let snapshot = StreamSnapshot {
            stream_id: stream_id.to_string(),
            frame_id,
            timestamp_ms,
            detections,
            violation_count: previous.map_or(0, |p| p.violation_count) + added,
            frames_seen: previous.map_or(0, |p| p.frames_seen) + 1,
            updated_at_ms: now,
        };
        state.streams.insert(stream_id.to_string(), snapshot);
        for (kind, n) in delta {
            *state.by_type.entry(*kind).or_insert(0) += n;
        }
        log::debug!(
            "cache {}#{}: +{} violations",
            stream_id,
            frame_id,
            added
        );
    }

    /// Latest snapshot, or `None` if the stream has never been seen.
    pub fn read(&self, stream_id: &str) -> Option<StreamSnapshot> {
        self.read_state().streams.get(stream_id).cloned()
    }

    /// Stream ids currently cached, sorted.
    pub fn streams(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_state().streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn statistics(&self) -> CacheStatistics {
        let state = self.read_state();
        let by_stream: BTreeMap<String, u64> = state
            .streams
            .iter()
            .map(|(id, s)| (id.clone(), s.violation_count))
            .collect();
        CacheStatistics {
            streams: state.streams.len() as u64,
            frames: state.streams.values().map(|s| s.frames_seen).sum(),
            violations: by_stream.values().sum(),
            by_type: state.by_type.clone(),
            by_stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use std::sync::Arc;

    fn hand() -> Detection {
        Detection::new("hand", 0.9, BBox::new(0.0, 0.0, 10.0, 10.0))
    }

    fn one(n: u64) -> TypeCounts {
        TypeCounts::from([(ViolationType::ToolNotUsed, n)])
    }

    #[test]
    fn unknown_stream_reads_none() {
        let cache = AggregationCache::new();
        assert!(cache.read("line_1").is_none());
        assert_eq!(cache.statistics(), CacheStatistics::default());
    }

    #[test]
    fn snapshot_is_last_write_wins_and_counter_accumulates() {
        let cache = AggregationCache::new();
        cache.update("line_1", 1, 0, vec![hand(), hand()], &one(2));
        cache.update("line_1", 2, 200, vec![hand()], &TypeCounts::new());
        let snap = cache.read("line_1").unwrap();
        assert_eq!(snap.frame_id, 2);
        assert_eq!(snap.detections.len(), 1);
        assert_eq!(snap.violation_count, 2);
        assert_eq!(snap.frames_seen, 2);
    }

    #[test]
    fn statistics_by_type_and_stream() {
        let cache = AggregationCache::new();
        cache.update("line_1", 1, 0, vec![], &one(1));
        cache.update("line_2", 1, 0, vec![], &one(3));
        let stats = cache.statistics();
        assert_eq!(stats.streams, 2);
        assert_eq!(stats.violations, 4);
        assert_eq!(stats.by_type.get(&ViolationType::ToolNotUsed), Some(&4));
        assert_eq!(stats.by_stream.get("line_2"), Some(&3));
        assert_eq!(cache.streams(), vec!["line_1", "line_2"]);
    }

    #[test]
    fn readers_never_see_torn_entries() {
        let cache = Arc::new(AggregationCache::new());
        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for frame in 1..=500u64 {
                    let dets = vec![hand(); (frame % 5) as usize];
                    cache.update("line_1", frame, frame * 10, dets, &one(1));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..500 {
                        if let Some(s) = cache.read("line_1") {
                            assert_eq!(s.detections.len() as u64, s.frame_id % 5);
                            assert_eq!(s.timestamp_ms, s.frame_id * 10);
                            assert_eq!(s.violation_count, s.frames_seen);
                            assert!(s.frame_id >= last);
                            last = s.frame_id;
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(cache.read("line_1").unwrap().violation_count, 500);
    }
}
