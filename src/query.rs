//! Read-only views over the violation store and the aggregation cache, for
//! an external API or dashboard to wrap.
//!
//! Missing data is `NotFound`, store trouble is `Unavailable`; neither
//! waits on the pipeline.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::cache::{AggregationCache, CacheStatistics, StreamSnapshot};
use crate::error::StoreError;
use crate::storage::{StoreStatistics, StreamCount, StreamSummary, ViolationRecord, ViolationStore};

pub const DEFAULT_VIOLATION_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("violation store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for QueryError {
    fn from(e: StoreError) -> Self {
        log::error!("query failed: {}", e);
        Self::Unavailable(e.to_string())
    }
}

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub store_reachable: bool,
    pub cached_streams: u64,
    pub uptime_secs: u64,
}

/// Durable summary plus whatever the cache currently holds for the stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamOverview {
    pub stream_id: String,
    pub stored: Option<StreamSummary>,
    pub live: Option<StreamSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Statistics {
    pub store: StoreStatistics,
    pub live: CacheStatistics,
}

pub struct QueryService {
    store: Mutex<Box<dyn ViolationStore>>,
    cache: Arc<AggregationCache>,
    started: Instant,
}

impl QueryService {
    pub fn new(store: Box<dyn ViolationStore>, cache: Arc<AggregationCache>) -> Self {
        Self {
            store: Mutex::new(store),
            cache,
            started: Instant::now(),
        }
    }

    fn store(&self) -> QueryResult<MutexGuard<'_, Box<dyn ViolationStore>>> {
        self.store
            .lock()
            .map_err(|_| QueryError::Unavailable("store lock poisoned".into()))
    }

    fn known_stream(stream_id: &str) -> QueryResult<()> {
        crate::validate_stream_id(stream_id)
            .map_err(|_| QueryError::NotFound(format!("stream '{}'", stream_id)))
    }

    pub fn health(&self) -> Health {
        let store_reachable = self
            .store()
            .and_then(|s| s.statistics().map_err(QueryError::from))
            .is_ok();
        Health {
            status: if store_reachable { "ok" } else { "degraded" },
            store_reachable,
            cached_streams: self.cache.streams().len() as u64,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    /// Newest first, at most `limit`.
    pub fn stream_violations(&self, stream_id: &str, limit: usize) -> QueryResult<Vec<ViolationRecord>> {
        Self::known_stream(stream_id)?;
        let records = self.store()?.by_stream(stream_id, limit)?;
        if records.is_empty() {
            return Err(QueryError::NotFound(format!("violations for '{}'", stream_id)));
        }
        Ok(records)
    }

    /// Streams with stored violations, most first.
    pub fn streams(&self) -> QueryResult<Vec<StreamCount>> {
        Ok(self.store()?.streams_with_counts()?)
    }

    pub fn latest_detection(&self, stream_id: &str) -> QueryResult<StreamSnapshot> {
        self.cache
            .read(stream_id)
            .ok_or_else(|| QueryError::NotFound(format!("detections for '{}'", stream_id)))
    }

    pub fn stream_summary(&self, stream_id: &str) -> QueryResult<StreamOverview> {
        Self::known_stream(stream_id)?;
        let stored = self.store()?.stream_summary(stream_id)?;
        let live = self.cache.read(stream_id);
        if stored.is_none() && live.is_none() {
            return Err(QueryError::NotFound(format!("stream '{}'", stream_id)));
        }
        Ok(StreamOverview {
            stream_id: stream_id.to_string(),
            stored,
            live,
        })
    }

    pub fn violation(&self, id: i64) -> QueryResult<ViolationRecord> {
        self.store()?
            .get(id)?
            .ok_or_else(|| QueryError::NotFound(format!("violation #{}", id)))
    }

    pub fn statistics(&self) -> QueryResult<Statistics> {
        Ok(Statistics {
            store: self.store()?.statistics()?,
            live: self.cache.statistics(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TypeCounts;
    use crate::geometry::BBox;
    use crate::storage::{InMemoryViolationStore, NewViolationRecord};
    use crate::violation::{ImplicatedBox, RoleBoxes, ViolationType};

    fn record(stream: &str, frame: u64) -> NewViolationRecord {
        let b = ImplicatedBox {
            label: "hand".into(),
            confidence: 0.9,
            bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
        };
        NewViolationRecord {
            stream_id: stream.into(),
            frame_id: frame,
            timestamp_ms: frame * 100,
            violation_type: ViolationType::ToolNotUsed,
            bounding_boxes: vec![RoleBoxes {
                hand: b.clone(),
                item: b,
                tool: None,
            }],
            detected_objects: vec!["hand".into()],
            confidences: vec![0.9],
        }
    }

    fn service() -> (QueryService, InMemoryViolationStore, Arc<AggregationCache>) {
        let store = InMemoryViolationStore::new();
        let cache = Arc::new(AggregationCache::new());
        (
            QueryService::new(Box::new(store.clone()), Arc::clone(&cache)),
            store,
            cache,
        )
    }

    #[test]
    fn empty_service_reports_not_found() {
        let (q, _, _) = service();
        assert_eq!(q.health().status, "ok");
        assert!(matches!(q.stream_violations("line_1", 10), Err(QueryError::NotFound(_))));
        assert!(matches!(q.latest_detection("line_1"), Err(QueryError::NotFound(_))));
        assert!(matches!(q.stream_summary("line_1"), Err(QueryError::NotFound(_))));
        assert!(matches!(q.violation(1), Err(QueryError::NotFound(_))));
        assert!(matches!(q.stream_summary("../etc"), Err(QueryError::NotFound(_))));
        assert!(q.streams().unwrap().is_empty());
    }

    #[test]
    fn views_combine_store_and_cache() {
        let (q, mut store, cache) = service();
        store.insert(&record("line_1", 1)).unwrap();
        let id = store.insert(&record("line_1", 2)).unwrap().id();
        cache.update(
            "line_1",
            2,
            200,
            vec![],
            &TypeCounts::from([(ViolationType::ToolNotUsed, 2)]),
        );

        let list = q.stream_violations("line_1", 1).unwrap();
        assert_eq!(list[0].frame_id, 2);
        assert_eq!(q.violation(id).unwrap().frame_id, 2);
        let overview = q.stream_summary("line_1").unwrap();
        assert_eq!(overview.stored.unwrap().records, 2);
        assert_eq!(overview.live.unwrap().frame_id, 2);
        let stats = q.statistics().unwrap();
        assert_eq!(stats.store.violations, 2);
        assert_eq!(stats.live.violations, 2);
        assert_eq!(q.streams().unwrap()[0].stream_id, "line_1");
    }
}
