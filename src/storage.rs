use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StoreError;
use crate::violation::{RoleBoxes, Violation, ViolationType};

/// A record ready to be written: every violation of one type in one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct NewViolationRecord {
    pub stream_id: String,
    pub frame_id: u64,
    pub timestamp_ms: u64,
    pub violation_type: ViolationType,
    /// One role-keyed box set per offending (hand, item) pair.
    pub bounding_boxes: Vec<RoleBoxes>,
    pub detected_objects: Vec<String>,
    pub confidences: Vec<f32>,
}

impl NewViolationRecord {
    /// Group a frame's violations by natural key, keeping first-seen order.
    pub fn group(violations: &[Violation]) -> Vec<NewViolationRecord> {
        let mut out: Vec<NewViolationRecord> = Vec::new();
        for v in violations {
            match out.iter_mut().find(|r| {
                r.stream_id == v.stream_id
                    && r.frame_id == v.frame_id
                    && r.violation_type == v.violation_type
            }) {
                Some(record) => record.bounding_boxes.push(v.boxes.clone()),
                None => out.push(NewViolationRecord {
                    stream_id: v.stream_id.clone(),
                    frame_id: v.frame_id,
                    timestamp_ms: v.timestamp_ms,
                    violation_type: v.violation_type,
                    bounding_boxes: vec![v.boxes.clone()],
                    detected_objects: v.detected_objects.clone(),
                    confidences: v.confidences.clone(),
                }),
            }
        }
        out
    }

    pub fn violation_count(&self) -> u64 {
        self.bounding_boxes.len() as u64
    }
}

/// A stored record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ViolationRecord {
    pub id: i64,
    pub stream_id: String,
    pub frame_id: u64,
    pub timestamp_ms: u64,
    pub violation_type: ViolationType,
    pub violation_count: u64,
    pub bounding_boxes: Vec<RoleBoxes>,
    pub detected_objects: Vec<String>,
    pub confidences: Vec<f32>,
    /// Wall-clock ms since the Unix epoch, assigned by the store.
    pub created_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The natural key was already present; nothing was written.
    Duplicate(i64),
}

impl InsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            Self::Inserted(id) | Self::Duplicate(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamCount {
    pub stream_id: String,
    pub records: u64,
    pub violations: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub stream_id: String,
    pub records: u64,
    pub violations: u64,
    pub first_violation_ms: u64,
    pub last_violation_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub records: u64,
    pub violations: u64,
    pub streams: u64,
    pub by_type: BTreeMap<ViolationType, u64>,
}

/// Append-only sink for violation records, deduplicated on
/// `(stream_id, frame_id, violation_type)`.
pub trait ViolationStore: Send {
    fn insert(&mut self, record: &NewViolationRecord) -> Result<InsertOutcome, StoreError>;

    /// Insert one frame's records atomically: either all outcomes are
    /// returned or nothing was written.
    fn insert_frame(
        &mut self,
        records: &[NewViolationRecord],
    ) -> Result<Vec<InsertOutcome>, StoreError> {
        records.iter().map(|r| self.insert(r)).collect()
    }

    fn get(&self, id: i64) -> Result<Option<ViolationRecord>, StoreError>;

    /// Newest frame first.
    fn by_stream(&self, stream_id: &str, limit: usize) -> Result<Vec<ViolationRecord>, StoreError>;

    /// Records with `from_ms <= timestamp_ms <= to_ms`, oldest first.
    fn by_time_range(
        &self,
        stream_id: &str,
        from_ms: u64,
        to_ms: u64,
    ) -> Result<Vec<ViolationRecord>, StoreError>;

    /// Violations (not records) stored for a stream.
    fn count_for_stream(&self, stream_id: &str) -> Result<u64, StoreError>;

    fn stream_summary(&self, stream_id: &str) -> Result<Option<StreamSummary>, StoreError>;

    /// Streams with at least one record, most violations first.
    fn streams_with_counts(&self) -> Result<Vec<StreamCount>, StoreError>;

    fn counts_by_type(&self) -> Result<BTreeMap<ViolationType, u64>, StoreError>;

    fn statistics(&self) -> Result<StoreStatistics, StoreError>;
}

pub struct SqliteViolationStore {
    conn: Connection,
}

const RECORD_COLUMNS: &str = "id, stream_id, frame_id, timestamp_ms, violation_type, \
     violation_count, bounding_boxes, detected_objects, confidences, created_at_ms";

impl SqliteViolationStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path.as_ref())?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS violations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              stream_id TEXT NOT NULL,
              frame_id INTEGER NOT NULL,
              timestamp_ms INTEGER NOT NULL,
              violation_type TEXT NOT NULL,
              violation_count INTEGER NOT NULL,
              bounding_boxes TEXT NOT NULL,
              detected_objects TEXT NOT NULL,
              confidences TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              UNIQUE(stream_id, frame_id, violation_type)
            );

            CREATE INDEX IF NOT EXISTS idx_violations_stream_ts
              ON violations(stream_id, timestamp_ms);
            "#,
        )?;
        Ok(())
    }

    fn query_records<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<ViolationRecord>, StoreError> {
        let raw = {
            let mut stmt = self.conn.prepare(sql)?;
            let rows = stmt.query_map(params, RawRecord::from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        raw.into_iter().map(RawRecord::decode).collect()
    }
}

/// Row as read from SQLite, before the JSON columns are decoded.
struct RawRecord {
    id: i64,
    stream_id: String,
    frame_id: i64,
    timestamp_ms: i64,
    violation_type: String,
    violation_count: i64,
    bounding_boxes: String,
    detected_objects: String,
    confidences: String,
    created_at_ms: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            stream_id: row.get(1)?,
            frame_id: row.get(2)?,
            timestamp_ms: row.get(3)?,
            violation_type: row.get(4)?,
            violation_count: row.get(5)?,
            bounding_boxes: row.get(6)?,
            detected_objects: row.get(7)?,
            confidences: row.get(8)?,
            created_at_ms: row.get(9)?,
        })
    }

    fn decode(self) -> Result<ViolationRecord, StoreError> {
        let id = self.id;
        let corrupt = |reason: String| StoreError::Corrupt { id, reason };
        Ok(ViolationRecord {
            id,
            stream_id: self.stream_id,
            frame_id: to_u64(self.frame_id).map_err(corrupt)?,
            timestamp_ms: to_u64(self.timestamp_ms).map_err(corrupt)?,
            violation_type: self
                .violation_type
                .parse()
                .map_err(|e: crate::violation::UnknownViolationType| corrupt(e.to_string()))?,
            violation_count: to_u64(self.violation_count).map_err(corrupt)?,
            bounding_boxes: serde_json::from_str(&self.bounding_boxes)
                .map_err(|e| corrupt(format!("bounding_boxes: {}", e)))?,
            detected_objects: serde_json::from_str(&self.detected_objects)
                .map_err(|e| corrupt(format!("detected_objects: {}", e)))?,
            confidences: serde_json::from_str(&self.confidences)
                .map_err(|e| corrupt(format!("confidences: {}", e)))?,
            created_at_ms: to_u64(self.created_at_ms).map_err(corrupt)?,
        })
    }
}

fn to_u64(v: i64) -> Result<u64, String> {
    u64::try_from(v).map_err(|_| format!("negative value {}", v))
}

fn to_i64(v: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(v).map_err(|_| StoreError::WriteFailed(format!("{} {} exceeds i64 range", what, v)))
}

fn write_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::WriteFailed(e.to_string())
}

fn insert_record(
    conn: &Connection,
    record: &NewViolationRecord,
) -> Result<InsertOutcome, StoreError> {
    crate::validate_stream_id(&record.stream_id).map_err(write_err)?;
    let frame_id = to_i64(record.frame_id, "frame_id")?;
    let timestamp_ms = to_i64(record.timestamp_ms, "timestamp_ms")?;
    let created_at_ms = to_i64(crate::now_ms(), "created_at_ms")?;
    let boxes = serde_json::to_string(&record.bounding_boxes).map_err(write_err)?;
    let objects = serde_json::to_string(&record.detected_objects).map_err(write_err)?;
    let confidences = serde_json::to_string(&record.confidences).map_err(write_err)?;

    let changed = conn
        .execute(
            r#"
            INSERT OR IGNORE INTO violations(
              stream_id, frame_id, timestamp_ms, violation_type, violation_count,
              bounding_boxes, detected_objects, confidences, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.stream_id,
                frame_id,
                timestamp_ms,
                record.violation_type.as_str(),
                record.violation_count() as i64,
                boxes,
                objects,
                confidences,
                created_at_ms
            ],
        )
        .map_err(write_err)?;
    if changed == 1 {
        return Ok(InsertOutcome::Inserted(conn.last_insert_rowid()));
    }

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM violations WHERE stream_id = ?1 AND frame_id = ?2 AND violation_type = ?3",
            params![record.stream_id, frame_id, record.violation_type.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(write_err)?;
    existing.map(InsertOutcome::Duplicate).ok_or_else(|| {
        StoreError::WriteFailed(format!(
            "insert of {}#{} ignored but no existing row found",
            record.stream_id, record.frame_id
        ))
    })
}

impl ViolationStore for SqliteViolationStore {
    fn insert(&mut self, record: &NewViolationRecord) -> Result<InsertOutcome, StoreError> {
        insert_record(&self.conn, record)
    }

    fn insert_frame(
        &mut self,
        records: &[NewViolationRecord],
    ) -> Result<Vec<InsertOutcome>, StoreError> {
        let tx = self.conn.transaction().map_err(write_err)?;
        let outcomes = records
            .iter()
            .map(|r| insert_record(&tx, r))
            .collect::<Result<Vec<_>, _>>()?;
        tx.commit().map_err(write_err)?;
        Ok(outcomes)
    }

    fn get(&self, id: i64) -> Result<Option<ViolationRecord>, StoreError> {
        let sql = format!("SELECT {} FROM violations WHERE id = ?1", RECORD_COLUMNS);
        Ok(self.query_records(&sql, params![id])?.into_iter().next())
    }

    fn by_stream(&self, stream_id: &str, limit: usize) -> Result<Vec<ViolationRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM violations WHERE stream_id = ?1 \
             ORDER BY frame_id DESC, id DESC LIMIT ?2",
            RECORD_COLUMNS
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query_records(&sql, params![stream_id, limit])
    }

    fn by_time_range(
        &self,
        stream_id: &str,
        from_ms: u64,
        to_ms: u64,
    ) -> Result<Vec<ViolationRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM violations WHERE stream_id = ?1 \
             AND timestamp_ms >= ?2 AND timestamp_ms <= ?3 ORDER BY timestamp_ms ASC, id ASC",
            RECORD_COLUMNS
        );
        let from = i64::try_from(from_ms).unwrap_or(i64::MAX);
        let to = i64::try_from(to_ms).unwrap_or(i64::MAX);
        self.query_records(&sql, params![stream_id, from, to])
    }

    fn count_for_stream(&self, stream_id: &str) -> Result<u64, StoreError> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(violation_count), 0) FROM violations WHERE stream_id = ?1",
            params![stream_id],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    fn stream_summary(&self, stream_id: &str) -> Result<Option<StreamSummary>, StoreError> {
        let row: (i64, i64, Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(violation_count), 0), MIN(timestamp_ms), MAX(timestamp_ms) \
             FROM violations WHERE stream_id = ?1",
            params![stream_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        match row {
            (records, violations, Some(first), Some(last)) if records > 0 => Ok(Some(StreamSummary {
                stream_id: stream_id.to_string(),
                records: records as u64,
                violations: violations.max(0) as u64,
                first_violation_ms: first.max(0) as u64,
                last_violation_ms: last.max(0) as u64,
            })),
            _ => Ok(None),
        }
    }

    fn streams_with_counts(&self) -> Result<Vec<StreamCount>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT stream_id, COUNT(*), SUM(violation_count) FROM violations \
             GROUP BY stream_id ORDER BY SUM(violation_count) DESC, stream_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let records: i64 = row.get(1)?;
            let violations: i64 = row.get(2)?;
            Ok(StreamCount {
                stream_id: row.get(0)?,
                records: records.max(0) as u64,
                violations: violations.max(0) as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn counts_by_type(&self) -> Result<BTreeMap<ViolationType, u64>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT violation_type, SUM(violation_count) FROM violations GROUP BY violation_type",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = BTreeMap::new();
        for (name, count) in rows {
            let kind: ViolationType = name.parse().map_err(|e: crate::violation::UnknownViolationType| {
                StoreError::Read(e.to_string())
            })?;
            out.insert(kind, count.max(0) as u64);
        }
        Ok(out)
    }

    fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        let (records, violations, streams): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(violation_count), 0), COUNT(DISTINCT stream_id) FROM violations",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(StoreStatistics {
            records: records.max(0) as u64,
            violations: violations.max(0) as u64,
            streams: streams.max(0) as u64,
            by_type: self.counts_by_type()?,
        })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<ViolationRecord>,
    keys: HashMap<(String, u64, ViolationType), i64>,
    fail_writes: u32,
}

/// In-process store with the same contract as the SQLite store. Clones share
/// the same records.
#[derive(Clone, Debug, Default)]
pub struct InMemoryViolationStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryViolationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fail the next `n` inserts with `WriteFailed`.
    pub fn fail_next_writes(&self, n: u32) {
        self.state().fail_writes = n;
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stream_records(&self, stream_id: &str) -> Vec<ViolationRecord> {
        self.state()
            .records
            .iter()
            .filter(|r| r.stream_id == stream_id)
            .cloned()
            .collect()
    }
}

impl MemoryState {
    fn take_failure(&mut self) -> Result<(), StoreError> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(StoreError::WriteFailed("injected write failure".into()));
        }
        Ok(())
    }

    fn insert(&mut self, record: &NewViolationRecord) -> Result<InsertOutcome, StoreError> {
        crate::validate_stream_id(&record.stream_id).map_err(write_err)?;
        let key = (
            record.stream_id.clone(),
            record.frame_id,
            record.violation_type,
        );
        if let Some(id) = self.keys.get(&key) {
            return Ok(InsertOutcome::Duplicate(*id));
        }
        let id = self.records.len() as i64 + 1;
        self.records.push(ViolationRecord {
            id,
            stream_id: record.stream_id.clone(),
            frame_id: record.frame_id,
            timestamp_ms: record.timestamp_ms,
            violation_type: record.violation_type,
            violation_count: record.violation_count(),
            bounding_boxes: record.bounding_boxes.clone(),
            detected_objects: record.detected_objects.clone(),
            confidences: record.confidences.clone(),
            created_at_ms: crate::now_ms(),
        });
        self.keys.insert(key, id);
        Ok(InsertOutcome::Inserted(id))
    }
}

impl ViolationStore for InMemoryViolationStore {
    fn insert(&mut self, record: &NewViolationRecord) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state();
        state.take_failure()?;
        state.insert(record)
    }

    fn insert_frame(
        &mut self,
        records: &[NewViolationRecord],
    ) -> Result<Vec<InsertOutcome>, StoreError> {
        let mut state = self.state();
        state.take_failure()?;
        for record in records {
            crate::validate_stream_id(&record.stream_id).map_err(write_err)?;
        }
        records.iter().map(|r| state.insert(r)).collect()
    }

    fn get(&self, id: i64) -> Result<Option<ViolationRecord>, StoreError> {
        Ok(self.state().records.iter().find(|r| r.id == id).cloned())
    }

    fn by_stream(&self, stream_id: &str, limit: usize) -> Result<Vec<ViolationRecord>, StoreError> {
        let mut records = self.stream_records(stream_id);
        records.sort_by(|a, b| b.frame_id.cmp(&a.frame_id).then(b.id.cmp(&a.id)));
        records.truncate(limit);
        Ok(records)
    }

    fn by_time_range(
        &self,
        stream_id: &str,
        from_ms: u64,
        to_ms: u64,
    ) -> Result<Vec<ViolationRecord>, StoreError> {
        let mut records: Vec<ViolationRecord> = self
            .stream_records(stream_id)
            .into_iter()
            .filter(|r| r.timestamp_ms >= from_ms && r.timestamp_ms <= to_ms)
            .collect();
        records.sort_by(|a, b| a.timestamp_ms.cmp(&b.timestamp_ms).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    fn count_for_stream(&self, stream_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .stream_records(stream_id)
            .iter()
            .map(|r| r.violation_count)
            .sum())
    }

    fn stream_summary(&self, stream_id: &str) -> Result<Option<StreamSummary>, StoreError> {
        let records = self.stream_records(stream_id);
        let (Some(first), Some(last)) = (
            records.iter().map(|r| r.timestamp_ms).min(),
            records.iter().map(|r| r.timestamp_ms).max(),
        ) else {
            return Ok(None);
        };
        Ok(Some(StreamSummary {
            stream_id: stream_id.to_string(),
            records: records.len() as u64,
            violations: records.iter().map(|r| r.violation_count).sum(),
            first_violation_ms: first,
            last_violation_ms: last,
        }))
    }

    fn streams_with_counts(&self) -> Result<Vec<StreamCount>, StoreError> {
        let mut by_stream: BTreeMap<String, StreamCount> = BTreeMap::new();
        for r in self.state().records.iter() {
            let entry = by_stream
                .entry(r.stream_id.clone())
                .or_insert_with(|| StreamCount {
                    stream_id: r.stream_id.clone(),
                    records: 0,
                    violations: 0,
                });
            entry.records += 1;
            entry.violations += r.violation_count;
        }
        let mut out: Vec<StreamCount> = by_stream.into_values().collect();
        out.sort_by(|a, b| {
            b.violations
                .cmp(&a.violations)
                .then_with(|| a.stream_id.cmp(&b.stream_id))
        });
        Ok(out)
    }

    fn counts_by_type(&self) -> Result<BTreeMap<ViolationType, u64>, StoreError> {
        let mut out = BTreeMap::new();
        for r in self.state().records.iter() {
            *out.entry(r.violation_type).or_insert(0) += r.violation_count;
        }
        Ok(out)
    }

    fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        let streams = self.streams_with_counts()?;
        Ok(StoreStatistics {
            records: streams.iter().map(|s| s.records).sum(),
            violations: streams.iter().map(|s| s.violations).sum(),
            streams: streams.len() as u64,
            by_type: self.counts_by_type()?,
        })
    }
}
