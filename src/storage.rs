use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One logged zone count.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub id: i64,
    /// Serialized as RFC 3339.
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "chicken_count")]
    pub count: u32,
    pub location: String,
}

pub trait DetectionStore {
    /// Append a record. Timestamps are kept at millisecond precision.
    fn record_detection(
        &mut self,
        timestamp: DateTime<Utc>,
        count: u32,
        location: &str,
    ) -> Result<DetectionRecord>;

    /// Records newest first; ties on timestamp fall back to insertion order,
    /// newest first.
    fn list_detections(&mut self, limit: Option<usize>) -> Result<Vec<DetectionRecord>>;
}

/// Store handle shared between request threads and the periodic logger.
pub type SharedStore = Arc<Mutex<dyn DetectionStore + Send>>;

pub fn shared<S: DetectionStore + Send + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

fn truncate_to_millis(timestamp: DateTime<Utc>) -> Result<(i64, DateTime<Utc>)> {
    let millis = timestamp.timestamp_millis();
    let truncated = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow!("timestamp {} out of range", timestamp))?;
    Ok((millis, truncated))
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteDetectionStore {
    conn: Connection,
}

impl SqliteDetectionStore {
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening detection database {}", db_path))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp_ms INTEGER NOT NULL,
              chicken_count INTEGER NOT NULL,
              location TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_timestamp ON detections(timestamp_ms);
            "#,
        )?;
        Ok(())
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn record_detection(
        &mut self,
        timestamp: DateTime<Utc>,
        count: u32,
        location: &str,
    ) -> Result<DetectionRecord> {
        let (timestamp_ms, timestamp) = truncate_to_millis(timestamp)?;
        self.conn.execute(
            "INSERT INTO detections(timestamp_ms, chicken_count, location) VALUES (?1, ?2, ?3)",
            params![timestamp_ms, count, location],
        )?;
        Ok(DetectionRecord {
            id: self.conn.last_insert_rowid(),
            timestamp,
            count,
            location: location.to_string(),
        })
    }

    fn list_detections(&mut self, limit: Option<usize>) -> Result<Vec<DetectionRecord>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = match limit {
            Some(limit) => i64::try_from(limit).unwrap_or(i64::MAX),
            None => -1,
        };
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, timestamp_ms, chicken_count, location FROM detections
            ORDER BY timestamp_ms DESC, id DESC
            LIMIT ?1
            "#,
        )?;
        let mut rows = stmt.query(params![limit])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let timestamp_ms: i64 = row.get(1)?;
            let count: u32 = row.get(2)?;
            let location: String = row.get(3)?;
            let timestamp = DateTime::from_timestamp_millis(timestamp_ms)
                .ok_or_else(|| anyhow!("corrupt detection {}: timestamp out of range", id))?;
            out.push(DetectionRecord {
                id,
                timestamp,
                count,
                location,
            });
        }
        Ok(out)
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct InMemoryDetectionStore {
    records: Vec<DetectionRecord>,
}

impl InMemoryDetectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DetectionStore for InMemoryDetectionStore {
    fn record_detection(
        &mut self,
        timestamp: DateTime<Utc>,
        count: u32,
        location: &str,
    ) -> Result<DetectionRecord> {
        let (_, timestamp) = truncate_to_millis(timestamp)?;
        let record = DetectionRecord {
            id: self.records.len() as i64 + 1,
            timestamp,
            count,
            location: location.to_string(),
        };
        self.records.push(record.clone());
        Ok(record)
    }

    fn list_detections(&mut self, limit: Option<usize>) -> Result<Vec<DetectionRecord>> {
        let mut out = self.records.clone();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}
