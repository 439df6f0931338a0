//! Links posted diagram images back to the message they were rendered from.
//!
//! Records are append-only from the bot's point of view: a source message
//! maps to every image ever posted for it, in posting order. The only
//! deletion is the retention prune run by the maintenance tick.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// One posted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDiagram {
    pub source_event_id: String,
    pub output_event_id: String,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed store of rendered diagrams.
pub struct DiagramTracker {
    conn: Mutex<Connection>,
}

impl DiagramTracker {
    /// In-memory tracker, gone on restart.
    pub fn in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("Failed to create in-memory database: {e}"))?;
        Self::with_connection(conn)
    }

    /// Open (or create) the tracker database at `path`.
    pub fn open(path: &Path) -> Result<Self, String> {
        let conn = Connection::open(path)
            .map_err(|e| format!("Failed to open {}: {e}", path.display()))?;
        let tracker = Self::with_connection(conn)?;
        info!("Loaded diagram tracker from {:?} ({} records)", path, tracker.len()?);
        Ok(tracker)
    }

    fn with_connection(conn: Connection) -> Result<Self, String> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rendered_diagrams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_event_id TEXT NOT NULL,
                output_event_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rendered_source ON rendered_diagrams(source_event_id);
            CREATE INDEX IF NOT EXISTS idx_rendered_created ON rendered_diagrams(created_at);
        "#,
        )
        .map_err(|e| format!("Failed to initialize tracker schema: {e}"))?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, String> {
        self.conn.lock().map_err(|_| "tracker lock poisoned".to_string())
    }

    /// Remember that `output_event_id` was posted for `source_event_id`.
    pub fn record_output(&self, source_event_id: &str, output_event_id: &str) -> Result<(), String> {
        self.record_output_at(source_event_id, output_event_id, Utc::now())
    }

    fn record_output_at(
        &self,
        source_event_id: &str,
        output_event_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), String> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO rendered_diagrams (source_event_id, output_event_id, created_at) VALUES (?1, ?2, ?3)",
            params![source_event_id, output_event_id, timestamp(created_at)],
        )
        .map_err(|e| format!("Failed to record rendered diagram: {e}"))?;
        debug!("Recorded {} -> {}", source_event_id, output_event_id);
        Ok(())
    }

    /// Every output ever recorded for `source_event_id`, oldest first.
    pub fn outputs_for(&self, source_event_id: &str) -> Result<Vec<String>, String> {
        Ok(self
            .records_for(source_event_id)?
            .into_iter()
            .map(|r| r.output_event_id)
            .collect())
    }

    pub fn records_for(&self, source_event_id: &str) -> Result<Vec<RenderedDiagram>, String> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT source_event_id, output_event_id, created_at FROM rendered_diagrams
                 WHERE source_event_id = ?1 ORDER BY id",
            )
            .map_err(|e| format!("Failed to query rendered diagrams: {e}"))?;

        let rows = stmt
            .query_map(params![source_event_id], |row| {
                let created_at: String = row.get(2)?;
                Ok(RenderedDiagram {
                    source_event_id: row.get(0)?,
                    output_event_id: row.get(1)?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_default(),
                })
            })
            .map_err(|e| format!("Failed to query rendered diagrams: {e}"))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("Failed to read rendered diagram: {e}"))
    }

    /// Drop records older than `max_age`. Returns how many were removed.
    pub fn prune_older_than(&self, max_age: Duration) -> Result<usize, String> {
        let cutoff = timestamp(Utc::now() - max_age);
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM rendered_diagrams WHERE created_at < ?1", params![cutoff])
            .map_err(|e| format!("Failed to prune rendered diagrams: {e}"))?;
        if removed > 0 {
            info!("🧹 Pruned {} rendered diagram record(s)", removed);
        }
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize, String> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM rendered_diagrams", [], |row| row.get(0))
            .map_err(|e| format!("Failed to count rendered diagrams: {e}"))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, String> {
        Ok(self.len()? == 0)
    }
}

/// Fixed-width UTC timestamps so string comparison in SQL orders correctly.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}
