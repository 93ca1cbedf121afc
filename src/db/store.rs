//! SQLite database store implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid monitor: {0}")]
    InvalidMonitor(String),
    #[error("slug already exists: {0}")]
    SlugExists(String),
    #[error("not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize pragmas and schema.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;

             CREATE TABLE IF NOT EXISTS monitors (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               name TEXT NOT NULL,
               slug TEXT UNIQUE NOT NULL,
               url TEXT NOT NULL,
               monitor_type TEXT NOT NULL,
               interval INTEGER NOT NULL,
               created_at DATETIME DEFAULT CURRENT_TIMESTAMP
             );

             CREATE TABLE IF NOT EXISTS monitors_status (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               slug TEXT NOT NULL,
               status TEXT NOT NULL,
               response_time INTEGER,
               status_code INTEGER,
               details_json TEXT,
               checked_at DATETIME NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_slug_checked
               ON monitors_status(slug, checked_at DESC);

             CREATE TABLE IF NOT EXISTS monitors_state (
               slug TEXT PRIMARY KEY,
               current_status TEXT NOT NULL,
               last_checked DATETIME,
               uptime_count INTEGER DEFAULT 0,
               downtime_count INTEGER DEFAULT 0
             );

             CREATE TABLE IF NOT EXISTS app_settings (
               id INTEGER PRIMARY KEY CHECK (id = 1),
               settings_json TEXT NOT NULL,
               updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
             );",
        )?;

        Ok(())
    }

    // --- Monitor definitions ---

    /// Load all monitor definitions for registry reconciliation.
    ///
    /// Rows with an unknown monitor type are skipped with a warning rather
    /// than failing the whole read.
    pub fn get_monitors(&self) -> Result<Vec<MonitorDefinition>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT slug, name, url, monitor_type, interval FROM monitors")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut monitors = Vec::with_capacity(rows.len());
        for (slug, name, target, type_str, interval_ms) in rows {
            match type_str.parse() {
                Ok(monitor_type) => monitors.push(MonitorDefinition {
                    slug,
                    name,
                    monitor_type,
                    target,
                    interval_ms,
                }),
                Err(e) => tracing::warn!("Store: skipping monitor {}: {}", slug, e),
            }
        }

        Ok(monitors)
    }

    /// Create a monitor definition.
    pub fn add_monitor(
        &self,
        def: &MonitorDefinition,
        min_interval_ms: i64,
        max_interval_ms: i64,
    ) -> Result<(), DbError> {
        validate_definition(def, min_interval_ms, max_interval_ms)?;

        let conn = self.conn.lock().unwrap();
        let exists: Option<String> = conn
            .query_row(
                "SELECT slug FROM monitors WHERE slug = ?1",
                params![def.slug],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(DbError::SlugExists(def.slug.clone()));
        }

        conn.execute(
            "INSERT INTO monitors (name, slug, url, monitor_type, interval) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                def.name,
                def.slug,
                def.target,
                def.monitor_type.as_str(),
                def.interval_ms,
            ],
        )?;
        Ok(())
    }

    /// Update a monitor definition, transactionally renaming its state and
    /// history rows when the slug changes.
    pub fn update_monitor(
        &self,
        old_slug: &str,
        def: &MonitorDefinition,
        min_interval_ms: i64,
        max_interval_ms: i64,
    ) -> Result<(), DbError> {
        validate_definition(def, min_interval_ms, max_interval_ms)?;

        let conn = self.conn.lock().unwrap();
        let exists: Option<String> = conn
            .query_row(
                "SELECT slug FROM monitors WHERE slug = ?1",
                params![old_slug],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(DbError::NotFound);
        }

        if def.slug != old_slug {
            let taken: Option<String> = conn
                .query_row(
                    "SELECT slug FROM monitors WHERE slug = ?1",
                    params![def.slug],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Err(DbError::SlugExists(def.slug.clone()));
            }
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE monitors SET name = ?1, slug = ?2, url = ?3, monitor_type = ?4, interval = ?5 WHERE slug = ?6",
            params![
                def.name,
                def.slug,
                def.target,
                def.monitor_type.as_str(),
                def.interval_ms,
                old_slug,
            ],
        )?;
        if def.slug != old_slug {
            tx.execute(
                "UPDATE monitors_state SET slug = ?1 WHERE slug = ?2",
                params![def.slug, old_slug],
            )?;
            tx.execute(
                "UPDATE monitors_status SET slug = ?1 WHERE slug = ?2",
                params![def.slug, old_slug],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a monitor along with its state and history rows.
    pub fn delete_monitor(&self, slug: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM monitors WHERE slug = ?1", params![slug])?;
        tx.execute("DELETE FROM monitors_state WHERE slug = ?1", params![slug])?;
        tx.execute("DELETE FROM monitors_status WHERE slug = ?1", params![slug])?;
        tx.commit()?;
        Ok(())
    }

    // --- Check results ---

    /// Commit a flush batch: bulk-insert raw check rows and apply per-slug
    /// state deltas, all in one transaction. Counters are incremented, not
    /// overwritten, so buffered batches compose with earlier flushes.
    pub fn flush_batch(
        &self,
        records: &[BufferedRecord],
        deltas: &[StateDelta],
    ) -> Result<(), DbError> {
        if records.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO monitors_status (slug, status, response_time, status_code, details_json, checked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for r in records {
                let details_json = r
                    .details
                    .as_ref()
                    .map(|d| d.to_string());
                stmt.execute(params![
                    r.slug,
                    r.status.as_str(),
                    r.response_time_ms,
                    r.status_code,
                    details_json,
                    r.checked_at.to_rfc3339(),
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO monitors_state (slug, current_status, last_checked, uptime_count, downtime_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (slug) DO UPDATE
                 SET current_status = excluded.current_status,
                     last_checked = excluded.last_checked,
                     uptime_count = monitors_state.uptime_count + excluded.uptime_count,
                     downtime_count = monitors_state.downtime_count + excluded.downtime_count",
            )?;
            for d in deltas {
                stmt.execute(params![
                    d.slug,
                    d.latest_status.as_str(),
                    d.latest_checked.to_rfc3339(),
                    d.up,
                    d.down,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Load all per-slug states to seed the in-memory tracker at startup.
    pub fn load_states(&self) -> Result<HashMap<String, MonitorState>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT slug, current_status, last_checked, uptime_count, downtime_count FROM monitors_state",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut states = HashMap::with_capacity(rows.len());
        for (slug, status_str, checked_str, up, down) in rows {
            let current_status = match status_str.parse() {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("Store: skipping state for {}: {}", slug, e);
                    continue;
                }
            };
            let last_checked = checked_str
                .and_then(|s| parse_db_time(&s))
                .unwrap_or_else(Utc::now);
            states.insert(
                slug,
                MonitorState {
                    current_status,
                    last_checked,
                    uptime_count: up,
                    downtime_count: down,
                },
            );
        }

        Ok(states)
    }

    /// Delete check-result rows older than the cutoff. Returns rows removed.
    pub fn purge_results_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM monitors_status WHERE checked_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(removed)
    }

    /// Count stored check-result rows for a slug.
    pub fn count_results(&self, slug: &str) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM monitors_status WHERE slug = ?1",
            params![slug],
            |row| row.get(0),
        )?)
    }

    // --- Settings ---

    /// Read the stored settings JSON, if any.
    pub fn read_settings(&self) -> Result<Option<String>, DbError> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT settings_json FROM app_settings WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json)
    }

    /// Persist the settings JSON.
    pub fn write_settings(&self, json: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO app_settings (id, settings_json, updated_at) VALUES (1, ?1, CURRENT_TIMESTAMP)
             ON CONFLICT (id) DO UPDATE
             SET settings_json = excluded.settings_json, updated_at = CURRENT_TIMESTAMP",
            params![json],
        )?;
        Ok(())
    }
}

fn validate_definition(
    def: &MonitorDefinition,
    min_interval_ms: i64,
    max_interval_ms: i64,
) -> Result<(), DbError> {
    if !is_valid_slug(&def.slug) {
        return Err(DbError::InvalidMonitor(format!("bad slug: {:?}", def.slug)));
    }
    if def.name.trim().is_empty() {
        return Err(DbError::InvalidMonitor("empty name".to_string()));
    }
    if def.target.trim().is_empty() {
        return Err(DbError::InvalidMonitor("empty target".to_string()));
    }
    if def.interval_ms < min_interval_ms || def.interval_ms > max_interval_ms {
        return Err(DbError::InvalidMonitor(format!(
            "interval {}ms outside [{}, {}]",
            def.interval_ms, min_interval_ms, max_interval_ms
        )));
    }
    Ok(())
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
