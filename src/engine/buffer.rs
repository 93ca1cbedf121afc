//! Result buffer: a durable NDJSON append log between check completion and
//! the batched database flush.
//!
//! Append is the durability boundary: a record is on disk before the engine
//! moves on. Flush is an idempotent compaction step that commits the whole
//! log in one transaction and truncates it only after the commit, so a
//! failed flush leaves everything in place for the next cycle.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::db::{BufferedRecord, DbError, StateDelta, Store};

const BUFFER_FILE: &str = "check-results.ndjson";

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("buffer I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("buffer encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Append log of check outcomes pending their next flush.
pub struct ResultBuffer {
    path: PathBuf,
}

impl ResultBuffer {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, BufferError> {
        fs::create_dir_all(&data_dir)?;
        Ok(Self {
            path: data_dir.as_ref().join(BUFFER_FILE),
        })
    }

    /// Durably append one record before returning.
    pub fn append(&self, record: &BufferedRecord) -> Result<(), BufferError> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.sync_data()?;
        Ok(())
    }

    /// Commit every pending record to the store and clear the log.
    ///
    /// Safe to call with an empty log. On any failure the log is left
    /// intact and the same records are retried on the next cycle. Returns
    /// the number of records flushed.
    pub fn flush(&self, store: &Store) -> Result<usize, BufferError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match serde_json::from_str::<BufferedRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("ResultBuffer: skipping corrupt record: {}", e),
            }
        }

        if records.is_empty() {
            if !raw.is_empty() {
                File::create(&self.path)?;
            }
            return Ok(0);
        }

        let deltas = aggregate_deltas(&records);
        store.flush_batch(&records, &deltas)?;

        // Truncate only after the transaction committed.
        File::create(&self.path)?;
        Ok(records.len())
    }

    /// Number of records currently staged in the log.
    pub fn pending(&self) -> usize {
        fs::read_to_string(&self.path)
            .map(|raw| raw.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0)
    }
}

/// Group records by slug into incremental counter deltas plus the latest
/// status and timestamp observed in the batch.
pub fn aggregate_deltas(records: &[BufferedRecord]) -> Vec<StateDelta> {
    let mut by_slug: std::collections::HashMap<&str, StateDelta> = std::collections::HashMap::new();

    for record in records {
        let delta = by_slug
            .entry(record.slug.as_str())
            .or_insert_with(|| StateDelta {
                slug: record.slug.clone(),
                latest_status: record.status,
                latest_checked: record.checked_at,
                up: 0,
                down: 0,
            });
        delta.latest_status = record.status;
        delta.latest_checked = record.checked_at;
        match record.status {
            crate::db::Status::Up => delta.up += 1,
            crate::db::Status::Down => delta.down += 1,
        }
    }

    by_slug.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Status;
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(slug: &str, status: Status) -> BufferedRecord {
        BufferedRecord {
            slug: slug.to_string(),
            status,
            response_time_ms: Some(5),
            status_code: Some(200),
            details: None,
            checked_at: Utc::now(),
        }
    }

    fn open_store(dir: &Path) -> Store {
        Store::new(dir.join("test.db")).unwrap()
    }

    #[test]
    fn test_aggregate_deltas() {
        let records = vec![
            record("a", Status::Up),
            record("a", Status::Down),
            record("a", Status::Down),
            record("b", Status::Up),
        ];
        let mut deltas = aggregate_deltas(&records);
        deltas.sort_by(|x, y| x.slug.cmp(&y.slug));

        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].up, 1);
        assert_eq!(deltas[0].down, 2);
        assert_eq!(deltas[0].latest_status, Status::Down);
        assert_eq!(deltas[1].up, 1);
        assert_eq!(deltas[1].latest_status, Status::Up);
    }

    #[test]
    fn test_append_then_flush() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let buffer = ResultBuffer::new(dir.path()).unwrap();

        buffer.append(&record("web", Status::Up)).unwrap();
        buffer.append(&record("web", Status::Down)).unwrap();
        assert_eq!(buffer.pending(), 2);

        assert_eq!(buffer.flush(&store).unwrap(), 2);
        assert_eq!(buffer.pending(), 0);

        let states = store.load_states().unwrap();
        let state = &states["web"];
        assert_eq!(state.current_status, Status::Down);
        assert_eq!(state.uptime_count, 1);
        assert_eq!(state.downtime_count, 1);
        assert_eq!(store.count_results("web").unwrap(), 2);
    }

    #[test]
    fn test_flush_empty_log_is_noop() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let buffer = ResultBuffer::new(dir.path()).unwrap();

        assert_eq!(buffer.flush(&store).unwrap(), 0);
        assert_eq!(buffer.flush(&store).unwrap(), 0);
    }

    #[test]
    fn test_flush_is_incremental_across_batches() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let buffer = ResultBuffer::new(dir.path()).unwrap();

        buffer.append(&record("web", Status::Up)).unwrap();
        buffer.flush(&store).unwrap();
        buffer.append(&record("web", Status::Up)).unwrap();
        buffer.append(&record("web", Status::Down)).unwrap();
        buffer.flush(&store).unwrap();

        let states = store.load_states().unwrap();
        let state = &states["web"];
        assert_eq!(state.uptime_count + state.downtime_count, 3);
    }

    #[test]
    fn test_restart_replays_pending_records() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        // "Crash" after appending: the buffer instance goes away but the
        // log survives on disk.
        {
            let buffer = ResultBuffer::new(dir.path()).unwrap();
            buffer.append(&record("web", Status::Up)).unwrap();
            buffer.append(&record("web", Status::Up)).unwrap();
        }

        let buffer = ResultBuffer::new(dir.path()).unwrap();
        assert_eq!(buffer.pending(), 2);
        assert_eq!(buffer.flush(&store).unwrap(), 2);

        let states = store.load_states().unwrap();
        assert_eq!(states["web"].uptime_count, 2);
    }

    #[test]
    fn test_failed_flush_leaves_log_for_retry() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let store = Store::new(&db_path).unwrap();
        let buffer = ResultBuffer::new(dir.path()).unwrap();

        buffer.append(&record("web", Status::Up)).unwrap();
        buffer.append(&record("web", Status::Down)).unwrap();

        // Sabotage the store so the flush transaction fails.
        {
            let raw = rusqlite::Connection::open(&db_path).unwrap();
            raw.execute_batch("DROP TABLE monitors_status").unwrap();
        }
        assert!(buffer.flush(&store).is_err());
        assert_eq!(buffer.pending(), 2);

        // Re-initializing the schema lets the retry commit the same batch.
        let store = Store::new(&db_path).unwrap();
        assert_eq!(buffer.flush(&store).unwrap(), 2);
        assert_eq!(buffer.pending(), 0);

        let states = store.load_states().unwrap();
        let state = &states["web"];
        assert_eq!(state.uptime_count + state.downtime_count, 2);
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let buffer = ResultBuffer::new(dir.path()).unwrap();

        buffer.append(&record("web", Status::Up)).unwrap();
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join(BUFFER_FILE))
                .unwrap();
            writeln!(file, "{{not json").unwrap();
        }
        buffer.append(&record("web", Status::Up)).unwrap();

        assert_eq!(buffer.flush(&store).unwrap(), 2);
        assert_eq!(store.load_states().unwrap()["web"].uptime_count, 2);
    }
}
