use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use thinglog_api::LogRecord;

use crate::config::Durability;
use crate::error::SinkError;
use crate::filename::log_file_name;

// ════════════════════════════════════════════════════════════════
//  LogFile
// ════════════════════════════════════════════════════════════════

struct LogFile {
    path: PathBuf,
    file: File,
}

impl LogFile {
    fn open(path: PathBuf) -> Result<Self, SinkError> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o640);
        }
        match options.open(&path) {
            Ok(file) => Ok(Self { path, file }),
            Err(source) => Err(SinkError::Open { path, source }),
        }
    }

    fn append(&mut self, line: &[u8], durability: Durability) -> Result<(), SinkError> {
        let result = self.file.write_all(line).and_then(|()| self.file.flush());
        let result = match durability {
            Durability::AuditStrict => result.and_then(|()| self.file.sync_data()),
            Durability::DevLoose => result,
        };
        result.map_err(|source| SinkError::Write { path: self.path.clone(), source })
    }
}

// ════════════════════════════════════════════════════════════════
//  FileSink
// ════════════════════════════════════════════════════════════════

/// Per-entity append-only log files under one folder.
///
/// All handles sit behind a single mutex. `write` and `close_all` take the
/// same lock, so a write either completes before the sink is closed or
/// observes [`SinkError::Closed`]; concurrent writes for one entity are
/// appended whole, in lock acquisition order.
pub struct FileSink {
    folder: PathBuf,
    durability: Durability,
    /// `None` once closed.
    table: Mutex<Option<HashMap<String, LogFile>>>,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("folder", &self.folder)
            .field("durability", &self.durability)
            .field("open_files", &self.open_files())
            .finish()
    }
}

impl FileSink {
    pub fn new(folder: impl Into<PathBuf>, durability: Durability) -> Self {
        Self {
            folder: folder.into(),
            durability,
            table: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Path the log of `entity_id` is (or would be) written to.
    pub fn log_path(&self, entity_id: &str) -> Result<PathBuf, SinkError> {
        Ok(self.folder.join(log_file_name(entity_id)?))
    }

    fn table(&self) -> MutexGuard<'_, Option<HashMap<String, LogFile>>> {
        match self.table.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("file sink lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Append one record to the log of `entity_id`, opening it on first use.
    ///
    /// The record is on disk (per the sink's durability) when this returns.
    /// On open failure no handle is kept, so the next message retries.
    pub fn write(&self, entity_id: &str, record: &LogRecord) -> Result<(), SinkError> {
        let line = record.to_line().map_err(SinkError::Serialize)?;

        let mut guard = self.table();
        let table = guard.as_mut().ok_or(SinkError::Closed)?;

        if !table.contains_key(entity_id) {
            let log = LogFile::open(self.log_path(entity_id)?)?;
            tracing::info!(entity = %entity_id, path = %log.path.display(), "opened log file");
            table.insert(entity_id.to_string(), log);
        }
        match table.get_mut(entity_id) {
            Some(log) => log.append(&line, self.durability),
            None => Err(SinkError::Closed),
        }
    }

    /// Close every handle and refuse further writes. Returns how many
    /// files were open; a second call returns 0.
    pub fn close_all(&self) -> usize {
        let Some(table) = self.table().take() else {
            return 0;
        };
        let count = table.len();
        for (entity, log) in table {
            if let Err(e) = log.file.sync_all() {
                tracing::warn!(entity = %entity, path = %log.path.display(), error = %e, "sync on close failed");
            }
        }
        tracing::debug!(folder = %self.folder.display(), files = count, "file sink closed");
        count
    }

    pub fn open_files(&self) -> usize {
        self.table().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_closed(&self) -> bool {
        self.table().is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;

    fn record(entity: &str, payload: &str) -> LogRecord {
        LogRecord::new(thinglog_api::received_at_now(), entity, "event", "test", payload.as_bytes())
    }

    fn read_records(path: &Path) -> Vec<LogRecord> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn first_write_creates_file_and_handle_is_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = FileSink::new(tmp.path(), Durability::DevLoose);

        sink.write("thing1", &record("thing1", r#"{"n":1}"#)).unwrap();
        sink.write("thing1", &record("thing1", r#"{"n":2}"#)).unwrap();
        assert_eq!(sink.open_files(), 1);

        let records = read_records(&tmp.path().join("thing1.log"));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, Some(serde_json::json!({"n": 1})));
        assert_eq!(records[1].payload, Some(serde_json::json!({"n": 2})));
    }

    #[test]
    fn entities_get_separate_files() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = FileSink::new(tmp.path(), Durability::AuditStrict);
        sink.write("thingA", &record("thingA", "1")).unwrap();
        sink.write("thingB", &record("thingB", "2")).unwrap();
        assert_eq!(sink.open_files(), 2);
        assert_eq!(read_records(&tmp.path().join("thingA.log")).len(), 1);
        assert_eq!(read_records(&tmp.path().join("thingB.log")).len(), 1);
    }

    #[test]
    fn reopening_appends_instead_of_truncating() {
        let tmp = tempfile::tempdir().unwrap();
        let first = FileSink::new(tmp.path(), Durability::DevLoose);
        first.write("thing1", &record("thing1", "1")).unwrap();
        assert_eq!(first.close_all(), 1);

        let second = FileSink::new(tmp.path(), Durability::DevLoose);
        second.write("thing1", &record("thing1", "2")).unwrap();
        second.close_all();

        let payloads: Vec<_> = read_records(&tmp.path().join("thing1.log"))
            .into_iter()
            .map(|r| r.payload)
            .collect();
        assert_eq!(payloads, vec![Some(serde_json::json!(1)), Some(serde_json::json!(2))]);
    }

    #[test]
    fn close_all_is_idempotent_and_rejects_later_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = FileSink::new(tmp.path(), Durability::DevLoose);
        sink.write("thing1", &record("thing1", "1")).unwrap();

        assert_eq!(sink.close_all(), 1);
        assert_eq!(sink.close_all(), 0);
        assert!(sink.is_closed());
        assert_eq!(sink.open_files(), 0);

        let err = sink.write("thing1", &record("thing1", "2")).unwrap_err();
        assert!(matches!(err, SinkError::Closed));
        let err = sink.write("new", &record("new", "3")).unwrap_err();
        assert!(matches!(err, SinkError::Closed));
        assert!(!tmp.path().join("new.log").exists());
    }

    #[test]
    fn unsafe_ids_stay_inside_the_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = tmp.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        let sink = FileSink::new(&logs, Durability::DevLoose);

        sink.write("../escape", &record("../escape", "1")).unwrap();
        assert!(!tmp.path().join("escape.log").exists());
        assert!(logs.join("%2E.%2Fescape.log").exists());

        let err = sink.write("", &record("", "1")).unwrap_err();
        assert!(matches!(err, SinkError::InvalidEntity { .. }));
        assert_eq!(sink.open_files(), 1);
    }

    #[test]
    fn open_failure_keeps_no_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = FileSink::new(tmp.path().join("missing"), Durability::DevLoose);
        let err = sink.write("thing1", &record("thing1", "1")).unwrap_err();
        assert!(matches!(err, SinkError::Open { .. }));
        assert_eq!(sink.open_files(), 0);

        std::fs::create_dir(tmp.path().join("missing")).unwrap();
        sink.write("thing1", &record("thing1", "2")).unwrap();
        assert_eq!(sink.open_files(), 1);
    }

    #[test]
    fn concurrent_writes_for_one_entity_are_not_interleaved() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileSink::new(tmp.path(), Durability::DevLoose));
        // large payloads make torn writes visible if the lock were missing
        let filler = "x".repeat(8 * 1024);

        let threads: Vec<_> = (0..100)
            .map(|i| {
                let sink = sink.clone();
                let payload = format!(r#"{{"i":{i},"fill":"{filler}"}}"#);
                std::thread::spawn(move || sink.write("hot", &record("hot", &payload)).unwrap())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(sink.open_files(), 1);

        let records = read_records(&tmp.path().join("hot.log"));
        assert_eq!(records.len(), 100);
        let mut seen: Vec<i64> = records
            .iter()
            .map(|r| r.payload.as_ref().unwrap()["i"].as_i64().unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[cfg(unix)]
    #[test]
    fn new_files_are_group_readable_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let sink = FileSink::new(tmp.path(), Durability::DevLoose);
        sink.write("thing1", &record("thing1", "1")).unwrap();
        let mode = std::fs::metadata(tmp.path().join("thing1.log")).unwrap().permissions().mode();
        // umask may clear bits but never adds any
        assert_eq!(mode & 0o137, 0);
    }
}
