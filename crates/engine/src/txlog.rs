//! The transaction log.
//!
//! A line-oriented UTF-8 text file beside the database, one entry per
//! line: ISO-8601 timestamp, operation tag, human-readable details, and
//! an optional JSON metadata object. The log is advisory (audit and
//! forensics, never correctness), so write failures degrade to a warning
//! instead of failing the operation that logged.

use chrono::{SecondsFormat, TimeZone, Utc};
use parking_lot::Mutex;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use tracing::warn;

/// Operation tags recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxTag {
    /// Database opened.
    Startup,
    /// Database closed cleanly.
    Shutdown,
    /// One email imported.
    Import,
    /// An email batch or index segment was flushed.
    Flush,
    /// An email was deleted.
    Delete,
    /// A block was recorded superseded.
    DeleteBlock,
    /// A compaction run.
    Compaction,
    /// A migration run.
    Migration,
    /// A key generation rotation.
    KeyRotation,
}

impl TxTag {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "STARTUP",
            Self::Shutdown => "SHUTDOWN",
            Self::Import => "IMPORT",
            Self::Flush => "FLUSH",
            Self::Delete => "DELETE",
            Self::DeleteBlock => "DELETE_BLOCK",
            Self::Compaction => "COMPACTION",
            Self::Migration => "MIGRATION",
            Self::KeyRotation => "KEY_ROTATION",
        }
    }
}

/// Append-only text log beside the database file.
#[derive(Debug)]
pub struct TxLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TxLog {
    /// Opens (appending) or creates the log at `<db_path>.txlog`.
    pub fn open(db_path: &Path) -> std::io::Result<Self> {
        let path = PathBuf::from(format!("{}.txlog", db_path.display()));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    /// The log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry. `now_ms` is Unix milliseconds.
    pub fn record(
        &self,
        now_ms: i64,
        tag: TxTag,
        details: &str,
        metadata: Option<&serde_json::Value>,
    ) {
        let timestamp = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = match metadata {
            Some(meta) => format!("{timestamp} {} {details} {meta}\n", tag.as_str()),
            None => format!("{timestamp} {} {details}\n", tag.as_str()),
        };
        let mut file = self.file.lock();
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(target: "emdb::txlog", error = %e, "failed to append transaction log entry");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entries_are_one_line_each_with_iso_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t.emdb");
        let log = TxLog::open(&db_path).unwrap();
        log.record(1_700_000_000_000, TxTag::Startup, "version=1.0.0", None);
        log.record(
            1_700_000_060_000,
            TxTag::Compaction,
            "reclaimed 3 blocks",
            Some(&serde_json::json!({"bytes": 4096})),
        );

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("2023-11-14T22:13:20.000Z STARTUP"));
        assert!(lines[1].contains("COMPACTION reclaimed 3 blocks {\"bytes\":4096}"));
    }

    #[test]
    fn reopen_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t.emdb");
        {
            let log = TxLog::open(&db_path).unwrap();
            log.record(0, TxTag::Startup, "first", None);
        }
        {
            let log = TxLog::open(&db_path).unwrap();
            log.record(0, TxTag::Shutdown, "second", None);
        }
        let text = std::fs::read_to_string(format!("{}.txlog", db_path.display())).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
