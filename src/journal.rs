//! Append-only operation journal.
//!
//! The journal is the audit trail: one JSON record per line, never rewritten,
//! never truncated. It is independent of the mutable undo stack: entries stay
//! here even after a successful rollback.

use crate::error::{Result, SafetyError};
use crate::types::{Operation, OperationKind};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Severity of a journaled event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    /// Session lifecycle and other informational records
    Info,
    /// Emergency-stop and other safety-critical records
    SafetyError,
}

/// One line in the journal file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JournalRecord {
    /// A tracked operation
    Operation(Operation),
    /// A non-operation event (session lifecycle, emergency stop)
    Event {
        severity: EventSeverity,
        message: String,
        session_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

/// Filters for [`OperationJournal::query`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    /// Restrict to these kinds; empty means all kinds
    pub kinds: Vec<OperationKind>,
    /// Only operations at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Only operations whose target contains this substring
    pub target_contains: Option<String>,
}

impl OperationFilter {
    fn matches(&self, op: &Operation) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&op.kind) {
            return false;
        }
        if let Some(since) = self.since {
            if op.timestamp < since {
                return false;
            }
        }
        if let Some(needle) = &self.target_contains {
            if !op.target.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Append-only JSON-lines journal.
#[derive(Debug)]
pub struct OperationJournal {
    path: PathBuf,
}

impl OperationJournal {
    /// Open (creating if necessary) the journal at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Touch the file so queries on a fresh journal succeed
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path })
    }

    /// Journal file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a tracked operation. The record is flushed before returning.
    pub fn append(&self, operation: &Operation) -> Result<()> {
        self.append_record(&JournalRecord::Operation(operation.clone()))
    }

    /// Append a non-operation event record.
    pub fn append_event(
        &self,
        severity: EventSeverity,
        message: impl Into<String>,
        session_id: Option<&str>,
    ) -> Result<()> {
        self.append_record(&JournalRecord::Event {
            severity,
            message: message.into(),
            session_id: session_id.map(str::to_string),
            timestamp: Utc::now(),
        })
    }

    fn append_record(&self, record: &JournalRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        debug!("Journal append: {}", line);
        Ok(())
    }

    /// All operations recorded for `session_id`, in append order, matching
    /// `filter`.
    pub fn query(&self, session_id: &str, filter: &OperationFilter) -> Result<Vec<Operation>> {
        let mut out = Vec::new();
        for record in self.read_all()? {
            if let JournalRecord::Operation(op) = record {
                if op.session_id == session_id && filter.matches(&op) {
                    out.push(op);
                }
            }
        }
        Ok(out)
    }

    /// Every record in the journal, in append order.
    pub fn read_all(&self) -> Result<Vec<JournalRecord>> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: JournalRecord = serde_json::from_str(&line).map_err(|e| {
                SafetyError::journal(format!(
                    "malformed record at line {}: {}",
                    lineno + 1,
                    e
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InverseAction;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sample_op(id: u64, session: &str, kind: OperationKind, target: &str) -> Operation {
        Operation {
            id,
            session_id: session.to_string(),
            kind,
            target: target.to_string(),
            timestamp: Utc::now(),
            inverse: InverseAction::DeleteFile {
                path: PathBuf::from(target),
            },
            backup_ref: None,
        }
    }

    #[test]
    fn test_append_and_query_in_order() {
        let dir = TempDir::new().unwrap();
        let journal = OperationJournal::open(dir.path().join("journal.log")).unwrap();

        for i in 1..=3 {
            let op = sample_op(i, "s1", OperationKind::FileCreate, &format!("f{}", i));
            journal.append(&op).unwrap();
        }

        let ops = journal.query("s1", &OperationFilter::default()).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops.iter().map(|o| o.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_query_filters_by_session_and_kind() {
        let dir = TempDir::new().unwrap();
        let journal = OperationJournal::open(dir.path().join("journal.log")).unwrap();

        journal
            .append(&sample_op(1, "s1", OperationKind::FileCreate, "a"))
            .unwrap();
        journal
            .append(&sample_op(2, "s1", OperationKind::FileDelete, "b"))
            .unwrap();
        journal
            .append(&sample_op(1, "s2", OperationKind::FileCreate, "c"))
            .unwrap();

        let filter = OperationFilter {
            kinds: vec![OperationKind::FileDelete],
            ..Default::default()
        };
        let ops = journal.query("s1", &filter).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].target, "b");
    }

    #[test]
    fn test_events_interleave_without_breaking_queries() {
        let dir = TempDir::new().unwrap();
        let journal = OperationJournal::open(dir.path().join("journal.log")).unwrap();

        journal
            .append_event(EventSeverity::Info, "session started", Some("s1"))
            .unwrap();
        journal
            .append(&sample_op(1, "s1", OperationKind::FileCreate, "a"))
            .unwrap();
        journal
            .append_event(EventSeverity::SafetyError, "EMERGENCY_STOP:test", Some("s1"))
            .unwrap();

        let ops = journal.query("s1", &OperationFilter::default()).unwrap();
        assert_eq!(ops.len(), 1);

        let records = journal.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(
            records[2],
            JournalRecord::Event {
                severity: EventSeverity::SafetyError,
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_line_is_an_error_not_a_skip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");
        let journal = OperationJournal::open(&path).unwrap();
        journal
            .append(&sample_op(1, "s1", OperationKind::FileCreate, "a"))
            .unwrap();

        use std::io::Write as _;
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "not json").unwrap();

        let err = journal.read_all().unwrap_err();
        assert!(matches!(err, SafetyError::Journal(_)));
    }
}
