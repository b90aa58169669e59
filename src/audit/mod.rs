//! Append-only JSONL audit trail shared by every component.
//!
//! Appends from any thread are serialised through one mutex and written as a
//! single `O_APPEND` write, so concurrent workers never interleave or lose
//! lines. Entries are never rewritten or deleted.

pub mod entry;

pub use entry::{AuditEntry, AuditOp, AuditOutcome};

use crate::shared::logging::{append_jsonl_line, read_jsonl_lines};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("failed to append audit entry to {path}: {source}")]
    Append {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read audit log {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode audit entry: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let line = serde_json::to_string(entry).map_err(AuditError::Encode)?;
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        append_jsonl_line(&self.path, &line).map_err(|source| AuditError::Append {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Every parseable entry in file order. Lines written by other tools that
    /// do not match the entry shape are skipped.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let lines = read_jsonl_lines(&self.path).map_err(|source| AuditError::Read {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(lines
            .iter()
            .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
            .collect())
    }

    pub fn read_recent(&self, count: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let mut entries = self.read_all()?;
        let skip = entries.len().saturating_sub(count);
        Ok(entries.split_off(skip))
    }

    pub fn entries_for(&self, file: &str) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|entry| entry.file == file)
            .collect())
    }

    pub fn errors_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|entry| entry.op == AuditOp::Error || entry.outcome == AuditOutcome::Failed)
            .filter(|entry| entry.timestamp().is_some_and(|ts| ts >= since))
            .collect())
    }

    pub fn count_errors(&self, since: DateTime<Utc>) -> Result<usize, AuditError> {
        Ok(self.errors_since(since)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::fs;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn entries_carry_required_fields_and_null_dst() {
        let dir = tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path().join("logs/operations.log"));
        log.append(&AuditEntry::new(
            AuditOp::TaskClassified,
            "TASK-1.md",
            "Needs_Action",
            AuditOutcome::Success,
            "complexity:simple",
        ))
        .expect("append");

        let raw = fs::read_to_string(log.path()).expect("read log");
        let value: serde_json::Value =
            serde_json::from_str(raw.trim()).expect("line is one json object");
        for key in ["ts", "op", "file", "src", "dst", "outcome", "detail"] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert!(value["dst"].is_null());
        assert_eq!(value["src"], "Needs_Action");
        assert_eq!(value["op"], "task_classified");
        assert!(value.get("decision_source").is_none());
    }

    #[test]
    fn concurrent_appends_never_interleave() {
        let dir = tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path().join("operations.log"));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let log = log.clone();
            handles.push(thread::spawn(move || {
                for n in 0..50 {
                    log.append(&AuditEntry::new(
                        AuditOp::StepExecuted,
                        format!("TASK-{worker}.md"),
                        "In_Progress",
                        AuditOutcome::Success,
                        format!("step {n}: {}", "x".repeat(256)),
                    ))
                    .expect("append");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join writer");
        }

        let raw = fs::read_to_string(log.path()).expect("read log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 400);
        for line in lines {
            serde_json::from_str::<AuditEntry>(line).expect("every line parses");
        }
    }

    #[test]
    fn read_recent_returns_tail_in_order_and_skips_garbage() {
        let dir = tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path().join("operations.log"));
        for n in 0..5 {
            log.append(&AuditEntry::new(
                AuditOp::RiskScored,
                "TASK-1.md",
                "Needs_Action",
                AuditOutcome::Success,
                format!("n={n}"),
            ))
            .expect("append");
        }
        append_jsonl_line(log.path(), "not json").expect("append garbage");

        let recent = log.read_recent(2).expect("read recent");
        let details: Vec<&str> = recent.iter().map(|e| e.detail.as_str()).collect();
        assert_eq!(details, vec!["n=3", "n=4"]);
    }

    #[test]
    fn errors_since_filters_by_window() {
        let dir = tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path().join("operations.log"));
        let now = Utc::now();
        log.append(
            &AuditEntry::new(AuditOp::Error, "old.md", "scheduler", AuditOutcome::Failed, "old")
                .at(now - Duration::hours(48)),
        )
        .expect("append old");
        log.append(&AuditEntry::new(
            AuditOp::StepExecuted,
            "new.md",
            "In_Progress",
            AuditOutcome::Failed,
            "new",
        ))
        .expect("append new");
        log.append(&AuditEntry::new(
            AuditOp::StepExecuted,
            "ok.md",
            "In_Progress",
            AuditOutcome::Success,
            "ok",
        ))
        .expect("append ok");

        let count = log
            .count_errors(now - Duration::hours(24))
            .expect("count errors");
        assert_eq!(count, 1);
    }
}
