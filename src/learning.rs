//! Per-task-type execution history.
//!
//! Each task type owns `<type>.jsonl` (one record per finished execution) and
//! `<type>.meta.json` (running aggregates). Writers are serialised by a
//! store-wide mutex; aggregates are replaced atomically so concurrent readers
//! only ever see a complete file, possibly one update behind.

use crate::audit::{AuditEntry, AuditError, AuditLog, AuditOp, AuditOutcome};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::logging::{append_jsonl_line, read_jsonl_lines};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const RECORDS_SUFFIX: &str = ".jsonl";
const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, thiserror::Error)]
pub enum LearningError {
    #[error("learning data io failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid learning data in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Audit(#[from] AuditError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Done,
    Failed,
    FailedRollback,
}

impl RecordOutcome {
    pub fn is_success(self) -> bool {
        self == RecordOutcome::Done
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordOutcome::Done => "done",
            RecordOutcome::Failed => "failed",
            RecordOutcome::FailedRollback => "failed_rollback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_ref: String,
    pub task_type: String,
    pub outcome: RecordOutcome,
    pub duration_secs: f64,
    pub steps_total: usize,
    pub steps_executed: usize,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default)]
    pub retry_successes: u32,
    #[serde(default)]
    pub sla_breached: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Running aggregates for one task type. Duration statistics cover
/// successful executions only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LearningMetrics {
    pub task_type: String,
    pub total_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    #[serde(default)]
    pub duration_samples: u64,
    pub avg_duration_secs: f64,
    pub duration_variance: f64,
    #[serde(default)]
    duration_m2: f64,
    pub retry_total_count: u64,
    pub retry_success_count: u64,
    pub sla_breach_count: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl LearningMetrics {
    fn empty(task_type: &str) -> Self {
        Self {
            task_type: task_type.to_string(),
            ..Self::default()
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        self.failure_count as f64 / self.total_count as f64
    }

    pub fn duration_stdev(&self) -> f64 {
        self.duration_variance.max(0.0).sqrt()
    }

    pub fn duration_history(&self) -> DurationHistory {
        DurationHistory {
            samples: self.duration_samples,
            mean_secs: self.avg_duration_secs,
            stdev_secs: self.duration_stdev(),
        }
    }

    fn apply(&mut self, record: &ExecutionRecord) {
        self.total_count += 1;
        if record.outcome.is_success() {
            self.success_count += 1;
            // Welford; variance is the sample variance.
            self.duration_samples += 1;
            let delta = record.duration_secs - self.avg_duration_secs;
            self.avg_duration_secs += delta / self.duration_samples as f64;
            self.duration_m2 += delta * (record.duration_secs - self.avg_duration_secs);
            self.duration_variance = if self.duration_samples > 1 {
                self.duration_m2 / (self.duration_samples - 1) as f64
            } else {
                0.0
            };
        } else {
            self.failure_count += 1;
        }
        self.retry_total_count += u64::from(record.retry_attempts);
        self.retry_success_count += u64::from(record.retry_successes);
        if record.sla_breached {
            self.sla_breach_count += 1;
        }
        self.last_updated = Some(record.recorded_at);
    }
}

/// Successful-run duration statistics handed to the SLA predictor and the
/// feasibility gate.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DurationHistory {
    pub samples: u64,
    pub mean_secs: f64,
    pub stdev_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MaintenanceReport {
    pub task_types: usize,
    pub records_dropped: usize,
}

#[derive(Debug, Clone)]
pub struct LearningStore {
    dir: PathBuf,
    window_days: u32,
    audit: AuditLog,
    write_lock: Arc<Mutex<()>>,
}

impl LearningStore {
    pub fn new(dir: impl Into<PathBuf>, window_days: u32, audit: AuditLog) -> Self {
        Self {
            dir: dir.into(),
            window_days,
            audit,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record(&self, record: &ExecutionRecord) -> Result<LearningMetrics, LearningError> {
        let key = file_key(&record.task_type);
        let records_path = self.dir.join(format!("{key}{RECORDS_SUFFIX}"));
        let meta_path = self.dir.join(format!("{key}{META_SUFFIX}"));
        let line = serde_json::to_string(record).map_err(|e| json_error(&records_path, e))?;

        let metrics = {
            let _guard = self
                .write_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            append_jsonl_line(&records_path, &line).map_err(|e| io_error(&records_path, e))?;
            let mut metrics = read_metrics(&meta_path)?
                .unwrap_or_else(|| LearningMetrics::empty(&record.task_type));
            metrics.apply(record);
            write_metrics(&meta_path, &metrics)?;
            metrics
        };

        self.audit.append(
            &AuditEntry::new(
                AuditOp::LearningUpdate,
                record.task_ref.as_str(),
                "learning_store",
                AuditOutcome::Success,
                format!(
                    "type={} outcome={} duration_secs={:.1} total={} failure_rate={:.3}",
                    record.task_type,
                    record.outcome.as_str(),
                    record.duration_secs,
                    metrics.total_count,
                    metrics.failure_rate()
                ),
            )
            .with_decision_source("learning"),
        )?;
        Ok(metrics)
    }

    pub fn query(&self, task_type: &str) -> Result<Option<LearningMetrics>, LearningError> {
        let meta_path = self
            .dir
            .join(format!("{}{META_SUFFIX}", file_key(task_type)));
        read_metrics(&meta_path)
    }

    /// Failure rate for a task type; 0 without data.
    pub fn failure_rate(&self, task_type: &str) -> f64 {
        self.query_or_report(task_type)
            .map(|metrics| metrics.failure_rate())
            .unwrap_or(0.0)
    }

    pub fn duration_history(&self, task_type: &str) -> DurationHistory {
        self.query_or_report(task_type)
            .map(|metrics| metrics.duration_history())
            .unwrap_or_default()
    }

    /// Unreadable aggregates count as no history. The read error is audited on
    /// a best-effort basis.
    fn query_or_report(&self, task_type: &str) -> Option<LearningMetrics> {
        match self.query(task_type) {
            Ok(metrics) => metrics,
            Err(err) => {
                let entry = AuditEntry::new(
                    AuditOp::Error,
                    format!("{}{META_SUFFIX}", file_key(task_type)),
                    "learning_store",
                    AuditOutcome::Failed,
                    format!("type={task_type} using empty history: {err}"),
                )
                .with_decision_source("learning_store");
                let _ = self.audit.append(&entry);
                None
            }
        }
    }

    pub fn records(&self, task_type: &str) -> Result<Vec<ExecutionRecord>, LearningError> {
        let path = self
            .dir
            .join(format!("{}{RECORDS_SUFFIX}", file_key(task_type)));
        read_records(&path)
    }

    /// Drops records older than the retention window and rebuilds every
    /// aggregate from what remains.
    pub fn maintenance(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, LearningError> {
        let cutoff = now - Duration::days(i64::from(self.window_days));
        let mut report = MaintenanceReport::default();
        {
            let _guard = self
                .write_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let entries = match fs::read_dir(&self.dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(report),
                Err(err) => return Err(io_error(&self.dir, err)),
            };
            let mut record_files = Vec::new();
            for entry in entries {
                let path = entry.map_err(|e| io_error(&self.dir, e))?.path();
                let is_records = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(RECORDS_SUFFIX));
                if is_records {
                    record_files.push(path);
                }
            }
            record_files.sort();

            for records_path in record_files {
                let records = read_records(&records_path)?;
                let before = records.len();
                let kept: Vec<ExecutionRecord> = records
                    .into_iter()
                    .filter(|record| record.recorded_at >= cutoff)
                    .collect();
                report.records_dropped += before - kept.len();
                report.task_types += 1;

                let mut content = String::new();
                for record in &kept {
                    let line =
                        serde_json::to_string(record).map_err(|e| json_error(&records_path, e))?;
                    content.push_str(&line);
                    content.push('\n');
                }
                atomic_write_file(&records_path, content.as_bytes())
                    .map_err(|e| io_error(&records_path, e))?;

                let stem = records_path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| name.strip_suffix(RECORDS_SUFFIX))
                    .unwrap_or_default()
                    .to_string();
                let task_type = kept
                    .first()
                    .map(|record| record.task_type.clone())
                    .unwrap_or_else(|| stem.clone());
                let mut metrics = LearningMetrics::empty(&task_type);
                for record in &kept {
                    metrics.apply(record);
                }
                write_metrics(&self.dir.join(format!("{stem}{META_SUFFIX}")), &metrics)?;
            }
        }

        self.audit.append(
            &AuditEntry::new(
                AuditOp::LearningUpdate,
                "learning",
                "learning_store",
                AuditOutcome::Success,
                format!(
                    "maintenance window_days={} types={} dropped={}",
                    self.window_days, report.task_types, report.records_dropped
                ),
            )
            .with_decision_source("learning"),
        )?;
        Ok(report)
    }
}

/// File-name-safe key for a task type.
fn file_key(task_type: &str) -> String {
    let key: String = task_type
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if key.is_empty() {
        crate::task::DEFAULT_TASK_TYPE.to_string()
    } else {
        key
    }
}

fn read_metrics(path: &Path) -> Result<Option<LearningMetrics>, LearningError> {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| json_error(path, e)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(path, err)),
    }
}

fn write_metrics(path: &Path, metrics: &LearningMetrics) -> Result<(), LearningError> {
    let encoded = serde_json::to_vec_pretty(metrics).map_err(|e| json_error(path, e))?;
    atomic_write_file(path, &encoded).map_err(|e| io_error(path, e))
}

fn read_records(path: &Path) -> Result<Vec<ExecutionRecord>, LearningError> {
    let lines = read_jsonl_lines(path).map_err(|e| io_error(path, e))?;
    Ok(lines
        .iter()
        .filter_map(|line| serde_json::from_str::<ExecutionRecord>(line).ok())
        .collect())
}

fn io_error(path: &Path, source: std::io::Error) -> LearningError {
    LearningError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn json_error(path: &Path, source: serde_json::Error) -> LearningError {
    LearningError::Json {
        path: path.display().to_string(),
        source,
    }
}
