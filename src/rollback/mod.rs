//! Pre-execution snapshots and restoration of a task's files.

pub mod snapshot;

pub use snapshot::{
    sha256_hex, ManifestEntry, RestoreStats, Snapshot, SnapshotManifest, SnapshotStore,
};

use crate::audit::{AuditEntry, AuditError, AuditLog, AuditOp, AuditOutcome};
use crate::shared::ids::StepId;
use crate::task::{Task, TaskError, TaskStatus, TaskStore};
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid snapshot manifest {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot verification failed for {path}: {reason}")]
    Verification { path: String, reason: String },
    #[error("rollback archive {path} is unavailable: {reason}")]
    ArchiveUnavailable { path: String, reason: String },
    #[error("task `{task_id}` has no snapshot reference")]
    NoSnapshot { task_id: String },
    #[error("snapshot `{snapshot_ref}` not found")]
    NotFound { snapshot_ref: String },
    #[error("failed to generate snapshot id: {0}")]
    Randomness(String),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Why a rollback was triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackContext {
    pub failed_step: Option<StepId>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreResult {
    pub snapshot_ref: String,
    pub restored_files: usize,
    pub removed_files: usize,
}

#[derive(Debug, Clone)]
pub struct RollbackManager {
    store: SnapshotStore,
    tasks: TaskStore,
    audit: AuditLog,
    retention_days: u32,
}

impl RollbackManager {
    pub fn new(tasks: TaskStore, audit: AuditLog, retention_days: u32) -> Self {
        let paths = tasks.paths();
        let store = SnapshotStore::new(&paths.vault_root, paths.rollback_archive_dir());
        Self {
            store,
            tasks,
            audit,
            retention_days,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Captures the task and its step targets, then records the snapshot id
    /// on the task file.
    pub fn create_snapshot(
        &self,
        task: &mut Task,
        now: DateTime<Utc>,
    ) -> Result<Snapshot, SnapshotError> {
        let snapshot = self.store.create(task, now)?;
        task.rollback_ref = Some(snapshot.id.clone());
        task.append_log(now, format!("snapshot {} created", snapshot.id));
        self.tasks.persist(task)?;
        self.audit.append(
            &AuditEntry::new(
                AuditOp::SnapshotCreated,
                task.id.as_str(),
                task.status.logical_folder(),
                AuditOutcome::Success,
                format!(
                    "snapshot={} files={} absent={}",
                    snapshot.id,
                    snapshot.manifest.entries.len(),
                    snapshot.manifest.absent.len()
                ),
            )
            .with_decision_source("rollback_manager"),
        )?;
        Ok(snapshot)
    }

    /// Restores files from the task's snapshot and moves the task from
    /// `in_progress` to `failed_rollback`.
    pub fn restore(
        &self,
        task: &mut Task,
        context: RollbackContext,
        now: DateTime<Utc>,
    ) -> Result<RestoreResult, SnapshotError> {
        let snapshot_ref = task
            .rollback_ref
            .clone()
            .ok_or_else(|| SnapshotError::NoSnapshot {
                task_id: task.id.to_string(),
            })?;
        let snapshot = self.store.load(&snapshot_ref)?;
        let stats = self.store.restore_files(&snapshot)?;

        // The restored file carries the pre-execution frontmatter; keep the
        // live lifecycle fields so the status change stays monotonic.
        let mut restored = self.tasks.reload(task)?;
        restored.status = task.status;
        restored.version = task.version;
        restored.started_at = task.started_at;
        restored.rollback_ref = task.rollback_ref.clone();
        restored.execution_log = task.execution_log.clone();
        *task = restored;

        let step = context
            .failed_step
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        task.append_log(
            now,
            format!(
                "rollback to {snapshot_ref}: restored={} removed={} failed_step={step}",
                stats.restored, stats.removed
            ),
        );
        self.tasks.transition(
            task,
            TaskStatus::FailedRollback,
            now,
            &format!("rolled back after failure: {}", context.error),
        )?;
        self.audit.append(
            &AuditEntry::new(
                AuditOp::RollbackRestored,
                task.id.as_str(),
                task.status.logical_folder(),
                AuditOutcome::Success,
                format!(
                    "snapshot={snapshot_ref} restored={} removed={} failed_step={step} error={}",
                    stats.restored, stats.removed, context.error
                ),
            )
            .with_decision_source("rollback_manager"),
        )?;
        Ok(RestoreResult {
            snapshot_ref,
            restored_files: stats.restored,
            removed_files: stats.removed,
        })
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, SnapshotError> {
        let removed = self.store.purge_expired(now, self.retention_days)?;
        for id in &removed {
            self.audit.append(
                &AuditEntry::new(
                    AuditOp::SnapshotPurged,
                    id.as_str(),
                    "rollback_manager",
                    AuditOutcome::Success,
                    format!("retention_days={}", self.retention_days),
                )
                .with_decision_source("rollback_manager"),
            )?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::state_paths::{bootstrap_vault, VaultPaths};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn restore_moves_task_to_failed_rollback_and_audits() {
        let dir = tempdir().expect("tempdir");
        let paths = VaultPaths::new(dir.path(), dir.path().join(".taskgate"));
        bootstrap_vault(&paths).expect("bootstrap");
        let audit = AuditLog::new(paths.audit_log_path());
        let tasks = TaskStore::new(paths.clone(), audit.clone());
        let task_path = paths.needs_action_dir().join("T-9.md");
        fs::write(
            &task_path,
            "---\ntype: docs\nstatus: pending\n---\n## Steps\n- [ ] s1: create_file Done/out.md\n",
        )
        .expect("task");

        let manager = RollbackManager::new(tasks.clone(), audit.clone(), 7);
        let mut task = tasks.load(&task_path).expect("load");
        let now = Utc::now();
        manager.create_snapshot(&mut task, now).expect("snapshot");
        tasks
            .transition(&mut task, TaskStatus::InProgress, now, "test")
            .expect("start");
        fs::write(paths.done_dir().join("out.md"), "partial").expect("side effect");

        let result = manager
            .restore(
                &mut task,
                RollbackContext {
                    failed_step: None,
                    error: "boom".to_string(),
                },
                now,
            )
            .expect("restore");
        assert_eq!(Some(result.snapshot_ref), task.rollback_ref);
        assert_eq!(task.status, TaskStatus::FailedRollback);
        assert!(!paths.done_dir().join("out.md").exists());

        let ops: Vec<AuditOp> = audit
            .read_all()
            .expect("audit")
            .into_iter()
            .map(|entry| entry.op)
            .collect();
        assert!(ops.contains(&AuditOp::SnapshotCreated));
        assert!(ops.contains(&AuditOp::RollbackRestored));
    }

    #[test]
    fn restore_without_snapshot_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let paths = VaultPaths::new(dir.path(), dir.path().join(".taskgate"));
        let audit = AuditLog::new(paths.audit_log_path());
        let manager = RollbackManager::new(TaskStore::new(paths, audit.clone()), audit, 7);
        let mut task = Task::new(
            crate::shared::ids::TaskId::parse("T.md").expect("id"),
            dir.path().join("T.md"),
        );
        let err = manager
            .restore(
                &mut task,
                RollbackContext {
                    failed_step: None,
                    error: String::new(),
                },
                Utc::now(),
            )
            .expect_err("no snapshot");
        assert!(matches!(err, SnapshotError::NoSnapshot { .. }));
    }
}
