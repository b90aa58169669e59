use super::RuntimeError;
use crate::audit::{AuditEntry, AuditLog, AuditOp, AuditOutcome};
use crate::shared::ids::TaskId;
use crate::task::{TaskStatus, TaskStore};
use chrono::{DateTime, Utc};

/// Marks tasks left `in_progress` by a previous process as `failed`. Runs
/// once at scheduler start, before any dispatch, so nothing it touches can
/// belong to a live worker.
pub fn recover_stale_tasks(
    tasks: &TaskStore,
    audit: &AuditLog,
    now: DateTime<Utc>,
) -> Result<Vec<TaskId>, RuntimeError> {
    let mut recovered = Vec::new();
    for mut task in tasks.list_active()? {
        if task.status != TaskStatus::InProgress {
            continue;
        }
        let completed = task.completed_main_steps();
        let total = task.main_flow_steps().len();
        tasks.transition(
            &mut task,
            TaskStatus::Failed,
            now,
            "interrupted by restart",
        )?;
        audit.append(
            &AuditEntry::new(
                AuditOp::TaskRecovered,
                task.id.as_str(),
                task.status.logical_folder(),
                AuditOutcome::Flagged,
                format!(
                    "stale in_progress marked failed steps_completed={completed}/{total} snapshot={}",
                    task.rollback_ref.as_deref().unwrap_or("-")
                ),
            )
            .with_decision_source("scheduler"),
        )?;
        recovered.push(task.id.clone());
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{bootstrap_vault, VaultPaths};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn only_in_progress_tasks_are_failed() {
        let dir = tempdir().expect("tempdir");
        let paths = VaultPaths::new(dir.path(), dir.path().join(".taskgate"));
        bootstrap_vault(&paths).expect("bootstrap");
        fs::write(
            paths.in_progress_dir().join("TASK-stuck.md"),
            "---\nstatus: in_progress\n---\nbody\n",
        )
        .expect("write stuck");
        fs::write(
            paths.needs_action_dir().join("TASK-new.md"),
            "---\nstatus: pending\n---\nbody\n",
        )
        .expect("write pending");

        let audit = AuditLog::new(paths.audit_log_path());
        let tasks = TaskStore::new(paths.clone(), audit.clone());
        let recovered = recover_stale_tasks(&tasks, &audit, Utc::now()).expect("recover");
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].as_str(), "TASK-stuck.md");

        let stuck = tasks
            .load(&paths.in_progress_dir().join("TASK-stuck.md"))
            .expect("load");
        assert_eq!(stuck.status, TaskStatus::Failed);
        let fresh = tasks
            .load(&paths.needs_action_dir().join("TASK-new.md"))
            .expect("load");
        assert_eq!(fresh.status, TaskStatus::Pending);

        let entries = audit.entries_for("TASK-stuck.md").expect("entries");
        assert!(entries.iter().any(|entry| entry.op == AuditOp::TaskRecovered));
    }
}
