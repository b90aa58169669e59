use chrono::{Duration as ChronoDuration, Utc};
use std::fs;
use std::path::Path;
use taskgate::audit::{AuditOp, AuditOutcome};
use taskgate::config::Settings;
use taskgate::rollback::SnapshotStore;
use taskgate::runtime::{Scheduler, TaskProcessor};
use taskgate::task::TaskStatus;
use tempfile::tempdir;

fn processor(vault: &Path) -> TaskProcessor {
    let mut settings = Settings::for_vault(vault);
    settings.execution.auto_execute_simple = true;
    let processor = TaskProcessor::new(settings);
    processor.bootstrap().expect("bootstrap vault");
    processor
}

const DESTRUCTIVE_TASK: &str = r#"---
type: cleanup
destructive: true
steps:
  - id: s1
    op: create_file
    path: Notes/keep.md
    content: rewritten
  - id: s2
    op: delete_file
    path: Notes/old.md
  - id: s3
    op: copy_file
    path: Notes/missing.md
    to: Notes/copy.md
  - id: s4
    op: create_file
    path: Notes/after.md
    content: after
---
Tidy the notes folder.
"#;

#[test]
fn failed_destructive_task_is_restored_byte_for_byte() {
    let dir = tempdir().expect("tempdir");
    let processor = processor(dir.path());
    fs::create_dir_all(dir.path().join("Notes")).expect("notes dir");
    fs::write(dir.path().join("Notes/keep.md"), "original\n").expect("keep");
    fs::write(dir.path().join("Notes/old.md"), "legacy\n").expect("old");
    let path = dir.path().join("Needs_Action/TASK-tidy.md");
    fs::write(&path, DESTRUCTIVE_TASK).expect("write task");

    Scheduler::new(processor.clone()).drain().expect("drain");

    let task = processor.tasks().load(&path).expect("load");
    assert_eq!(task.status, TaskStatus::FailedRollback);
    assert_eq!(
        task.gate_results.get("gate_6_rollback"),
        Some(&taskgate::task::GateOutcome::Pass)
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("Notes/keep.md")).expect("keep"),
        "original\n"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("Notes/old.md")).expect("old"),
        "legacy\n"
    );
    assert!(!dir.path().join("Notes/copy.md").exists());
    assert!(!dir.path().join("Notes/after.md").exists());

    let snapshot_ref = task.rollback_ref.clone().expect("snapshot ref");
    let store = SnapshotStore::new(dir.path(), processor.paths().rollback_archive_dir());
    let snapshot = store.load(&snapshot_ref).expect("load snapshot");
    assert_eq!(snapshot.manifest.task_ref, "TASK-tidy.md");
    store.verify(&snapshot).expect("snapshot still verifies");

    let entries = processor.audit().entries_for("TASK-tidy.md").expect("entries");
    let restored = entries
        .iter()
        .find(|entry| entry.op == AuditOp::RollbackRestored)
        .expect("rollback entry");
    assert_eq!(restored.outcome, AuditOutcome::Success);
    assert!(restored.detail.contains(&snapshot_ref));
    assert!(restored.detail.contains("failed_step=s3"));
}

#[test]
fn unwritable_archive_blocks_execution_before_any_step() {
    let dir = tempdir().expect("tempdir");
    let processor = processor(dir.path());
    let archive = processor.paths().rollback_archive_dir();
    fs::remove_dir_all(&archive).expect("remove archive");
    fs::write(&archive, "not a directory").expect("archive placeholder");

    let path = dir.path().join("Needs_Action/TASK-nosnap.md");
    fs::write(
        &path,
        "---\ntype: filing\nsteps:\n  - id: s1\n    op: create_folder\n    path: Filed\n---\nFile it.\n",
    )
    .expect("write task");

    Scheduler::new(processor.clone()).drain().expect("drain");

    let task = processor.tasks().load(&path).expect("load");
    assert_eq!(task.status, TaskStatus::Blocked);
    assert!(!dir.path().join("Filed").exists());
    let ops: Vec<AuditOp> = processor
        .audit()
        .entries_for("TASK-nosnap.md")
        .expect("entries")
        .into_iter()
        .map(|entry| entry.op)
        .collect();
    assert!(ops.contains(&AuditOp::Error));
    assert!(!ops.contains(&AuditOp::StepExecuted));
}

#[test]
fn maintenance_purges_snapshots_past_retention() {
    let dir = tempdir().expect("tempdir");
    let processor = processor(dir.path());
    let path = dir.path().join("Needs_Action/TASK-old.md");
    fs::write(
        &path,
        "---\ntype: filing\nsteps:\n  - id: s1\n    op: create_folder\n    path: Filed\n---\nFile it.\n",
    )
    .expect("write task");
    let task = processor.tasks().load(&path).expect("load");

    let store = SnapshotStore::new(dir.path(), processor.paths().rollback_archive_dir());
    let now = Utc::now();
    let stale = store
        .create(&task, now - ChronoDuration::days(10))
        .expect("stale snapshot");
    let fresh = store
        .create(&task, now - ChronoDuration::days(1))
        .expect("fresh snapshot");

    let summary = processor.maintenance(now).expect("maintenance");
    assert_eq!(summary.snapshots_purged, vec![stale.id.clone()]);
    assert_eq!(store.list().expect("list"), vec![fresh.id]);

    let purged = processor.audit().entries_for(&stale.id).expect("entries");
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0].op, AuditOp::SnapshotPurged);
}
