use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use taskgate::audit::{AuditEntry, AuditOp, AuditOutcome};
use taskgate::config::Settings;
use taskgate::execution::{StepContext, StepError, StepRunner, VaultOperations};
use taskgate::runtime::{Scheduler, TaskProcessor};
use taskgate::task::{Step, StepStatus, TaskStatus};
use tempfile::tempdir;

/// Fails the listed steps on their first attempt only.
struct FlakyRunner {
    flaky: BTreeSet<String>,
    calls: AtomicU32,
}

impl StepRunner for FlakyRunner {
    fn run(&self, ctx: &StepContext<'_>, step: &Step) -> Result<String, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt == 1 && self.flaky.contains(step.id.as_str()) {
            return Err(StepError::Injected("transient lock on target".to_string()));
        }
        VaultOperations.run(ctx, step)
    }
}

/// Fails the listed steps on every attempt.
struct BrokenRunner {
    broken: BTreeSet<String>,
}

impl StepRunner for BrokenRunner {
    fn run(&self, ctx: &StepContext<'_>, step: &Step) -> Result<String, StepError> {
        if self.broken.contains(step.id.as_str()) {
            return Err(StepError::Injected(format!("{} keeps failing", step.id)));
        }
        VaultOperations.run(ctx, step)
    }
}

fn ids(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|id| id.to_string()).collect()
}

fn processor_with(
    vault: &Path,
    runner: Arc<dyn StepRunner>,
    configure: impl FnOnce(&mut Settings),
) -> TaskProcessor {
    let mut settings = Settings::for_vault(vault);
    settings.execution.auto_execute_simple = true;
    configure(&mut settings);
    let processor = TaskProcessor::with_runner(settings, runner);
    processor.bootstrap().expect("bootstrap vault");
    processor
}

fn entries(processor: &TaskProcessor, file: &str) -> Vec<AuditEntry> {
    processor.audit().entries_for(file).expect("audit entries")
}

fn count(entries: &[AuditEntry], op: AuditOp) -> usize {
    entries.iter().filter(|entry| entry.op == op).count()
}

const FIVE_STEP_TASK: &str = r#"---
type: filing
steps:
  - id: s1
    op: create_folder
    path: Work/beta
  - id: s2
    op: create_file
    path: Work/beta/plan.md
    content: plan
  - id: s3
    op: create_file
    path: Work/beta/notes.md
    content: notes
  - id: s4
    op: copy_file
    path: Work/beta/notes.md
    to: Work/beta/notes-copy.md
  - id: s5
    op: create_file
    path: Work/beta/index.md
    content: index
---
File the beta workstream.
"#;

#[test]
fn transient_failure_is_healed_by_a_single_retry() {
    let dir = tempdir().expect("tempdir");
    let runner = Arc::new(FlakyRunner {
        flaky: ids(&["s3"]),
        calls: AtomicU32::new(0),
    });
    let processor = processor_with(dir.path(), runner.clone(), |_| {});
    let path = dir.path().join("Needs_Action/TASK-beta.md");
    fs::write(&path, FIVE_STEP_TASK).expect("write task");

    Scheduler::new(processor.clone()).drain().expect("drain");

    let task = processor.tasks().load(&path).expect("load");
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task
        .main_flow_steps()
        .iter()
        .all(|step| step.status == StepStatus::Completed));
    assert_eq!(runner.calls.load(Ordering::SeqCst), 6);

    let log = entries(&processor, "TASK-beta.md");
    let retries: Vec<&AuditEntry> = log
        .iter()
        .filter(|entry| entry.op == AuditOp::SelfHealRetry)
        .collect();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].outcome, AuditOutcome::Success);
    assert!(retries[0].detail.contains("step=s3"));
    assert_eq!(count(&log, AuditOp::SelfHealAlternative), 0);
    assert_eq!(count(&log, AuditOp::RollbackRestored), 0);
    assert!(dir.path().join("Work/beta/index.md").is_file());
}

const ALTERNATIVE_TASK: &str = r#"---
type: filing
steps:
  - id: s1
    op: create_folder
    path: Work/gamma
  - id: s2
    op: create_file
    path: Work/gamma/plan.md
    content: plan
  - id: s3
    op: create_file
    path: Work/gamma/notes.md
    content: notes
    alternative: s3b
  - id: s4
    op: create_file
    path: Work/gamma/summary.md
    content: summary
  - id: s5
    op: create_file
    path: Work/gamma/index.md
    content: index
  - id: s3b
    op: create_file
    path: Work/gamma/notes-fallback.md
    content: notes
---
File the gamma workstream.
"#;

#[test]
fn exhausted_cascade_rolls_back_to_the_snapshot() {
    let dir = tempdir().expect("tempdir");
    let runner = Arc::new(BrokenRunner {
        broken: ids(&["s3", "s3b"]),
    });
    let processor = processor_with(dir.path(), runner, |_| {});
    let path = dir.path().join("Needs_Action/TASK-gamma.md");
    fs::write(&path, ALTERNATIVE_TASK).expect("write task");

    Scheduler::new(processor.clone()).drain().expect("drain");

    let task = processor.tasks().load(&path).expect("load");
    assert_eq!(task.status, TaskStatus::FailedRollback);
    assert!(task.rollback_ref.is_some());

    let log = entries(&processor, "TASK-gamma.md");
    let recovery: Vec<(AuditOp, AuditOutcome)> = log
        .iter()
        .filter(|entry| {
            matches!(
                entry.op,
                AuditOp::SelfHealRetry | AuditOp::SelfHealAlternative | AuditOp::SelfHealPartial
            )
        })
        .map(|entry| (entry.op, entry.outcome))
        .collect();
    assert_eq!(
        recovery,
        vec![
            (AuditOp::SelfHealRetry, AuditOutcome::Failed),
            (AuditOp::SelfHealAlternative, AuditOutcome::Failed),
            (AuditOp::SelfHealPartial, AuditOutcome::Failed),
        ]
    );
    assert_eq!(count(&log, AuditOp::RollbackRestored), 1);
    assert!(!dir.path().join("Work/gamma/plan.md").exists());
    assert!(!dir.path().join("Work/gamma").exists());
}

#[test]
fn failure_on_the_last_step_keeps_partial_work() {
    let dir = tempdir().expect("tempdir");
    let runner = Arc::new(BrokenRunner {
        broken: ids(&["s3"]),
    });
    let processor = processor_with(dir.path(), runner, |_| {});
    let path = dir.path().join("Needs_Action/TASK-delta.md");
    fs::write(
        &path,
        "---\ntype: filing\nsteps:\n  - id: s1\n    op: create_folder\n    path: Work/delta\n  - id: s2\n    op: create_file\n    path: Work/delta/plan.md\n    content: plan\n  - id: s3\n    op: create_file\n    path: Work/delta/extra.md\n    content: extra\n---\nFile delta.\n",
    )
    .expect("write task");

    Scheduler::new(processor.clone()).drain().expect("drain");

    let task = processor.tasks().load(&path).expect("load");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(dir.path().join("Work/delta/plan.md").is_file());

    let log = entries(&processor, "TASK-delta.md");
    let partial = log
        .iter()
        .find(|entry| entry.op == AuditOp::SelfHealPartial)
        .expect("partial attempt");
    assert_eq!(partial.outcome, AuditOutcome::Success);
    assert_eq!(count(&log, AuditOp::RollbackRestored), 0);
}

#[test]
fn disabled_self_healing_rolls_back_immediately() {
    let dir = tempdir().expect("tempdir");
    let runner = Arc::new(BrokenRunner {
        broken: ids(&["s2"]),
    });
    let processor = processor_with(dir.path(), runner, |settings| {
        settings.features.self_healing = false;
    });
    let path = dir.path().join("Needs_Action/TASK-eps.md");
    fs::write(
        &path,
        "---\ntype: filing\nsteps:\n  - id: s1\n    op: create_file\n    path: eps.md\n    content: one\n  - id: s2\n    op: create_file\n    path: eps-two.md\n    content: two\n---\nFile eps.\n",
    )
    .expect("write task");

    Scheduler::new(processor.clone()).drain().expect("drain");

    let task = processor.tasks().load(&path).expect("load");
    assert_eq!(task.status, TaskStatus::FailedRollback);
    assert!(!dir.path().join("eps.md").exists());
    let log = entries(&processor, "TASK-eps.md");
    assert_eq!(count(&log, AuditOp::SelfHealRetry), 0);
    assert_eq!(count(&log, AuditOp::RollbackRestored), 1);
}
