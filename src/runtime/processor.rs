use super::lease::{Lease, LeaseHolder};
use super::{bootstrap_vault, RuntimeError, VaultPaths};
use crate::audit::{AuditEntry, AuditLog, AuditOp, AuditOutcome};
use crate::config::Settings;
use crate::execution::{ExecutionEngine, ExecutionOutcome, ExecutionResult, StepRunner, VaultOperations};
use crate::gates::{auto_execution_allowed, Disposition, GatePipeline, GateReport};
use crate::learning::{ExecutionRecord, LearningStore, MaintenanceReport, RecordOutcome};
use crate::recovery::{AttemptOutcome, RecoveryStrategyKind, SelfHealingCascade};
use crate::rollback::{RollbackContext, RollbackManager};
use crate::shared::ids::TaskId;
use crate::shared::time::{elapsed_secs, now_utc};
use crate::sla::{predict_for_task, SlaCheck, SlaPrediction, SlaTracker};
use crate::task::{StepStatus, Task, TaskStatus, TaskStore};
use chrono::{DateTime, Utc};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// What one dispatch did to its task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRun {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub execution: Option<ExecutionResult>,
    /// `None` when the worker found the task no longer pending.
    pub settled_by: Option<LeaseHolder>,
    pub sla: Option<SlaCheck>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MaintenanceSummary {
    pub snapshots_purged: Vec<String>,
    pub learning: MaintenanceReport,
}

/// Everything a worker needs to classify and run one task. Cheap to clone;
/// each worker thread gets its own copy.
#[derive(Clone)]
pub struct TaskProcessor {
    settings: Arc<Settings>,
    paths: VaultPaths,
    audit: AuditLog,
    tasks: TaskStore,
    rollback: RollbackManager,
    learning: LearningStore,
    tracker: SlaTracker,
    runner: Arc<dyn StepRunner>,
}

impl TaskProcessor {
    pub fn new(settings: Settings) -> Self {
        Self::with_runner(settings, Arc::new(VaultOperations))
    }

    pub fn with_runner(settings: Settings, runner: Arc<dyn StepRunner>) -> Self {
        let paths = settings.paths();
        let audit = AuditLog::new(paths.audit_log_path());
        let tasks = TaskStore::new(paths.clone(), audit.clone());
        let rollback = RollbackManager::new(
            tasks.clone(),
            audit.clone(),
            settings.rollback.retention_days,
        );
        let learning = LearningStore::new(
            paths.learning_data_dir(),
            settings.learning.window_days,
            audit.clone(),
        );
        let tracker = SlaTracker::new(audit.clone(), settings.sla.clone());
        Self {
            settings: Arc::new(settings),
            paths,
            audit,
            tasks,
            rollback,
            learning,
            tracker,
            runner,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn learning(&self) -> &LearningStore {
        &self.learning
    }

    pub fn rollback(&self) -> &RollbackManager {
        &self.rollback
    }

    pub fn tracker(&self) -> &SlaTracker {
        &self.tracker
    }

    pub fn bootstrap(&self) -> Result<(), RuntimeError> {
        bootstrap_vault(&self.paths)
    }

    /// Runs the gate pipeline on a pending task, records the classification
    /// and moves rejected tasks to `manual_review` or `blocked`.
    pub fn classify_task(
        &self,
        task: &mut Task,
        now: DateTime<Utc>,
    ) -> Result<GateReport, RuntimeError> {
        let pipeline = GatePipeline::new(
            &self.settings,
            self.paths.step_scope(),
            self.paths.rollback_archive_dir(),
            Some(&self.learning),
            &self.audit,
        );
        let report = pipeline.evaluate(task)?;

        task.set_classification(report.classification, report.gate_results.clone(), now);
        task.append_log(
            now,
            format!(
                "classified {} disposition={}",
                report.classification,
                report.disposition.as_str()
            ),
        );
        self.tasks.persist(task)?;

        let gates = report
            .gate_results
            .iter()
            .map(|(gate, outcome)| format!("{gate}={outcome}"))
            .collect::<Vec<_>>()
            .join(",");
        let outcome = match report.disposition {
            Disposition::AutoEligible | Disposition::NotEligible => AuditOutcome::Success,
            Disposition::ManualReview | Disposition::Blocked => AuditOutcome::Flagged,
        };
        self.audit.append(
            &AuditEntry::new(
                AuditOp::TaskClassified,
                task.id.as_str(),
                task.status.logical_folder(),
                outcome,
                format!(
                    "complexity:{} disposition={} gates={gates}",
                    report.classification,
                    report.disposition.as_str()
                ),
            )
            .with_decision_source("gate_pipeline"),
        )?;

        if let Some(next) = report.disposition.target_status() {
            let reason = report
                .reason
                .clone()
                .unwrap_or_else(|| report.disposition.as_str().to_string());
            self.tasks.transition(task, next, now, &reason)?;
        }
        Ok(report)
    }

    /// A pending, classified task whose class may currently run unattended.
    pub fn is_dispatchable(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending
            && task.is_classified()
            && auto_execution_allowed(&self.settings, task.classification)
    }

    /// Snapshot, execute and finalize one task. Every task-file write goes
    /// through `lease`, so a timeout that settles first wins and later
    /// writes from this worker are dropped.
    pub fn execute_task(
        &self,
        task: Task,
        lease: &Lease,
        cancel: &AtomicBool,
    ) -> Result<TaskRun, RuntimeError> {
        let mut task = self.tasks.reload(&task)?;
        if task.status != TaskStatus::Pending {
            return Ok(self.untouched(&task, lease.holder()));
        }

        let now = now_utc();
        match lease.with_open(|| self.rollback.create_snapshot(&mut task, now)) {
            None => return Ok(self.untouched(&task, lease.holder())),
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                let reason = format!("snapshot_failed: {err}");
                let settled = lease.settle(LeaseHolder::Worker, || -> Result<(), RuntimeError> {
                    self.audit.append(
                        &AuditEntry::new(
                            AuditOp::Error,
                            task.id.as_str(),
                            task.status.logical_folder(),
                            AuditOutcome::Failed,
                            reason.clone(),
                        )
                        .with_decision_source("rollback_manager"),
                    )?;
                    self.tasks
                        .transition(&mut task, TaskStatus::Blocked, now_utc(), &reason)?;
                    Ok(())
                });
                if let Some(result) = settled {
                    result?;
                }
                return Ok(self.untouched(&task, lease.holder()));
            }
        }

        let started = lease.with_open(|| {
            self.tasks
                .transition(&mut task, TaskStatus::InProgress, now_utc(), "execution started")
        });
        match started {
            None => return Ok(self.untouched(&task, lease.holder())),
            Some(result) => result?,
        }

        let cascade = self
            .settings
            .features
            .self_healing
            .then(|| SelfHealingCascade::standard(self.settings.recovery.max_attempts));
        let scope = self.paths.step_scope();
        let engine = ExecutionEngine::new(&scope, &*self.runner, &self.audit)
            .with_cascade(cascade.as_ref())
            .with_cancel_flag(cancel);
        let tasks = &self.tasks;
        let mut checkpoint = |current: &Task| lease.with_open(|| tasks.persist(current)).unwrap_or(Ok(()));
        let executed = engine.execute(&mut task, &mut checkpoint);

        let result = match executed {
            Ok(result) => result,
            Err(err) => {
                let reason = format!("execution error: {err}");
                if let Some(settled) = lease.settle(LeaseHolder::Worker, || {
                    self.fail_in_progress(&mut task, &reason)
                }) {
                    settled?;
                    self.record_outcome(&task, None)?;
                }
                return Err(err.into());
            }
        };

        let finalized = lease.settle(LeaseHolder::Worker, || self.finalize(&mut task, &result));
        let Some(finalized) = finalized else {
            // Settled elsewhere (timeout); the task file already says so.
            return Ok(TaskRun {
                task_id: task.id.clone(),
                status: TaskStatus::Failed,
                execution: Some(result),
                settled_by: lease.holder(),
                sla: None,
            });
        };
        finalized?;
        let sla = self.record_outcome(&task, Some(&result))?;
        Ok(TaskRun {
            task_id: task.id.clone(),
            status: task.status,
            execution: Some(result),
            settled_by: Some(LeaseHolder::Worker),
            sla,
        })
    }

    fn finalize(&self, task: &mut Task, result: &ExecutionResult) -> Result<(), RuntimeError> {
        let now = now_utc();
        let failed_step = result
            .failed_step
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        match result.outcome {
            ExecutionOutcome::Completed => {
                self.tasks
                    .transition(task, TaskStatus::Done, now, "all steps completed")?;
            }
            ExecutionOutcome::PartialHalt => {
                self.tasks.transition(
                    task,
                    TaskStatus::Failed,
                    now,
                    &format!("partial completion kept; step {failed_step} needs manual intervention"),
                )?;
            }
            ExecutionOutcome::Failed => {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "step failed".to_string());
                let context = RollbackContext {
                    failed_step: result.failed_step.clone(),
                    error: error.clone(),
                };
                if let Err(err) = self.rollback.restore(task, context, now) {
                    self.audit.append(
                        &AuditEntry::new(
                            AuditOp::Error,
                            task.id.as_str(),
                            task.status.logical_folder(),
                            AuditOutcome::Failed,
                            format!("rollback failed: {err}"),
                        )
                        .with_decision_source("rollback_manager"),
                    )?;
                    if task.status == TaskStatus::InProgress {
                        self.tasks.transition(
                            task,
                            TaskStatus::Failed,
                            now,
                            &format!("{error}; rollback failed: {err}"),
                        )?;
                    }
                }
            }
            ExecutionOutcome::Cancelled => {
                self.fail_in_progress(task, "execution cancelled")?;
            }
        }
        Ok(())
    }

    fn fail_in_progress(&self, task: &mut Task, reason: &str) -> Result<(), RuntimeError> {
        if task.status == TaskStatus::InProgress {
            self.tasks
                .transition(task, TaskStatus::Failed, now_utc(), reason)?;
        }
        Ok(())
    }

    /// Terminal bookkeeping: `task_executed`, SLA breach check and the
    /// learning record.
    fn record_outcome(
        &self,
        task: &Task,
        result: Option<&ExecutionResult>,
    ) -> Result<Option<SlaCheck>, RuntimeError> {
        let outcome = match task.status {
            TaskStatus::Done => RecordOutcome::Done,
            TaskStatus::FailedRollback => RecordOutcome::FailedRollback,
            TaskStatus::Failed => RecordOutcome::Failed,
            _ => return Ok(None),
        };
        let steps_total = result
            .map(|r| r.steps_total)
            .unwrap_or_else(|| task.main_flow_steps().len());
        let steps_executed = result
            .map(|r| r.steps_executed)
            .unwrap_or_else(|| task.completed_main_steps());
        let attempts = result.map(|r| r.recovery_attempts.as_slice()).unwrap_or(&[]);
        let duration_secs = match (task.started_at, task.completed_at) {
            (Some(start), Some(end)) => elapsed_secs(start, end),
            _ => 0.0,
        };

        self.audit.append(
            &AuditEntry::new(
                AuditOp::TaskExecuted,
                task.id.as_str(),
                task.status.logical_folder(),
                if outcome.is_success() {
                    AuditOutcome::Success
                } else {
                    AuditOutcome::Failed
                },
                format!(
                    "complexity:{} status={} steps={steps_executed}/{steps_total} recovery_attempts={} duration_secs={duration_secs:.1}",
                    task.classification,
                    task.status,
                    attempts.len()
                ),
            )
            .with_decision_source("execution_engine"),
        )?;

        let sla = self.tracker.check(task)?;
        let retries = attempts
            .iter()
            .filter(|a| a.strategy == RecoveryStrategyKind::Retry);
        let retry_attempts = retries.clone().count() as u32;
        let retry_successes = retries
            .filter(|a| a.outcome == AttemptOutcome::Success)
            .count() as u32;
        self.learning.record(&ExecutionRecord {
            task_ref: task.id.to_string(),
            task_type: task.task_type().to_string(),
            outcome,
            duration_secs,
            steps_total,
            steps_executed,
            retry_attempts,
            retry_successes,
            sla_breached: sla.is_some_and(|check| check.breached),
            recorded_at: now_utc(),
        })?;
        Ok(sla)
    }

    /// Settles a dispatch whose deadline passed: `in_progress` becomes
    /// `failed`, a task that never started becomes `blocked`.
    pub fn expire(
        &self,
        task_id: &TaskId,
        lease: &Lease,
        timeout: Duration,
    ) -> Result<Option<TaskStatus>, RuntimeError> {
        let reason = format!("timeout after {:.1}s", timeout.as_secs_f64());
        self.abandon(task_id, lease, LeaseHolder::Timeout, AuditOp::TaskTimeout, &reason)
    }

    /// Settles a dispatch whose worker returned an error or panicked.
    pub fn abandon_after_error(
        &self,
        task_id: &TaskId,
        lease: &Lease,
        error: &str,
    ) -> Result<Option<TaskStatus>, RuntimeError> {
        let reason = format!("worker error: {error}");
        self.abandon(task_id, lease, LeaseHolder::Scheduler, AuditOp::Error, &reason)
    }

    fn abandon(
        &self,
        task_id: &TaskId,
        lease: &Lease,
        holder: LeaseHolder,
        op: AuditOp,
        reason: &str,
    ) -> Result<Option<TaskStatus>, RuntimeError> {
        let settled = lease.settle(holder, || -> Result<Option<TaskStatus>, RuntimeError> {
            let Some(mut task) = self.tasks.find(task_id)? else {
                return Ok(None);
            };
            let next = match task.status {
                TaskStatus::InProgress => TaskStatus::Failed,
                TaskStatus::Pending => TaskStatus::Blocked,
                _ => return Ok(None),
            };
            self.tasks.transition(&mut task, next, now_utc(), reason)?;
            self.audit.append(
                &AuditEntry::new(op, task.id.as_str(), "scheduler", AuditOutcome::Flagged, reason)
                    .with_decision_source("scheduler"),
            )?;
            if next == TaskStatus::Failed {
                self.record_outcome(&task, None)?;
            }
            Ok(Some(next))
        });
        settled.unwrap_or(Ok(None))
    }

    /// Breach prediction for a running task, recorded as `sla_prediction`.
    pub fn predict_sla(&self, task: &Task, now: DateTime<Utc>) -> Result<SlaPrediction, RuntimeError> {
        let history = self.learning.duration_history(task.task_type());
        let prediction = predict_for_task(&self.settings.sla, task, history, now);
        let flagged = prediction.probability > self.settings.sla.prediction_threshold;
        self.audit.append(
            &AuditEntry::new(
                AuditOp::SlaPrediction,
                task.id.as_str(),
                task.status.logical_folder(),
                if flagged {
                    AuditOutcome::Flagged
                } else {
                    AuditOutcome::Success
                },
                format!(
                    "probability={:.3} predicted_secs={} recommendation={} model={}",
                    prediction.probability,
                    prediction
                        .predicted_duration_secs
                        .map(|secs| format!("{secs:.1}"))
                        .unwrap_or_else(|| "-".to_string()),
                    prediction.recommendation,
                    prediction.model.as_str()
                ),
            )
            .with_decision_source("sla_predictor"),
        )?;
        Ok(prediction)
    }

    pub fn warn_sla(&self, task: &Task, prediction: &SlaPrediction) -> Result<(), RuntimeError> {
        let completed = task
            .main_flow_steps()
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .count();
        self.audit.append(
            &AuditEntry::new(
                AuditOp::SlaEarlyWarning,
                task.id.as_str(),
                task.status.logical_folder(),
                AuditOutcome::Flagged,
                format!(
                    "probability={:.3} threshold={:.2} steps_completed={completed}/{} recommendation={}",
                    prediction.probability,
                    self.settings.sla.prediction_threshold,
                    task.main_flow_steps().len(),
                    prediction.recommendation
                ),
            )
            .with_decision_source("sla_predictor"),
        )?;
        Ok(())
    }

    /// Snapshot retention and learning-data window housekeeping.
    pub fn maintenance(&self, now: DateTime<Utc>) -> Result<MaintenanceSummary, RuntimeError> {
        let snapshots_purged = self.rollback.purge_expired(now)?;
        let learning = self.learning.maintenance(now)?;
        Ok(MaintenanceSummary {
            snapshots_purged,
            learning,
        })
    }

    fn untouched(&self, task: &Task, settled_by: Option<LeaseHolder>) -> TaskRun {
        TaskRun {
            task_id: task.id.clone(),
            status: task.status,
            execution: None,
            settled_by,
            sla: None,
        }
    }
}
