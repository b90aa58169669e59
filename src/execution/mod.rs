pub mod graph;
pub mod operations;

pub use graph::{ExecutionGraph, GraphError};
pub use operations::{preflight, StepContext, StepError, StepRunner, VaultOperations};

use crate::audit::{AuditEntry, AuditError, AuditLog, AuditOp, AuditOutcome};
use crate::recovery::{CascadeOutcome, RecoveryAttempt, RecoveryContext, SelfHealingCascade};
use crate::shared::ids::StepId;
use crate::shared::time::now_utc;
use crate::shared::vault_access::VaultScope;
use crate::task::{Step, StepStatus, Task, TaskError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("invalid step graph: {0}")]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("failed to checkpoint task: {0}")]
    Checkpoint(#[from] TaskError),
}

/// Runs a single step with the allowlist and confinement checks applied.
pub trait StepExecutor {
    fn execute_step(&self, task: &Task, step: &Step, attempt: u32) -> Result<String, StepError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub step_id: StepId,
    pub operation: String,
    pub success: bool,
    pub detail: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Every main-flow step completed.
    Completed,
    /// A step failed, partial recovery kept earlier work; the task halts.
    PartialHalt,
    /// A step failed and was not recovered; the caller rolls back.
    Failed,
    /// The cancellation flag was raised between steps.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub steps_executed: usize,
    pub steps_total: usize,
    pub step_results: Vec<StepResult>,
    pub outcome: ExecutionOutcome,
    pub recovery_attempts: Vec<RecoveryAttempt>,
    pub failed_step: Option<StepId>,
    pub error: Option<String>,
}

pub struct ExecutionEngine<'a> {
    scope: &'a VaultScope,
    runner: &'a dyn StepRunner,
    audit: &'a AuditLog,
    cascade: Option<&'a SelfHealingCascade>,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(scope: &'a VaultScope, runner: &'a dyn StepRunner, audit: &'a AuditLog) -> Self {
        Self {
            scope,
            runner,
            audit,
            cascade: None,
            cancel: None,
        }
    }

    pub fn with_cascade(mut self, cascade: Option<&'a SelfHealingCascade>) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Executes main-flow steps in dependency order, halting on the first
    /// failure the cascade cannot recover. `checkpoint` is called after every
    /// step so progress survives a crash.
    pub fn execute(
        &self,
        task: &mut Task,
        checkpoint: &mut dyn FnMut(&Task) -> Result<(), TaskError>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let graph = ExecutionGraph::from_task(task)?;
        let order = graph.execution_order();
        let mut result = ExecutionResult {
            steps_executed: 0,
            steps_total: order.len(),
            step_results: Vec::new(),
            outcome: ExecutionOutcome::Completed,
            recovery_attempts: Vec::new(),
            failed_step: None,
            error: None,
        };

        for (position, step_id) in order.iter().enumerate() {
            let Some(step) = task.find_step(step_id).cloned() else {
                continue;
            };
            if step.status == StepStatus::Completed {
                result.steps_executed += 1;
                continue;
            }
            if self.cancelled() {
                result.outcome = ExecutionOutcome::Cancelled;
                result.error = Some("execution cancelled".to_string());
                return Ok(result);
            }

            let started = Instant::now();
            let outcome = self.execute_step(task, &step, 1);
            let duration_ms = started.elapsed().as_millis() as u64;
            let (success, detail) = match &outcome {
                Ok(detail) => (true, detail.clone()),
                Err(err) => (false, err.to_string()),
            };
            self.audit.append(
                &AuditEntry::new(
                    AuditOp::StepExecuted,
                    task.id.as_str(),
                    task.status.logical_folder(),
                    if success {
                        AuditOutcome::Success
                    } else {
                        AuditOutcome::Failed
                    },
                    format!(
                        "step {}: id={} op={} success={success} detail={detail}",
                        position + 1,
                        step.id,
                        step.op
                    ),
                )
                .with_decision_source("execution_engine"),
            )?;
            task.append_log(
                now_utc(),
                format!(
                    "step {} op={} outcome={} detail={detail}",
                    step.id,
                    step.op,
                    if success { "success" } else { "failed" }
                ),
            );
            result.step_results.push(StepResult {
                step_id: step.id.clone(),
                operation: step.op.to_string(),
                success,
                detail: detail.clone(),
                duration_ms,
            });

            if success {
                set_step_status(task, &step.id, StepStatus::Completed);
                result.steps_executed += 1;
                checkpoint(task)?;
                continue;
            }

            set_step_status(task, &step.id, StepStatus::Failed);
            checkpoint(task)?;
            result.failed_step = Some(step.id.clone());
            result.error = Some(detail.clone());

            let Some(cascade) = self.cascade else {
                result.outcome = ExecutionOutcome::Failed;
                return Ok(result);
            };
            let mut ctx = RecoveryContext {
                task: &mut *task,
                graph: &graph,
                failed_step: step.id.clone(),
                error: detail,
                executor: self,
            };
            let report = cascade.recover(&mut ctx, self.audit)?;
            let last_error = ctx.error.clone();
            result.recovery_attempts.extend(report.attempts);
            checkpoint(task)?;

            match report.outcome {
                CascadeOutcome::Recovered(_) => {
                    result.steps_executed += 1;
                    result.failed_step = None;
                    result.error = None;
                }
                CascadeOutcome::Partial => {
                    result.outcome = ExecutionOutcome::PartialHalt;
                    return Ok(result);
                }
                CascadeOutcome::Exhausted => {
                    result.outcome = ExecutionOutcome::Failed;
                    result.error = Some(last_error);
                    return Ok(result);
                }
            }
        }

        Ok(result)
    }
}

impl StepExecutor for ExecutionEngine<'_> {
    fn execute_step(&self, task: &Task, step: &Step, attempt: u32) -> Result<String, StepError> {
        let resolved = preflight(self.scope, task, step)?;
        let ctx = StepContext {
            vault_root: self.scope.root(),
            task,
            resolved: &resolved,
            attempt,
        };
        self.runner.run(&ctx, step)
    }
}

fn set_step_status(task: &mut Task, id: &StepId, status: StepStatus) {
    if let Some(step) = task.find_step_mut(id) {
        step.status = status;
    }
}
