//! Bounded self-healing for a failed step.
//!
//! Strategies run in a fixed order (retry, alternative, partial), each at
//! most once per failure episode, and the episode never exceeds the
//! configured attempt cap. Every attempt is written to the audit log.

pub mod strategies;

pub use strategies::{AlternativeStrategy, PartialStrategy, RetryStrategy};

use crate::audit::{AuditEntry, AuditError, AuditLog, AuditOp, AuditOutcome};
use crate::execution::graph::ExecutionGraph;
use crate::execution::StepExecutor;
use crate::shared::ids::StepId;
use crate::task::Task;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategyKind {
    Retry,
    Alternative,
    Partial,
}

impl RecoveryStrategyKind {
    pub fn audit_op(self) -> AuditOp {
        match self {
            Self::Retry => AuditOp::SelfHealRetry,
            Self::Alternative => AuditOp::SelfHealAlternative,
            Self::Partial => AuditOp::SelfHealPartial,
        }
    }
}

impl std::fmt::Display for RecoveryStrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Alternative => write!(f, "alternative"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub task_ref: String,
    pub step_id: StepId,
    pub attempt_number: u32,
    pub strategy: RecoveryStrategyKind,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    pub error_detail: Option<String>,
}

impl RecoveryAttempt {
    fn detail(&self) -> String {
        let outcome = match self.outcome {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failed => "failed",
        };
        let mut detail = format!(
            "step={} strategy={} attempt={} outcome={outcome} duration_ms={}",
            self.step_id, self.strategy, self.attempt_number, self.duration_ms
        );
        if let Some(error) = &self.error_detail {
            detail.push_str(&format!(" error={error}"));
        }
        detail
    }
}

/// What a single strategy concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyVerdict {
    /// The step's work is done; execution may continue with the next step.
    Recovered(String),
    /// Completed work is kept; the task halts awaiting manual intervention.
    PartialAccepted(String),
    Failed(String),
    /// The strategy has nothing to try; it consumes no attempt.
    NotApplicable,
}

pub struct RecoveryContext<'a> {
    pub task: &'a mut Task,
    pub graph: &'a ExecutionGraph,
    pub failed_step: StepId,
    pub error: String,
    pub executor: &'a dyn StepExecutor,
}

pub trait RecoveryStrategy: Send + Sync {
    fn kind(&self) -> RecoveryStrategyKind;
    fn attempt(&self, ctx: &mut RecoveryContext<'_>, attempt_number: u32) -> StrategyVerdict;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeOutcome {
    Recovered(RecoveryStrategyKind),
    Partial,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeReport {
    pub outcome: CascadeOutcome,
    pub attempts: Vec<RecoveryAttempt>,
}

pub struct SelfHealingCascade {
    strategies: Vec<Box<dyn RecoveryStrategy>>,
    max_attempts: u32,
}

impl SelfHealingCascade {
    pub fn standard(max_attempts: u32) -> Self {
        Self::with_strategies(
            vec![
                Box::new(RetryStrategy),
                Box::new(AlternativeStrategy),
                Box::new(PartialStrategy),
            ],
            max_attempts,
        )
    }

    pub fn with_strategies(strategies: Vec<Box<dyn RecoveryStrategy>>, max_attempts: u32) -> Self {
        Self {
            strategies,
            max_attempts,
        }
    }

    pub fn recover(
        &self,
        ctx: &mut RecoveryContext<'_>,
        audit: &AuditLog,
    ) -> Result<CascadeReport, AuditError> {
        let mut attempts = Vec::new();
        let mut used = 0u32;

        for strategy in &self.strategies {
            if used >= self.max_attempts {
                break;
            }
            let started = Instant::now();
            let verdict = strategy.attempt(ctx, used + 1);
            if verdict == StrategyVerdict::NotApplicable {
                continue;
            }
            used += 1;

            let (outcome, error_detail) = match &verdict {
                StrategyVerdict::Recovered(_) | StrategyVerdict::PartialAccepted(_) => {
                    (AttemptOutcome::Success, None)
                }
                StrategyVerdict::Failed(error) => (AttemptOutcome::Failed, Some(error.clone())),
                StrategyVerdict::NotApplicable => continue,
            };
            let attempt = RecoveryAttempt {
                task_ref: ctx.task.id.to_string(),
                step_id: ctx.failed_step.clone(),
                attempt_number: used,
                strategy: strategy.kind(),
                outcome,
                duration_ms: started.elapsed().as_millis() as u64,
                error_detail,
            };
            let audit_outcome = match outcome {
                AttemptOutcome::Success => AuditOutcome::Success,
                AttemptOutcome::Failed => AuditOutcome::Failed,
            };
            audit.append(
                &AuditEntry::new(
                    strategy.kind().audit_op(),
                    ctx.task.id.as_str(),
                    ctx.task.status.logical_folder(),
                    audit_outcome,
                    attempt.detail(),
                )
                .with_decision_source("self_healing"),
            )?;
            ctx.task.append_log(
                crate::shared::time::now_utc(),
                format!("recovery {}", attempt.detail()),
            );
            attempts.push(attempt);

            match verdict {
                StrategyVerdict::Recovered(_) => {
                    return Ok(CascadeReport {
                        outcome: CascadeOutcome::Recovered(strategy.kind()),
                        attempts,
                    })
                }
                StrategyVerdict::PartialAccepted(_) => {
                    return Ok(CascadeReport {
                        outcome: CascadeOutcome::Partial,
                        attempts,
                    })
                }
                StrategyVerdict::Failed(error) => ctx.error = error,
                StrategyVerdict::NotApplicable => {}
            }
        }

        Ok(CascadeReport {
            outcome: CascadeOutcome::Exhausted,
            attempts,
        })
    }
}
