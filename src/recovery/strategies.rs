use super::{RecoveryContext, RecoveryStrategy, RecoveryStrategyKind, StrategyVerdict};
use crate::task::StepStatus;

/// Re-runs the failed step once.
pub struct RetryStrategy;

impl RecoveryStrategy for RetryStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::Retry
    }

    fn attempt(&self, ctx: &mut RecoveryContext<'_>, attempt_number: u32) -> StrategyVerdict {
        let Some(step) = ctx.task.find_step(&ctx.failed_step).cloned() else {
            return StrategyVerdict::Failed(format!("step `{}` vanished", ctx.failed_step));
        };
        match ctx
            .executor
            .execute_step(ctx.task, &step, attempt_number + 1)
        {
            Ok(detail) => {
                if let Some(step) = ctx.task.find_step_mut(&ctx.failed_step) {
                    step.status = StepStatus::Completed;
                }
                StrategyVerdict::Recovered(detail)
            }
            Err(err) => StrategyVerdict::Failed(err.to_string()),
        }
    }
}

/// Runs the standby step named by the failed step's `alternative`.
pub struct AlternativeStrategy;

impl RecoveryStrategy for AlternativeStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::Alternative
    }

    fn attempt(&self, ctx: &mut RecoveryContext<'_>, attempt_number: u32) -> StrategyVerdict {
        let Some(alternative_id) = ctx
            .task
            .find_step(&ctx.failed_step)
            .and_then(|step| step.alternative.clone())
        else {
            return StrategyVerdict::NotApplicable;
        };
        let Some(alternative) = ctx.task.find_step(&alternative_id).cloned() else {
            return StrategyVerdict::Failed(format!(
                "alternative step `{alternative_id}` is not declared"
            ));
        };
        match ctx
            .executor
            .execute_step(ctx.task, &alternative, attempt_number)
        {
            Ok(detail) => {
                if let Some(step) = ctx.task.find_step_mut(&alternative_id) {
                    step.status = StepStatus::Completed;
                }
                if let Some(step) = ctx.task.find_step_mut(&ctx.failed_step) {
                    step.status = StepStatus::Completed;
                }
                StrategyVerdict::Recovered(format!("via {alternative_id}: {detail}"))
            }
            Err(err) => {
                if let Some(step) = ctx.task.find_step_mut(&alternative_id) {
                    step.status = StepStatus::Failed;
                }
                StrategyVerdict::Failed(format!("alternative {alternative_id}: {err}"))
            }
        }
    }
}

/// Keeps completed work when nothing still to run depends on the failed step.
pub struct PartialStrategy;

impl RecoveryStrategy for PartialStrategy {
    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::Partial
    }

    fn attempt(&self, ctx: &mut RecoveryContext<'_>, _attempt_number: u32) -> StrategyVerdict {
        if ctx.task.completed_main_steps() == 0 {
            return StrategyVerdict::Failed("no completed steps to preserve".to_string());
        }
        let blocked = ctx.graph.transitive_dependents(&ctx.failed_step);
        if !blocked.is_empty() {
            let names: Vec<String> = blocked.iter().map(|id| id.to_string()).collect();
            return StrategyVerdict::Failed(format!(
                "steps {} depend on failed step {}",
                names.join(","),
                ctx.failed_step
            ));
        }
        if let Some(step) = ctx.task.find_step_mut(&ctx.failed_step) {
            step.status = StepStatus::Failed;
        }
        StrategyVerdict::PartialAccepted(format!(
            "kept {} completed steps; {} needs manual intervention",
            ctx.task.completed_main_steps(),
            ctx.failed_step
        ))
    }
}
