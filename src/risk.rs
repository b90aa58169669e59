//! Composite risk scoring and queue ordering for waiting tasks.

use crate::audit::{AuditEntry, AuditError, AuditLog, AuditOp, AuditOutcome};
use crate::config::{RiskWeights, Settings};
use crate::learning::LearningStore;
use crate::sla::predict_for_task;
use crate::task::{Classification, Task};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskScore {
    pub sla_risk: f64,
    pub complexity: f64,
    pub impact: f64,
    pub failure_rate: f64,
    pub composite: f64,
}

impl RiskScore {
    /// Weighted sum of the clamped components; stays in [0, 1] for weights
    /// summing to 1.
    pub fn from_components(
        sla_risk: f64,
        complexity: f64,
        impact: f64,
        failure_rate: f64,
        weights: &RiskWeights,
    ) -> Self {
        let sla_risk = unit(sla_risk);
        let complexity = unit(complexity);
        let impact = unit(impact);
        let failure_rate = unit(failure_rate);
        let composite = sla_risk * weights.sla
            + complexity * weights.complexity
            + impact * weights.impact
            + failure_rate * weights.failure_rate;
        Self {
            sla_risk,
            complexity,
            impact,
            failure_rate,
            composite: unit(composite),
        }
    }

    fn detail(&self) -> String {
        format!(
            "composite={:.4} sla={:.4} complexity={:.2} impact={:.2} failure_rate={:.4}",
            self.composite, self.sla_risk, self.complexity, self.impact, self.failure_rate
        )
    }
}

fn unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn complexity_component(classification: Classification) -> f64 {
    match classification {
        Classification::Simple => 0.33,
        Classification::Complex => 0.67,
        Classification::ManualReview => 1.0,
        Classification::Unclassified => 0.33,
    }
}

/// Complexity of a task, using its step-count class until the gates run.
pub fn task_complexity(task: &Task) -> f64 {
    match task.classification {
        Classification::Unclassified => complexity_component(task.nominal_classification()),
        other => complexity_component(other),
    }
}

#[derive(Debug, Clone)]
pub struct RankedTask {
    pub task: Task,
    /// `None` when risk scoring is disabled.
    pub score: Option<RiskScore>,
}

/// Static order: priority, then creation time (missing last), then id.
pub fn baseline_order(a: &Task, b: &Task) -> Ordering {
    a.priority
        .rank()
        .cmp(&b.priority.rank())
        .then_with(|| match (a.created_at, b.created_at) {
            (Some(left), Some(right)) => left.cmp(&right),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

pub struct RiskEngine<'a> {
    settings: &'a Settings,
    learning: Option<&'a LearningStore>,
    audit: &'a AuditLog,
}

impl<'a> RiskEngine<'a> {
    pub fn new(settings: &'a Settings, learning: Option<&'a LearningStore>, audit: &'a AuditLog) -> Self {
        Self {
            settings,
            learning,
            audit,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.features.risk_scoring
    }

    pub fn compute_score(&self, task: &Task, now: DateTime<Utc>) -> RiskScore {
        let sla_risk = match (self.settings.features.predictive_sla, self.learning) {
            (true, Some(learning)) => {
                let history = learning.duration_history(task.task_type());
                predict_for_task(&self.settings.sla, task, history, now).probability
            }
            _ => 0.0,
        };
        let failure_rate = self
            .learning
            .map(|learning| learning.failure_rate(task.task_type()))
            .unwrap_or(0.0);
        RiskScore::from_components(
            sla_risk,
            task_complexity(task),
            task.priority.impact(),
            failure_rate,
            &self.settings.risk.weights,
        )
    }

    /// Orders tasks for dispatch. With scoring enabled: composite descending,
    /// ties by the baseline order; otherwise the baseline order alone.
    pub fn reorder(&self, tasks: Vec<Task>, now: DateTime<Utc>) -> Result<Vec<RankedTask>, AuditError> {
        let mut baseline = tasks;
        baseline.sort_by(baseline_order);
        if !self.enabled() {
            return Ok(baseline
                .into_iter()
                .map(|task| RankedTask { task, score: None })
                .collect());
        }

        let mut ranked = Vec::with_capacity(baseline.len());
        for task in baseline {
            let score = self.compute_score(&task, now);
            self.audit.append(
                &AuditEntry::new(
                    AuditOp::RiskScored,
                    task.id.as_str(),
                    task.status.logical_folder(),
                    AuditOutcome::Success,
                    score.detail(),
                )
                .with_decision_source("risk_engine"),
            )?;
            ranked.push(RankedTask {
                task,
                score: Some(score),
            });
        }
        let baseline_ids: Vec<String> = ranked.iter().map(|r| r.task.id.to_string()).collect();
        // Stable sort keeps the baseline order among equal composites.
        ranked.sort_by(|a, b| {
            let left = a.score.map(|s| s.composite).unwrap_or(0.0);
            let right = b.score.map(|s| s.composite).unwrap_or(0.0);
            right.partial_cmp(&left).unwrap_or(Ordering::Equal)
        });

        if !ranked.is_empty() {
            let order: Vec<String> = ranked.iter().map(|r| r.task.id.to_string()).collect();
            let changed = order != baseline_ids;
            self.audit.append(
                &AuditEntry::new(
                    AuditOp::PriorityAdjusted,
                    "queue",
                    "risk_scorer",
                    AuditOutcome::Success,
                    format!("order={} changed={changed}", order.join(",")),
                )
                .with_decision_source("risk_engine"),
            )?;
        }
        Ok(ranked)
    }
}
