use crate::shared::time::{format_millis, now_utc};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOp {
    TaskClassified,
    StatusChanged,
    StepExecuted,
    TaskExecuted,
    GateBlocked,
    OverrideApplied,
    CredentialFlagged,
    SnapshotCreated,
    SnapshotPurged,
    RollbackRestored,
    SelfHealRetry,
    SelfHealAlternative,
    SelfHealPartial,
    RiskScored,
    PriorityAdjusted,
    ConcurrencyQueued,
    SlaPrediction,
    SlaEarlyWarning,
    SlaBreach,
    TaskTimeout,
    TaskRecovered,
    LearningUpdate,
    Error,
}

impl AuditOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskClassified => "task_classified",
            Self::StatusChanged => "status_changed",
            Self::StepExecuted => "step_executed",
            Self::TaskExecuted => "task_executed",
            Self::GateBlocked => "gate_blocked",
            Self::OverrideApplied => "override_applied",
            Self::CredentialFlagged => "credential_flagged",
            Self::SnapshotCreated => "snapshot_created",
            Self::SnapshotPurged => "snapshot_purged",
            Self::RollbackRestored => "rollback_restored",
            Self::SelfHealRetry => "self_heal_retry",
            Self::SelfHealAlternative => "self_heal_alternative",
            Self::SelfHealPartial => "self_heal_partial",
            Self::RiskScored => "risk_scored",
            Self::PriorityAdjusted => "priority_adjusted",
            Self::ConcurrencyQueued => "concurrency_queued",
            Self::SlaPrediction => "sla_prediction",
            Self::SlaEarlyWarning => "sla_early_warning",
            Self::SlaBreach => "sla_breach",
            Self::TaskTimeout => "task_timeout",
            Self::TaskRecovered => "task_recovered",
            Self::LearningUpdate => "learning_update",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for AuditOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failed,
    Flagged,
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Flagged => write!(f, "flagged"),
        }
    }
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub op: AuditOp,
    pub file: String,
    /// Logical folder of the task, or the component that wrote the entry.
    #[serde(default)]
    pub src: String,
    pub dst: Option<String>,
    pub outcome: AuditOutcome,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_source: Option<String>,
}

impl AuditEntry {
    pub fn new(
        op: AuditOp,
        file: impl Into<String>,
        src: impl Into<String>,
        outcome: AuditOutcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            ts: format_millis(now_utc()),
            op,
            file: file.into(),
            src: src.into(),
            dst: None,
            outcome,
            detail: detail.into(),
            decision_source: None,
        }
    }

    pub fn with_dst(mut self, dst: impl Into<String>) -> Self {
        self.dst = Some(dst.into());
        self
    }

    pub fn with_decision_source(mut self, source: impl Into<String>) -> Self {
        self.decision_source = Some(source.into());
        self
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = format_millis(ts);
        self
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.ts)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}
