pub mod document;
pub mod store;

pub use document::{parse_task_document, render_task_document};
pub use store::TaskStore;

use crate::shared::ids::{StepId, TaskId};
use crate::shared::serde_ext::{parse_via_string, serialize_display};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

pub const SIMPLE_STEP_LIMIT: usize = 5;
pub const COMPLEX_STEP_LIMIT: usize = 15;
pub const DEFAULT_TASK_TYPE: &str = "general";

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode task frontmatter for {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid task file name {path}: {reason}")]
    InvalidId { path: String, reason: String },
    #[error("task `{task_id}` cannot transition from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error(transparent)]
    Audit(#[from] crate::audit::AuditError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
    FailedRollback,
    Blocked,
    ManualReview,
}

impl TaskStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Pending, TaskStatus::Blocked)
                | (TaskStatus::Pending, TaskStatus::ManualReview)
                | (TaskStatus::InProgress, TaskStatus::Done)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::FailedRollback)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }

    pub fn sets_completed_at(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::FailedRollback
        )
    }

    /// Folder an external mover would place a task with this status in.
    pub fn logical_folder(self) -> &'static str {
        match self {
            TaskStatus::Pending => crate::runtime::state_paths::NEEDS_ACTION_DIR,
            TaskStatus::InProgress => crate::runtime::state_paths::IN_PROGRESS_DIR,
            TaskStatus::Done => crate::runtime::state_paths::DONE_DIR,
            TaskStatus::Failed
            | TaskStatus::FailedRollback
            | TaskStatus::Blocked
            | TaskStatus::ManualReview => crate::runtime::state_paths::NEEDS_ATTENTION_DIR,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::FailedRollback => write!(f, "failed_rollback"),
            TaskStatus::Blocked => write!(f, "blocked"),
            TaskStatus::ManualReview => write!(f, "manual_review"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Simple,
    Complex,
    ManualReview,
    #[default]
    Unclassified,
}

impl Classification {
    fn severity(self) -> u8 {
        match self {
            Classification::Unclassified => 0,
            Classification::Simple => 1,
            Classification::Complex => 2,
            Classification::ManualReview => 3,
        }
    }

    /// The stricter of two classifications; gates only ever tighten.
    pub fn escalate(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn from_step_count(count: usize) -> Self {
        if count <= SIMPLE_STEP_LIMIT {
            Classification::Simple
        } else if count <= COMPLEX_STEP_LIMIT {
            Classification::Complex
        } else {
            Classification::ManualReview
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classification::Simple => write!(f, "simple"),
            Classification::Complex => write!(f, "complex"),
            Classification::ManualReview => write!(f, "manual_review"),
            Classification::Unclassified => write!(f, "unclassified"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Lower ranks run first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn impact(self) -> f64 {
        match self {
            Priority::Critical => 1.0,
            Priority::High => 0.75,
            Priority::Normal => 0.5,
            Priority::Low => 0.25,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateFile,
    CopyFile,
    CreateFolder,
    RenameFile,
    MoveFile,
    SummarizeContent,
    DeleteFile,
    HttpRequest,
    ApiCall,
    Deploy,
    SendEmail,
    Download,
    Upload,
    Install,
    Unknown(String),
}

impl Operation {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        if normalized.is_empty() {
            return Err("operation must be non-empty".to_string());
        }
        Ok(match normalized.as_str() {
            "create-file" | "file-create" => Operation::CreateFile,
            "copy-file" | "file-copy" => Operation::CopyFile,
            "create-folder" => Operation::CreateFolder,
            "rename-file" => Operation::RenameFile,
            "move-file" => Operation::MoveFile,
            "summarize-content" | "summarize" => Operation::SummarizeContent,
            "delete-file" => Operation::DeleteFile,
            "http-request" => Operation::HttpRequest,
            "api-call" => Operation::ApiCall,
            "deploy" => Operation::Deploy,
            "send-email" => Operation::SendEmail,
            "download" => Operation::Download,
            "upload" => Operation::Upload,
            "install" => Operation::Install,
            _ => Operation::Unknown(normalized),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operation::CreateFile => "create-file",
            Operation::CopyFile => "copy-file",
            Operation::CreateFolder => "create-folder",
            Operation::RenameFile => "rename-file",
            Operation::MoveFile => "move-file",
            Operation::SummarizeContent => "summarize-content",
            Operation::DeleteFile => "delete-file",
            Operation::HttpRequest => "http-request",
            Operation::ApiCall => "api-call",
            Operation::Deploy => "deploy",
            Operation::SendEmail => "send-email",
            Operation::Download => "download",
            Operation::Upload => "upload",
            Operation::Install => "install",
            Operation::Unknown(raw) => raw,
        }
    }

    /// The file-system operations the execution engine will run.
    pub fn is_allowlisted(&self) -> bool {
        matches!(
            self,
            Operation::CreateFile
                | Operation::CopyFile
                | Operation::CreateFolder
                | Operation::RenameFile
                | Operation::MoveFile
                | Operation::SummarizeContent
        )
    }

    /// Operations whose outcome depends on something outside the vault.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Operation::HttpRequest
                | Operation::ApiCall
                | Operation::Deploy
                | Operation::SendEmail
                | Operation::Download
                | Operation::Upload
                | Operation::Install
        )
    }

    /// Operations that write to `to` rather than `path`.
    pub fn writes_destination(&self) -> bool {
        matches!(
            self,
            Operation::CopyFile
                | Operation::RenameFile
                | Operation::MoveFile
                | Operation::SummarizeContent
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Operation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_display(self, serializer)
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        parse_via_string(deserializer, "operation", Operation::parse)
    }
}

fn default_step_priority() -> u32 {
    1
}

fn is_pending(status: &StepStatus) -> bool {
    *status == StepStatus::Pending
}

fn is_default_priority(priority: &u32) -> bool {
    *priority == default_step_priority()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub id: StepId,
    pub op: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "is_pending")]
    pub status: StepStatus,
    #[serde(
        default = "default_step_priority",
        skip_serializing_if = "is_default_priority"
    )]
    pub priority: u32,
    /// `None` means "after the previous main-flow step".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<StepId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate_secs: Option<f64>,
}

impl Step {
    pub fn new(id: StepId, op: Operation) -> Self {
        Self {
            id,
            op,
            path: None,
            to: None,
            content: None,
            service: None,
            description: None,
            status: StepStatus::Pending,
            priority: default_step_priority(),
            depends_on: None,
            alternative: None,
            estimate_secs: None,
        }
    }

    /// One-line rendering used by the checkbox list.
    pub fn summary(&self) -> String {
        let mut line = self.op.to_string();
        if let Some(path) = &self.path {
            line.push(' ');
            line.push_str(path);
        }
        if let Some(to) = &self.to {
            line.push_str(" -> ");
            line.push_str(to);
        }
        line
    }

    /// Every piece of free text a scanner should look at.
    pub fn text_fragments(&self) -> Vec<&str> {
        [
            self.description.as_deref(),
            self.content.as_deref(),
            self.path.as_deref(),
            self.to.as_deref(),
            self.service.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn referenced_paths(&self) -> Vec<&str> {
        [self.path.as_deref(), self.to.as_deref()]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Pass,
    Fail(String),
    Skipped(String),
}

impl GateOutcome {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed == "pass" {
            return Ok(GateOutcome::Pass);
        }
        if trimmed == "fail" {
            return Ok(GateOutcome::Fail(String::new()));
        }
        if trimmed == "skipped" {
            return Ok(GateOutcome::Skipped(String::new()));
        }
        if let Some(reason) = trimmed.strip_prefix("fail:") {
            return Ok(GateOutcome::Fail(reason.to_string()));
        }
        if let Some(reason) = trimmed.strip_prefix("skipped:") {
            return Ok(GateOutcome::Skipped(reason.to_string()));
        }
        Err("expected `pass`, `fail:<reason>` or `skipped:<reason>`".to_string())
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, GateOutcome::Fail(_))
    }
}

impl std::fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateOutcome::Pass => write!(f, "pass"),
            GateOutcome::Fail(reason) if reason.is_empty() => write!(f, "fail"),
            GateOutcome::Fail(reason) => write!(f, "fail:{reason}"),
            GateOutcome::Skipped(reason) if reason.is_empty() => write!(f, "skipped"),
            GateOutcome::Skipped(reason) => write!(f, "skipped:{reason}"),
        }
    }
}

impl Serialize for GateOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_display(self, serializer)
    }
}

impl<'de> Deserialize<'de> for GateOutcome {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        parse_via_string(deserializer, "gate result", GateOutcome::parse)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub source_path: PathBuf,
    pub source: Option<String>,
    pub task_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub version: u64,
    pub priority: Priority,
    pub classification: Classification,
    pub gate_results: BTreeMap<String, GateOutcome>,
    pub classified_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rollback_ref: Option<String>,
    pub destructive: bool,
    pub override_requested: bool,
    pub override_reason: Option<String>,
    pub steps: Vec<Step>,
    pub body: String,
    pub execution_log: Vec<String>,
    /// Problems found while parsing; any entry forces manual review.
    pub metadata_issues: Vec<String>,
    /// Frontmatter keys this crate does not interpret, kept verbatim.
    pub extra_fields: BTreeMap<String, serde_yaml::Value>,
    /// Original frontmatter text when it could not be parsed.
    pub unparsed_frontmatter: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, source_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            source_path: source_path.into(),
            source: None,
            task_type: None,
            created_at: None,
            status: TaskStatus::Pending,
            version: 1,
            priority: Priority::Normal,
            classification: Classification::Unclassified,
            gate_results: BTreeMap::new(),
            classified_at: None,
            started_at: None,
            completed_at: None,
            rollback_ref: None,
            destructive: false,
            override_requested: false,
            override_reason: None,
            steps: Vec::new(),
            body: String::new(),
            execution_log: Vec::new(),
            metadata_issues: Vec::new(),
            extra_fields: BTreeMap::new(),
            unparsed_frontmatter: None,
        }
    }

    pub fn task_type(&self) -> &str {
        self.task_type
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(DEFAULT_TASK_TYPE)
    }

    pub fn is_classified(&self) -> bool {
        self.classification != Classification::Unclassified
    }

    pub fn alternative_step_ids(&self) -> HashSet<&StepId> {
        self.steps
            .iter()
            .filter_map(|step| step.alternative.as_ref())
            .collect()
    }

    /// Steps that run in the normal flow; alternatives are standby steps.
    pub fn main_flow_steps(&self) -> Vec<&Step> {
        let standby = self.alternative_step_ids();
        self.steps
            .iter()
            .filter(|step| !standby.contains(&step.id))
            .collect()
    }

    pub fn find_step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|step| &step.id == id)
    }

    pub fn find_step_mut(&mut self, id: &StepId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|step| &step.id == id)
    }

    pub fn completed_main_steps(&self) -> usize {
        self.main_flow_steps()
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .count()
    }

    /// Share of main-flow work still outstanding, in [0, 1].
    pub fn remaining_fraction(&self) -> f64 {
        let main = self.main_flow_steps();
        if main.is_empty() {
            return 1.0;
        }
        let remaining = main
            .iter()
            .filter(|step| step.status != StepStatus::Completed)
            .count();
        remaining as f64 / main.len() as f64
    }

    /// Classification implied by step count alone.
    pub fn nominal_classification(&self) -> Classification {
        Classification::from_step_count(self.main_flow_steps().len())
    }

    pub fn transition_to(
        &mut self,
        next: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, TaskError> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                task_id: self.id.to_string(),
                from,
                to: next,
            });
        }
        self.status = next;
        self.version += 1;
        if next == TaskStatus::InProgress {
            self.started_at = Some(now);
        }
        if next.sets_completed_at() {
            self.completed_at = Some(now);
        }
        Ok(from)
    }

    pub fn set_classification(
        &mut self,
        classification: Classification,
        gate_results: BTreeMap<String, GateOutcome>,
        now: DateTime<Utc>,
    ) {
        if self.classification != classification || self.gate_results != gate_results {
            self.version += 1;
        }
        self.classification = classification;
        self.gate_results = gate_results;
        self.classified_at = Some(now);
    }

    pub fn append_log(&mut self, now: DateTime<Utc>, line: impl AsRef<str>) {
        self.execution_log.push(format!(
            "{} {}",
            crate::shared::time::format_millis(now),
            line.as_ref()
        ));
    }
}
