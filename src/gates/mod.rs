//! Admission pipeline: six ordered gates deciding whether a task may run
//! unattended, and at which classification.
//!
//! Gates only ever tighten the candidate classification. A hard failure
//! short-circuits and the remaining gates are recorded as skipped. Metadata
//! problems are caught before gate 1 and always end in manual review.

pub mod credentials;

pub use credentials::{mask_value, scan_file, scan_task_text, scan_text, scan_vault, CredentialFinding};

use crate::audit::{AuditEntry, AuditError, AuditLog, AuditOp, AuditOutcome};
use crate::config::Settings;
use crate::execution::ExecutionGraph;
use crate::learning::LearningStore;
use crate::rollback::SnapshotStore;
use crate::shared::vault_access::{resolve_in_vault, VaultAccessError, VaultScope};
use crate::task::{Classification, GateOutcome, Operation, Step, Task, TaskStatus};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::LazyLock;

pub const GATE_METADATA: &str = "gate_0_metadata";
pub const GATE_STEP_COUNT: &str = "gate_1_step_count";
pub const GATE_CREDENTIALS: &str = "gate_2_credentials";
pub const GATE_DETERMINISM: &str = "gate_3_determinism";
pub const GATE_PERMISSIONS: &str = "gate_4_permissions";
pub const GATE_SLA: &str = "gate_5_sla";
pub const GATE_ROLLBACK: &str = "gate_6_rollback";

pub const GATE_NAMES: [&str; 6] = [
    GATE_STEP_COUNT,
    GATE_CREDENTIALS,
    GATE_DETERMINISM,
    GATE_PERMISSIONS,
    GATE_SLA,
    GATE_ROLLBACK,
];

/// Estimated duration above this multiple of the SLA threshold is infeasible.
pub const SLA_FEASIBILITY_FACTOR: f64 = 1.5;

const NETWORK_PHRASES: [&str; 11] = [
    "api call",
    "http request",
    "download",
    "upload",
    "send email",
    "network",
    "external service",
    "database",
    "webhook",
    "deploy",
    "install",
];

static URL_HOST: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\b[a-z][a-z0-9+.-]*://([^/\s:@]+)").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Passed every gate and the feature flag for its class is on.
    AutoEligible,
    /// Passed, but auto-execution for its class is switched off.
    NotEligible,
    ManualReview,
    Blocked,
}

impl Disposition {
    /// Status a pending task moves to when the gates reject it.
    pub fn target_status(self) -> Option<TaskStatus> {
        match self {
            Disposition::ManualReview => Some(TaskStatus::ManualReview),
            Disposition::Blocked => Some(TaskStatus::Blocked),
            Disposition::AutoEligible | Disposition::NotEligible => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::AutoEligible => "auto_eligible",
            Disposition::NotEligible => "not_eligible",
            Disposition::ManualReview => "manual_review",
            Disposition::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateReport {
    pub classification: Classification,
    pub disposition: Disposition,
    pub gate_results: BTreeMap<String, GateOutcome>,
    pub findings: Vec<CredentialFinding>,
    pub override_applied: bool,
    pub estimate_secs: Option<f64>,
    /// Reason of the gate that rejected the task, if any.
    pub reason: Option<String>,
}

/// Whether a task with this classification may start without a human.
pub fn auto_execution_allowed(settings: &Settings, classification: Classification) -> bool {
    match classification {
        Classification::Simple => settings.execution.auto_execute_simple,
        Classification::Complex => settings.execution.auto_execute_complex,
        Classification::ManualReview | Classification::Unclassified => false,
    }
}

pub struct GatePipeline<'a> {
    settings: &'a Settings,
    scope: VaultScope,
    archive: SnapshotStore,
    learning: Option<&'a LearningStore>,
    audit: &'a AuditLog,
}

struct Evaluation {
    candidate: Classification,
    results: BTreeMap<String, GateOutcome>,
    findings: Vec<CredentialFinding>,
    estimate_secs: Option<f64>,
}

impl Evaluation {
    fn pass(&mut self, gate: &str) {
        self.results.insert(gate.to_string(), GateOutcome::Pass);
    }

    fn skip_from(&mut self, first: usize, reason: &str) {
        for gate in &GATE_NAMES[first..] {
            self.results
                .insert((*gate).to_string(), GateOutcome::Skipped(reason.to_string()));
        }
    }
}

impl<'a> GatePipeline<'a> {
    pub fn new(
        settings: &'a Settings,
        scope: VaultScope,
        archive_dir: PathBuf,
        learning: Option<&'a LearningStore>,
        audit: &'a AuditLog,
    ) -> Self {
        Self {
            settings,
            archive: SnapshotStore::new(scope.root(), archive_dir),
            scope,
            learning,
            audit,
        }
    }

    pub fn evaluate(&self, task: &Task) -> Result<GateReport, AuditError> {
        if let Some(reason) = metadata_problem(task) {
            let mut results = BTreeMap::new();
            results.insert(GATE_METADATA.to_string(), GateOutcome::Fail(reason.clone()));
            for gate in GATE_NAMES {
                results.insert(gate.to_string(), GateOutcome::Skipped("metadata".to_string()));
            }
            self.blocked(task, GATE_METADATA, &reason)?;
            return Ok(GateReport {
                classification: Classification::ManualReview,
                disposition: Disposition::ManualReview,
                gate_results: results,
                findings: Vec::new(),
                override_applied: false,
                estimate_secs: None,
                reason: Some(reason),
            });
        }

        if task.override_requested {
            return self.apply_override(task);
        }

        let mut eval = Evaluation {
            candidate: Classification::Unclassified,
            results: BTreeMap::new(),
            findings: Vec::new(),
            estimate_secs: None,
        };

        // Gate 1: main-flow step count.
        let main_steps = task.main_flow_steps().len();
        let by_count = Classification::from_step_count(main_steps);
        if by_count == Classification::ManualReview {
            let reason = format!("too_many_steps:{main_steps}");
            return self.reject(task, eval, 0, Disposition::ManualReview, reason, "step_count");
        }
        eval.candidate = by_count;
        eval.pass(GATE_STEP_COUNT);

        // Gate 2: credentials downgrade but never stop the pipeline.
        let findings = scan_task_text(&task_text(task));
        if findings.is_empty() {
            eval.pass(GATE_CREDENTIALS);
        } else {
            eval.candidate = eval.candidate.escalate(Classification::Complex);
            let reason = "credential_reference".to_string();
            eval.results
                .insert(GATE_CREDENTIALS.to_string(), GateOutcome::Fail(reason.clone()));
            self.blocked(task, GATE_CREDENTIALS, &reason)?;
            let masked: Vec<String> = findings.iter().map(|f| f.describe()).collect();
            self.audit.append(
                &AuditEntry::new(
                    AuditOp::CredentialFlagged,
                    task.id.as_str(),
                    task.status.logical_folder(),
                    AuditOutcome::Flagged,
                    format!("findings={} [{}]", findings.len(), masked.join(", ")),
                )
                .with_decision_source("gate_pipeline"),
            )?;
            eval.findings = findings;
        }

        // Gate 3: anything touching the network must target allowlisted services.
        match self.determinism(task) {
            Determinism::Deterministic => eval.pass(GATE_DETERMINISM),
            Determinism::AllowlistedExternal(services) => {
                eval.candidate = eval.candidate.escalate(Classification::Complex);
                let reason = format!("external_services:{}", services.join(","));
                eval.results
                    .insert(GATE_DETERMINISM.to_string(), GateOutcome::Fail(reason.clone()));
                self.blocked(task, GATE_DETERMINISM, &reason)?;
            }
            Determinism::Unlisted(reason) => {
                return self.reject(task, eval, 2, Disposition::ManualReview, reason, "determinism");
            }
        }

        // Gate 4: vault confinement and destructive intent.
        if let Some(reason) = self.permission_problem(task) {
            return self.reject(task, eval, 3, Disposition::Blocked, reason, "permissions");
        }
        eval.pass(GATE_PERMISSIONS);

        // Gate 5: estimated duration against the candidate's SLA.
        let estimate = self.estimate_secs(task);
        eval.estimate_secs = Some(estimate);
        let limit = self.settings.sla.threshold_secs(eval.candidate) * SLA_FEASIBILITY_FACTOR;
        if estimate > limit {
            let reason = format!("estimate:{estimate:.0}s>limit:{limit:.0}s");
            return self.reject(task, eval, 4, Disposition::ManualReview, reason, "sla");
        }
        eval.pass(GATE_SLA);

        // Gate 6: a snapshot must be possible before non-simple work.
        if eval.candidate != Classification::Simple || task.destructive {
            if let Err(err) = self.archive.check_writable() {
                let reason = format!("rollback_unavailable:{err}");
                return self.reject(task, eval, 5, Disposition::ManualReview, reason, "rollback");
            }
            eval.pass(GATE_ROLLBACK);
        } else {
            eval.results.insert(
                GATE_ROLLBACK.to_string(),
                GateOutcome::Skipped("simple".to_string()),
            );
        }

        let disposition = if auto_execution_allowed(self.settings, eval.candidate) {
            Disposition::AutoEligible
        } else {
            Disposition::NotEligible
        };
        Ok(GateReport {
            classification: eval.candidate,
            disposition,
            gate_results: eval.results,
            findings: eval.findings,
            override_applied: false,
            estimate_secs: eval.estimate_secs,
            reason: None,
        })
    }

    fn apply_override(&self, task: &Task) -> Result<GateReport, AuditError> {
        let classification = match task.classification {
            Classification::Simple | Classification::Complex => task.classification,
            _ if task.main_flow_steps().len() <= crate::task::SIMPLE_STEP_LIMIT => {
                Classification::Simple
            }
            _ => Classification::Complex,
        };
        let mut results = BTreeMap::new();
        for gate in GATE_NAMES {
            results.insert(gate.to_string(), GateOutcome::Skipped("override".to_string()));
        }
        let reason = task
            .override_reason
            .clone()
            .unwrap_or_else(|| "none".to_string());
        self.audit.append(
            &AuditEntry::new(
                AuditOp::OverrideApplied,
                task.id.as_str(),
                task.status.logical_folder(),
                AuditOutcome::Flagged,
                format!("classification={classification} reason={reason}"),
            )
            .with_decision_source("gate_pipeline"),
        )?;
        let disposition = if auto_execution_allowed(self.settings, classification) {
            Disposition::AutoEligible
        } else {
            Disposition::NotEligible
        };
        Ok(GateReport {
            classification,
            disposition,
            gate_results: results,
            findings: Vec::new(),
            override_applied: true,
            estimate_secs: None,
            reason: None,
        })
    }

    /// Records a short-circuiting failure at `GATE_NAMES[index]`.
    fn reject(
        &self,
        task: &Task,
        mut eval: Evaluation,
        index: usize,
        disposition: Disposition,
        reason: String,
        skip_reason: &str,
    ) -> Result<GateReport, AuditError> {
        let gate = GATE_NAMES[index];
        eval.results
            .insert(gate.to_string(), GateOutcome::Fail(reason.clone()));
        eval.skip_from(index + 1, skip_reason);
        self.blocked(task, gate, &reason)?;
        let classification = match disposition {
            Disposition::ManualReview => Classification::ManualReview,
            _ => eval.candidate,
        };
        Ok(GateReport {
            classification,
            disposition,
            gate_results: eval.results,
            findings: eval.findings,
            override_applied: false,
            estimate_secs: eval.estimate_secs,
            reason: Some(reason),
        })
    }

    fn blocked(&self, task: &Task, gate: &str, reason: &str) -> Result<(), AuditError> {
        self.audit.append(
            &AuditEntry::new(
                AuditOp::GateBlocked,
                task.id.as_str(),
                task.status.logical_folder(),
                AuditOutcome::Flagged,
                format!("{gate}:{reason}"),
            )
            .with_decision_source("gate_pipeline"),
        )
    }

    fn determinism(&self, task: &Task) -> Determinism {
        let mut services = BTreeSet::new();
        for step in task.main_flow_steps().into_iter().chain(standby_steps(task)) {
            if !is_network_step(step) {
                continue;
            }
            let named = step_services(step);
            if named.is_empty() {
                return Determinism::Unlisted(format!(
                    "unidentified_service:step={}",
                    step.id
                ));
            }
            for service in named {
                if !self.settings.execution.is_service_allowed(&service) {
                    return Determinism::Unlisted(format!("service_not_allowlisted:{service}"));
                }
                services.insert(service);
            }
        }
        if services.is_empty() {
            Determinism::Deterministic
        } else {
            Determinism::AllowlistedExternal(services.into_iter().collect())
        }
    }

    fn permission_problem(&self, task: &Task) -> Option<String> {
        for step in &task.steps {
            if step.op.is_external() {
                continue;
            }
            for raw in step.referenced_paths() {
                let resolved = if step.op == Operation::RenameFile && Some(raw) == step.to.as_deref()
                {
                    rename_target(&self.scope, step, raw)
                } else {
                    self.scope.resolve(raw)
                };
                match resolved {
                    Ok(_) => {}
                    Err(VaultAccessError::Protected { .. }) => {
                        return Some(format!("protected_path:{raw}"));
                    }
                    Err(_) => return Some(format!("outside_vault:{raw}")),
                }
            }
            if !task.destructive {
                if let Some(kind) = self.destructive_kind(step) {
                    return Some(format!("destructive_without_flag:step={}:{kind}", step.id));
                }
            }
        }
        None
    }

    fn destructive_kind(&self, step: &Step) -> Option<&'static str> {
        let target = match step.op {
            Operation::DeleteFile => return Some("delete"),
            Operation::CreateFile => step.path.as_deref(),
            Operation::CopyFile | Operation::MoveFile => step.to.as_deref(),
            Operation::RenameFile => {
                return step
                    .to
                    .as_deref()
                    .and_then(|to| rename_target(&self.scope, step, to).ok())
                    .filter(|path| path.exists())
                    .map(|_| "overwrite");
            }
            _ => None,
        }?;
        resolve_in_vault(self.scope.root(), target)
            .ok()
            .filter(|path| path.is_file())
            .map(|_| "overwrite")
    }

    fn estimate_secs(&self, task: &Task) -> f64 {
        let main = task.main_flow_steps();
        let default = self.settings.execution.default_step_estimate_secs;
        if main.iter().any(|step| step.estimate_secs.is_some()) {
            return main
                .iter()
                .map(|step| step.estimate_secs.unwrap_or(default))
                .sum();
        }
        if let Some(learning) = self.learning {
            let history = learning.duration_history(task.task_type());
            if history.samples > 0 {
                return history.mean_secs;
            }
        }
        default * main.len() as f64
    }
}

enum Determinism {
    Deterministic,
    AllowlistedExternal(Vec<String>),
    Unlisted(String),
}

fn metadata_problem(task: &Task) -> Option<String> {
    if let Some(issue) = task.metadata_issues.first() {
        return Some(issue.clone());
    }
    if let Some(step) = task
        .steps
        .iter()
        .find(|step| matches!(step.op, Operation::Unknown(_)))
    {
        return Some(format!("unknown_operation:{}:{}", step.id, step.op));
    }
    ExecutionGraph::from_task(task)
        .err()
        .map(|err| format!("invalid_step_graph:{err}"))
}

fn standby_steps(task: &Task) -> impl Iterator<Item = &Step> {
    let standby = task.alternative_step_ids();
    task.steps
        .iter()
        .filter(move |step| standby.contains(&step.id))
}

fn task_text(task: &Task) -> String {
    let mut text = task.body.clone();
    for step in &task.steps {
        for fragment in [
            step.description.as_deref(),
            step.content.as_deref(),
            step.path.as_deref(),
            step.to.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            text.push('\n');
            text.push_str(fragment);
        }
    }
    text
}

fn is_network_step(step: &Step) -> bool {
    if step.op.is_external() {
        return true;
    }
    let description = step
        .description
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();
    NETWORK_PHRASES
        .iter()
        .any(|phrase| description.contains(phrase))
}

/// Services a network step talks to: its `service` field, else URL hosts.
fn step_services(step: &Step) -> Vec<String> {
    if let Some(service) = step.service.as_deref().filter(|s| !s.trim().is_empty()) {
        return vec![service.trim().to_ascii_lowercase()];
    }
    let Some(url_host) = URL_HOST.as_ref() else {
        return Vec::new();
    };
    let mut hosts = Vec::new();
    for fragment in step.text_fragments() {
        for captures in url_host.captures_iter(fragment) {
            if let Some(host) = captures.get(1) {
                hosts.push(host.as_str().to_ascii_lowercase());
            }
        }
    }
    hosts.sort();
    hosts.dedup();
    hosts
}

fn rename_target(scope: &VaultScope, step: &Step, name: &str) -> Result<PathBuf, VaultAccessError> {
    let invalid = |reason: &str| VaultAccessError::InvalidPath {
        path: name.to_string(),
        reason: reason.to_string(),
    };
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("rename target must be a bare file name"));
    }
    let source = scope.resolve(step.path.as_deref().ok_or_else(|| invalid("rename needs `path`"))?)?;
    let parent = source.parent().ok_or_else(|| invalid("rename source has no parent"))?;
    scope.resolve(&parent.join(name).display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::{StepId, TaskId};
    use std::fs;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        settings: Settings,
        audit: AuditLog,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        fs::create_dir_all(root.join("Rollback_Archive")).expect("archive");
        fs::create_dir_all(root.join("Done")).expect("done");
        let mut settings = Settings::for_vault(&root);
        settings.execution.auto_execute_simple = true;
        let audit = AuditLog::new(root.join(".taskgate/logs/operations.log"));
        Fixture {
            _dir: dir,
            root,
            settings,
            audit,
        }
    }

    fn task_with(steps: Vec<Step>) -> Task {
        let mut task = Task::new(TaskId::parse("T-1.md").expect("id"), "/v/T-1.md");
        task.task_type = Some("docs".to_string());
        task.steps = steps;
        task
    }

    fn create(id: &str, path: &str) -> Step {
        let mut step = Step::new(StepId::parse(id).expect("id"), Operation::CreateFile);
        step.path = Some(path.to_string());
        step
    }

    fn evaluate(fx: &Fixture, task: &Task) -> GateReport {
        GatePipeline::new(
            &fx.settings,
            fx.settings.paths().step_scope(),
            fx.root.join("Rollback_Archive"),
            None,
            &fx.audit,
        )
        .evaluate(task)
        .expect("evaluate")
    }

    #[test]
    fn small_clean_task_is_simple() {
        let fx = fixture();
        let report = evaluate(&fx, &task_with(vec![create("s1", "Done/a.md")]));
        assert_eq!(report.classification, Classification::Simple);
        assert_eq!(report.disposition, Disposition::AutoEligible);
        assert_eq!(
            report.gate_results.get(GATE_ROLLBACK),
            Some(&GateOutcome::Skipped("simple".to_string()))
        );
        assert_eq!(report.gate_results.len(), 6);
    }

    #[test]
    fn sixteen_steps_force_manual_review() {
        let fx = fixture();
        let steps = (1..=16)
            .map(|n| create(&format!("s{n}"), &format!("Done/{n}.md")))
            .collect();
        let mut task = task_with(steps);
        task.body = "password = hunter2hunter2".to_string();
        let report = evaluate(&fx, &task);
        assert_eq!(report.classification, Classification::ManualReview);
        assert_eq!(
            report.gate_results.get(GATE_CREDENTIALS),
            Some(&GateOutcome::Skipped("step_count".to_string()))
        );
    }

    #[test]
    fn credentials_downgrade_to_complex() {
        let fx = fixture();
        let mut task = task_with(vec![create("s1", "Done/a.md")]);
        task.body = "Store the api_key in the notes".to_string();
        let report = evaluate(&fx, &task);
        assert_eq!(report.classification, Classification::Complex);
        assert_eq!(report.disposition, Disposition::NotEligible);
        assert!(!report.findings.is_empty());
        let ops: Vec<AuditOp> = fx.audit.read_all().expect("read").iter().map(|e| e.op).collect();
        assert!(ops.contains(&AuditOp::CredentialFlagged));
    }

    #[test]
    fn key_file_in_step_path_is_flagged() {
        let fx = fixture();
        fs::create_dir_all(fx.root.join("certs")).expect("certs");
        fs::write(fx.root.join("certs/server.key"), "-").expect("key");
        let mut copy = Step::new(StepId::parse("s1").expect("id"), Operation::CopyFile);
        copy.path = Some("certs/server.key".to_string());
        copy.to = Some("Done/server.key".to_string());
        let report = evaluate(&fx, &task_with(vec![copy]));
        assert_eq!(report.classification, Classification::Complex);
        assert!(report
            .gate_results
            .get(GATE_CREDENTIALS)
            .is_some_and(GateOutcome::is_fail));
    }

    #[test]
    fn out_of_vault_path_blocks() {
        let fx = fixture();
        let report = evaluate(&fx, &task_with(vec![create("s1", "../outside.md")]));
        assert_eq!(report.disposition, Disposition::Blocked);
        assert_eq!(report.disposition.target_status(), Some(TaskStatus::Blocked));
        assert_eq!(
            report.gate_results.get(GATE_SLA),
            Some(&GateOutcome::Skipped("permissions".to_string()))
        );
    }

    #[test]
    fn overwrite_without_destructive_flag_blocks() {
        let fx = fixture();
        fs::write(fx.root.join("Done/a.md"), "exists").expect("write");
        let report = evaluate(&fx, &task_with(vec![create("s1", "Done/a.md")]));
        assert_eq!(report.disposition, Disposition::Blocked);
        assert!(report
            .reason
            .as_deref()
            .is_some_and(|reason| reason.starts_with("destructive_without_flag")));
    }

    #[test]
    fn state_and_archive_paths_block() {
        let fx = fixture();
        let mut moving = Step::new(StepId::parse("s1").expect("id"), Operation::MoveFile);
        moving.path = Some(".taskgate/logs/operations.log".to_string());
        moving.to = Some("Done/moved.log".to_string());
        let report = evaluate(&fx, &task_with(vec![moving]));
        assert_eq!(report.disposition, Disposition::Blocked);
        assert_eq!(
            report.reason.as_deref(),
            Some("protected_path:.taskgate/logs/operations.log")
        );

        let report = evaluate(
            &fx,
            &task_with(vec![create("s1", "Rollback_Archive/forged/manifest.json")]),
        );
        assert_eq!(report.disposition, Disposition::Blocked);
        let report = evaluate(&fx, &task_with(vec![create("s1", "Learning_Data/docs/metrics.json")]));
        assert_eq!(report.disposition, Disposition::Blocked);
    }

    #[test]
    fn allowlisted_service_downgrades_and_unlisted_goes_to_review() {
        let mut fx = fixture();
        fx.settings.execution.allowed_external_services = vec!["reports.example.com".to_string()];
        let mut call = Step::new(StepId::parse("s2").expect("id"), Operation::HttpRequest);
        call.path = Some("https://reports.example.com/weekly".to_string());
        let task = task_with(vec![create("s1", "Done/a.md"), call.clone()]);
        let report = evaluate(&fx, &task);
        assert_eq!(report.classification, Classification::Complex);

        call.path = Some("https://elsewhere.example.org/x".to_string());
        let report = evaluate(&fx, &task_with(vec![create("s1", "Done/a.md"), call]));
        assert_eq!(report.classification, Classification::ManualReview);
        assert_eq!(report.disposition, Disposition::ManualReview);
    }

    #[test]
    fn long_estimate_fails_feasibility() {
        let fx = fixture();
        let mut step = create("s1", "Done/a.md");
        step.estimate_secs = Some(1000.0);
        let report = evaluate(&fx, &task_with(vec![step]));
        assert_eq!(report.disposition, Disposition::ManualReview);
        assert!(report.gate_results[GATE_SLA].is_fail());
    }

    #[test]
    fn missing_archive_fails_rollback_readiness_for_complex() {
        let fx = fixture();
        fs::remove_dir_all(fx.root.join("Rollback_Archive")).expect("remove archive");
        let steps = (1..=6)
            .map(|n| create(&format!("s{n}"), &format!("Done/{n}.md")))
            .collect();
        let report = evaluate(&fx, &task_with(steps));
        assert_eq!(report.disposition, Disposition::ManualReview);
        assert!(report.gate_results[GATE_ROLLBACK].is_fail());
    }

    #[test]
    fn metadata_issues_route_to_manual_review() {
        let fx = fixture();
        let mut task = task_with(vec![create("s1", "Done/a.md")]);
        task.metadata_issues.push("missing required field `type`".to_string());
        let report = evaluate(&fx, &task);
        assert_eq!(report.classification, Classification::ManualReview);
        assert!(report.gate_results[GATE_METADATA].is_fail());
    }

    #[test]
    fn override_skips_every_gate_and_is_audited() {
        let fx = fixture();
        let mut task = task_with(vec![create("s1", "../outside.md")]);
        task.override_requested = true;
        task.override_reason = Some("operator approved".to_string());
        let report = evaluate(&fx, &task);
        assert!(report.override_applied);
        assert_eq!(report.classification, Classification::Simple);
        assert!(report
            .gate_results
            .values()
            .all(|outcome| *outcome == GateOutcome::Skipped("override".to_string())));
        let entries = fx.audit.read_all().expect("read");
        assert!(entries.iter().any(|e| e.op == AuditOp::OverrideApplied));
    }
}
