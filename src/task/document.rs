use super::{
    Classification, GateOutcome, Operation, Priority, Step, StepStatus, Task, TaskStatus,
};
use crate::shared::ids::{StepId, TaskId};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const STEPS_HEADING: &str = "## Steps";
const LOG_HEADING: &str = "## Execution Log";
const UNPARSED_HEADING: &str = "## Unparsed Frontmatter";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Frontmatter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    task_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    created: Option<DateTime<Utc>>,
    #[serde(default)]
    status: Option<TaskStatus>,
    #[serde(default)]
    version: Option<u64>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    complexity: Option<Classification>,
    #[serde(default)]
    gate_results: BTreeMap<String, GateOutcome>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    classified_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    rollback_ref: Option<String>,
    #[serde(default)]
    destructive: bool,
    #[serde(default, rename = "override")]
    override_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    override_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    steps: Vec<Step>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

/// Accepts RFC 3339 and zone-less `YYYY-MM-DDTHH:MM:SS[.fff]` (read as UTC).
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let raw = Option::<String>::deserialize(deserializer)?;
    let Some(raw) = raw.filter(|value| !value.trim().is_empty() && value != "null") else {
        return Ok(None);
    };
    parse_timestamp(&raw)
        .map(Some)
        .ok_or_else(|| D::Error::custom(format!("invalid timestamp `{raw}`")))
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

struct SplitDocument<'a> {
    frontmatter: Option<&'a str>,
    rest: &'a str,
}

fn split_frontmatter(raw: &str) -> SplitDocument<'_> {
    let Some(after_open) = raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))
    else {
        return SplitDocument {
            frontmatter: None,
            rest: raw,
        };
    };
    let mut offset = 0;
    for line in after_open.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return SplitDocument {
                frontmatter: Some(&after_open[..offset]),
                rest: &after_open[offset + line.len()..],
            };
        }
        offset += line.len();
    }
    SplitDocument {
        frontmatter: None,
        rest: raw,
    }
}

#[derive(Default)]
struct BodySections {
    body: Vec<String>,
    steps: Vec<String>,
    log: Vec<String>,
}

fn split_body(rest: &str) -> BodySections {
    enum Section {
        Body,
        Steps,
        Log,
    }
    let mut sections = BodySections::default();
    let mut current = Section::Body;
    for line in rest.lines() {
        let trimmed = line.trim_end();
        if trimmed == STEPS_HEADING {
            current = Section::Steps;
            continue;
        }
        if trimmed == LOG_HEADING {
            current = Section::Log;
            continue;
        }
        if trimmed.starts_with("## ") {
            current = Section::Body;
        }
        match current {
            Section::Body => sections.body.push(line.to_string()),
            Section::Steps => sections.steps.push(line.to_string()),
            Section::Log => {
                if let Some(entry) = trimmed.strip_prefix("- ") {
                    sections.log.push(entry.to_string());
                }
            }
        }
    }
    sections
}

/// Parses `- [ ] [id:] <op> <path> [-> <to>]` checkbox lines.
fn parse_checkbox_steps(lines: &[String]) -> Result<Vec<Step>, String> {
    let mut steps = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        let (done, rest) = if let Some(rest) = trimmed.strip_prefix("- [ ] ") {
            (false, rest)
        } else if let Some(rest) = trimmed
            .strip_prefix("- [x] ")
            .or_else(|| trimmed.strip_prefix("- [X] "))
        {
            (true, rest)
        } else {
            continue;
        };

        let (target, destination) = match rest.split_once(" -> ") {
            Some((left, right)) => (left.trim(), Some(right.trim().to_string())),
            None => (rest.trim(), None),
        };
        let mut tokens = target.split_whitespace().peekable();
        let mut explicit_id = None;
        if let Some(first) = tokens.peek() {
            if let Some(candidate) = first.strip_suffix(':') {
                explicit_id = Some(StepId::parse(candidate)?);
                tokens.next();
            }
        }
        let Some(op_token) = tokens.next() else {
            return Err(format!("checkbox step `{trimmed}` has no operation"));
        };
        let path = tokens.collect::<Vec<_>>().join(" ");
        let id = match explicit_id {
            Some(id) => id,
            None => StepId::parse(&format!("s{}", steps.len() + 1))?,
        };
        let mut step = Step::new(id, Operation::parse(op_token)?);
        step.path = (!path.is_empty()).then_some(path);
        step.to = destination;
        step.description = Some(rest.trim().to_string());
        if done {
            step.status = StepStatus::Completed;
        }
        steps.push(step);
    }
    Ok(steps)
}

fn join_body(lines: &[String]) -> String {
    let joined = lines.join("\n");
    joined.trim_matches('\n').to_string()
}

/// Parses a task file leniently: anything wrong with the metadata is recorded
/// in `metadata_issues` instead of failing, so the gate pipeline can route the
/// task to manual review.
pub fn parse_task_document(id: TaskId, source_path: impl Into<PathBuf>, raw: &str) -> Task {
    let mut task = Task::new(id, source_path);
    let split = split_frontmatter(raw);
    let sections = split_body(split.rest);
    task.body = join_body(&sections.body);
    task.execution_log = sections.log;

    let frontmatter = match split.frontmatter {
        None => {
            task.metadata_issues
                .push("missing frontmatter block".to_string());
            None
        }
        Some(text) => match serde_yaml::from_str::<Option<Frontmatter>>(text) {
            Ok(parsed) => Some(parsed.unwrap_or_default()),
            Err(err) => {
                task.metadata_issues
                    .push(format!("unparseable frontmatter: {err}"));
                task.unparsed_frontmatter = Some(text.to_string());
                None
            }
        },
    };

    if let Some(fm) = frontmatter {
        task.source = fm.source;
        task.task_type = fm.task_type;
        task.created_at = fm.created;
        task.status = fm.status.unwrap_or_default();
        task.version = fm.version.unwrap_or(1).max(1);
        task.priority = fm.priority.unwrap_or_default();
        task.classification = fm.complexity.unwrap_or_default();
        task.gate_results = fm.gate_results;
        task.classified_at = fm.classified_at;
        task.started_at = fm.started_at;
        task.completed_at = fm.completed_at;
        task.rollback_ref = fm.rollback_ref.filter(|value| !value.trim().is_empty());
        task.destructive = fm.destructive;
        task.override_requested = fm.override_requested;
        task.override_reason = fm.override_reason;
        task.steps = fm.steps;
        task.extra_fields = fm.extra;

        if task
            .task_type
            .as_deref()
            .map_or(true, |value| value.trim().is_empty())
        {
            task.metadata_issues
                .push("missing required field `type`".to_string());
        }
    }

    if task.steps.is_empty() {
        match parse_checkbox_steps(&sections.steps) {
            Ok(steps) => task.steps = steps,
            Err(err) => task
                .metadata_issues
                .push(format!("invalid checkbox step: {err}")),
        }
    }
    if task.steps.is_empty() && task.metadata_issues.is_empty() {
        task.metadata_issues
            .push("task declares no actionable steps".to_string());
    }
    task
}

pub fn render_task_document(task: &Task) -> Result<String, serde_yaml::Error> {
    let frontmatter = Frontmatter {
        source: task.source.clone(),
        task_type: task.task_type.clone(),
        created: task.created_at,
        status: Some(task.status),
        version: Some(task.version),
        priority: Some(task.priority),
        complexity: Some(task.classification),
        gate_results: task.gate_results.clone(),
        classified_at: task.classified_at,
        started_at: task.started_at,
        completed_at: task.completed_at,
        rollback_ref: task.rollback_ref.clone(),
        destructive: task.destructive,
        override_requested: task.override_requested,
        override_reason: task.override_reason.clone(),
        steps: task.steps.clone(),
        extra: task.extra_fields.clone(),
    };
    let yaml = serde_yaml::to_string(&frontmatter)?;

    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&yaml);
    if !yaml.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("---\n");
    if let Some(unparsed) = &task.unparsed_frontmatter {
        out.push_str(UNPARSED_HEADING);
        out.push_str("\n```yaml\n");
        out.push_str(unparsed.trim_end());
        out.push_str("\n```\n\n");
    }
    if !task.body.is_empty() {
        out.push_str(&task.body);
        out.push_str("\n\n");
    }
    out.push_str(STEPS_HEADING);
    out.push('\n');
    for step in &task.steps {
        let mark = if step.status == StepStatus::Completed {
            "x"
        } else {
            " "
        };
        out.push_str(&format!("- [{mark}] {}: {}\n", step.id, step.summary()));
    }
    if !task.execution_log.is_empty() {
        out.push('\n');
        out.push_str(LOG_HEADING);
        out.push('\n');
        for line in &task.execution_log {
            out.push_str("- ");
            out.push_str(line);
            out.push('\n');
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> TaskId {
        TaskId::parse("TASK-7.md").expect("task id")
    }

    const SAMPLE: &str = r##"---
source: file_watcher
type: document
created: 2026-01-05T09:30:00Z
status: pending
priority: high
subject: quarterly numbers
steps:
  - id: s1
    op: create-folder
    path: Done/reports
  - id: s2
    op: create-file
    path: Done/reports/q1.md
    content: "# Q1"
    alternative: s3
  - id: s3
    op: create-file
    path: Done/reports/q1-fallback.md
---
# Quarterly report

Please compile the report.
"##;

    #[test]
    fn parses_frontmatter_steps_and_body() {
        let task = parse_task_document(id(), "/vault/Needs_Action/TASK-7.md", SAMPLE);
        assert!(task.metadata_issues.is_empty(), "{:?}", task.metadata_issues);
        assert_eq!(task.task_type(), "document");
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.version, 1);
        assert_eq!(task.steps.len(), 3);
        assert_eq!(task.main_flow_steps().len(), 2);
        assert_eq!(task.body, "# Quarterly report\n\nPlease compile the report.");
        assert_eq!(
            task.extra_fields.get("subject"),
            Some(&serde_yaml::Value::String("quarterly numbers".to_string()))
        );
    }

    #[test]
    fn render_then_parse_keeps_state_and_log() {
        let mut task = parse_task_document(id(), "/vault/Needs_Action/TASK-7.md", SAMPLE);
        task.steps[0].status = StepStatus::Completed;
        task.classification = Classification::Simple;
        task.gate_results
            .insert("gate_1_step_count".to_string(), GateOutcome::Pass);
        task.append_log(Utc::now(), "step s1 op=create-folder outcome=success");

        let rendered = render_task_document(&task).expect("render");
        assert!(rendered.contains("- [x] s1: create-folder Done/reports"));
        assert!(rendered.contains("## Execution Log"));
        assert!(rendered.contains("subject: quarterly numbers"));

        let reparsed = parse_task_document(id(), "/vault/Needs_Action/TASK-7.md", &rendered);
        assert_eq!(reparsed.steps, task.steps);
        assert_eq!(reparsed.classification, Classification::Simple);
        assert_eq!(reparsed.gate_results, task.gate_results);
        assert_eq!(reparsed.execution_log, task.execution_log);
        assert_eq!(reparsed.body, task.body);
    }

    #[test]
    fn checkbox_steps_are_used_when_frontmatter_has_none() {
        let raw = "---\ntype: general\n---\nDo things\n\n## Steps\n- [ ] create-folder Done/out\n- [x] b2: copy-file notes.md -> Done/out/notes.md\n";
        let task = parse_task_document(id(), "/vault/Needs_Action/TASK-7.md", raw);
        assert!(task.metadata_issues.is_empty(), "{:?}", task.metadata_issues);
        assert_eq!(task.steps.len(), 2);
        assert_eq!(task.steps[0].id.as_str(), "s1");
        assert_eq!(task.steps[0].op, Operation::CreateFolder);
        assert_eq!(task.steps[1].id.as_str(), "b2");
        assert_eq!(task.steps[1].to.as_deref(), Some("Done/out/notes.md"));
        assert_eq!(task.steps[1].status, StepStatus::Completed);
    }

    #[test]
    fn broken_or_missing_metadata_is_reported_not_fatal() {
        let missing = parse_task_document(id(), "/v/TASK-7.md", "just text\n");
        assert!(missing.metadata_issues[0].contains("missing frontmatter"));

        let broken = parse_task_document(id(), "/v/TASK-7.md", "---\ntype: [oops\n---\nbody\n");
        assert!(broken.metadata_issues[0].contains("unparseable frontmatter"));
        let rendered = render_task_document(&broken).expect("render broken");
        assert!(rendered.contains("type: [oops"));

        let bad_enum = parse_task_document(
            id(),
            "/v/TASK-7.md",
            "---\ntype: document\npriority: urgent\n---\nbody\n",
        );
        assert!(!bad_enum.metadata_issues.is_empty());

        let no_type = parse_task_document(
            id(),
            "/v/TASK-7.md",
            "---\nsource: email\n---\n## Steps\n- [ ] create-folder a\n",
        );
        assert!(no_type
            .metadata_issues
            .iter()
            .any(|issue| issue.contains("`type`")));

        let no_steps = parse_task_document(id(), "/v/TASK-7.md", "---\ntype: general\n---\nbody\n");
        assert!(no_steps.metadata_issues[0].contains("no actionable steps"));
    }

    #[test]
    fn zone_less_timestamps_are_read_as_utc() {
        let parsed = parse_timestamp("2026-02-01T08:00:00").expect("naive timestamp");
        assert_eq!(parsed.to_rfc3339(), "2026-02-01T08:00:00+00:00");
        assert!(parse_timestamp("yesterday").is_none());
    }
}
