use crate::app::command_support::{ready_processor, render_lines};
use crate::gates::credentials::scan_vault;
use crate::shared::time::now_utc;
use crate::task::TaskStatus;
use chrono::Duration;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const STATUS_WINDOW_HOURS: u32 = 24;

pub fn cmd_classify(config: Option<&Path>, args: &[String]) -> Result<String, String> {
    let file = match args {
        [file] => PathBuf::from(file),
        _ => return Err("usage: taskgate classify <file>".to_string()),
    };
    let processor = ready_processor(config)?;
    let mut task = processor.tasks().load(&file).map_err(|e| e.to_string())?;
    if task.status != TaskStatus::Pending {
        return Err(format!(
            "task {} is {}; only pending tasks are classified",
            task.id, task.status
        ));
    }

    let report = processor
        .classify_task(&mut task, now_utc())
        .map_err(|e| e.to_string())?;
    let mut lines = vec![
        format!("task={}", task.id),
        format!("classification={}", report.classification),
        format!("disposition={}", report.disposition.as_str()),
        format!("status={}", task.status),
        format!("override_applied={}", report.override_applied),
    ];
    if let Some(estimate) = report.estimate_secs {
        lines.push(format!("estimate_secs={estimate:.1}"));
    }
    if let Some(reason) = &report.reason {
        lines.push(format!("reason={reason}"));
    }
    for (gate, outcome) in &report.gate_results {
        lines.push(format!("gate.{gate}={outcome}"));
    }
    for finding in &report.findings {
        lines.push(format!("credential={}", finding.describe()));
    }
    Ok(render_lines(lines))
}

pub fn cmd_status(config: Option<&Path>) -> Result<String, String> {
    let processor = ready_processor(config)?;
    let now = now_utc();
    let tasks = processor.tasks().list_active().map_err(|e| e.to_string())?;
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for task in &tasks {
        *counts.entry(task.status.to_string()).or_default() += 1;
    }
    let compliance = processor
        .tracker()
        .compliance(now, STATUS_WINDOW_HOURS)
        .map_err(|e| e.to_string())?;
    let errors = processor
        .audit()
        .count_errors(now - Duration::hours(i64::from(STATUS_WINDOW_HOURS)))
        .map_err(|e| e.to_string())?;
    let snapshots = processor
        .rollback()
        .store()
        .list()
        .map_err(|e| e.to_string())?;

    let mut lines = vec![
        format!("vault={}", processor.paths().vault_root.display()),
        format!("tasks.active={}", tasks.len()),
    ];
    for (status, count) in counts {
        lines.push(format!("tasks.{status}={count}"));
    }
    lines.push(format!("snapshots={}", snapshots.len()));
    lines.push(format!(
        "sla.compliance_{STATUS_WINDOW_HOURS}h={:.3} executed={} breaches={}",
        compliance.rate, compliance.executed, compliance.breaches
    ));
    lines.push(format!("errors_{STATUS_WINDOW_HOURS}h={errors}"));
    lines.push(format!(
        "stop_requested={}",
        processor.paths().stop_signal_path().exists()
    ));
    Ok(render_lines(lines))
}

pub fn cmd_scan(config: Option<&Path>) -> Result<String, String> {
    let processor = ready_processor(config)?;
    let findings = scan_vault(processor.paths());
    let mut lines = vec![format!("findings={}", findings.len())];
    lines.extend(findings.iter().map(|finding| finding.describe()));
    Ok(render_lines(lines))
}
