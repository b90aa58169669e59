use crate::app::command_support::{load_settings, ready_processor, render_lines};
use crate::runtime::{append_runtime_log, signal_stop, Scheduler};
use std::path::Path;
use std::sync::atomic::AtomicBool;

pub fn cmd_run(config: Option<&Path>) -> Result<String, String> {
    let processor = ready_processor(config)?;
    let paths = processor.paths().clone();
    let stop = AtomicBool::new(false);
    let mut scheduler = Scheduler::new(processor);
    scheduler.run_loop(&stop).map_err(|e| {
        append_runtime_log(&paths, "error", "scheduler.failed", &e.to_string());
        e.to_string()
    })?;
    Ok(format!("stopped\nvault={}", paths.vault_root.display()))
}

pub fn cmd_once(config: Option<&Path>) -> Result<String, String> {
    let processor = ready_processor(config)?;
    let mut scheduler = Scheduler::new(processor);
    let report = scheduler.drain().map_err(|e| e.to_string())?;

    let mut lines = vec![
        format!("classified={}", report.classified),
        format!("dispatched={}", report.dispatched.len()),
        format!("completed={}", report.completed.len()),
        format!("timed_out={}", report.timed_out.len()),
        format!("errors={}", report.errors),
    ];
    for run in &report.completed {
        lines.push(format!("task={} status={}", run.task_id, run.status));
    }
    for id in &report.timed_out {
        lines.push(format!("task={id} status=timeout"));
    }
    Ok(render_lines(lines))
}

pub fn cmd_stop(config: Option<&Path>) -> Result<String, String> {
    let settings = load_settings(config)?;
    let paths = settings.paths();
    signal_stop(&paths).map_err(|e| e.to_string())?;
    append_runtime_log(&paths, "info", "scheduler.stop.requested", "signal file written");
    Ok(format!(
        "stop requested\nsignal={}",
        paths.stop_signal_path().display()
    ))
}
