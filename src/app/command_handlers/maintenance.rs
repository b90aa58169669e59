use crate::app::command_support::{ready_processor, render_lines};
use crate::shared::time::now_utc;
use std::path::Path;

pub fn cmd_purge(config: Option<&Path>) -> Result<String, String> {
    let processor = ready_processor(config)?;
    let summary = processor
        .maintenance(now_utc())
        .map_err(|e| e.to_string())?;

    let mut lines = vec![
        format!(
            "retention_days={}",
            processor.settings().rollback.retention_days
        ),
        format!("snapshots_purged={}", summary.snapshots_purged.len()),
        format!("learning_task_types={}", summary.learning.task_types),
        format!("learning_records_dropped={}", summary.learning.records_dropped),
    ];
    for id in summary.snapshots_purged {
        lines.push(format!("purged={id}"));
    }
    Ok(render_lines(lines))
}
