use crate::config::{self, Settings};
use crate::runtime::TaskProcessor;
use std::path::Path;

pub fn load_settings(config: Option<&Path>) -> Result<Settings, String> {
    config::load_settings(config).map_err(|e| e.to_string())
}

/// Settings loaded and the vault layout created, ready for any command.
pub fn ready_processor(config: Option<&Path>) -> Result<TaskProcessor, String> {
    let settings = load_settings(config)?;
    let processor = TaskProcessor::new(settings);
    processor.bootstrap().map_err(|e| e.to_string())?;
    Ok(processor)
}

pub fn render_lines(lines: Vec<String>) -> String {
    lines.join("\n")
}
