use super::VaultPaths;
use crate::shared::logging::append_jsonl_line;
use crate::shared::time::{format_millis, now_utc};

/// Best-effort operational log line; failures to write are ignored.
pub fn append_runtime_log(paths: &VaultPaths, level: &str, event: &str, message: &str) {
    let payload = serde_json::json!({
        "timestamp": format_millis(now_utc()),
        "level": level,
        "event": event,
        "message": message,
    });

    let Ok(line) = serde_json::to_string(&payload) else {
        return;
    };
    let _ = append_jsonl_line(&paths.runtime_log_path(), &line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn writes_one_json_object_per_call() {
        let dir = tempdir().expect("tempdir");
        let paths = VaultPaths::new(dir.path(), dir.path().join(".taskgate"));
        append_runtime_log(&paths, "info", "scheduler.started", "interval=30s");
        append_runtime_log(&paths, "error", "worker.error", "boom");

        let raw = fs::read_to_string(paths.runtime_log_path()).expect("read log");
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "scheduler.started");
        assert_eq!(lines[1]["level"], "error");
    }
}
