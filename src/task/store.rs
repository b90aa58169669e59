use super::{parse_task_document, render_task_document, Task, TaskError, TaskStatus};
use crate::audit::{AuditEntry, AuditLog, AuditOp, AuditOutcome};
use crate::runtime::VaultPaths;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::TaskId;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

/// Reads and rewrites task files in place. Moving files between folders is
/// left to external tooling; the frontmatter `status` is authoritative.
#[derive(Debug, Clone)]
pub struct TaskStore {
    paths: VaultPaths,
    audit: AuditLog,
}

impl TaskStore {
    pub fn new(paths: VaultPaths, audit: AuditLog) -> Self {
        Self { paths, audit }
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn load(&self, path: &Path) -> Result<Task, TaskError> {
        let id = task_id_for_path(path)?;
        let raw = fs::read_to_string(path).map_err(|source| io_error(path, source))?;
        Ok(parse_task_document(id, path, &raw))
    }

    /// Every `*.md` task in the directories the core acts on, ordered by file
    /// name. Files whose names are not valid task ids are skipped.
    pub fn list_active(&self) -> Result<Vec<Task>, TaskError> {
        let mut files = Vec::new();
        for dir in self.paths.task_directories() {
            files.extend(list_markdown_files(&dir)?);
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut tasks = Vec::new();
        for path in files {
            match self.load(&path) {
                Ok(task) => tasks.push(task),
                Err(TaskError::InvalidId { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(tasks)
    }

    pub fn find(&self, id: &TaskId) -> Result<Option<Task>, TaskError> {
        for dir in self.paths.task_directories() {
            let candidate = dir.join(id.as_str());
            if candidate.is_file() {
                return self.load(&candidate).map(Some);
            }
        }
        Ok(None)
    }

    /// Re-reads a task from the file it was loaded from.
    pub fn reload(&self, task: &Task) -> Result<Task, TaskError> {
        self.load(&task.source_path)
    }

    pub fn persist(&self, task: &Task) -> Result<(), TaskError> {
        let rendered = render_task_document(task).map_err(|source| TaskError::Encode {
            path: task.source_path.display().to_string(),
            source,
        })?;
        atomic_write_file(&task.source_path, rendered.as_bytes())
            .map_err(|source| io_error(&task.source_path, source))
    }

    /// Applies a status change, persists it and records it in the audit log.
    pub fn transition(
        &self,
        task: &mut Task,
        next: TaskStatus,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), TaskError> {
        let from = task.transition_to(next, now)?;
        task.append_log(now, format!("status {from} -> {next}: {reason}"));
        self.persist(task)?;
        let outcome = match next {
            TaskStatus::Done | TaskStatus::InProgress => AuditOutcome::Success,
            TaskStatus::Blocked | TaskStatus::ManualReview => AuditOutcome::Flagged,
            TaskStatus::Pending | TaskStatus::Failed | TaskStatus::FailedRollback => {
                AuditOutcome::Failed
            }
        };
        self.audit.append(
            &AuditEntry::new(
                AuditOp::StatusChanged,
                task.id.as_str(),
                from.logical_folder(),
                outcome,
                format!("{from}->{next} version={} reason={reason}", task.version),
            )
            .with_dst(next.logical_folder()),
        )?;
        Ok(())
    }
}

fn list_markdown_files(dir: &Path) -> Result<Vec<PathBuf>, TaskError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(dir, err)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| io_error(dir, source))?;
        let path = entry.path();
        let is_markdown = path.extension().and_then(|ext| ext.to_str()) == Some("md");
        if is_markdown && path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

fn task_id_for_path(path: &Path) -> Result<TaskId, TaskError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TaskError::InvalidId {
            path: path.display().to_string(),
            reason: "file name is not valid utf-8".to_string(),
        })?;
    TaskId::parse(name).map_err(|reason| TaskError::InvalidId {
        path: path.display().to_string(),
        reason,
    })
}

fn io_error(path: &Path, source: std::io::Error) -> TaskError {
    TaskError::Io {
        path: path.display().to_string(),
        source,
    }
}
