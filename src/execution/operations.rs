use crate::shared::fs_atomic::{atomic_write_file, copy_file_atomic};
use crate::shared::vault_access::{VaultAccessError, VaultScope};
use crate::task::{Operation, Step, Task};
use std::fs;
use std::path::{Path, PathBuf};

const SUMMARY_MAX_LINES: usize = 20;
const SUMMARY_FALLBACK_LINES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("step rejected: {0}")]
    Rejected(String),
    #[error("step precondition failed: {0}")]
    Precondition(String),
    #[error("step io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Injected(String),
}

impl From<VaultAccessError> for StepError {
    fn from(err: VaultAccessError) -> Self {
        StepError::Rejected(err.to_string())
    }
}

/// Vault-confined paths for one step, resolved before anything runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStep {
    pub path: Option<PathBuf>,
    pub to: Option<PathBuf>,
}

pub struct StepContext<'a> {
    pub vault_root: &'a Path,
    pub task: &'a Task,
    pub resolved: &'a ResolvedStep,
    /// 1 for the first try, incremented by recovery retries.
    pub attempt: u32,
}

/// Runs one validated step. Implementations only ever receive steps that
/// passed [`preflight`].
pub trait StepRunner: Send + Sync {
    fn run(&self, ctx: &StepContext<'_>, step: &Step) -> Result<String, StepError>;
}

/// Allowlist and vault-confinement check that runs before a step touches the
/// filesystem. Protected directories in `scope` are refused like paths
/// outside the vault.
pub fn preflight(scope: &VaultScope, task: &Task, step: &Step) -> Result<ResolvedStep, StepError> {
    let permitted = step.op.is_allowlisted() || (step.op == Operation::DeleteFile && task.destructive);
    if !permitted {
        let reason = if step.op == Operation::DeleteFile {
            "delete-file requires `destructive: true`".to_string()
        } else {
            format!("operation `{}` is not in the allowlist", step.op)
        };
        return Err(StepError::Rejected(reason));
    }

    let path = step
        .path
        .as_deref()
        .map(|raw| scope.resolve(raw))
        .transpose()?;
    let to = match (&step.op, step.to.as_deref()) {
        (Operation::RenameFile, Some(name)) => {
            if name.contains('/') || name.contains('\\') || name == ".." || name == "." {
                return Err(StepError::Rejected(format!(
                    "rename target `{name}` must be a bare file name"
                )));
            }
            let source = path.as_ref().ok_or_else(|| {
                StepError::Rejected("rename-file requires `path`".to_string())
            })?;
            let parent = source.parent().ok_or_else(|| {
                StepError::Rejected("rename-file source has no parent".to_string())
            })?;
            Some(scope.resolve(&parent.join(name).display().to_string())?)
        }
        (_, Some(raw)) => Some(scope.resolve(raw)?),
        (_, None) => None,
    };
    Ok(ResolvedStep { path, to })
}

/// File-system implementation of the allowlisted operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct VaultOperations;

impl StepRunner for VaultOperations {
    fn run(&self, ctx: &StepContext<'_>, step: &Step) -> Result<String, StepError> {
        let destructive = ctx.task.destructive;
        match step.op {
            Operation::CreateFile => {
                let target = required(&ctx.resolved.path, "create-file", "path")?;
                guard_overwrite(target, destructive)?;
                ensure_parent(target)?;
                let content = step
                    .content
                    .clone()
                    .unwrap_or_else(|| default_file_content(step, target));
                atomic_write_file(target, content.as_bytes()).map_err(|e| io_error(target, e))?;
                Ok(format!("created {}", display_relative(ctx.vault_root, target)))
            }
            Operation::CopyFile => {
                let source = required(&ctx.resolved.path, "copy-file", "path")?;
                let target = required(&ctx.resolved.to, "copy-file", "to")?;
                require_file(source)?;
                guard_overwrite(target, destructive)?;
                let bytes = copy_file_atomic(source, target).map_err(|e| io_error(target, e))?;
                Ok(format!(
                    "copied {} -> {} ({bytes} bytes)",
                    display_relative(ctx.vault_root, source),
                    display_relative(ctx.vault_root, target)
                ))
            }
            Operation::CreateFolder => {
                let target = required(&ctx.resolved.path, "create-folder", "path")?;
                if target.is_file() {
                    return Err(StepError::Precondition(format!(
                        "{} exists and is a file",
                        display_relative(ctx.vault_root, target)
                    )));
                }
                fs::create_dir_all(target).map_err(|e| io_error(target, e))?;
                Ok(format!(
                    "folder {} ready",
                    display_relative(ctx.vault_root, target)
                ))
            }
            Operation::RenameFile | Operation::MoveFile => {
                let op = step.op.as_str();
                let source = required(&ctx.resolved.path, op, "path")?;
                let target = required(&ctx.resolved.to, op, "to")?;
                require_file(source)?;
                guard_overwrite(target, destructive)?;
                ensure_parent(target)?;
                fs::rename(source, target).map_err(|e| io_error(source, e))?;
                Ok(format!(
                    "moved {} -> {}",
                    display_relative(ctx.vault_root, source),
                    display_relative(ctx.vault_root, target)
                ))
            }
            Operation::SummarizeContent => {
                let source = ctx
                    .resolved
                    .path
                    .clone()
                    .unwrap_or_else(|| ctx.task.source_path.clone());
                require_file(&source)?;
                let target = match &ctx.resolved.to {
                    Some(target) => target.clone(),
                    None => summary_path_for(&source),
                };
                guard_overwrite(&target, destructive)?;
                let raw = fs::read_to_string(&source).map_err(|e| io_error(&source, e))?;
                let summary = summarize(&raw);
                ensure_parent(&target)?;
                atomic_write_file(&target, summary.as_bytes()).map_err(|e| io_error(&target, e))?;
                Ok(format!(
                    "summarized {} into {}",
                    display_relative(ctx.vault_root, &source),
                    display_relative(ctx.vault_root, &target)
                ))
            }
            Operation::DeleteFile => {
                let target = required(&ctx.resolved.path, "delete-file", "path")?;
                require_file(target)?;
                fs::remove_file(target).map_err(|e| io_error(target, e))?;
                Ok(format!("deleted {}", display_relative(ctx.vault_root, target)))
            }
            _ => Err(StepError::Rejected(format!(
                "no executor for operation `{}`",
                step.op
            ))),
        }
    }
}

fn required<'a>(value: &'a Option<PathBuf>, op: &str, field: &str) -> Result<&'a PathBuf, StepError> {
    value
        .as_ref()
        .ok_or_else(|| StepError::Precondition(format!("{op} requires `{field}`")))
}

fn require_file(path: &Path) -> Result<(), StepError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(StepError::Precondition(format!(
            "source {} does not exist",
            path.display()
        )))
    }
}

fn guard_overwrite(target: &Path, destructive: bool) -> Result<(), StepError> {
    if target.exists() && !destructive {
        return Err(StepError::Precondition(format!(
            "{} already exists; overwriting requires `destructive: true`",
            target.display()
        )));
    }
    Ok(())
}

fn ensure_parent(target: &Path) -> Result<(), StepError> {
    match target.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(|e| io_error(parent, e)),
        None => Ok(()),
    }
}

fn default_file_content(step: &Step, target: &Path) -> String {
    let title = step
        .description
        .clone()
        .or_else(|| {
            target
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| step.id.to_string());
    format!("# {title}\n")
}

pub(crate) fn summary_path_for(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("content");
    source.with_file_name(format!("{stem}.summary.md"))
}

/// Headings and bold list items, or the first few non-empty lines when the
/// document has neither.
pub fn summarize(raw: &str) -> String {
    let body = strip_frontmatter(raw);
    let mut picked: Vec<&str> = body
        .lines()
        .map(str::trim_end)
        .filter(|line| line.starts_with('#') || line.trim_start().starts_with("- **"))
        .take(SUMMARY_MAX_LINES)
        .collect();
    if picked.is_empty() {
        picked = body
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .take(SUMMARY_FALLBACK_LINES)
            .collect();
    }
    let mut out = String::from("# Summary\n\n");
    for line in picked {
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn strip_frontmatter(raw: &str) -> &str {
    let Some(after_open) = raw.strip_prefix("---\n") else {
        return raw;
    };
    match after_open.find("\n---\n") {
        Some(end) => &after_open[end + 5..],
        None => raw,
    }
}

fn display_relative(root: &Path, path: &Path) -> String {
    let canonical_root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    path.strip_prefix(&canonical_root)
        .or_else(|_| path.strip_prefix(root))
        .unwrap_or(path)
        .display()
        .to_string()
}

fn io_error(path: &Path, source: std::io::Error) -> StepError {
    StepError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::{StepId, TaskId};
    use tempfile::tempdir;

    fn task_in(vault: &Path) -> Task {
        Task::new(
            TaskId::parse("T.md").expect("task id"),
            vault.join("Needs_Action/T.md"),
        )
    }

    fn step(op: Operation, path: Option<&str>, to: Option<&str>) -> Step {
        let mut step = Step::new(StepId::parse("s1").expect("step id"), op);
        step.path = path.map(str::to_string);
        step.to = to.map(str::to_string);
        step
    }

    fn scope(vault: &Path) -> VaultScope {
        VaultScope::new(vault)
            .protecting(vault.join(".taskgate"))
            .protecting(vault.join("Rollback_Archive"))
    }

    fn run(vault: &Path, task: &Task, step: &Step) -> Result<String, StepError> {
        let resolved = preflight(&scope(vault), task, step)?;
        VaultOperations.run(
            &StepContext {
                vault_root: vault,
                task,
                resolved: &resolved,
                attempt: 1,
            },
            step,
        )
    }

    #[test]
    fn preflight_rejects_non_allowlisted_and_outside_paths() {
        let dir = tempdir().expect("tempdir");
        let task = task_in(dir.path());

        let network = step(Operation::HttpRequest, Some("api"), None);
        assert!(matches!(
            preflight(&scope(dir.path()), &task, &network),
            Err(StepError::Rejected(_))
        ));

        let escape = step(Operation::CreateFile, Some("../outside.md"), None);
        assert!(matches!(
            preflight(&scope(dir.path()), &task, &escape),
            Err(StepError::Rejected(_))
        ));
        assert!(!dir.path().parent().expect("parent").join("outside.md").exists());

        let delete = step(Operation::DeleteFile, Some("a.md"), None);
        assert!(preflight(&scope(dir.path()), &task, &delete).is_err());
        let mut destructive = task_in(dir.path());
        destructive.destructive = true;
        assert!(preflight(&scope(dir.path()), &destructive, &delete).is_ok());
    }

    #[test]
    fn steps_cannot_reach_logs_or_snapshots() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join(".taskgate/logs")).expect("logs");
        fs::write(dir.path().join(".taskgate/logs/operations.log"), "{}\n").expect("log");
        let task = task_in(dir.path());

        let err = run(
            dir.path(),
            &task,
            &step(
                Operation::MoveFile,
                Some(".taskgate/logs/operations.log"),
                Some("Done/moved.log"),
            ),
        )
        .expect_err("audit log is protected");
        assert!(matches!(err, StepError::Rejected(_)));
        assert!(dir.path().join(".taskgate/logs/operations.log").is_file());

        let mut into_archive = step(Operation::CreateFile, Some("Rollback_Archive/x/manifest.json"), None);
        into_archive.content = Some("{}".to_string());
        assert!(matches!(
            run(dir.path(), &task, &into_archive),
            Err(StepError::Rejected(_))
        ));
        assert!(!dir.path().join("Rollback_Archive/x").exists());
    }

    #[test]
    fn create_copy_move_and_folder_operate_inside_vault() {
        let dir = tempdir().expect("tempdir");
        let task = task_in(dir.path());

        run(dir.path(), &task, &step(Operation::CreateFolder, Some("Done/out"), None))
            .expect("create folder");
        let mut create = step(Operation::CreateFile, Some("Done/out/a.md"), None);
        create.content = Some("alpha".to_string());
        run(dir.path(), &task, &create).expect("create file");
        run(
            dir.path(),
            &task,
            &step(Operation::CopyFile, Some("Done/out/a.md"), Some("Done/out/b.md")),
        )
        .expect("copy file");
        run(
            dir.path(),
            &task,
            &step(Operation::MoveFile, Some("Done/out/b.md"), Some("Done/moved/c.md")),
        )
        .expect("move file");
        run(
            dir.path(),
            &task,
            &step(Operation::RenameFile, Some("Done/moved/c.md"), Some("d.md")),
        )
        .expect("rename file");

        assert_eq!(
            fs::read_to_string(dir.path().join("Done/out/a.md")).expect("read a"),
            "alpha"
        );
        assert!(!dir.path().join("Done/out/b.md").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("Done/moved/d.md")).expect("read d"),
            "alpha"
        );
    }

    #[test]
    fn overwrites_require_destructive_flag() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("existing.md"), "keep").expect("seed");
        let task = task_in(dir.path());
        let err = run(
            dir.path(),
            &task,
            &step(Operation::CreateFile, Some("existing.md"), None),
        )
        .expect_err("overwrite refused");
        assert!(matches!(err, StepError::Precondition(_)));
        assert_eq!(
            fs::read_to_string(dir.path().join("existing.md")).expect("read"),
            "keep"
        );
    }

    #[test]
    fn rename_rejects_path_separators() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("a.md"), "x").expect("seed");
        let task = task_in(dir.path());
        let err = preflight(
            &scope(dir.path()),
            &task,
            &step(Operation::RenameFile, Some("a.md"), Some("../b.md")),
        )
        .expect_err("separator rejected");
        assert!(matches!(err, StepError::Rejected(_)));
    }

    #[test]
    fn summarize_keeps_headings_and_bold_items() {
        let summary = summarize(
            "---\ntype: x\n---\n# Title\nplain text\n- **Owner**: ops\n## Section\nmore\n",
        );
        assert_eq!(summary, "# Summary\n\n# Title\n- **Owner**: ops\n## Section\n");

        let fallback = summarize("one\n\ntwo\nthree\n");
        assert_eq!(fallback, "# Summary\n\none\ntwo\nthree\n");
    }

    #[test]
    fn summarize_defaults_to_task_file_and_sibling_target() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("Needs_Action")).expect("mkdir");
        let task = task_in(dir.path());
        fs::write(&task.source_path, "# Heading\nbody\n").expect("seed task");
        run(dir.path(), &task, &step(Operation::SummarizeContent, None, None))
            .expect("summarize");
        let written = fs::read_to_string(dir.path().join("Needs_Action/T.summary.md"))
            .expect("summary written");
        assert!(written.contains("# Heading"));
    }
}
