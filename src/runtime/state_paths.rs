use super::RuntimeError;
use crate::shared::vault_access::VaultScope;
use std::fs;
use std::path::PathBuf;

pub const NEEDS_ACTION_DIR: &str = "Needs_Action";
pub const IN_PROGRESS_DIR: &str = "In_Progress";
pub const DONE_DIR: &str = "Done";
pub const NEEDS_ATTENTION_DIR: &str = "Needs_Attention";
pub const ROLLBACK_ARCHIVE_DIR: &str = "Rollback_Archive";
pub const LEARNING_DATA_DIR: &str = "Learning_Data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPaths {
    pub vault_root: PathBuf,
    pub state_root: PathBuf,
}

impl VaultPaths {
    pub fn new(vault_root: impl Into<PathBuf>, state_root: impl Into<PathBuf>) -> Self {
        Self {
            vault_root: vault_root.into(),
            state_root: state_root.into(),
        }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.needs_action_dir(),
            self.in_progress_dir(),
            self.done_dir(),
            self.rollback_archive_dir(),
            self.learning_data_dir(),
            self.state_root.join("logs"),
            self.daemon_dir(),
        ]
    }

    /// Directories scanned for tasks the core may act on.
    pub fn task_directories(&self) -> [PathBuf; 2] {
        [self.needs_action_dir(), self.in_progress_dir()]
    }

    pub fn needs_action_dir(&self) -> PathBuf {
        self.vault_root.join(NEEDS_ACTION_DIR)
    }

    pub fn in_progress_dir(&self) -> PathBuf {
        self.vault_root.join(IN_PROGRESS_DIR)
    }

    pub fn done_dir(&self) -> PathBuf {
        self.vault_root.join(DONE_DIR)
    }

    pub fn rollback_archive_dir(&self) -> PathBuf {
        self.vault_root.join(ROLLBACK_ARCHIVE_DIR)
    }

    pub fn learning_data_dir(&self) -> PathBuf {
        self.vault_root.join(LEARNING_DATA_DIR)
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.state_root.join("daemon")
    }

    pub fn stop_signal_path(&self) -> PathBuf {
        self.daemon_dir().join("stop")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.state_root.join("logs/operations.log")
    }

    pub fn runtime_log_path(&self) -> PathBuf {
        self.state_root.join("logs/runtime.log")
    }

    /// What task steps may touch: the vault minus the state dir, the
    /// snapshot archive and the learning data.
    pub fn step_scope(&self) -> VaultScope {
        VaultScope::new(&self.vault_root)
            .protecting(&self.state_root)
            .protecting(self.rollback_archive_dir())
            .protecting(self.learning_data_dir())
    }
}

pub fn bootstrap_vault(paths: &VaultPaths) -> Result<(), RuntimeError> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path).map_err(|source| RuntimeError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}
