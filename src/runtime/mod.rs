pub mod lease;
pub mod logging;
pub mod processor;
pub mod recovery;
pub mod scheduler;
pub mod slots;
pub mod state_paths;
pub(crate) mod worker_primitives;

pub use crate::shared::errors::RuntimeError;
pub use lease::{Lease, LeaseHolder};
pub use logging::append_runtime_log;
pub use processor::{MaintenanceSummary, TaskProcessor, TaskRun};
pub use recovery::recover_stale_tasks;
pub use scheduler::{IterationReport, Scheduler};
pub use slots::{Scheduled, SlotScheduler};
pub use state_paths::{bootstrap_vault, VaultPaths};

use std::fs;

/// Asks a running scheduler to stop by dropping the signal file it polls.
pub fn signal_stop(paths: &VaultPaths) -> Result<(), RuntimeError> {
    let path = paths.stop_signal_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    fs::write(&path, crate::shared::time::now_secs().to_string()).map_err(|source| {
        RuntimeError::WriteState {
            path: path.display().to_string(),
            source,
        }
    })
}
