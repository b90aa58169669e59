#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to create runtime path {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write runtime state {path}: {source}")]
    WriteState {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("task store error: {0}")]
    Task(#[from] crate::task::TaskError),
    #[error("audit log error: {0}")]
    Audit(#[from] crate::audit::AuditError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] crate::rollback::SnapshotError),
    #[error("learning store error: {0}")]
    Learning(#[from] crate::learning::LearningError),
    #[error("execution error: {0}")]
    Execution(#[from] crate::execution::ExecutionError),
    #[error("task {task_id} not found")]
    TaskNotFound { task_id: String },
    #[error("worker completion channel disconnected")]
    ChannelDisconnected,
}
