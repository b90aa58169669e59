pub const DEFAULT_CONFIG_FILE_NAME: &str = "taskgate.yaml";
pub const CONFIG_ENV_VAR: &str = "TASKGATE_CONFIG";
pub const DEFAULT_STATE_DIR_NAME: &str = ".taskgate";
