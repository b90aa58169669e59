pub mod error;
pub mod load;
pub mod paths;
pub mod settings;

pub use error::ConfigError;
pub use load::{load_settings, resolve_config_path};
pub use paths::{CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE_NAME, DEFAULT_STATE_DIR_NAME};
pub use settings::{
    ExecutionConfig, FeatureFlags, LearningConfig, RecoveryConfig, RiskConfig, RiskWeights,
    RollbackConfig, SchedulerConfig, Settings, SlaConfig,
};
