use super::{ConfigError, DEFAULT_STATE_DIR_NAME};
use crate::runtime::VaultPaths;
use crate::task::Classification;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub vault_path: PathBuf,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub sla: SlaConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_parallel_tasks: default_max_parallel_tasks(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub auto_execute_simple: bool,
    #[serde(default)]
    pub auto_execute_complex: bool,
    /// Services network-type steps may reach, matched case-insensitively by host or name.
    #[serde(default)]
    pub allowed_external_services: Vec<String>,
    #[serde(default = "default_step_estimate_secs")]
    pub default_step_estimate_secs: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            auto_execute_simple: false,
            auto_execute_complex: false,
            allowed_external_services: Vec::new(),
            default_step_estimate_secs: default_step_estimate_secs(),
        }
    }
}

impl ExecutionConfig {
    pub fn is_service_allowed(&self, service: &str) -> bool {
        let wanted = service.trim().to_ascii_lowercase();
        !wanted.is_empty()
            && self
                .allowed_external_services
                .iter()
                .any(|allowed| allowed.trim().to_ascii_lowercase() == wanted)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SlaConfig {
    #[serde(default = "default_sla_simple_minutes")]
    pub simple_minutes: f64,
    #[serde(default = "default_sla_complex_minutes")]
    pub complex_minutes: f64,
    #[serde(default = "default_prediction_threshold")]
    pub prediction_threshold: f64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            simple_minutes: default_sla_simple_minutes(),
            complex_minutes: default_sla_complex_minutes(),
            prediction_threshold: default_prediction_threshold(),
        }
    }
}

impl SlaConfig {
    pub fn threshold_secs(&self, classification: Classification) -> f64 {
        match classification {
            Classification::Simple => self.simple_minutes * 60.0,
            Classification::Complex
            | Classification::ManualReview
            | Classification::Unclassified => self.complex_minutes * 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_recovery_attempts")]
    pub max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_recovery_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    #[serde(default)]
    pub weights: RiskWeights,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RiskWeights {
    #[serde(default = "default_weight_sla")]
    pub sla: f64,
    #[serde(default = "default_weight_complexity")]
    pub complexity: f64,
    #[serde(default = "default_weight_impact")]
    pub impact: f64,
    #[serde(default = "default_weight_failure_rate")]
    pub failure_rate: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            sla: default_weight_sla(),
            complexity: default_weight_complexity(),
            impact: default_weight_impact(),
            failure_rate: default_weight_failure_rate(),
        }
    }
}

impl RiskWeights {
    pub fn sum(&self) -> f64 {
        self.sla + self.complexity + self.impact + self.failure_rate
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RollbackConfig {
    #[serde(default = "default_rollback_retention_days")]
    pub retention_days: u32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            retention_days: default_rollback_retention_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LearningConfig {
    #[serde(default = "default_learning_window_days")]
    pub window_days: u32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            window_days: default_learning_window_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub self_healing: bool,
    #[serde(default = "default_true")]
    pub predictive_sla: bool,
    #[serde(default = "default_true")]
    pub risk_scoring: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            self_healing: true,
            predictive_sla: true,
            risk_scoring: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    30
}

fn default_max_parallel_tasks() -> usize {
    3
}

fn default_task_timeout_secs() -> u64 {
    15 * 60
}

fn default_step_estimate_secs() -> f64 {
    15.0
}

fn default_sla_simple_minutes() -> f64 {
    2.0
}

fn default_sla_complex_minutes() -> f64 {
    10.0
}

fn default_prediction_threshold() -> f64 {
    0.7
}

fn default_max_recovery_attempts() -> u32 {
    3
}

fn default_weight_sla() -> f64 {
    0.3
}

fn default_weight_complexity() -> f64 {
    0.2
}

fn default_weight_impact() -> f64 {
    0.3
}

fn default_weight_failure_rate() -> f64 {
    0.2
}

fn default_rollback_retention_days() -> u32 {
    7
}

fn default_learning_window_days() -> u32 {
    30
}

impl Settings {
    /// Settings with every section at its default, rooted at `vault_path`.
    pub fn for_vault(vault_path: impl Into<PathBuf>) -> Self {
        Self {
            vault_path: vault_path.into(),
            state_dir: None,
            scheduler: SchedulerConfig::default(),
            execution: ExecutionConfig::default(),
            sla: SlaConfig::default(),
            recovery: RecoveryConfig::default(),
            risk: RiskConfig::default(),
            rollback: RollbackConfig::default(),
            learning: LearningConfig::default(),
            features: FeatureFlags::default(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn state_root(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => dir.clone(),
            None => self.vault_path.join(DEFAULT_STATE_DIR_NAME),
        }
    }

    pub fn paths(&self) -> VaultPaths {
        VaultPaths::new(&self.vault_path, self.state_root())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.vault_path.is_absolute() {
            return Err(ConfigError::Settings(
                "`vault_path` must be an absolute path".to_string(),
            ));
        }
        if let Some(dir) = &self.state_dir {
            if !dir.is_absolute() {
                return Err(ConfigError::Settings(
                    "`state_dir` must be an absolute path".to_string(),
                ));
            }
        }
        if self.scheduler.interval_secs == 0 {
            return Err(ConfigError::Settings(
                "`scheduler.interval_secs` must be >= 1".to_string(),
            ));
        }
        if self.scheduler.max_parallel_tasks == 0 {
            return Err(ConfigError::Settings(
                "`scheduler.max_parallel_tasks` must be >= 1".to_string(),
            ));
        }
        if self.scheduler.task_timeout_secs == 0 {
            return Err(ConfigError::Settings(
                "`scheduler.task_timeout_secs` must be >= 1".to_string(),
            ));
        }
        if !(self.execution.default_step_estimate_secs > 0.0) {
            return Err(ConfigError::Settings(
                "`execution.default_step_estimate_secs` must be > 0".to_string(),
            ));
        }
        if self
            .execution
            .allowed_external_services
            .iter()
            .any(|service| service.trim().is_empty())
        {
            return Err(ConfigError::Settings(
                "`execution.allowed_external_services` entries must be non-empty".to_string(),
            ));
        }
        if !(self.sla.simple_minutes > 0.0) || !(self.sla.complex_minutes > 0.0) {
            return Err(ConfigError::Settings(
                "`sla.simple_minutes` and `sla.complex_minutes` must be > 0".to_string(),
            ));
        }
        let threshold = self.sla.prediction_threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(ConfigError::Settings(
                "`sla.prediction_threshold` must be between 0 and 1 (exclusive)".to_string(),
            ));
        }
        if self.recovery.max_attempts == 0 {
            return Err(ConfigError::Settings(
                "`recovery.max_attempts` must be >= 1".to_string(),
            ));
        }
        let weights = self.risk.weights;
        for (name, value) in [
            ("sla", weights.sla),
            ("complexity", weights.complexity),
            ("impact", weights.impact),
            ("failure_rate", weights.failure_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Settings(format!(
                    "`risk.weights.{name}` must be within [0, 1]"
                )));
            }
        }
        if (weights.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::Settings(format!(
                "`risk.weights` must sum to 1.0 (got {:.4})",
                weights.sum()
            )));
        }
        if self.rollback.retention_days == 0 {
            return Err(ConfigError::Settings(
                "`rollback.retention_days` must be >= 1".to_string(),
            ));
        }
        if self.learning.window_days == 0 {
            return Err(ConfigError::Settings(
                "`learning.window_days` must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
