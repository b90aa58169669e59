use super::{ConfigError, Settings, CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE_NAME};
use std::path::{Path, PathBuf};

pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE_NAME),
    }
}

pub fn load_settings(explicit: Option<&Path>) -> Result<Settings, ConfigError> {
    let path = resolve_config_path(explicit);
    let settings = Settings::from_path(&path)?;
    settings.validate()?;
    Ok(settings)
}
