//! Centralized path utilities

use std::path::PathBuf;

use crate::constants;

/// Get the agentline config directory (~/.agentline)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(constants::CONFIG_DIR_NAME)
}

/// Default config file (~/.agentline/config.toml)
pub fn config_file() -> PathBuf {
    config_dir().join(constants::CONFIG_FILE_NAME)
}

/// Default chat database (~/.agentline/agentline.db)
pub fn database_path() -> PathBuf {
    config_dir().join(constants::DATABASE_FILE_NAME)
}
