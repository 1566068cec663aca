//! Centralized path utilities

use std::path::PathBuf;

use crate::constants::files;

/// Get the weaver config directory (~/.weaver)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(files::CONFIG_DIR_NAME)
}

/// Get the config file (~/.weaver/config.toml)
pub fn config_file() -> PathBuf {
    config_dir().join(files::CONFIG_FILE_NAME)
}

/// Get the default database file (~/.weaver/weaver.db)
pub fn default_db_path() -> PathBuf {
    config_dir().join(files::DB_FILE_NAME)
}
