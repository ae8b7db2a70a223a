mod config;
pub mod database;

pub use config::{
    AppConfig, GestureConfig, RemoteConfig, SessionDefaults, SourceEntry, SourcesConfig,
    TimingConfig,
};
pub use database::{Database, SessionRecord, SqliteProgressStore, Stats};

use std::path::PathBuf;

use crate::error::ConfigError;

/// Returns the data directory, creating it if needed.
///
/// `APNEAFLOW_DATA_DIR` wins when set. Otherwise `~/.config/apneaflow[-dev]/`,
/// with the `-dev` suffix when `APNEAFLOW_ENV=dev`.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let dir = match std::env::var_os("APNEAFLOW_DATA_DIR") {
        Some(explicit) if !explicit.is_empty() => PathBuf::from(explicit),
        _ => {
            let base_dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config");
            let env = std::env::var("APNEAFLOW_ENV").unwrap_or_else(|_| "production".to_string());
            if env == "dev" {
                base_dir.join("apneaflow-dev")
            } else {
                base_dir.join("apneaflow")
            }
        }
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| ConfigError::DataDir(format!("{}: {e}", dir.display())))?;
    Ok(dir)
}
