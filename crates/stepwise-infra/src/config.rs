//! Engine configuration loader for Stepwise.
//!
//! Reads `stepwise.toml` from the data directory (`~/.stepwise/` in production)
//! or an explicit path and deserializes it into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use stepwise_types::config::EngineConfig;

/// File name of the configuration inside the data directory.
pub const CONFIG_FILE_NAME: &str = "stepwise.toml";

/// File name of the definition document inside the data directory.
pub const DEFINITIONS_FILE_NAME: &str = "workflows.json";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "STEPWISE_DATA_DIR";

/// Resolve the data directory: `STEPWISE_DATA_DIR`, else `~/.stepwise`.
pub fn resolve_data_dir() -> PathBuf {
    data_dir_from(std::env::var(DATA_DIR_ENV).ok(), dirs::home_dir())
}

fn data_dir_from(env: Option<String>, home: Option<PathBuf>) -> PathBuf {
    match env.filter(|v| !v.trim().is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => home
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stepwise"),
    }
}

/// SQLite URL of the database inside `data_dir`.
pub fn default_database_url(data_dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", data_dir.join("stepwise.db").display())
}

/// Load configuration from `path`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but cannot be read or parsed, logs a warning and
///   returns the default.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

/// Fill in the paths left unset by the file with locations under `data_dir`.
pub fn apply_data_dir_defaults(config: &mut EngineConfig, data_dir: &Path) {
    if config.definitions_file.is_none() {
        config.definitions_file = Some(data_dir.join(DEFINITIONS_FILE_NAME));
    }
    if config.database_url.is_none() {
        config.database_url = Some(default_database_url(data_dir));
    }
}
