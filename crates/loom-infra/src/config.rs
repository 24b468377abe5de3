//! Engine configuration loader for Loom.
//!
//! Reads `loom.toml` from the data directory (`~/.loom/` in production) and
//! deserializes it into [`EngineConfig`]. Falls back to defaults when the file
//! is missing or malformed.

use std::path::Path;

use loom_types::config::EngineConfig;

pub const CONFIG_FILE: &str = "loom.toml";

/// Load engine configuration from `{data_dir}/loom.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config; omitted fields take their defaults.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// SQLite URL from `[storage]`, or the default file in the data directory.
pub fn resolve_database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config
        .storage
        .database_url
        .clone()
        .unwrap_or_else(|| crate::sqlite::database_url_in(data_dir))
}
