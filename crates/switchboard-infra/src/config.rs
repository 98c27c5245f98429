//! Configuration loader for Switchboard.
//!
//! Reads a TOML file into [`SwitchboardConfig`]. Falls back to defaults
//! when the file is missing or malformed, so a bus can always start.

use std::path::{Path, PathBuf};

use switchboard_types::config::SwitchboardConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "SWITCHBOARD_CONFIG";

/// Resolve the config file path.
///
/// Priority:
/// 1. `SWITCHBOARD_CONFIG` environment variable
/// 2. `~/.switchboard/config.toml`
/// 3. `.switchboard/config.toml` relative to the working directory
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return PathBuf::from(path);
    }
    let base = dirs::home_dir()
        .map(|home| home.join(".switchboard"))
        .unwrap_or_else(|| PathBuf::from(".switchboard"));
    base.join("config.toml")
}

/// Load configuration from `path`.
///
/// - Missing file: defaults (debug log).
/// - Unreadable or unparsable file: defaults with a warning.
pub async fn load_config(path: &Path) -> SwitchboardConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return SwitchboardConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return SwitchboardConfig::default();
        }
    };

    match toml::from_str::<SwitchboardConfig>(&content) {
        Ok(config) => {
            tracing::debug!(
                path = %path.display(),
                agents = config.agents.len(),
                "loaded configuration"
            );
            config
        }
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            SwitchboardConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_types::config::{BackoffStrategy, StoreFullPolicy};
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("config.toml")).await;
        assert_eq!(config, SwitchboardConfig::default());
    }

    #[tokio::test]
    async fn load_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        tokio::fs::write(
            &path,
            r#"
[bus]
max_stored_events = 10
store_full_policy = "reject"
max_dead_letters = 5

[bus.retry]
backoff = "exponential"
base_delay_ms = 0

[[agents]]
agent_id = "pricing-1"
agent_type = "pricing"
"#,
        )
        .await
        .unwrap();

        let config = load_config(&path).await;
        assert_eq!(config.bus.max_stored_events, Some(10));
        assert_eq!(config.bus.store_full_policy, StoreFullPolicy::Reject);
        assert_eq!(config.bus.max_dead_letters, 5);
        assert_eq!(config.bus.retry.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.bus.retry.base_delay_ms, 0);
        assert_eq!(config.agents.len(), 1);
    }

    #[tokio::test]
    async fn load_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        tokio::fs::write(&path, "this is not { valid toml !!!").await.unwrap();

        let config = load_config(&path).await;
        assert_eq!(config, SwitchboardConfig::default());
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        // Either the env override or the home-relative default.
        let path = default_config_path();
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(explicit) => assert_eq!(path, PathBuf::from(explicit)),
            Err(_) => assert!(path.ends_with(".switchboard/config.toml")),
        }
    }
}
