//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "router.toml",
    "config.toml",
    "./config/router.toml",
    "/etc/flowcatalyst/router.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading router configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("FLOWCATALYST_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("FLOWCATALYST_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("FLOWCATALYST_HTTP_HOST") {
            config.http.host = val;
        }

        if let Ok(val) = env::var("FLOWCATALYST_MEDIATOR_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                config.mediator.timeout_ms = timeout;
            }
        }
        if let Ok(val) = env::var("FLOWCATALYST_MEDIATOR_MAX_CONNECTIONS_PER_HOST") {
            if let Ok(n) = val.parse() {
                config.mediator.max_connections_per_host = n;
            }
        }

        if let Ok(val) = env::var("FLOWCATALYST_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file_present() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let loader = ConfigLoader::new();
        let config = loader.load().unwrap();
        assert_eq!(config.http.port, 8080);
        assert!(config.pools.is_empty());
    }

    #[test]
    fn loads_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.toml");
        std::fs::write(&path, AppConfig::example_toml()).unwrap();

        let loader = ConfigLoader::with_path(&path);
        let config = loader.load().unwrap();
        assert_eq!(config.pools.len(), 3);
        assert_eq!(config.queues.len(), 1);
    }
}
