//! Configuration Loader
//!
//! Layers defaults, an optional TOML file and `BOTRELAY__*` environment variables
//! using the `config` crate, then validates the merged result.

use super::error::ConfigResult;
use super::BotRelayConfig;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "BOTRELAY_CONFIG";
/// Prefix for per-field overrides, e.g. `BOTRELAY__COORDINATION__LOCK_TTL_MS`
pub const ENV_PREFIX: &str = "BOTRELAY";
const ENV_SEPARATOR: &str = "__";
const DEFAULT_CONFIG_FILE: &str = "botrelay.toml";

/// Loaded, validated configuration shared by every component of a process
#[derive(Debug)]
pub struct ConfigManager {
    config: BotRelayConfig,
    environment: String,
    source_file: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from the process environment.
    ///
    /// The file is taken from `BOTRELAY_CONFIG` when set (and must exist), otherwise
    /// `./botrelay.toml` is used if present.
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let (path, required) = match env::var(CONFIG_PATH_ENV) {
            Ok(path) => (PathBuf::from(path), true),
            Err(_) => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        let file = if required || path.exists() {
            Some(path)
        } else {
            None
        };
        Self::load_from_sources(file.as_deref(), None)
    }

    /// Load from an explicit file and an optional injected environment map.
    ///
    /// Passing `Some(map)` replaces the process environment, which keeps tests
    /// free of global `set_var` calls.
    pub fn load_from_sources(
        file: Option<&Path>,
        environment_overrides: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(environment_overrides),
        );

        let config: BotRelayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        let environment = detect_environment();
        debug!(
            environment = %environment,
            config = %serde_json::to_string(&config.sanitized())
                .unwrap_or_else(|_| "[serialization error]".to_string()),
            "Configuration loaded successfully"
        );

        Ok(Arc::new(Self {
            config,
            environment,
            source_file: file.map(Path::to_path_buf),
        }))
    }

    /// Wrap an already-built configuration (tests, embedding applications)
    pub fn from_config(config: BotRelayConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            environment: detect_environment(),
            source_file: None,
        }))
    }

    pub fn config(&self) -> &BotRelayConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn source_file(&self) -> Option<&Path> {
        self.source_file.as_deref()
    }
}

/// Current deployment environment, `development` when unset
pub fn detect_environment() -> String {
    env::var("BOTRELAY_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnmatchedEventPolicy;
    use std::io::Write;

    fn env_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_without_sources() {
        let manager = ConfigManager::load_from_sources(None, Some(HashMap::new())).unwrap();
        assert_eq!(manager.config().coordination.key_prefix, "botrelay");
        assert!(manager.source_file().is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let overrides = env_map(&[
            ("BOTRELAY__COORDINATION__LOCK_TTL_MS", "900"),
            ("BOTRELAY__COORDINATION__RENEWAL_INTERVAL_MS", "300"),
            ("BOTRELAY__GATEWAY__USER_TOKEN", "abc"),
            ("BOTRELAY__CORRELATION__UNMATCHED_POLICY", "requery"),
        ]);
        let manager = ConfigManager::load_from_sources(None, Some(overrides)).unwrap();
        let config = manager.config();
        assert_eq!(config.coordination.lock_ttl_ms, 900);
        assert_eq!(config.coordination.renewal_interval_ms, 300);
        assert_eq!(config.gateway.user_token, "abc");
        assert_eq!(
            config.correlation.unmatched_policy,
            UnmatchedEventPolicy::Requery
        );
    }

    #[test]
    fn test_file_then_environment_precedence() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[relay]\ntimeout_ms = 1234\n\n[wait]\npoll_interval_ms = 50\ntimeout_ms = 500\n"
        )
        .unwrap();

        let overrides = env_map(&[("BOTRELAY__RELAY__TIMEOUT_MS", "4321")]);
        let manager = ConfigManager::load_from_sources(Some(file.path()), Some(overrides)).unwrap();
        assert_eq!(manager.config().relay.timeout_ms, 4321);
        assert_eq!(manager.config().wait.poll_interval_ms, 50);
        assert_eq!(manager.config().wait.timeout_ms, 500);
        assert_eq!(manager.source_file(), Some(file.path()));
    }

    #[test]
    fn test_invalid_layered_config_is_rejected() {
        let overrides = env_map(&[
            ("BOTRELAY__COORDINATION__LOCK_TTL_MS", "100"),
            ("BOTRELAY__COORDINATION__RENEWAL_INTERVAL_MS", "200"),
        ]);
        assert!(ConfigManager::load_from_sources(None, Some(overrides)).is_err());
    }
}
