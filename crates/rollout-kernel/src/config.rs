//! Configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file (or no
//! file at all) yields a working configuration.
//!
//! ```toml
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 2000
//!
//! [store]
//! dir = "deployments/sepolia"
//!
//! [migration]
//! shadow_suffix = "_NEW"
//! stale_record = "fail"
//!
//! [environment]
//! name = "sepolia"
//! chain_id = 11155111
//! live = true
//! ```

use crate::engine::StaleRecordPolicy;
use crate::migration::DEFAULT_SHADOW_SUFFIX;
use crate::retry::RetryPolicy;
use crate::types::TargetEnvironment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeployConfig {
    pub retry: RetryConfig,
    pub store: StoreConfig,
    pub catalog: CatalogConfig,
    pub migration: MigrationConfig,
    pub environment: EnvironmentConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts per remote call; 0 behaves like 1
    pub max_attempts: u32,
    /// Backoff step in milliseconds
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("deployments"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    pub dir: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("artifacts"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    pub shadow_suffix: String,
    pub stale_record: StaleRecordPolicy,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            shadow_suffix: DEFAULT_SHADOW_SUFFIX.to_string(),
            stale_record: StaleRecordPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub name: String,
    pub chain_id: u64,
    pub live: bool,
    pub tags: BTreeSet<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        let env = TargetEnvironment::default();
        Self {
            name: env.name,
            chain_id: env.chain_id,
            live: env.live,
            tags: env.tags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl DeployConfig {
    /// Load and validate a config file
    ///
    /// # Errors
    /// [`ConfigError::Io`] if the file cannot be read, [`ConfigError::Parse`]
    /// for malformed TOML, [`ConfigError::Invalid`] for rejected values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check values that parse but cannot be used
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.migration.shadow_suffix.is_empty() {
            return Err(ConfigError::Invalid(
                "migration.shadow_suffix must not be empty".to_string(),
            ));
        }
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.filter must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
        )
    }

    pub fn target_environment(&self) -> TargetEnvironment {
        TargetEnvironment {
            name: self.environment.name.clone(),
            chain_id: self.environment.chain_id,
            live: self.environment.live,
            tags: self.environment.tags.clone(),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay_ms: u64) -> Self {
        self.retry = RetryConfig {
            max_attempts,
            base_delay_ms,
        };
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store.dir = dir.into();
        self
    }

    pub fn with_catalog_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.catalog.dir = dir.into();
        self
    }

    pub fn with_shadow_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.migration.shadow_suffix = suffix.into();
        self
    }

    pub fn with_stale_record_policy(mut self, policy: StaleRecordPolicy) -> Self {
        self.migration.stale_record = policy;
        self
    }

    pub fn with_environment(mut self, env: TargetEnvironment) -> Self {
        self.environment = EnvironmentConfig {
            name: env.name,
            chain_id: env.chain_id,
            live: env.live,
            tags: env.tags,
        };
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.logging.filter = filter.into();
        self
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_yields_defaults() {
        let config = DeployConfig::from_toml_str("").unwrap();
        assert_eq!(config, DeployConfig::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.migration.shadow_suffix, "_NEW");
        assert_eq!(config.target_environment(), TargetEnvironment::default());
    }

    #[test]
    fn sections_override_defaults() {
        let config = DeployConfig::from_toml_str(
            r#"
            [retry]
            max_attempts = 5
            base_delay_ms = 250

            [migration]
            stale_record = "fail"

            [environment]
            name = "sepolia"
            chain_id = 11155111
            live = true
            tags = ["testnet"]
            "#,
        )
        .unwrap();

        assert_eq!(
            config.retry_policy(),
            RetryPolicy::new(5, Duration::from_millis(250))
        );
        assert_eq!(config.migration.stale_record, StaleRecordPolicy::Fail);
        assert_eq!(config.migration.shadow_suffix, "_NEW");
        let env = config.target_environment();
        assert!(env.live && env.has_tag("testnet"));
        assert_eq!(config.store.dir, PathBuf::from("deployments"));
    }

    #[test]
    fn zero_attempts_is_accepted() {
        let config = DeployConfig::from_toml_str("[retry]\nmax_attempts = 0\n").unwrap();
        assert_eq!(config.retry_policy().attempts(), 1);
    }

    #[test]
    fn empty_suffix_is_rejected() {
        let err = DeployConfig::from_toml_str("[migration]\nshadow_suffix = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = DeployConfig::from_toml_str("[retry]\nattempts = 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn renders_and_reloads() {
        let config = DeployConfig::default()
            .with_store_dir("out/records")
            .with_shadow_suffix("__next")
            .with_retry(2, 10);
        let text = config.to_toml_string().unwrap();
        assert_eq!(DeployConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout.toml");
        std::fs::write(&path, "[store]\ndir = \"records\"\n").unwrap();
        assert_eq!(
            DeployConfig::load(&path).unwrap().store.dir,
            PathBuf::from("records")
        );
        assert!(matches!(
            DeployConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
