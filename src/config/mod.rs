//! Build cache configuration
//!
//! Values come from three layers, later layers winning:
//! 1. Built-in defaults
//! 2. Config file (TOML)
//! 3. CLI overrides
//!
//! ```toml
//! enabled = true
//! push = true
//! directory = "/var/cache/build-cache-1"
//! remove_unused_entries_after_days = 7
//! lock_timeout_seconds = 60
//! cleanup = "daily"
//! ```

mod defaults;
mod merge;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::persistent::CleanupFrequency;

pub use defaults::{
    default_cache_root, default_directory, BuiltinDefaults, CACHE_DIR_NAME, CACHE_HOME_ENV,
};
pub use merge::{deep_merge, merge_layers, normalize_keys};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Settings of the local build cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildCacheConfig {
    /// Whether the local cache is used at all.
    pub enabled: bool,

    /// Whether new entries are stored. Loads work either way.
    pub push: bool,

    /// Cache directory; [`default_directory`] when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    #[serde(alias = "removeUnusedEntriesAfterDays")]
    pub remove_unused_entries_after_days: u32,

    #[serde(alias = "lockTimeoutSeconds")]
    pub lock_timeout_seconds: u64,

    pub cleanup: CleanupFrequency,
}

impl Default for BuildCacheConfig {
    fn default() -> Self {
        let defaults = BuiltinDefaults::default();
        Self {
            enabled: defaults.enabled,
            push: defaults.push,
            directory: None,
            remove_unused_entries_after_days: defaults.remove_unused_entries_after_days,
            lock_timeout_seconds: defaults.lock_timeout_seconds,
            cleanup: defaults.cleanup,
        }
    }
}

impl BuildCacheConfig {
    /// Load a config file. Keys it leaves out take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::resolve(Some(path), None)
    }

    /// Parse TOML text. Keys it leaves out take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Merge defaults, the optional config file and CLI overrides.
    pub fn resolve(
        config_path: Option<&Path>,
        cli_overrides: Option<toml::Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];

        if let Some(path) = config_path {
            layers.push(normalize_keys(Self::load_toml_file(path)?));
        }
        if let Some(overrides) = cli_overrides {
            layers.push(normalize_keys(overrides));
        }

        let config: Self = merge_layers(layers)
            .try_into::<Self>()
            .map_err(|e| ConfigError::ParseError(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn load_toml_file(path: &Path) -> Result<toml::Value, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        let table: toml::Table = toml::from_str(&contents).map_err(|e| {
            ConfigError::ParseError(format!("TOML parse error in {}: {}", path.display(), e))
        })?;
        Ok(toml::Value::Table(table))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remove_unused_entries_after_days < 1 {
            return Err(ConfigError::ValidationError(format!(
                "remove_unused_entries_after_days must be at least 1, got {}",
                self.remove_unused_entries_after_days
            )));
        }

        if self.lock_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "lock_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self
            .directory
            .as_ref()
            .is_some_and(|dir| dir.as_os_str().is_empty())
        {
            return Err(ConfigError::ValidationError(
                "directory must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// The configured directory, or the default one.
    pub fn resolved_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(default_directory)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_only() {
        let config = BuildCacheConfig::resolve(None, None).unwrap();

        assert_eq!(config, BuildCacheConfig::default());
        assert!(config.enabled);
        assert!(!config.push);
        assert_eq!(config.lock_timeout(), Duration::from_secs(60));
        assert!(config.resolved_directory().ends_with(CACHE_DIR_NAME));
    }

    #[test]
    fn test_from_toml_str_partial() {
        let config = BuildCacheConfig::from_toml_str("push = true\ncleanup = \"always\"").unwrap();

        assert!(config.enabled);
        assert!(config.push);
        assert_eq!(config.cleanup, CleanupFrequency::Always);
        assert_eq!(config.remove_unused_entries_after_days, 7);
    }

    #[test]
    fn test_camel_case_alias() {
        let config = BuildCacheConfig::from_toml_str("removeUnusedEntriesAfterDays = 14").unwrap();
        assert_eq!(config.remove_unused_entries_after_days, 14);
    }

    #[test]
    fn test_load_file_with_cli_override() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "push = true").unwrap();
        writeln!(temp, "removeUnusedEntriesAfterDays = 3").unwrap();
        writeln!(temp, "directory = \"/from/file\"").unwrap();

        let overrides: toml::Value = toml::Value::Table(toml::from_str("directory = \"/from/cli\"").unwrap());
        let config = BuildCacheConfig::resolve(Some(temp.path()), Some(overrides)).unwrap();

        assert!(config.push);
        assert_eq!(config.remove_unused_entries_after_days, 3);
        assert_eq!(config.resolved_directory(), PathBuf::from("/from/cli"));
    }

    #[test]
    fn test_validation_minimum_days() {
        let err = BuildCacheConfig::from_toml_str("remove_unused_entries_after_days = 0").unwrap_err();

        assert!(matches!(err, ConfigError::ValidationError(_)));
        assert!(err.to_string().contains("remove_unused_entries_after_days"));
    }

    #[test]
    fn test_validation_lock_timeout() {
        let err = BuildCacheConfig::from_toml_str("lock_timeout_seconds = 0").unwrap_err();
        assert!(err.to_string().contains("lock_timeout_seconds"));
    }

    #[test]
    fn test_unknown_cleanup_value() {
        let err = BuildCacheConfig::from_toml_str("cleanup = \"hourly\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = BuildCacheConfig::load(Path::new("/nonexistent/build-cache.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
