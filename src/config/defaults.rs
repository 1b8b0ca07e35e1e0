//! Built-in defaults (layer 1)
//!
//! Hardcoded defaults for every configuration value, plus the default cache
//! location.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::persistent::CleanupFrequency;

/// Environment variable overriding the global cache root.
pub const CACHE_HOME_ENV: &str = "BUILD_CACHE_HOME";

/// Directory of the build cache below the global cache root. The number is
/// the layout version.
pub const CACHE_DIR_NAME: &str = "build-cache-1";

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Use the local cache at all (default: true)
    pub enabled: bool,

    /// Store new entries (default: false)
    pub push: bool,

    /// Days an entry may stay unused before cleanup removes it (default: 7)
    pub remove_unused_entries_after_days: u32,

    /// Seconds to wait for the cache lock (default: 60)
    pub lock_timeout_seconds: u64,

    /// Cleanup frequency (default: daily)
    pub cleanup: CleanupFrequency,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            enabled: true,
            push: false,
            remove_unused_entries_after_days: 7,
            lock_timeout_seconds: 60,
            cleanup: CleanupFrequency::Daily,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to a TOML value for merging
    pub fn to_value(&self) -> toml::Value {
        let mut table = toml::Table::new();
        table.insert("enabled".into(), toml::Value::Boolean(self.enabled));
        table.insert("push".into(), toml::Value::Boolean(self.push));
        table.insert(
            "remove_unused_entries_after_days".into(),
            toml::Value::Integer(i64::from(self.remove_unused_entries_after_days)),
        );
        table.insert(
            "lock_timeout_seconds".into(),
            toml::Value::Integer(i64::try_from(self.lock_timeout_seconds).unwrap_or(i64::MAX)),
        );
        table.insert(
            "cleanup".into(),
            toml::Value::String(self.cleanup.as_str().to_string()),
        );
        toml::Value::Table(table)
    }
}

/// Root under which this tool keeps its caches.
///
/// `$BUILD_CACHE_HOME` if set, else the platform cache directory, else the
/// temp directory.
pub fn default_cache_root() -> PathBuf {
    if let Some(home) = env::var_os(CACHE_HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    dirs::cache_dir()
        .map(|dir| dir.join("build-cache"))
        .unwrap_or_else(|| env::temp_dir().join("build-cache"))
}

/// Cache directory used when none is configured.
pub fn default_directory() -> PathBuf {
    default_cache_root().join(CACHE_DIR_NAME)
}
