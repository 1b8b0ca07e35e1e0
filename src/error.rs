//! Error types for the local build cache.

use std::io;
use std::path::{Path, PathBuf};

use build_cache_key::KeyError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::lock::{LockError, LockMode};

/// Boxed error produced by caller-supplied readers and writers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Cache result type
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors from cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    MalformedKey(#[from] KeyError),

    #[error("cache directory {path} is unusable: {reason}")]
    Directory { path: PathBuf, reason: String },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{display_name} is locked in {held} mode, {required} access is not allowed")]
    InsufficientLockMode {
        display_name: String,
        held: LockMode,
        required: LockMode,
    },

    #[error("failed to move entry {key} into the cache: {source}")]
    StoreWrite {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read cache entry {key}: {source}")]
    Read {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to write cache entry {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("{0} has been closed")]
    Closed(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error during {operation} on {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    /// I/O failure on a specific path.
    pub fn io(operation: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Cache root that cannot be used.
    pub fn directory(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::Directory {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// True when another process or thread held the cache lock for too long.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::Lock(LockError::Timeout { .. }))
    }

    /// True when a retrieved entry could not be consumed and was quarantined.
    pub fn is_corrupt_entry(&self) -> bool {
        matches!(self, Self::Read { .. })
    }
}
