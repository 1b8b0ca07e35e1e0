//! Persistent cache directories
//!
//! A [`PersistentCache`] owns one directory shared between processes. Every
//! operation on it runs under the directory lock, taken in the mode the
//! operation needs; with [`LockMode::OnDemand`] the lock is kept between
//! operations until another process asks for it. Periodic cleanup runs while
//! the lock is held exclusively.

mod cleanup;
mod handle;
mod lru;

use std::path::PathBuf;

pub use cleanup::{
    CacheCleanupStrategy, CleanupAction, CleanupFrequency, CleanupReport, CompositeCleanup,
};
pub use handle::PersistentCache;
pub use lru::{days_ago, LeastRecentlyUsedCleanup, SingleDepthFilesFinder, TimestampSupplier};

use crate::lock::LockMode;

/// How to open a persistent cache.
#[derive(Debug)]
pub struct CacheOptions {
    pub(crate) base_dir: PathBuf,
    pub(crate) display_name: String,
    pub(crate) lock_mode: LockMode,
    pub(crate) cleanup: Option<CacheCleanupStrategy>,
}

impl CacheOptions {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let display_name = base_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cache".to_string());

        Self {
            base_dir,
            display_name,
            lock_mode: LockMode::OnDemand,
            cleanup: None,
        }
    }

    /// Name used in lock diagnostics and errors.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    pub fn with_cleanup(mut self, strategy: CacheCleanupStrategy) -> Self {
        self.cleanup = Some(strategy);
        self
    }
}
