//! Temp files for entries being written.
//!
//! Temp files are created in the cache root itself so the final rename stays
//! on one filesystem. A crashed writer can leave one behind;
//! [`OrphanedTempFileCleanup`] sweeps those during cache cleanup.

use std::fs;
use std::path::{Path, PathBuf};

use build_cache_key::HashKey;
use tempfile::Builder;
use tracing::debug;

use crate::error::CacheError;
use crate::persistent::{CleanupAction, CleanupReport, TimestampSupplier};

/// Suffix of every staged temp file.
pub const TEMP_SUFFIX: &str = ".part";

/// Creates uniquely named temp files in one directory.
#[derive(Debug, Clone)]
pub struct TempFileStaging {
    dir: PathBuf,
}

impl TempFileStaging {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Run `action` with a fresh temp file named `<HEX>-<random>.part`.
    ///
    /// The file is removed once `action` returns, whatever the outcome. If
    /// `action` moved it away, there is nothing left to remove and that is
    /// not an error.
    pub fn with_temp_file<T, E, F>(&self, key: &HashKey, action: F) -> Result<T, E>
    where
        F: FnOnce(&Path) -> Result<T, E>,
        E: From<CacheError>,
    {
        let temp_path = Builder::new()
            .prefix(&format!("{}-", key.to_hex()))
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.dir)
            .map_err(|e| CacheError::io("create temp file", &self.dir, e))?
            .into_temp_path();

        // Dropping `temp_path` deletes the file, ignoring a missing one
        action(&temp_path)
    }
}

/// Deletes temp files left in the cache root by writers that never finished.
pub struct OrphanedTempFileCleanup {
    cutoff: TimestampSupplier,
}

impl OrphanedTempFileCleanup {
    /// Temp files last modified before `cutoff()` are removed.
    pub fn new(cutoff: TimestampSupplier) -> Self {
        Self { cutoff }
    }
}

impl CleanupAction for OrphanedTempFileCleanup {
    fn clean(&self, base_dir: &Path, should_stop: &dyn Fn() -> bool) -> CleanupReport {
        let mut report = CleanupReport::default();
        let cutoff = (self.cutoff)();

        let entries = match fs::read_dir(base_dir) {
            Ok(entries) => entries,
            Err(e) => {
                report
                    .errors
                    .push(format!("{}: {}", base_dir.display(), e));
                return report;
            }
        };

        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.ends_with(TEMP_SUFFIX));
            if !is_temp {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            report.scanned += 1;

            let modified = metadata.modified().unwrap_or(cutoff);
            if modified >= cutoff {
                continue;
            }
            if should_stop() {
                report.interrupted = true;
                break;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "removed orphaned temp file");
                    report.deleted += 1;
                    report.bytes_reclaimed += metadata.len();
                }
                Err(e) => report.errors.push(format!("{}: {}", path.display(), e)),
            }
        }

        report
    }
}
