//! Least-recently-used eviction.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use tracing::debug;
use walkdir::WalkDir;

use super::cleanup::{CleanupAction, CleanupReport};
use crate::access::FileAccessTimeJournal;

/// Produces a point in time when asked. Evaluated at cleanup time, not when
/// the cleanup is configured.
pub type TimestampSupplier = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Supplier of "now minus `days` days".
pub fn days_ago(days: u32) -> TimestampSupplier {
    Arc::new(move || {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        SystemTime::from(cutoff)
    })
}

/// Finds the files and directories exactly `depth` levels below a base
/// directory.
#[derive(Debug, Clone, Copy)]
pub struct SingleDepthFilesFinder {
    depth: usize,
}

impl SingleDepthFilesFinder {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
        }
    }

    pub fn find(&self, base_dir: &Path) -> Vec<PathBuf> {
        WalkDir::new(base_dir)
            .min_depth(self.depth)
            .max_depth(self.depth)
            .into_iter()
            .filter_map(Result::ok)
            .map(walkdir::DirEntry::into_path)
            .collect()
    }
}

/// Deletes everything the finder returns that was last accessed before the
/// cutoff, oldest first.
pub struct LeastRecentlyUsedCleanup {
    finder: SingleDepthFilesFinder,
    journal: Arc<dyn FileAccessTimeJournal>,
    cutoff: TimestampSupplier,
}

impl LeastRecentlyUsedCleanup {
    pub fn new(
        finder: SingleDepthFilesFinder,
        journal: Arc<dyn FileAccessTimeJournal>,
        cutoff: TimestampSupplier,
    ) -> Self {
        Self {
            finder,
            journal,
            cutoff,
        }
    }
}

impl CleanupAction for LeastRecentlyUsedCleanup {
    fn clean(&self, base_dir: &Path, should_stop: &dyn Fn() -> bool) -> CleanupReport {
        let mut report = CleanupReport::default();
        let cutoff = (self.cutoff)();

        let candidates = self.finder.find(base_dir);
        report.scanned = candidates.len();

        let mut expired: Vec<(PathBuf, SystemTime)> = candidates
            .into_iter()
            .filter_map(|path| {
                let accessed = self.journal.get_last_access_time(&path)?;
                (accessed < cutoff).then_some((path, accessed))
            })
            .collect();

        // Oldest first, so an interrupted pass has removed the least useful ones
        expired.sort_by_key(|(_, accessed)| *accessed);

        let mut parents = Vec::new();
        for (path, _) in expired {
            if should_stop() {
                report.interrupted = true;
                break;
            }

            let Ok(metadata) = fs::symlink_metadata(&path) else {
                continue;
            };
            let removed = if metadata.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };

            match removed {
                Ok(()) => {
                    debug!(path = %path.display(), "evicted unused cache entry");
                    self.journal.delete_last_access_time(&path);
                    report.deleted += 1;
                    report.bytes_reclaimed += if metadata.is_dir() { 0 } else { metadata.len() };
                    if let Some(parent) = path.parent() {
                        parents.push(parent.to_path_buf());
                    }
                }
                Err(e) => report.errors.push(format!("{}: {}", path.display(), e)),
            }
        }

        // Drop emptied shard directories; a non-empty one simply stays
        parents.sort();
        parents.dedup();
        for parent in parents {
            if parent != base_dir {
                let _ = fs::remove_dir(&parent);
            }
        }

        report
    }
}
