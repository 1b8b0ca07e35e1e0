//! Last-access tracking for cache entries
//!
//! The eviction policy needs to know when an entry was last used. Trackers
//! record that in a [`FileAccessTimeJournal`]; the journal used for the build
//! cache is the entry's own modification time, so nothing beyond the entry file
//! has to be kept in sync.
//!
//! Tracking is best effort. Failures are logged and never fail the operation
//! that triggered them.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

/// Storage for last-access times of files.
pub trait FileAccessTimeJournal: Send + Sync {
    /// Record `time` as the last access of `file`.
    fn set_last_access_time(&self, file: &Path, time: SystemTime) -> io::Result<()>;

    /// Last recorded access of `file`, if any.
    fn get_last_access_time(&self, file: &Path) -> Option<SystemTime>;

    /// Forget `file`. Called after it was deleted.
    fn delete_last_access_time(&self, file: &Path);
}

/// Journal backed by the file's modification time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModificationTimeJournal;

impl FileAccessTimeJournal for ModificationTimeJournal {
    fn set_last_access_time(&self, file: &Path, time: SystemTime) -> io::Result<()> {
        let handle = File::options().write(true).open(file)?;
        handle.set_modified(time)
    }

    fn get_last_access_time(&self, file: &Path) -> Option<SystemTime> {
        fs::metadata(file).and_then(|m| m.modified()).ok()
    }

    fn delete_last_access_time(&self, _file: &Path) {
        // The record went away with the file.
    }
}

/// Marks files as accessed.
pub trait FileAccessTracker: Send + Sync + fmt::Debug {
    fn mark_accessed(&self, file: &Path);
}

/// Tracks access at a fixed depth below a base directory.
///
/// A path deeper than `depth` is tracked as its ancestor at `depth`, so
/// a whole subtree is kept or evicted as one unit. Paths outside the base
/// directory or shallower than `depth` are ignored.
#[derive(Clone)]
pub struct SingleDepthFileAccessTracker {
    base_dir: PathBuf,
    depth: usize,
    journal: Arc<dyn FileAccessTimeJournal>,
}

impl SingleDepthFileAccessTracker {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        depth: usize,
        journal: Arc<dyn FileAccessTimeJournal>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            depth: depth.max(1),
            journal,
        }
    }

    /// The path that stands for `file` in the journal.
    fn tracked_path(&self, file: &Path) -> Option<PathBuf> {
        let relative = file.strip_prefix(&self.base_dir).ok()?;
        let components: Vec<Component<'_>> = relative.components().collect();
        if components.len() < self.depth
            || components
                .iter()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }

        let mut tracked = self.base_dir.clone();
        tracked.extend(components.iter().take(self.depth));
        Some(tracked)
    }
}

impl FileAccessTracker for SingleDepthFileAccessTracker {
    fn mark_accessed(&self, file: &Path) {
        let Some(tracked) = self.tracked_path(file) else {
            debug!(path = %file.display(), "not tracking access outside tracked depth");
            return;
        };

        if let Err(e) = self
            .journal
            .set_last_access_time(&tracked, SystemTime::now())
        {
            debug!(path = %tracked.display(), error = %e, "could not record access time");
        }
    }
}

impl fmt::Debug for SingleDepthFileAccessTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleDepthFileAccessTracker")
            .field("base_dir", &self.base_dir)
            .field("depth", &self.depth)
            .finish()
    }
}
