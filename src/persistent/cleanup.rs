//! Cleanup strategies for persistent caches.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

/// How often a cache is cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupFrequency {
    /// At most once per 24 hours
    #[default]
    Daily,
    /// Whenever the cache is used
    Always,
    /// Never automatically
    Never,
}

impl CleanupFrequency {
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    /// Whether a cleanup is due, given the last one finished at `last`.
    pub fn should_cleanup(&self, last: Option<SystemTime>, now: SystemTime) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Daily => match last {
                None => true,
                // A timestamp in the future means the clock moved; wait for it
                Some(last) => now
                    .duration_since(last)
                    .is_ok_and(|since| since >= Self::DAY),
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Always => "always",
            Self::Never => "never",
        }
    }
}

impl fmt::Display for CleanupFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CleanupFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(format!(
                "unknown cleanup frequency '{other}', expected daily, always or never"
            )),
        }
    }
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Number of candidates looked at
    pub scanned: usize,
    /// Number of files deleted
    pub deleted: usize,
    /// Bytes reclaimed
    pub bytes_reclaimed: u64,
    /// Errors encountered (non-fatal)
    pub errors: Vec<String>,
    /// Stopped early because the cache lock was requested
    pub interrupted: bool,
}

impl CleanupReport {
    /// Fold `other` into this report.
    pub fn merge(&mut self, other: CleanupReport) {
        self.scanned += other.scanned;
        self.deleted += other.deleted;
        self.bytes_reclaimed += other.bytes_reclaimed;
        self.errors.extend(other.errors);
        self.interrupted |= other.interrupted;
    }
}

/// One kind of cleanup over a cache directory.
///
/// `should_stop` turns true when another party wants the cache lock; long
/// running actions check it between deletions and return what they have.
pub trait CleanupAction: Send + Sync {
    fn clean(&self, base_dir: &Path, should_stop: &dyn Fn() -> bool) -> CleanupReport;
}

/// Runs several actions in order.
#[derive(Default)]
pub struct CompositeCleanup {
    actions: Vec<Box<dyn CleanupAction>>,
}

impl CompositeCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, action: impl CleanupAction + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }
}

impl CleanupAction for CompositeCleanup {
    fn clean(&self, base_dir: &Path, should_stop: &dyn Fn() -> bool) -> CleanupReport {
        let mut report = CleanupReport::default();
        for action in &self.actions {
            if should_stop() {
                report.interrupted = true;
                break;
            }
            report.merge(action.clean(base_dir, should_stop));
            if report.interrupted {
                break;
            }
        }
        report
    }
}

/// What to clean and how often.
pub struct CacheCleanupStrategy {
    action: Box<dyn CleanupAction>,
    frequency: CleanupFrequency,
}

impl CacheCleanupStrategy {
    pub fn new(action: impl CleanupAction + 'static, frequency: CleanupFrequency) -> Self {
        Self {
            action: Box::new(action),
            frequency,
        }
    }

    pub fn frequency(&self) -> CleanupFrequency {
        self.frequency
    }

    pub(crate) fn clean(&self, base_dir: &Path, should_stop: &dyn Fn() -> bool) -> CleanupReport {
        self.action.clean(base_dir, should_stop)
    }
}

impl fmt::Debug for CacheCleanupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCleanupStrategy")
            .field("frequency", &self.frequency)
            .finish_non_exhaustive()
    }
}

/// Time of the last completed cleanup, stored as decimal epoch milliseconds.
#[derive(Debug, Clone)]
pub(crate) struct CleanupMarker {
    path: PathBuf,
}

impl CleanupMarker {
    pub(crate) const FILE_NAME: &'static str = "cleanup.timestamp";

    pub(crate) fn new(base_dir: &Path) -> Self {
        Self {
            path: base_dir.join(Self::FILE_NAME),
        }
    }

    pub(crate) fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// `None` when missing or unreadable.
    pub(crate) fn read(&self) -> Option<SystemTime> {
        let contents = fs::read_to_string(&self.path).ok()?;
        let millis: u64 = contents.trim().parse().ok()?;
        Some(UNIX_EPOCH + Duration::from_millis(millis))
    }

    /// Replace the marker with `time`. Readers never see a partial write.
    pub(crate) fn write(&self, time: SystemTime) -> io::Result<()> {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));

        let mut temp = NamedTempFile::new_in(dir)?;
        write!(temp, "{millis}")?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
