//! Local build cache service
//!
//! Ties the pieces together: loads run under a shared lock and stream an
//! entry to a caller-supplied reader, stores run under an exclusive lock and
//! stage the caller's bytes in a temp file before moving them into place. An
//! entry the reader cannot consume is moved aside with a failure suffix so
//! the next build recomputes it while the bytes stay around for inspection.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use build_cache_key::HashKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::access::{
    FileAccessTimeJournal, FileAccessTracker, ModificationTimeJournal, SingleDepthFileAccessTracker,
};
use crate::config::BuildCacheConfig;
use crate::error::{BoxError, CacheError, CacheResult};
use crate::lock::{FileLockManager, LockMode, DEFAULT_LOCK_TIMEOUT};
use crate::persistent::{
    days_ago, CacheCleanupStrategy, CacheOptions, CleanupFrequency, CleanupReport,
    CompositeCleanup, LeastRecentlyUsedCleanup, PersistentCache, SingleDepthFilesFinder,
};
use crate::store::{
    ContentAddressableFileStore, EntryIdentity, OrphanedTempFileCleanup, TempFileStaging,
    DEFAULT_FAILED_SUFFIX,
};

/// Entries sit two levels below the root: shard directory, then entry file.
const ENTRY_DEPTH: usize = 2;

/// Default number of days an unused entry is kept.
pub const DEFAULT_REMOVE_UNUSED_ENTRIES_AFTER_DAYS: u32 = 7;

/// Settings for [`LocalCacheService::open`].
#[derive(Debug, Clone)]
pub struct LocalCacheOptions {
    pub directory: PathBuf,
    pub display_name: String,
    pub remove_unused_entries_after_days: u32,
    pub lock_timeout: Duration,
    pub cleanup: CleanupFrequency,
    pub lock_mode: LockMode,
    pub failed_suffix: String,
}

impl LocalCacheOptions {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            display_name: "Build cache".to_string(),
            remove_unused_entries_after_days: DEFAULT_REMOVE_UNUSED_ENTRIES_AFTER_DAYS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            cleanup: CleanupFrequency::default(),
            lock_mode: LockMode::OnDemand,
            failed_suffix: DEFAULT_FAILED_SUFFIX.to_string(),
        }
    }

    /// Options for the directory and policies in `config`.
    pub fn from_config(config: &BuildCacheConfig) -> Self {
        Self {
            remove_unused_entries_after_days: config.remove_unused_entries_after_days,
            lock_timeout: config.lock_timeout(),
            cleanup: config.cleanup,
            ..Self::new(config.resolved_directory())
        }
    }

    pub fn with_remove_unused_entries_after_days(mut self, days: u32) -> Self {
        self.remove_unused_entries_after_days = days;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_cleanup(mut self, frequency: CleanupFrequency) -> Self {
        self.cleanup = frequency;
        self
    }

    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }
}

/// Outcome of [`LocalCacheService::fetch`].
#[derive(Debug)]
pub enum Fetched {
    Found(Vec<u8>),
    NotFound,
    Failed(CacheError),
}

impl Fetched {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Summary of the cache contents.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub directory: PathBuf,
    pub entries: usize,
    pub total_bytes: u64,
    pub quarantined: usize,
    /// Last complete cleanup, or the first open of a never cleaned cache.
    pub cleanup_epoch: Option<DateTime<Utc>>,
}

/// Local directory build cache.
#[derive(Debug)]
pub struct LocalCacheService {
    cache: PersistentCache,
    store: ContentAddressableFileStore,
    staging: TempFileStaging,
    tracker: Arc<dyn FileAccessTracker>,
    failed_suffix: String,
}

impl LocalCacheService {
    /// Open the cache with its own lock manager.
    pub fn open(options: LocalCacheOptions) -> CacheResult<Self> {
        let lock_manager = Arc::new(FileLockManager::new(options.lock_timeout));
        Self::open_with_lock_manager(options, lock_manager)
    }

    /// Open the cache using a lock manager shared with other caches.
    pub fn open_with_lock_manager(
        options: LocalCacheOptions,
        lock_manager: Arc<FileLockManager>,
    ) -> CacheResult<Self> {
        let directory = options.directory.clone();
        let journal: Arc<dyn FileAccessTimeJournal> = Arc::new(ModificationTimeJournal);
        let cutoff = days_ago(options.remove_unused_entries_after_days.max(1));

        let cleanup = CompositeCleanup::new()
            .with(LeastRecentlyUsedCleanup::new(
                SingleDepthFilesFinder::new(ENTRY_DEPTH),
                Arc::clone(&journal),
                Arc::clone(&cutoff),
            ))
            .with(OrphanedTempFileCleanup::new(cutoff));

        let cache = PersistentCache::open(
            CacheOptions::new(&directory)
                .with_display_name(options.display_name.as_str())
                .with_lock_mode(options.lock_mode)
                .with_cleanup(CacheCleanupStrategy::new(cleanup, options.cleanup)),
            lock_manager,
        )?;

        Ok(Self::with_components(
            cache,
            ContentAddressableFileStore::new(&directory),
            TempFileStaging::new(&directory),
            Arc::new(SingleDepthFileAccessTracker::new(&directory, ENTRY_DEPTH, journal)),
            options.failed_suffix,
        ))
    }

    /// Assemble a service from already built parts.
    pub fn with_components(
        cache: PersistentCache,
        store: ContentAddressableFileStore,
        staging: TempFileStaging,
        tracker: Arc<dyn FileAccessTracker>,
        failed_suffix: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            store,
            staging,
            tracker,
            failed_suffix: failed_suffix.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        self.cache.base_dir()
    }

    /// Look up `key` and hand its content to `reader`.
    ///
    /// Returns `Ok(None)` on a miss without calling `reader`. If `reader`
    /// fails, the entry is quarantined and [`CacheError::Read`] is returned.
    pub fn load<T, E, F>(&self, key: &HashKey, reader: F) -> CacheResult<Option<T>>
    where
        F: FnOnce(&mut dyn Read) -> Result<T, E>,
        E: Into<BoxError>,
    {
        self.cache.with_file_lock(LockMode::Shared, || {
            let Some(entry) = self.store.get(key) else {
                debug!(key = %key, "cache miss");
                return Ok(None);
            };
            self.tracker.mark_accessed(&entry.path);

            let mut input = match File::open(&entry.path) {
                Ok(file) => BufReader::new(file),
                Err(e) => {
                    self.quarantine(key, &entry.identity);
                    return Err(CacheError::Read {
                        key: key.to_hex(),
                        source: e.into(),
                    });
                }
            };

            match reader(&mut input).map_err(Into::<BoxError>::into) {
                Ok(value) => {
                    debug!(key = %key, size = entry.size, "cache hit");
                    Ok(Some(value))
                }
                Err(source) => {
                    // Kept open until then, so the inode cannot be reused
                    self.quarantine(key, &entry.identity);
                    drop(input);
                    Err(CacheError::Read {
                        key: key.to_hex(),
                        source,
                    })
                }
            }
        })
    }

    /// Load `key` fully into memory.
    pub fn fetch(&self, key: &HashKey) -> Fetched {
        let result = self.load(key, |input| {
            let mut bytes = Vec::new();
            input.read_to_end(&mut bytes).map(|_| bytes)
        });

        match result {
            Ok(Some(bytes)) => Fetched::Found(bytes),
            Ok(None) => Fetched::NotFound,
            Err(e) => Fetched::Failed(e),
        }
    }

    /// Store the bytes `writer` produces under `key`, replacing any entry.
    ///
    /// Nothing is visible under `key` until `writer` has finished and the
    /// bytes are on disk. If `writer` fails, the cache is left as it was.
    pub fn store<E, F>(&self, key: &HashKey, writer: F) -> CacheResult<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<(), E>,
        E: Into<BoxError>,
    {
        let write_error = |source: BoxError| CacheError::Write {
            key: key.to_hex(),
            source,
        };

        self.cache.with_file_lock(LockMode::Exclusive, || {
            self.staging.with_temp_file(key, |temp| {
                let file = File::create(temp).map_err(|e| write_error(e.into()))?;
                let mut output = BufWriter::new(file);
                writer(&mut output).map_err(|e| write_error(e.into()))?;

                let file = output
                    .into_inner()
                    .map_err(|e| write_error(e.into_error().into()))?;
                file.sync_all().map_err(|e| write_error(e.into()))?;
                drop(file);

                let entry = self.store.move_into(key, temp)?;
                self.tracker.mark_accessed(&entry.path);
                debug!(key = %key, size = entry.size, "stored cache entry");
                Ok(())
            })
        })
    }

    /// Move an already complete file into the cache under `key`.
    ///
    /// `file` must be on the same filesystem as the cache directory.
    pub fn store_locally(&self, key: &HashKey, file: &Path) -> CacheResult<()> {
        self.cache.with_file_lock(LockMode::Exclusive, || {
            let entry = self.store.move_into(key, file)?;
            self.tracker.mark_accessed(&entry.path);
            debug!(key = %key, size = entry.size, "moved file into cache");
            Ok(())
        })
    }

    /// Delete the entry for `key`. Returns whether there was one.
    pub fn remove(&self, key: &HashKey) -> CacheResult<bool> {
        self.cache.with_file_lock(LockMode::Exclusive, || {
            self.store
                .remove(key)
                .map_err(|e| CacheError::io("remove entry", self.store.entry_path(key), e))
        })
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        self.cache.with_file_lock(LockMode::Shared, || {
            let entries = self.store.entries();
            Ok(CacheStats {
                directory: self.directory().to_path_buf(),
                entries: entries.len(),
                total_bytes: entries.iter().map(|e| e.size).sum(),
                quarantined: self.store.quarantined(&self.failed_suffix).len(),
                cleanup_epoch: self.cache.cleanup_epoch().map(DateTime::<Utc>::from),
            })
        })
    }

    /// Remove unused entries now.
    pub fn cleanup_now(&self) -> CacheResult<CleanupReport> {
        self.cache.cleanup()
    }

    pub fn close(&self) -> CacheResult<()> {
        self.cache.close()
    }

    /// Best effort; runs inside a load, so under the cache lock already.
    ///
    /// Getting the exclusive lock may mean giving up the shared one first,
    /// and a writer can replace the entry in between. Only the file the
    /// reader rejected, as identified by `identity`, is moved.
    fn quarantine(&self, key: &HashKey, identity: &EntryIdentity) {
        let result = self.cache.with_file_lock(LockMode::Exclusive, || {
            self.store
                .quarantine(key, &self.failed_suffix, identity)
                .map_err(|e| CacheError::io("quarantine entry", self.store.entry_path(key), e))
        });

        match result {
            Ok(Some(path)) => {
                warn!(key = %key, path = %path.display(), "moved unreadable cache entry aside")
            }
            Ok(None) => debug!(key = %key, "unreadable cache entry already replaced or removed"),
            Err(e) => warn!(key = %key, error = %e, "could not quarantine unreadable cache entry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io;
    use tempfile::TempDir;

    fn key(hex: &str) -> HashKey {
        hex.parse().unwrap()
    }

    fn service(dir: &Path) -> LocalCacheService {
        LocalCacheService::open(
            LocalCacheOptions::new(dir).with_lock_timeout(Duration::from_secs(10)),
        )
        .unwrap()
    }

    #[test]
    fn test_options_defaults() {
        let options = LocalCacheOptions::new("/tmp/cache");

        assert_eq!(options.display_name, "Build cache");
        assert_eq!(options.remove_unused_entries_after_days, 7);
        assert_eq!(options.lock_timeout, Duration::from_secs(60));
        assert_eq!(options.cleanup, CleanupFrequency::Daily);
        assert_eq!(options.lock_mode, LockMode::OnDemand);
        assert_eq!(options.failed_suffix, ".failed");
    }

    #[test]
    fn test_store_then_fetch() {
        let temp_dir = TempDir::new().unwrap();
        let cache = service(temp_dir.path());

        cache
            .store(&key("ABCD"), |out| out.write_all(b"artifact"))
            .unwrap();

        match cache.fetch(&key("abcd")) {
            Fetched::Found(bytes) => assert_eq!(bytes, b"artifact"),
            other => panic!("expected hit, got {other:?}"),
        }
        assert!(matches!(cache.fetch(&key("ABCE")), Fetched::NotFound));
    }

    #[test]
    fn test_store_locally_moves_file() {
        let temp_dir = TempDir::new().unwrap();
        let cache = service(&temp_dir.path().join("cache"));
        let produced = temp_dir.path().join("output.bin");
        fs::write(&produced, b"built").unwrap();

        cache.store_locally(&key("0A0B"), &produced).unwrap();

        assert!(!produced.exists());
        assert!(cache.fetch(&key("0A0B")).is_found());
    }

    #[test]
    fn test_store_locally_rejects_directory() {
        let temp_dir = TempDir::new().unwrap();
        let cache = service(&temp_dir.path().join("cache"));
        let produced = temp_dir.path().join("outputs");
        fs::create_dir(&produced).unwrap();

        let err = cache.store_locally(&key("0A0B"), &produced).unwrap_err();
        assert!(matches!(err, CacheError::StoreWrite { .. }));
        assert!(produced.is_dir());

        // The key is still usable
        cache.store(&key("0A0B"), |out| out.write_all(b"built")).unwrap();
        assert!(cache.fetch(&key("0A0B")).is_found());
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let cache = service(temp_dir.path());
        cache.store(&key("0102"), |out| out.write_all(b"x")).unwrap();

        assert!(cache.remove(&key("0102")).unwrap());
        assert!(!cache.remove(&key("0102")).unwrap());
        assert!(matches!(cache.fetch(&key("0102")), Fetched::NotFound));
    }

    #[test]
    fn test_stats() {
        let temp_dir = TempDir::new().unwrap();
        let cache = service(temp_dir.path());
        cache.store(&key("0102"), |out| out.write_all(b"abc")).unwrap();
        cache.store(&key("0304"), |out| out.write_all(b"defgh")).unwrap();
        cache
            .load(&key("0304"), |_| {
                Err::<(), _>(io::Error::new(io::ErrorKind::InvalidData, "bad"))
            })
            .unwrap_err();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 3);
        assert_eq!(stats.quarantined, 1);
        assert!(stats.cleanup_epoch.is_some());
    }

    #[test]
    fn test_fixed_shared_mode_cannot_store() {
        let temp_dir = TempDir::new().unwrap();
        let cache = LocalCacheService::open(
            LocalCacheOptions::new(temp_dir.path()).with_lock_mode(LockMode::Shared),
        )
        .unwrap();

        let err = cache
            .store(&key("0102"), |out| out.write_all(b"x"))
            .unwrap_err();
        assert!(matches!(err, CacheError::InsufficientLockMode { .. }));
        assert!(matches!(cache.fetch(&key("0102")), Fetched::NotFound));
    }
}
