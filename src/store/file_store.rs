//! Content-addressed entry store.
//!
//! Uses a two-level fan-out: `<root>/<HEX[0:2]>/<HEX>`. Quarantined entries
//! sit next to the entry they replaced, with a suffix appended.
//!
//! Entries are only ever replaced by renaming a new file over them, so an
//! [`EntryIdentity`] taken at lookup tells whether the file at the entry path
//! is still the one that was looked up.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use build_cache_key::HashKey;
use walkdir::WalkDir;

use crate::error::{CacheError, CacheResult};

/// Suffix for entries whose content could not be read back.
pub const DEFAULT_FAILED_SUFFIX: &str = ".failed";

/// Shard directory name length, in hex digits.
const PREFIX_LEN: usize = 2;

/// Which file an entry path pointed to. Unaffected by access tracking,
/// which only touches the modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryIdentity {
    size: u64,
    #[cfg(unix)]
    device: u64,
    #[cfg(unix)]
    inode: u64,
    #[cfg(not(unix))]
    created: Option<SystemTime>,
}

impl EntryIdentity {
    pub fn of(metadata: &fs::Metadata) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Self {
                size: metadata.len(),
                device: metadata.dev(),
                inode: metadata.ino(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                size: metadata.len(),
                created: metadata.created().ok(),
            }
        }
    }
}

/// An entry present in the store.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub key: HashKey,
    pub path: PathBuf,
    pub size: u64,
    /// Last modification, which is also the last recorded access.
    pub modified: SystemTime,
    pub identity: EntryIdentity,
}

impl StoredEntry {
    fn from_path(key: HashKey, path: PathBuf) -> Option<Self> {
        let metadata = fs::metadata(&path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        Some(Self {
            key,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            identity: EntryIdentity::of(&metadata),
            path,
        })
    }
}

/// Maps keys to files under a root directory.
#[derive(Debug, Clone)]
pub struct ContentAddressableFileStore {
    root: PathBuf,
}

impl ContentAddressableFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the entry for `key`. Depends on the key only.
    pub fn entry_path(&self, key: &HashKey) -> PathBuf {
        let hex = key.to_hex();
        let prefix = &hex[..PREFIX_LEN.min(hex.len())];
        self.root.join(prefix).join(hex.as_str())
    }

    /// Path an entry is moved to when quarantined with `suffix`.
    pub fn failed_path(&self, key: &HashKey, suffix: &str) -> PathBuf {
        let mut name = self.entry_path(key).into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Look up the entry for `key`. Absence is not an error.
    pub fn get(&self, key: &HashKey) -> Option<StoredEntry> {
        StoredEntry::from_path(key.clone(), self.entry_path(key))
    }

    /// Move `source` into the store as the entry for `key`, replacing any
    /// existing entry.
    ///
    /// `source` must be a regular file on the same filesystem as the store;
    /// anything else, and a rename that fails for any reason, cross-device
    /// included, is reported as [`CacheError::StoreWrite`].
    pub fn move_into(&self, key: &HashKey, source: &Path) -> CacheResult<StoredEntry> {
        let target = self.entry_path(key);
        let store_write = |source: io::Error| CacheError::StoreWrite {
            key: key.to_hex(),
            source,
        };

        let metadata = fs::symlink_metadata(source).map_err(store_write)?;
        if !metadata.is_file() {
            return Err(store_write(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", source.display()),
            )));
        }

        if let Some(shard) = target.parent() {
            fs::create_dir_all(shard).map_err(store_write)?;
        }
        fs::rename(source, &target).map_err(store_write)?;

        StoredEntry::from_path(key.clone(), target.clone()).ok_or_else(|| {
            store_write(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} vanished after the move", target.display()),
            ))
        })
    }

    /// Rename the entry for `key` out of the way, keeping its bytes.
    ///
    /// Only the file identified by `expected` is moved. If the entry is gone
    /// or has been replaced since, nothing happens and `Ok(None)` is returned.
    pub fn quarantine(
        &self,
        key: &HashKey,
        suffix: &str,
        expected: &EntryIdentity,
    ) -> io::Result<Option<PathBuf>> {
        let path = self.entry_path(key);
        let current = match fs::metadata(&path) {
            Ok(metadata) => EntryIdentity::of(&metadata),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if &current != expected {
            return Ok(None);
        }

        let failed = self.failed_path(key, suffix);
        fs::rename(&path, &failed)?;
        Ok(Some(failed))
    }

    /// Delete the entry for `key`. Returns whether there was one.
    pub fn remove(&self, key: &HashKey) -> io::Result<bool> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// All entries currently in the store.
    pub fn entries(&self) -> Vec<StoredEntry> {
        self.shard_files()
            .filter_map(|path| {
                let key = path.file_name()?.to_str()?.parse::<HashKey>().ok()?;
                // Only files at their canonical place count
                if self.entry_path(&key) != path {
                    return None;
                }
                StoredEntry::from_path(key, path)
            })
            .collect()
    }

    /// Quarantined entries carrying `suffix`.
    pub fn quarantined(&self, suffix: &str) -> Vec<PathBuf> {
        self.shard_files()
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| name.ends_with(suffix))
            })
            .collect()
    }

    fn shard_files(&self) -> impl Iterator<Item = PathBuf> {
        WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(hex: &str) -> HashKey {
        hex.parse().unwrap()
    }

    #[test]
    fn test_entry_path_structure() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentAddressableFileStore::new(temp_dir.path());

        let path = store.entry_path(&key("abcdef0123"));
        assert_eq!(path, temp_dir.path().join("AB").join("ABCDEF0123"));

        let failed = store.failed_path(&key("abcdef0123"), DEFAULT_FAILED_SUFFIX);
        assert_eq!(failed, temp_dir.path().join("AB").join("ABCDEF0123.failed"));
    }

    #[test]
    fn test_single_byte_key() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentAddressableFileStore::new(temp_dir.path());

        assert_eq!(
            store.entry_path(&key("0f")),
            temp_dir.path().join("0F").join("0F")
        );
    }

    #[test]
    fn test_move_into_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentAddressableFileStore::new(temp_dir.path());
        let source = temp_dir.path().join("staged.part");
        fs::write(&source, b"payload").unwrap();

        assert!(store.get(&key("0102")).is_none());

        let entry = store.move_into(&key("0102"), &source).unwrap();
        assert_eq!(entry.size, 7);
        assert!(!source.exists());

        let found = store.get(&key("0102")).unwrap();
        assert_eq!(found.path, entry.path);
        assert_eq!(fs::read(&found.path).unwrap(), b"payload");
    }

    #[test]
    fn test_move_into_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentAddressableFileStore::new(temp_dir.path());

        for content in [&b"first"[..], &b"second"[..]] {
            let source = temp_dir.path().join("staged.part");
            fs::write(&source, content).unwrap();
            store.move_into(&key("0102"), &source).unwrap();
        }

        let entry = store.get(&key("0102")).unwrap();
        assert_eq!(fs::read(entry.path).unwrap(), b"second");
    }

    #[test]
    fn test_move_missing_source_is_store_write() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentAddressableFileStore::new(temp_dir.path());

        let err = store
            .move_into(&key("0102"), &temp_dir.path().join("missing"))
            .unwrap_err();
        assert!(matches!(err, CacheError::StoreWrite { ref key, .. } if key == "0102"));
    }

    #[test]
    fn test_quarantine_keeps_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentAddressableFileStore::new(temp_dir.path());
        let source = temp_dir.path().join("staged.part");
        fs::write(&source, b"broken").unwrap();
        let entry = store.move_into(&key("0102"), &source).unwrap();

        let failed = store
            .quarantine(&key("0102"), ".failed", &entry.identity)
            .unwrap()
            .unwrap();

        assert!(store.get(&key("0102")).is_none());
        assert_eq!(fs::read(&failed).unwrap(), b"broken");
        assert_eq!(store.quarantined(".failed"), vec![failed]);
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_quarantine_skips_replaced_entry() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentAddressableFileStore::new(temp_dir.path());
        let source = temp_dir.path().join("staged.part");
        fs::write(&source, b"broken").unwrap();
        let stale = store.move_into(&key("0102"), &source).unwrap();

        // Same size, so only the file identity tells them apart
        fs::write(&source, b"repair").unwrap();
        store.move_into(&key("0102"), &source).unwrap();

        let moved = store
            .quarantine(&key("0102"), ".failed", &stale.identity)
            .unwrap();

        assert!(moved.is_none());
        let entry = store.get(&key("0102")).unwrap();
        assert_eq!(fs::read(entry.path).unwrap(), b"repair");
        assert!(store.quarantined(".failed").is_empty());
    }

    #[test]
    fn test_quarantine_missing_entry() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentAddressableFileStore::new(temp_dir.path());
        let source = temp_dir.path().join("staged.part");
        fs::write(&source, b"gone").unwrap();
        let entry = store.move_into(&key("0102"), &source).unwrap();
        store.remove(&key("0102")).unwrap();

        assert!(store
            .quarantine(&key("0102"), ".failed", &entry.identity)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_move_directory_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentAddressableFileStore::new(temp_dir.path());
        let source = temp_dir.path().join("outputs");
        fs::create_dir(&source).unwrap();

        let err = store.move_into(&key("0102"), &source).unwrap_err();

        assert!(matches!(err, CacheError::StoreWrite { .. }));
        assert!(source.is_dir());
        assert!(!store.entry_path(&key("0102")).exists());
    }

    #[test]
    fn test_remove_and_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentAddressableFileStore::new(temp_dir.path());

        for hex in ["0102", "0103", "FF00"] {
            let source = temp_dir.path().join("staged.part");
            fs::write(&source, hex).unwrap();
            store.move_into(&key(hex), &source).unwrap();
        }
        assert_eq!(store.entries().len(), 3);

        assert!(store.remove(&key("0103")).unwrap());
        assert!(!store.remove(&key("0103")).unwrap());

        let mut remaining: Vec<String> = store.entries().iter().map(|e| e.key.to_hex()).collect();
        remaining.sort();
        assert_eq!(remaining, vec!["0102", "FF00"]);
    }

    #[test]
    fn test_entries_ignores_strays() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentAddressableFileStore::new(temp_dir.path());

        fs::write(temp_dir.path().join("cache.lock"), b"").unwrap();
        fs::create_dir_all(temp_dir.path().join("AB")).unwrap();
        fs::write(temp_dir.path().join("AB").join("notes.txt"), b"x").unwrap();
        // Valid hex, wrong shard
        fs::write(temp_dir.path().join("AB").join("CD01"), b"x").unwrap();

        assert!(store.entries().is_empty());
    }
}
