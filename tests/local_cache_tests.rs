//! Local cache correctness tests
//!
//! Store/load behaviour of the local build cache against a real directory:
//! round trips, misses, failing writers and readers, overwrites and
//! concurrent writers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use build_cache::{
    CacheError, Fetched, HashKey, LocalCacheOptions, LocalCacheService, LockMode,
};
use proptest::prelude::*;
use tempfile::TempDir;

fn open_cache(dir: &Path) -> LocalCacheService {
    LocalCacheService::open(LocalCacheOptions::new(dir).with_lock_timeout(Duration::from_secs(30)))
        .unwrap()
}

fn key(hex: &str) -> HashKey {
    hex.parse().unwrap()
}

fn read_all(cache: &LocalCacheService, key: &HashKey) -> Option<Vec<u8>> {
    cache
        .load(key, |input| {
            let mut bytes = Vec::new();
            input.read_to_end(&mut bytes).map(|_| bytes)
        })
        .unwrap()
}

/// Every file below `dir`, relative to it.
fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(dir).unwrap().to_path_buf())
        .collect();
    files.sort();
    files
}

fn temp_files(dir: &Path) -> Vec<PathBuf> {
    files_under(dir)
        .into_iter()
        .filter(|p| p.to_string_lossy().ends_with(".part"))
        .collect()
}

// =============================================================================
// Round trip
// =============================================================================

#[test]
fn test_store_then_load_returns_same_bytes() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(temp_dir.path());
    let key = key("ABCDEF0123456789");

    cache
        .store(&key, |out| out.write_all(b"compiled classes"))
        .unwrap();

    assert_eq!(read_all(&cache, &key).as_deref(), Some(&b"compiled classes"[..]));
    assert!(temp_dir.path().join("AB").join("ABCDEF0123456789").is_file());
}

#[test]
fn test_entry_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let key = HashKey::sha256(b"task inputs");

    {
        let cache = open_cache(temp_dir.path());
        cache.store(&key, |out| out.write_all(b"persisted")).unwrap();
        cache.close().unwrap();
    }

    let cache = open_cache(temp_dir.path());
    assert_eq!(read_all(&cache, &key).as_deref(), Some(&b"persisted"[..]));
}

#[test]
fn test_empty_payload() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(temp_dir.path());

    cache.store(&key("00"), |_| Ok::<_, io::Error>(())).unwrap();

    assert_eq!(read_all(&cache, &key("00")), Some(Vec::new()));
}

// =============================================================================
// Miss
// =============================================================================

#[test]
fn test_miss_does_not_call_reader_or_touch_disk() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(temp_dir.path());
    // First use creates the lock file
    assert!(matches!(cache.fetch(&key("0000")), Fetched::NotFound));
    let before = files_under(temp_dir.path());

    let mut called = false;
    let result = cache
        .load(&key("DEADBEEF"), |_| {
            called = true;
            Ok::<_, io::Error>(())
        })
        .unwrap();

    assert!(result.is_none());
    assert!(!called, "reader must not run on a miss");
    assert_eq!(files_under(temp_dir.path()), before);
    assert!(matches!(cache.fetch(&key("DEADBEEF")), Fetched::NotFound));
}

// =============================================================================
// Failing writer
// =============================================================================

#[test]
fn test_failing_writer_leaves_no_entry() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(temp_dir.path());
    let key = key("0102030405");

    let err = cache
        .store(&key, |out| {
            out.write_all(b"partial output")?;
            Err(io::Error::new(io::ErrorKind::Other, "producer crashed"))
        })
        .unwrap_err();

    match err {
        CacheError::Write { key: failed, source } => {
            assert_eq!(failed, "0102030405");
            assert!(source.to_string().contains("producer crashed"));
        }
        other => panic!("expected write error, got {other:?}"),
    }

    assert!(read_all(&cache, &key).is_none());
    assert!(temp_files(temp_dir.path()).is_empty());
}

#[test]
fn test_failing_writer_keeps_previous_entry() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(temp_dir.path());
    let key = key("0102030405");

    cache.store(&key, |out| out.write_all(b"good")).unwrap();
    cache
        .store(&key, |out| {
            out.write_all(b"bad")?;
            Err(io::Error::new(io::ErrorKind::Other, "interrupted"))
        })
        .unwrap_err();

    assert_eq!(read_all(&cache, &key).as_deref(), Some(&b"good"[..]));
}

// =============================================================================
// Quarantine
// =============================================================================

#[test]
fn test_failing_reader_quarantines_entry() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(temp_dir.path());
    let key = key("CAFEBABE");

    cache.store(&key, |out| out.write_all(b"corrupt bytes")).unwrap();

    let err = cache
        .load(&key, |input| {
            let mut header = [0u8; 4];
            input.read_exact(&mut header)?;
            Err::<(), _>(io::Error::new(io::ErrorKind::InvalidData, "bad header"))
        })
        .unwrap_err();

    assert!(err.is_corrupt_entry());
    assert!(matches!(err, CacheError::Read { ref key, .. } if key == "CAFEBABE"));

    let failed = temp_dir.path().join("CA").join("CAFEBABE.failed");
    assert_eq!(fs::read(&failed).unwrap(), b"corrupt bytes");
    assert!(!temp_dir.path().join("CA").join("CAFEBABE").exists());

    // Next lookup is a clean miss
    assert!(read_all(&cache, &key).is_none());
}

#[test]
fn test_quarantine_failure_keeps_entry_and_reports_read_error() {
    let temp_dir = TempDir::new().unwrap();
    let key = key("CAFE");
    {
        let cache = open_cache(temp_dir.path());
        cache.store(&key, |out| out.write_all(b"suspect")).unwrap();
        cache.close().unwrap();
    }

    // A fixed shared handle cannot take the exclusive lock quarantine needs
    let cache = LocalCacheService::open(
        LocalCacheOptions::new(temp_dir.path())
            .with_lock_mode(LockMode::Shared)
            .with_lock_timeout(Duration::from_secs(30)),
    )
    .unwrap();

    let err = cache
        .load(&key, |_| {
            Err::<(), _>(io::Error::new(io::ErrorKind::InvalidData, "bad"))
        })
        .unwrap_err();

    assert!(matches!(err, CacheError::Read { ref key, .. } if key == "CAFE"));
    let entry = temp_dir.path().join("CA").join("CAFE");
    assert_eq!(fs::read(&entry).unwrap(), b"suspect");
    assert!(!temp_dir.path().join("CA").join("CAFE.failed").exists());
}

#[cfg(unix)]
#[test]
fn test_entry_replaced_during_failed_read_is_not_quarantined() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(temp_dir.path());
    let key = key("CAFEBABE");
    let entry = temp_dir.path().join("CA").join("CAFEBABE");
    cache.store(&key, |out| out.write_all(b"corrupt bytes")).unwrap();

    // Another writer renames fresh content into place before the reader
    // gives up
    let err = cache
        .load(&key, |_| {
            let replacement = temp_dir.path().join("replacement.part");
            fs::write(&replacement, b"fresh content").unwrap();
            fs::rename(&replacement, &entry).unwrap();
            Err::<(), _>(io::Error::new(io::ErrorKind::InvalidData, "bad header"))
        })
        .unwrap_err();

    assert!(err.is_corrupt_entry());
    assert!(!temp_dir.path().join("CA").join("CAFEBABE.failed").exists());
    assert_eq!(read_all(&cache, &key).as_deref(), Some(&b"fresh content"[..]));
}

#[test]
fn test_directory_in_place_of_entry_is_a_miss() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(temp_dir.path());
    let key = key("CAFEBABE");
    cache.store(&key, |out| out.write_all(b"data")).unwrap();

    // Entry replaced by a directory: opening it for reading fails
    let entry = temp_dir.path().join("CA").join("CAFEBABE");
    fs::remove_file(&entry).unwrap();
    fs::create_dir(&entry).unwrap();

    match cache.fetch(&key) {
        Fetched::NotFound => {}
        other => panic!("a directory is not an entry, got {other:?}"),
    }
}

// =============================================================================
// Overwrite
// =============================================================================

#[test]
fn test_overwrite_keeps_last_and_leaks_no_temp_files() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(temp_dir.path());
    let key = key("0A0B0C");

    cache.store(&key, |out| out.write_all(b"first")).unwrap();
    cache.store(&key, |out| out.write_all(b"second")).unwrap();

    assert_eq!(read_all(&cache, &key).as_deref(), Some(&b"second"[..]));
    assert!(temp_files(temp_dir.path()).is_empty());
}

// =============================================================================
// Concurrency
// =============================================================================

fn payload(writer: u8) -> Vec<u8> {
    (0..64 * 1024).map(|i| (i as u8) ^ writer).collect()
}

fn assert_one_intact_payload(bytes: &[u8]) {
    assert!(
        bytes == payload(1).as_slice() || bytes == payload(2).as_slice(),
        "entry must hold one writer's complete payload"
    );
}

#[test]
fn test_concurrent_stores_through_shared_service() {
    let temp_dir = TempDir::new().unwrap();
    let cache = Arc::new(open_cache(temp_dir.path()));
    let key = key("5EED");

    let handles: Vec<_> = [1u8, 2u8]
        .into_iter()
        .map(|writer| {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    cache
                        .store(&key, |out| out.write_all(&payload(writer)))
                        .expect("store must not time out");
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    assert_one_intact_payload(&read_all(&cache, &key).unwrap());
    assert!(temp_files(temp_dir.path()).is_empty());
}

#[test]
fn test_concurrent_stores_through_separate_services() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().to_path_buf();
    let key = key("5EED");

    let handles: Vec<_> = [1u8, 2u8]
        .into_iter()
        .map(|writer| {
            let dir = dir.clone();
            let key = key.clone();
            thread::spawn(move || {
                let cache = open_cache(&dir);
                for _ in 0..10 {
                    cache
                        .store(&key, |out| out.write_all(&payload(writer)))
                        .expect("store must not time out");
                    let seen = read_all(&cache, &key).expect("entry must exist after a store");
                    assert_one_intact_payload(&seen);
                }
                cache.close().unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    let cache = open_cache(&dir);
    assert_one_intact_payload(&read_all(&cache, &key).unwrap());
}

#[test]
fn test_readers_and_writer_interleave() {
    let temp_dir = TempDir::new().unwrap();
    let cache = Arc::new(open_cache(temp_dir.path()));
    let key = key("5EED");
    cache.store(&key, |out| out.write_all(&payload(1))).unwrap();

    let writer = {
        let cache = Arc::clone(&cache);
        let key = key.clone();
        thread::spawn(move || {
            for round in 0..10u8 {
                let writer = 1 + round % 2;
                cache
                    .store(&key, |out| out.write_all(&payload(writer)))
                    .unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    assert_one_intact_payload(&read_all(&cache, &key).unwrap());
                }
            })
        })
        .collect();

    writer.join().expect("Thread panicked");
    for reader in readers {
        reader.join().expect("Thread panicked");
    }
}

// =============================================================================
// Payload round trip (property)
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_any_payload_round_trips(
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
        key_bytes in proptest::collection::vec(any::<u8>(), 1..32),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let cache = open_cache(temp_dir.path());
        let key = HashKey::from_bytes(&key_bytes).unwrap();

        cache.store(&key, |out| out.write_all(&payload)).unwrap();
        prop_assert_eq!(read_all(&cache, &key), Some(payload));
    }
}
