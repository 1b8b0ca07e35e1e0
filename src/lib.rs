//! Local build cache
//!
//! A content-addressed store for build outputs on the local filesystem,
//! shared between processes. Entries are keyed by a [`HashKey`] computed by
//! the caller and hold opaque bytes.
//!
//! - Writes are atomic: content is staged in a temp file and renamed into place.
//! - Reads run under a shared lock and writes under an exclusive one, on a
//!   lock file in the cache directory.
//! - An entry whose content a reader rejects is moved aside, not deleted.
//! - Entries unused for a number of days are removed by periodic cleanup.
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use build_cache::{HashKey, LocalCacheOptions, LocalCacheService};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = LocalCacheService::open(LocalCacheOptions::new("/tmp/build-cache-1"))?;
//! let key = HashKey::sha256(b"inputs of the task");
//!
//! cache.store(&key, |out| out.write_all(b"task output"))?;
//! let output = cache.load(&key, |input| {
//!     let mut bytes = Vec::new();
//!     input.read_to_end(&mut bytes).map(|_| bytes)
//! })?;
//! assert_eq!(output.as_deref(), Some(&b"task output"[..]));
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod config;
pub mod controller;
pub mod error;
pub mod lock;
pub mod persistent;
pub mod service;
pub mod store;

pub use build_cache_key::{HashKey, KeyError};
pub use config::{BuildCacheConfig, ConfigError};
pub use controller::{BuildCacheController, SkipReason, StoreOutcome};
pub use error::{BoxError, CacheError, CacheResult};
pub use lock::{FileLock, FileLockManager, LockError, LockMode};
pub use persistent::{CleanupFrequency, CleanupReport, PersistentCache};
pub use service::{CacheStats, Fetched, LocalCacheOptions, LocalCacheService};
