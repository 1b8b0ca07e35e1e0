//! Cross-process file locking
//!
//! Advisory locks on a lock file per target, in shared or exclusive mode.
//! Acquisition polls with backoff until a configurable timeout and emits
//! diagnostics when contention lasts. A holder may register a callback that
//! fires when another process or thread asks for the lock, so it can hand the
//! lock over sooner.
//!
//! ## Lock files
//!
//! - directory target `<dir>`: `<dir>/<dirname>.lock`
//! - file target `<file>`: `<parent>/<file>.lock`
//! - contention requests: `<lockfile>.contended`

mod contention;
mod manager;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use contention::ContendedAction;
pub use manager::{
    contention_marker_for, lock_file_for, FileLock, FileLockManager, LockError, LockOwner,
    LockResult, DEFAULT_LOCK_TIMEOUT,
};

/// How a lock target is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// No locking at all
    None,
    /// Many readers, no writer
    Shared,
    /// Single holder
    Exclusive,
    /// Taken on first use and kept until another party asks for it.
    /// Only meaningful for a persistent cache; the lock manager rejects it.
    #[default]
    OnDemand,
}

impl LockMode {
    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
            Self::OnDemand => "on_demand",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
