//! Lock acquisition and release

use std::env;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use super::contention::{self, ContendedAction, ContentionWatcher};
use super::LockMode;

/// Default time to wait for a lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Waiting longer than this is reported as contention.
const CONTENTION_WARNING_AFTER: Duration = Duration::from_millis(500);

/// How often a blocked waiter renews its release request.
const RELEASE_REQUEST_INTERVAL: Duration = Duration::from_millis(500);

/// How often a holder checks for release requests.
const CONTENTION_POLL_INTERVAL: Duration = Duration::from_millis(25);

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "timeout waiting to lock {display_name} after {:.1}s{}",
        .timeout.as_secs_f64(),
        describe_owner(.owner)
    )]
    Timeout {
        display_name: String,
        lock_file: PathBuf,
        timeout: Duration,
        owner: Option<LockOwner>,
    },

    #[error("lock mode {0} cannot be requested from the lock manager")]
    UnsupportedMode(LockMode),

    #[error("I/O error on lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn describe_owner(owner: &Option<LockOwner>) -> String {
    match owner {
        Some(owner) => format!(", it is currently held by {owner}"),
        None => String::new(),
    }
}

/// Diagnostic record an exclusive holder leaves in the lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub process: String,
    pub operation: String,
}

impl LockOwner {
    fn to_contents(&self) -> String {
        format!(
            "pid={}\nprocess={}\noperation={}\n",
            self.pid, self.process, self.operation
        )
    }

    /// Parse the contents of a lock file. Returns `None` when nothing usable is there.
    pub fn parse(contents: &str) -> Option<Self> {
        let mut pid = None;
        let mut process = String::new();
        let mut operation = String::new();

        for line in contents.lines() {
            match line.split_once('=') {
                Some(("pid", value)) => pid = value.trim().parse().ok(),
                Some(("process", value)) => process = value.to_string(),
                Some(("operation", value)) => operation = value.to_string(),
                _ => {}
            }
        }

        pid.map(|pid| Self {
            pid,
            process,
            operation,
        })
    }

    fn read_from(lock_file: &Path) -> Option<Self> {
        fs::read_to_string(lock_file)
            .ok()
            .and_then(|contents| Self::parse(&contents))
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} ({})", self.pid, self.process)?;
        if !self.operation.is_empty() {
            write!(f, " for '{}'", self.operation)?;
        }
        Ok(())
    }
}

/// Lock file guarding `target`.
pub fn lock_file_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache".to_string());

    if target.is_dir() {
        target.join(format!("{name}.lock"))
    } else {
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        parent.join(format!("{name}.lock"))
    }
}

/// File a waiter writes to ask the holder of `lock_file` to let go.
pub fn contention_marker_for(lock_file: &Path) -> PathBuf {
    let mut name = lock_file.as_os_str().to_os_string();
    name.push(".contended");
    PathBuf::from(name)
}

/// Hands out advisory locks on lock files.
///
/// The manager carries no per-target state: two managers, or two processes,
/// locking the same target contend through the lock file only.
#[derive(Debug)]
pub struct FileLockManager {
    timeout: Duration,
    process_name: String,
    next_id: AtomicU64,
}

impl Default for FileLockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl FileLockManager {
    pub fn new(timeout: Duration) -> Self {
        let process_name = env::args()
            .next()
            .and_then(|arg0| {
                Path::new(&arg0)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            timeout,
            process_name,
            next_id: AtomicU64::new(1),
        }
    }

    /// Name recorded in lock files for diagnostics.
    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = name.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire a lock on `target`.
    ///
    /// Blocks until the lock is obtained or the timeout elapses. While
    /// blocked, the current holder is asked to release. If `on_contended` is
    /// given, it is called with the returned lock's id once some other party
    /// asks for this lock.
    pub fn lock(
        &self,
        target: &Path,
        mode: LockMode,
        display_name: &str,
        operation: &str,
        on_contended: Option<ContendedAction>,
    ) -> LockResult<FileLock> {
        let deadline = Instant::now() + self.timeout;
        self.lock_until(target, mode, display_name, operation, on_contended, deadline)
    }

    /// Like [`lock`](Self::lock), but gives up at `deadline` instead of a
    /// full timeout from now. Lets a caller that already waited for
    /// something else stay within one timeout overall.
    pub fn lock_until(
        &self,
        target: &Path,
        mode: LockMode,
        display_name: &str,
        operation: &str,
        on_contended: Option<ContendedAction>,
        deadline: Instant,
    ) -> LockResult<FileLock> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let lock_file = lock_file_for(target);

        match mode {
            LockMode::OnDemand => return Err(LockError::UnsupportedMode(mode)),
            LockMode::None => {
                return Ok(FileLock {
                    id,
                    lock_file,
                    display_name: display_name.to_string(),
                    mode,
                    file: None,
                    watcher: None,
                })
            }
            LockMode::Shared | LockMode::Exclusive => {}
        }

        if let Some(parent) = lock_file.parent() {
            fs::create_dir_all(parent).map_err(|e| LockError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_file)
            .map_err(|e| LockError::io(&lock_file, e))?;

        self.wait_for_lock(&file, &lock_file, mode, display_name, deadline)?;

        if mode == LockMode::Exclusive {
            let owner = LockOwner {
                pid: process::id(),
                process: self.process_name.clone(),
                operation: operation.to_string(),
            };
            // Diagnostics only
            if let Err(e) = write_owner(&file, &owner) {
                debug!(lock_file = %lock_file.display(), error = %e, "could not record lock owner");
            }
        }

        let marker = contention_marker_for(&lock_file);
        let watcher = on_contended.and_then(|action| {
            match ContentionWatcher::start(marker, id, action, CONTENTION_POLL_INTERVAL) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(lock_file = %lock_file.display(), error = %e, "could not watch for lock contention");
                    None
                }
            }
        });

        debug!(id, %mode, display_name, operation, "acquired lock");

        Ok(FileLock {
            id,
            lock_file,
            display_name: display_name.to_string(),
            mode,
            file: Some(file),
            watcher,
        })
    }

    fn wait_for_lock(
        &self,
        file: &File,
        lock_file: &Path,
        mode: LockMode,
        display_name: &str,
        deadline: Instant,
    ) -> LockResult<()> {
        let marker = contention_marker_for(lock_file);
        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut warned = false;
        let mut last_request: Option<Instant> = None;

        loop {
            if sys::try_lock(file, lock_file, mode).map_err(|e| LockError::io(lock_file, e))? {
                if warned {
                    warn!(
                        display_name,
                        waited_secs = start.elapsed().as_secs_f64(),
                        "lock acquired after contention"
                    );
                }
                return Ok(());
            }

            if last_request.map_or(true, |t| t.elapsed() >= RELEASE_REQUEST_INTERVAL) {
                if let Err(e) = contention::request_release(&marker) {
                    debug!(marker = %marker.display(), error = %e, "could not request lock release");
                }
                last_request = Some(Instant::now());
            }

            let elapsed = start.elapsed();
            if !warned && elapsed > CONTENTION_WARNING_AFTER {
                let owner = LockOwner::read_from(lock_file);
                warn!(
                    display_name,
                    lock_file = %lock_file.display(),
                    owner = %describe_owner(&owner),
                    "lock contention, waiting"
                );
                warned = true;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    display_name: display_name.to_string(),
                    lock_file: lock_file.to_path_buf(),
                    timeout: self.timeout,
                    owner: LockOwner::read_from(lock_file),
                });
            }

            thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

fn write_owner(mut file: &File, owner: &LockOwner) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(owner.to_contents().as_bytes())?;
    file.flush()
}

/// A held lock. Released on drop.
pub struct FileLock {
    id: u64,
    lock_file: PathBuf,
    display_name: String,
    mode: LockMode,
    file: Option<File>,
    watcher: Option<ContentionWatcher>,
}

impl FileLock {
    /// Identifier passed to the contention callback.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    /// Whether the underlying lock is still held.
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock. Calling it again does nothing.
    pub fn release(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }

        if let Some(file) = self.file.take() {
            if self.mode == LockMode::Exclusive {
                let _ = file.set_len(0);
            }
            sys::unlock(&file, &self.lock_file);
            debug!(id = self.id, display_name = %self.display_name, "released lock");
        }
    }
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock")
            .field("id", &self.id)
            .field("lock_file", &self.lock_file)
            .field("mode", &self.mode)
            .field("held", &self.is_held())
            .finish()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    use crate::lock::LockMode;

    pub(super) fn try_lock(file: &File, _lock_file: &Path, mode: LockMode) -> io::Result<bool> {
        let operation = match mode {
            LockMode::Shared => libc::LOCK_SH,
            _ => libc::LOCK_EX,
        };

        let result = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub(super) fn unlock(file: &File, _lock_file: &Path) {
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Without flock, a sentinel created exclusively next to the lock file marks
/// the holder. Shared requests are treated as exclusive.
#[cfg(not(unix))]
mod sys {
    use std::fs::{self, File, OpenOptions};
    use std::io;
    use std::path::{Path, PathBuf};

    use crate::lock::LockMode;

    fn sentinel(lock_file: &Path) -> PathBuf {
        let mut name = lock_file.as_os_str().to_os_string();
        name.push(".held");
        PathBuf::from(name)
    }

    pub(super) fn try_lock(_file: &File, lock_file: &Path, _mode: LockMode) -> io::Result<bool> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(sentinel(lock_file))
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(super) fn unlock(_file: &File, lock_file: &Path) {
        let _ = fs::remove_file(sentinel(lock_file));
    }
}
