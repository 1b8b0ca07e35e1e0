//! Handle on an open persistent cache.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Instant, SystemTime};

use tempfile::Builder;
use tracing::{debug, info, warn};

use super::cleanup::{CacheCleanupStrategy, CleanupMarker, CleanupReport};
use super::CacheOptions;
use crate::error::{CacheError, CacheResult};
use crate::lock::{lock_file_for, ContendedAction, FileLock, FileLockManager, LockError, LockMode};

/// An open cache directory.
///
/// Operations go through [`with_file_lock`](Self::with_file_lock), which
/// lets one thread at a time work on the cache and holds the directory lock
/// in the required mode while it does. The same thread may nest operations.
pub struct PersistentCache {
    inner: Arc<Inner>,
}

struct Inner {
    base_dir: PathBuf,
    display_name: String,
    lock_mode: LockMode,
    lock_manager: Arc<FileLockManager>,
    cleanup: Option<CacheCleanupStrategy>,
    marker: CleanupMarker,
    state: Mutex<AccessState>,
    released: Condvar,
    /// Another party asked for the lock while an operation was running.
    contended: AtomicBool,
}

#[derive(Default)]
struct AccessState {
    open: bool,
    owner: Option<ThreadId>,
    depth: usize,
    file_lock: Option<FileLock>,
    /// Release request that arrived before its lock was installed.
    early_request: Option<u64>,
    cleaned: bool,
}

impl PersistentCache {
    /// Open the cache directory described by `options`, creating it if needed.
    ///
    /// Fails with [`CacheError::Directory`] if the directory cannot be
    /// created, is not a directory or is not writable. Fixed lock modes take
    /// the directory lock here and keep it until the cache is closed.
    pub fn open(options: CacheOptions, lock_manager: Arc<FileLockManager>) -> CacheResult<Self> {
        let CacheOptions {
            base_dir,
            display_name,
            lock_mode,
            cleanup,
        } = options;

        prepare_directory(&base_dir)?;

        let marker = CleanupMarker::new(&base_dir);
        if cleanup.is_some() && !marker.exists() {
            // Nothing to clean in a fresh cache; start counting from now
            if let Err(e) = marker.write(SystemTime::now()) {
                warn!(display_name = %display_name, error = %e, "could not initialise cleanup timestamp");
            }
        }

        let file_lock = match lock_mode {
            LockMode::Shared | LockMode::Exclusive => {
                Some(lock_manager.lock(&base_dir, lock_mode, &display_name, "open", None)?)
            }
            LockMode::None | LockMode::OnDemand => None,
        };

        debug!(display_name = %display_name, dir = %base_dir.display(), %lock_mode, "opened cache");

        Ok(Self {
            inner: Arc::new(Inner {
                base_dir,
                display_name,
                lock_mode,
                lock_manager,
                cleanup,
                marker,
                state: Mutex::new(AccessState {
                    open: true,
                    file_lock,
                    ..Default::default()
                }),
                released: Condvar::new(),
                contended: AtomicBool::new(false),
            }),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    pub fn lock_mode(&self) -> LockMode {
        self.inner.lock_mode
    }

    /// Time the cleanup frequency counts from: when the last complete
    /// cleanup finished or, for a cache never cleaned, when it was first
    /// opened.
    pub fn cleanup_epoch(&self) -> Option<SystemTime> {
        self.inner.marker.read()
    }

    /// Run `action` with the cache locked for `intent`.
    ///
    /// `intent` is [`LockMode::Shared`] for reads and [`LockMode::Exclusive`]
    /// for writes; any other value counts as shared. After the outermost
    /// action on this thread finishes, a due cleanup runs if the lock held is
    /// exclusive. Errors from `action` are returned as is.
    pub fn with_file_lock<T, E, F>(&self, intent: LockMode, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<CacheError>,
    {
        let intent = match intent {
            LockMode::Exclusive => LockMode::Exclusive,
            _ => LockMode::Shared,
        };

        // One timeout covers both waits
        let deadline = Instant::now() + self.inner.lock_manager.timeout();
        self.inner.acquire_ownership(deadline)?;
        let _ownership = Ownership(&self.inner);

        self.ensure_file_lock(intent, deadline)?;
        let result = action();
        self.inner.maybe_cleanup();
        result
    }

    /// Clean up now, whatever the cleanup frequency says.
    pub fn cleanup(&self) -> CacheResult<CleanupReport> {
        self.with_file_lock(LockMode::Exclusive, || {
            Ok(match &self.inner.cleanup {
                Some(strategy) => self.inner.run_cleanup(strategy),
                None => CleanupReport::default(),
            })
        })
    }

    /// Close the cache, running a due cleanup that has not run yet. Closing
    /// again does nothing.
    pub fn close(&self) -> CacheResult<()> {
        if !self.inner.lock_state().open {
            return Ok(());
        }

        if self.inner.cleanup_due_on_close() {
            let result = self.with_file_lock(LockMode::Exclusive, || {
                if let Some(strategy) = &self.inner.cleanup {
                    self.inner.run_cleanup(strategy);
                }
                Ok::<_, CacheError>(())
            });
            if let Err(e) = result {
                warn!(display_name = %self.inner.display_name, error = %e, "cleanup on close failed");
            }
        }

        let deadline = Instant::now() + self.inner.lock_manager.timeout();
        match self.inner.acquire_ownership(deadline) {
            Ok(()) => {}
            Err(CacheError::Closed(_)) => return Ok(()),
            Err(e) => return Err(e),
        }

        let file_lock = {
            let mut state = self.inner.lock_state();
            state.open = false;
            state.owner = None;
            state.depth = 0;
            state.file_lock.take()
        };
        self.inner.released.notify_all();
        drop(file_lock);

        debug!(display_name = %self.inner.display_name, "closed cache");
        Ok(())
    }

    /// Make sure the directory lock is held in a mode allowing `intent`.
    /// Called by the owning thread only.
    fn ensure_file_lock(&self, intent: LockMode, deadline: Instant) -> CacheResult<()> {
        let inner = &self.inner;
        match inner.lock_mode {
            LockMode::None => return Ok(()),
            LockMode::Shared if intent == LockMode::Exclusive => {
                return Err(CacheError::InsufficientLockMode {
                    display_name: inner.display_name.clone(),
                    held: LockMode::Shared,
                    required: intent,
                })
            }
            LockMode::Shared | LockMode::Exclusive => return Ok(()),
            LockMode::OnDemand => {}
        }

        let previous = {
            let mut state = inner.lock_state();
            let held = state
                .file_lock
                .as_ref()
                .filter(|lock| lock.is_held())
                .map(FileLock::mode);
            if held == Some(LockMode::Exclusive) || held == Some(intent) {
                return Ok(());
            }
            inner.contended.store(false, Ordering::SeqCst);
            state.early_request = None;
            state.file_lock.take()
        };

        // Upgrading releases the shared lock first; flock conversion is not
        // atomic either, and holding it would deadlock two upgraders.
        drop(previous);

        let weak = Arc::downgrade(&self.inner);
        let on_contended: ContendedAction = Arc::new(move |lock_id| {
            if let Some(inner) = weak.upgrade() {
                inner.on_contended(lock_id);
            }
        });

        let lock = inner.lock_manager.lock_until(
            &inner.base_dir,
            intent,
            &inner.display_name,
            intent.as_str(),
            Some(on_contended),
            deadline,
        )?;

        let mut state = inner.lock_state();
        if state.early_request.take() == Some(lock.id()) {
            inner.contended.store(true, Ordering::SeqCst);
        }
        state.file_lock = Some(lock);
        Ok(())
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, AccessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until no other thread works on the cache, at most until
    /// `deadline`.
    fn acquire_ownership(&self, deadline: Instant) -> CacheResult<()> {
        let me = thread::current().id();
        let timeout = self.lock_manager.timeout();
        let mut state = self.lock_state();

        loop {
            if !state.open {
                return Err(CacheError::Closed(self.display_name.clone()));
            }
            match state.owner {
                None => {
                    state.owner = Some(me);
                    break;
                }
                Some(owner) if owner == me => break,
                Some(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LockError::Timeout {
                            display_name: self.display_name.clone(),
                            lock_file: lock_file_for(&self.base_dir),
                            timeout,
                            owner: None,
                        }
                        .into());
                    }
                    state = self
                        .released
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        state.depth += 1;
        Ok(())
    }

    fn release_ownership(&self) {
        let mut state = self.lock_state();
        state.depth = state.depth.saturating_sub(1);
        if state.depth > 0 {
            return;
        }

        state.owner = None;
        if self.contended.swap(false, Ordering::SeqCst) {
            if let Some(lock) = state.file_lock.take() {
                debug!(id = lock.id(), display_name = %self.display_name, "releasing lock on request");
                drop(lock);
            }
        }
        drop(state);
        self.released.notify_all();
    }

    /// Runs on the contention watcher thread.
    fn on_contended(&self, lock_id: u64) {
        let mut state = self.lock_state();
        let current = state.file_lock.as_ref().map(FileLock::id);
        if current != Some(lock_id) {
            state.early_request = Some(lock_id);
            return;
        }

        if state.owner.is_some() {
            // Released when the running operation completes
            self.contended.store(true, Ordering::SeqCst);
        } else if let Some(lock) = state.file_lock.take() {
            debug!(id = lock_id, display_name = %self.display_name, "releasing idle lock on request");
            drop(lock);
        }
    }

    fn cleanup_due(&self, strategy: &CacheCleanupStrategy) -> bool {
        strategy
            .frequency()
            .should_cleanup(self.marker.read(), SystemTime::now())
    }

    fn cleanup_due_on_close(&self) -> bool {
        let Some(strategy) = &self.cleanup else {
            return false;
        };
        if self.lock_mode == LockMode::Shared || self.lock_state().cleaned {
            return false;
        }
        self.cleanup_due(strategy)
    }

    /// Called by the owner after each action.
    fn maybe_cleanup(&self) {
        let Some(strategy) = &self.cleanup else {
            return;
        };

        {
            let state = self.lock_state();
            if state.depth != 1 || state.cleaned {
                return;
            }
            let exclusive = self.lock_mode == LockMode::None
                || state
                    .file_lock
                    .as_ref()
                    .is_some_and(|lock| lock.is_held() && lock.mode() == LockMode::Exclusive);
            if !exclusive {
                return;
            }
        }

        if self.cleanup_due(strategy) {
            self.run_cleanup(strategy);
        }
    }

    fn run_cleanup(&self, strategy: &CacheCleanupStrategy) -> CleanupReport {
        let started = Instant::now();
        let should_stop = || self.contended.load(Ordering::SeqCst);
        let report = strategy.clean(&self.base_dir, &should_stop);

        if report.interrupted {
            info!(
                display_name = %self.display_name,
                deleted = report.deleted,
                "cleanup interrupted, lock requested by another process"
            );
            return report;
        }

        if let Err(e) = self.marker.write(SystemTime::now()) {
            warn!(display_name = %self.display_name, error = %e, "could not record cleanup time");
        }
        self.lock_state().cleaned = true;

        for error in &report.errors {
            warn!(display_name = %self.display_name, error = %error, "cleanup could not delete file");
        }
        info!(
            display_name = %self.display_name,
            scanned = report.scanned,
            deleted = report.deleted,
            bytes_reclaimed = report.bytes_reclaimed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cleaned up cache"
        );
        report
    }
}

/// Gives up in-process ownership when dropped, also on panic.
struct Ownership<'a>(&'a Inner);

impl Drop for Ownership<'_> {
    fn drop(&mut self) {
        self.0.release_ownership();
    }
}

fn prepare_directory(base_dir: &Path) -> CacheResult<()> {
    if base_dir.exists() && !base_dir.is_dir() {
        return Err(CacheError::directory(base_dir, "not a directory"));
    }
    fs::create_dir_all(base_dir)
        .map_err(|e| CacheError::directory(base_dir, format!("cannot be created: {e}")))?;

    Builder::new()
        .prefix(".write-check")
        .tempfile_in(base_dir)
        .map_err(|e| CacheError::directory(base_dir, format!("not writable: {e}")))?;
    Ok(())
}

impl fmt::Debug for PersistentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentCache")
            .field("base_dir", &self.inner.base_dir)
            .field("display_name", &self.inner.display_name)
            .field("lock_mode", &self.inner.lock_mode)
            .finish_non_exhaustive()
    }
}

impl Drop for PersistentCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(display_name = %self.inner.display_name, error = %e, "failed to close cache");
        }
    }
}
