//! Lock contention signalling
//!
//! A waiter that cannot get a lock writes a fresh token into the contention
//! marker next to the lock file. A holder that asked to be notified runs a
//! watcher thread polling that marker; once the token changes, the holder's
//! callback runs on the watcher thread and the watcher exits. The callback can
//! therefore fire at most once per acquisition, and it may still fire shortly
//! after the lock has been released.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Callback invoked with the id of the contended lock.
pub type ContendedAction = Arc<dyn Fn(u64) + Send + Sync>;

/// Background watcher for one held lock.
#[derive(Debug)]
pub(crate) struct ContentionWatcher {
    stop: Option<mpsc::Sender<()>>,
}

impl ContentionWatcher {
    /// Start watching `marker` on behalf of lock `lock_id`.
    pub(crate) fn start(
        marker: PathBuf,
        lock_id: u64,
        action: ContendedAction,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let baseline = read_token(&marker);
        let (tx, rx) = mpsc::channel::<()>();

        thread::Builder::new()
            .name(format!("lock-contention-{lock_id}"))
            .spawn(move || loop {
                match rx.recv_timeout(poll_interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if read_token(&marker) != baseline {
                            debug!(lock_id, marker = %marker.display(), "lock release requested");
                            action(lock_id);
                            return;
                        }
                    }
                    // stopped, or the holder went away
                    _ => return,
                }
            })?;

        Ok(Self { stop: Some(tx) })
    }

    /// Stop watching. Does not wait for the thread, which may be the caller.
    pub(crate) fn stop(&mut self) {
        self.stop.take();
    }
}

impl Drop for ContentionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Ask the current holder of a lock to release it.
pub(crate) fn request_release(marker: &Path) -> io::Result<()> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let token = format!(
        "{}:{:?}:{}",
        process::id(),
        thread::current().id(),
        nanos
    );
    fs::write(marker, token)
}

fn read_token(marker: &Path) -> Option<Vec<u8>> {
    fs::read(marker).ok()
}
