//! Advisory inter-process lock on `"{path}.lock"`
//!
//! The lock is an exclusive `flock` taken through `fs2`, polled until a
//! deadline so a stuck holder surfaces as `ConcurrencyTimeout` instead of a
//! hang. Locks are released on drop. Every held lock is also recorded in a
//! process-wide registry so the signal handler can remove the artifacts of
//! a process that is being killed.
//!
//! Artifacts are only removed on the exit path, possibly while other
//! processes wait on them. A waiter that wins the lock on an unlinked inode
//! re-opens the path and tries again. Removing the artifact also closes the
//! publish gate, so a critical section still running on another thread of
//! the exiting process can no longer overwrite the database.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use fs2::FileExt;
use tracing::{debug, warn};

use crate::{Error, Result};

fn held_locks() -> &'static DashSet<PathBuf> {
    static HELD: OnceLock<DashSet<PathBuf>> = OnceLock::new();
    HELD.get_or_init(DashSet::new)
}

/// Orders snapshot publication against artifact removal on the exit path.
#[derive(Debug, Default)]
pub(crate) struct PublishGate {
    closed: AtomicBool,
    running: Mutex<()>,
}

impl PublishGate {
    /// Run `publish` unless the gate is closed. `close` waits for it.
    pub(crate) fn publish<T>(&self, publish: impl FnOnce() -> Result<T>) -> Result<T> {
        let _running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        publish()
    }

    /// Refuse every later publish and wait for a running one to finish.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        drop(self.running.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

fn publish_gate() -> &'static PublishGate {
    static GATE: OnceLock<PublishGate> = OnceLock::new();
    GATE.get_or_init(PublishGate::default)
}

/// Publish a snapshot, unless held locks were already released for exit.
pub(crate) fn publish_while_held<T>(publish: impl FnOnce() -> Result<T>) -> Result<T> {
    publish_gate().publish(publish)
}

/// Lock file path for a database path
#[must_use]
pub fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Remove the lock artifacts of every lock this process holds.
///
/// Meant for the exit path: the descriptors themselves are released by the
/// OS when the process ends. Waits for a publish in progress, and from then
/// on every commit of this process fails with `ShuttingDown`. Returns the
/// number of artifacts removed.
pub fn release_held_locks() -> usize {
    publish_gate().close();
    let paths: Vec<PathBuf> = held_locks().iter().map(|p| p.key().clone()).collect();
    let mut removed = 0;
    for path in paths {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "could not remove lock file"),
        }
        held_locks().remove(&path);
    }
    removed
}

/// True if this process currently holds the lock at `lock_path`
#[must_use]
pub fn is_held(lock_path: &Path) -> bool {
    held_locks().contains(lock_path)
}

/// An acquired exclusive lock
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock at `path`, polling every `poll` until `timeout`.
    ///
    /// # Errors
    ///
    /// `ConcurrencyTimeout` when the deadline passes, `Io` if the lock file
    /// cannot be created.
    pub fn acquire(path: &Path, timeout: Duration, poll: Duration) -> Result<Self> {
        let started = Instant::now();
        let mut file = open_lock_file(path)?;
        let mut reported = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    if same_inode(&file, path)? {
                        held_locks().insert(path.to_path_buf());
                        debug!(path = %path.display(), waited = ?started.elapsed(), "lock acquired");
                        return Ok(Self {
                            file,
                            path: path.to_path_buf(),
                        });
                    }
                    // The artifact was removed or replaced while we waited.
                    let _ = FileExt::unlock(&file);
                    file = open_lock_file(path)?;
                    continue;
                }
                Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {}
                Err(err) => return Err(err.into()),
            }

            let waited = started.elapsed();
            if waited >= timeout {
                warn!(path = %path.display(), ?waited, "lock timeout");
                return Err(Error::ConcurrencyTimeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            if !reported {
                debug!(path = %path.display(), "waiting for lock");
                reported = true;
            }
            thread::sleep(poll.min(timeout.saturating_sub(waited)));
        }
    }

    /// Lock file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        held_locks().remove(&self.path);
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release lock");
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

#[cfg(unix)]
fn same_inode(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.ino() == current.ino() && held.dev() == current.dev()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(not(unix))]
fn same_inode(_file: &File, path: &Path) -> Result<bool> {
    Ok(path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/db.json")),
            PathBuf::from("/tmp/db.json.lock")
        );
    }

    #[test]
    fn test_second_handle_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json.lock");
        let held = FileLock::acquire(&path, Duration::from_secs(1), Duration::from_millis(5)).unwrap();
        assert!(is_held(&path));

        let err = FileLock::acquire(&path, Duration::from_millis(50), Duration::from_millis(5))
            .unwrap_err();
        assert!(err.is_timeout());

        drop(held);
        assert!(!is_held(&path));
        FileLock::acquire(&path, Duration::from_millis(50), Duration::from_millis(5)).unwrap();
    }

    #[test]
    fn test_closed_gate_refuses_publish() {
        let gate = PublishGate::default();
        assert_eq!(gate.publish(|| Ok(1)).unwrap(), 1);
        gate.close();
        assert!(matches!(gate.publish(|| Ok(2)), Err(Error::ShuttingDown)));
    }

    #[test]
    fn test_close_waits_for_running_publish() {
        let gate = std::sync::Arc::new(PublishGate::default());
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let publisher = {
            let gate = std::sync::Arc::clone(&gate);
            std::thread::spawn(move || {
                gate.publish(|| {
                    started_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(100));
                    Ok(Instant::now())
                })
            })
        };
        started_rx.recv().unwrap();
        gate.close();
        let closed_at = Instant::now();

        let published_at = publisher.join().unwrap().unwrap();
        assert!(published_at <= closed_at);
    }

    #[test]
    fn test_waiter_survives_artifact_removal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json.lock");
        let held = FileLock::acquire(&path, Duration::from_secs(1), Duration::from_millis(5)).unwrap();

        let waiter_path = path.clone();
        let waiter = std::thread::spawn(move || {
            FileLock::acquire(&waiter_path, Duration::from_secs(5), Duration::from_millis(5))
                .map(|lock| lock.path().exists())
        });
        std::thread::sleep(Duration::from_millis(50));
        std::fs::remove_file(&path).unwrap();
        drop(held);

        assert!(waiter.join().unwrap().unwrap(), "waiter re-created the artifact");
    }
}
