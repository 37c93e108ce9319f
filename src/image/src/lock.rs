//! Interprocess locking using a combination of flock and process-local
//! mutexes.
//!
//! A [`PathLock`] excludes both other processes and other tasks in the
//! current process. It works by first acquiring a local lock and then a
//! file lock.
//!
//! The reason a local lock is taken first are the limits of interprocess
//! locking on Linux: closing any descriptor of a locked file releases the
//! lock for the whole process, so the same lock file must never be held
//! through more than one descriptor per process. The local mutex funnels
//! all in-process contenders through a single file-lock owner at a time.
//! See: <http://0pointer.de/blog/projects/locking.html>

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use rootpull_core::{PullError, Result};
use rustix::fs::{flock, FlockOperation};
use tokio::sync::{Mutex as LocalMutex, OwnedMutexGuard};

lazy_static! {
    // one local mutex per lock file path, for the lifetime of the process
    static ref LOCAL_LOCKS: Mutex<HashMap<PathBuf, Arc<LocalMutex<()>>>> =
        Mutex::new(HashMap::new());
}

/// A named exclusive lock backed by a lock file.
///
/// Acquisition blocks until the lock is available; there is no try-lock and
/// no timeout. Release happens when the returned guard is dropped: file
/// lock first, local mutex second, the exact reverse of acquisition.
pub struct PathLock {
    path: PathBuf,
}

/// Holds a [`PathLock`] until dropped.
///
/// The file descriptor is declared before the local guard so it is closed
/// (releasing the flock) before the local mutex opens up.
#[derive(Debug)]
pub struct PathLockGuard {
    _file: File,
    _local: OwnedMutexGuard<()>,
}

impl PathLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Acquire the lock, blocking until it is held.
    pub async fn lock(&self) -> Result<PathLockGuard> {
        let local = self.local_mutex();
        let guard = local.lock_owned().await;

        // the flock can wait for an unbounded time on another process, so
        // it must not hold up a runtime worker thread
        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || -> Result<File> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| PullError::fs("open", &path, e))?;

            flock(&file, FlockOperation::LockExclusive)
                .map_err(|e| PullError::fs("flock", &path, e.into()))?;

            Ok(file)
        })
        .await
        .map_err(|e| {
            PullError::fs(
                "flock",
                &self.path,
                std::io::Error::new(ErrorKind::Other, e),
            )
        })??;

        Ok(PathLockGuard {
            _file: file,
            _local: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn local_mutex(&self) -> Arc<LocalMutex<()>> {
        let mut locks = LOCAL_LOCKS.lock().expect("lock table poisoned");

        locks
            .entry(self.path.clone())
            .or_insert_with(|| Arc::new(LocalMutex::new(())))
            .clone()
    }
}
