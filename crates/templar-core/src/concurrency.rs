use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Exclusive advisory lock on the state directory. At most one orchestrator
/// run mutates metadata, cache and work directory at a time.
pub struct StoreLock {
    lock_file: File,
}

impl StoreLock {
    fn open(lock_path: &Path) -> Result<File, CoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?)
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = Self::open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("acquired run lock {}", lock_path.display());
                Ok(Some(Self { lock_file: file }))
            }
            Err(_) => Ok(None),
        }
    }

    /// Take the lock or fail with [`CoreError::Locked`].
    pub fn acquire_or_fail(lock_path: &Path) -> Result<Self, CoreError> {
        Self::try_acquire(lock_path)?.ok_or_else(|| CoreError::Locked(lock_path.to_path_buf()))
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C stops the run after the in-flight template is cleaned up;
/// a second one exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if shutdown_requested() {
            std::process::exit(1);
        }
        request_shutdown();
        eprintln!("\ninterrupt received, cleaning up the current template...");
    });
}

pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
