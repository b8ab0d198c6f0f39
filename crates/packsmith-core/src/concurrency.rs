use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// File name of the advisory run lock inside a target directory.
pub const TARGET_LOCK_NAME: &str = ".packsmith.lock";

/// Exclusive advisory lock on a target directory, held for the whole run.
pub struct TargetLock {
    lock_file: File,
}

impl TargetLock {
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

    /// Take the lock if nobody holds it.
    fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = Self::open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }

    /// Lock `<target>/.packsmith.lock`, failing fast if another run holds it.
    pub fn for_target(target: &Path) -> Result<Self, CoreError> {
        Self::try_acquire(&target.join(TARGET_LOCK_NAME))?
            .ok_or_else(|| CoreError::TargetLocked(target.to_path_buf()))
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Cooperative cancellation flag shared by the retry loop and the assembler.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Route Ctrl-C into `flag`. A second Ctrl-C exits immediately.
pub fn install_signal_handler(flag: ShutdownFlag) {
    let _ = ctrlc::set_handler(move || {
        if flag.is_requested() {
            std::process::exit(130);
        }
        flag.request();
        eprintln!("\nshutdown requested, finishing current operation...");
    });
}
