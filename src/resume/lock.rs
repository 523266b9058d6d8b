//! Exclusive advisory lock on the ledger
//!
//! Two runs writing the same output root would interleave ledger appends, so
//! the second one fails fast instead of waiting.

use super::{LedgerError, LedgerResult};
use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Held for as long as the value lives; released when the file closes.
pub struct LedgerLock {
    _lock: RwLock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for LedgerLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerLock").field("path", &self.path).finish()
    }
}

impl LedgerLock {
    /// Lock file guarding `ledger_path` (`<ledger>.lock`)
    pub fn lock_path(ledger_path: &Path) -> PathBuf {
        let mut name = ledger_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        ledger_path.with_file_name(name)
    }

    /// Try to take the lock without blocking
    pub fn try_acquire(ledger_path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = ledger_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LedgerError::IoError(format!("{}: {e}", parent.display())))?;
            }
        }

        let path = Self::lock_path(ledger_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| LedgerError::IoError(format!("Failed to open lock file: {e}")))?;

        let mut lock = RwLock::new(file);
        let guard = lock
            .try_write()
            .map_err(|_| LedgerError::Locked(path.display().to_string()))?;
        // The OS lock belongs to the open file; dropping the guard would unlock
        // it early, so it is released when `lock` closes the file instead.
        std::mem::forget(guard);

        Ok(Self { _lock: lock, path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
