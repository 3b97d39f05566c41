//! Per-client advisory file lock.
//!
//! Every write to a client's knowledge (ingest, cluster, reset) holds this lock so
//! two processes never mutate the same client at once.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const LOCK_FILE: &str = ".lock";

/// Lock guard holding exclusive access to one client's storage directory.
#[derive(Debug)]
pub struct ClientLock {
    client_id: String,
    path: PathBuf,
    lock_file: Option<File>,
}

impl ClientLock {
    /// Acquire an exclusive lock in `client_dir`, failing fast when it is held.
    pub fn acquire(client_id: &str, client_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(client_dir)
            .map_err(|e| Error::LockError(format!("Failed to create {}: {}", client_dir.display(), e)))?;
        let path = client_dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::LockError(format!("Failed to open lock file: {}", e)))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Locked client {}", client_id);
                Ok(Self {
                    client_id: client_id.to_string(),
                    path,
                    lock_file: Some(lock_file),
                })
            }
            Err(_) => {
                warn!("Client {} is locked by another process", client_id);
                Err(Error::ClientLocked(client_id.to_string()))
            }
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Release the lock manually.
    pub fn release(&mut self) {
        if let Some(file) = self.lock_file.take() {
            let _ = file.unlock();
            // The directory may already be gone after a reset.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for ClientLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempdir().unwrap();
        let _lock = ClientLock::acquire("acme", dir.path()).unwrap();

        let err = ClientLock::acquire("acme", dir.path()).unwrap_err();
        assert!(matches!(err, Error::ClientLocked(ref id) if id == "acme"));
    }

    #[test]
    fn release_allows_reacquire() {
        let dir = tempdir().unwrap();
        let mut lock = ClientLock::acquire("acme", dir.path()).unwrap();
        assert_eq!(lock.client_id(), "acme");
        lock.release();
        assert!(!dir.path().join(LOCK_FILE).exists());

        let again = ClientLock::acquire("acme", dir.path());
        assert!(again.is_ok());
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempdir().unwrap();
        {
            let _lock = ClientLock::acquire("acme", dir.path()).unwrap();
        }
        assert!(ClientLock::acquire("acme", dir.path()).is_ok());
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("clients").join("acme");
        let _lock = ClientLock::acquire("acme", &nested).unwrap();
        assert!(nested.join(LOCK_FILE).exists());
    }
}
