//! Plaintext scratch copies of vault items.
//!
//! Readers consume decrypted copies from here and delete them when done.
//! As a backstop the vault purges copies older than the configured lifetime
//! on unlock and on every decrypt, and purges all of them on lock.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ScratchArea {
    dir: PathBuf,
    lifetime: Duration,
}

impl ScratchArea {
    pub fn new(dir: PathBuf, lifetime: Duration) -> Self {
        Self { dir, lifetime }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A fresh temp file for one decrypted copy, removed unless kept.
    pub fn create(&self, extension: Option<&str>) -> Result<tempfile::NamedTempFile> {
        std::fs::create_dir_all(&self.dir)?;
        let suffix = extension.map(|ext| format!(".{ext}")).unwrap_or_default();
        Ok(tempfile::Builder::new()
            .prefix("item-")
            .suffix(&suffix)
            .tempfile_in(&self.dir)?)
    }

    /// Remove copies older than the lifetime. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = SystemTime::now();
        self.purge_where(|modified| {
            now.duration_since(modified)
                .map(|age| age >= self.lifetime)
                .unwrap_or(self.lifetime.is_zero())
        })
    }

    pub fn purge_all(&self) -> Result<usize> {
        self.purge_where(|_| true)
    }

    fn purge_where(&self, expired: impl Fn(SystemTime) -> bool) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                // Removed by its owner while we were listing
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() || !expired(metadata.modified()?) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not purge scratch copy {}: {}", entry.path().display(), e),
            }
        }

        if removed > 0 {
            debug!("Purged {} scratch copies", removed);
        }
        Ok(removed)
    }
}

/// Deletes a scratch copy when dropped.
#[derive(Debug)]
pub struct ScratchGuard {
    path: PathBuf,
}

impl ScratchGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove scratch copy {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_purge_expired_keeps_fresh_copies() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchArea::new(dir.path().join("scratch"), Duration::from_secs(600));
        let (_, fresh) = scratch.create(Some("cbz")).unwrap().keep().unwrap();

        assert_eq!(scratch.purge_expired().unwrap(), 0);
        assert!(fresh.exists());
        assert!(fresh.to_string_lossy().ends_with(".cbz"));

        assert_eq!(scratch.purge_all().unwrap(), 1);
        assert!(!fresh.exists());
    }

    #[test]
    fn test_zero_lifetime_purges_everything() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchArea::new(dir.path().to_path_buf(), Duration::ZERO);
        let (_, copy) = scratch.create(None).unwrap().keep().unwrap();

        assert_eq!(scratch.purge_expired().unwrap(), 1);
        assert!(!copy.exists());
    }

    #[test]
    fn test_missing_dir_purges_nothing() {
        let scratch = ScratchArea::new(PathBuf::from("/nonexistent/scratch"), Duration::ZERO);
        assert_eq!(scratch.purge_all().unwrap(), 0);
    }

    #[test]
    fn test_guard_removes_copy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("copy.cbz");
        std::fs::write(&path, b"x").unwrap();
        drop(ScratchGuard::new(path.clone()));
        assert!(!path.exists());
    }
}
