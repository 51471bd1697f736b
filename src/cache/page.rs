//! Cache keys and payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;

/// Identity of an archive that survives restarts: hex SHA-256 of the
/// canonicalized archive path. The path is carried along for pruning but
/// takes no part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveId {
    id: String,
    path: PathBuf,
}

impl ArchiveId {
    pub fn for_path(path: &Path) -> Result<Self> {
        let canonical = std::fs::canonicalize(path)?;
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        Ok(Self {
            id: hex::encode(digest),
            path: canonical,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Canonical path the id was derived from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PartialEq for ArchiveId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ArchiveId {}

impl Hash for ArchiveId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub archive: ArchiveId,
    pub index: usize,
}

impl PageKey {
    pub fn new(archive: ArchiveId, index: usize) -> Self {
        Self { archive, index }
    }
}

/// A page file owned by the cache. The file is deleted when the last handle
/// to it drops.
#[derive(Debug)]
pub struct CachedFile {
    path: PathBuf,
    len: u64,
}

impl CachedFile {
    pub(crate) fn new(path: PathBuf, len: u64) -> Self {
        Self { path, len }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CachedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed cached page file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("Could not remove {}: {}", self.path.display(), e),
        }
    }
}

/// Decoded bytes or a file handle.
#[derive(Debug)]
pub enum PagePayload {
    Bytes(Bytes),
    File(CachedFile),
}

impl PagePayload {
    pub fn len(&self) -> u64 {
        match self {
            PagePayload::Bytes(bytes) => bytes.len() as u64,
            PagePayload::File(file) => file.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One cached page. Handed out as `Arc<CachedPage>`, a read-only handle.
#[derive(Debug)]
pub struct CachedPage {
    pub key: PageKey,
    pub payload: PagePayload,
}

impl CachedPage {
    pub fn size_bytes(&self) -> u64 {
        self.payload.len()
    }

    /// The page contents. File payloads are read from disk.
    pub async fn bytes(&self) -> Result<Bytes> {
        match &self.payload {
            PagePayload::Bytes(bytes) => Ok(bytes.clone()),
            PagePayload::File(file) => Ok(Bytes::from(tokio::fs::read(&file.path).await?)),
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        match &self.payload {
            PagePayload::File(file) => Some(file.path()),
            PagePayload::Bytes(_) => None,
        }
    }
}
