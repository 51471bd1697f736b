//! On-disk vault layout.
//!
//! ```text
//! <root>/vault.json      manifest: salt, KDF params, key verifier
//! <root>/index.bin       item index, encrypted with the vault key
//! <root>/items/<id>.cvx  encrypted blobs
//! <root>/scratch/        plaintext copies handed to readers
//! ```
//!
//! The manifest is written last during setup and doubles as the
//! "is set up" marker. Every write goes through a temp file and a rename.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::crypto::{self, KdfParams, SymmetricKey};
use crate::error::{Error, Result};

pub const MANIFEST_VERSION: u32 = 1;
const VERIFIER_PLAINTEXT: &[u8] = b"comicvault.key-check.v1";

/// A file held in the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultItem {
    pub id: Uuid,
    pub original_path: PathBuf,
    pub encrypted_path: PathBuf,
    /// Plaintext size
    pub size_bytes: u64,
    pub added_date: DateTime<Utc>,
}

impl VaultItem {
    pub fn file_name(&self) -> String {
        self.original_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Lowercased extension of the original file, if any.
    pub fn extension(&self) -> Option<String> {
        self.original_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultManifest {
    pub version: u32,
    /// Hex-encoded KDF salt
    pub salt: String,
    pub kdf: KdfParams,
    /// Hex blob proving a candidate key is the vault key
    pub verifier: String,
    /// Hex blob from the platform keychain, present when biometric unlock is on
    pub biometric_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl VaultManifest {
    pub fn new(salt: &[u8], kdf: KdfParams, key: &SymmetricKey) -> Result<Self> {
        Ok(Self {
            version: MANIFEST_VERSION,
            salt: hex::encode(salt),
            kdf,
            verifier: hex::encode(crypto::encrypt(VERIFIER_PLAINTEXT, key)?),
            biometric_key: None,
            created_at: Utc::now(),
        })
    }

    pub fn salt_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(&self.salt).map_err(|_| Error::Io("vault manifest is damaged".to_string()))
    }

    /// Whether `key` opens this vault. Wrong keys and damaged verifiers look
    /// the same.
    pub fn verify(&self, key: &SymmetricKey) -> bool {
        hex::decode(&self.verifier)
            .ok()
            .and_then(|blob| crypto::decrypt(&blob, key).ok())
            .is_some_and(|plain| plain == VERIFIER_PLAINTEXT)
    }
}

#[derive(Debug, Clone)]
pub struct VaultLayout {
    root: PathBuf,
}

impl VaultLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("vault.json")
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.bin")
    }

    pub fn items_dir(&self) -> PathBuf {
        self.root.join("items")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch")
    }

    pub fn item_path(&self, id: &Uuid) -> PathBuf {
        self.items_dir().join(format!("{id}.cvx"))
    }

    pub fn create_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.items_dir())?;
        std::fs::create_dir_all(self.scratch_dir())?;
        Ok(())
    }

    pub fn is_set_up(&self) -> bool {
        self.manifest_path().is_file()
    }

    pub fn read_manifest(&self) -> Result<VaultManifest> {
        let bytes = match std::fs::read(self.manifest_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::VaultNotSetUp),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|_| Error::Io("vault manifest is damaged".to_string()))
    }

    pub fn write_manifest(&self, manifest: &VaultManifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| Error::Io(format!("encode vault manifest: {e}")))?;
        write_atomic(&self.manifest_path(), &json)
    }

    pub fn read_index(&self, key: &SymmetricKey) -> Result<Vec<VaultItem>> {
        let blob = match std::fs::read(self.index_path()) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let plain = zeroize::Zeroizing::new(crypto::decrypt(&blob, key)?);
        serde_json::from_slice(&plain).map_err(|_| Error::DecryptionFailed)
    }

    pub fn write_index(&self, key: &SymmetricKey, items: &[VaultItem]) -> Result<()> {
        let plain = zeroize::Zeroizing::new(
            serde_json::to_vec(items).map_err(|e| Error::Io(format!("encode vault index: {e}")))?,
        );
        write_atomic(&self.index_path(), &crypto::encrypt(&plain, key)?)
    }
}

/// Write through a sibling temp file and rename over `path`.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error.to_string()))?;
    Ok(())
}
