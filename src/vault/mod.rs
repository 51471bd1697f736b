//! Vault
//!
//! Encrypted-at-rest storage for comics, gated by a password or a biometric
//! check. The vault is either Locked (no key in memory, nothing about its
//! contents readable) or Unlocked (key held in memory until `lock()`).
//! Every content operation checks the state itself; a locked vault refuses
//! them with [`Error::VaultLocked`].
//!
//! Key material never leaves this module except through the
//! [`BiometricUnlock`] seam. Crypto runs on the blocking pool and stops at
//! the next chunk if the calling future is dropped, so callers can bound
//! any operation with [`with_deadline`](crate::task::with_deadline).

pub mod biometric;
pub mod lockout;
pub mod scratch;
pub mod storage;

pub use biometric::BiometricUnlock;
pub use lockout::{BackoffConfig, UnlockStatus, UnlockThrottle};
pub use scratch::{ScratchArea, ScratchGuard};
pub use storage::{VaultItem, VaultLayout, VaultManifest};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{self, KdfParams, SymmetricKey};
use crate::error::{Error, Result};
use crate::task::{checkpoint, CancellationToken};

/// Vault configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory holding the manifest, index, blobs and scratch area
    pub root: PathBuf,
    /// Age after which scratch copies are purged (default 10 minutes)
    pub scratch_lifetime_secs: u64,
    pub kdf: KdfParams,
    pub backoff: BackoffConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".comicvault/vault"),
            scratch_lifetime_secs: 600,
            kdf: KdfParams::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl VaultConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("vault root cannot be empty"));
        }
        if self.scratch_lifetime_secs == 0 {
            return Err(anyhow::anyhow!("scratch_lifetime_secs must be greater than 0"));
        }
        if self.backoff.backoff_threshold == 0 {
            return Err(anyhow::anyhow!("backoff_threshold must be greater than 0"));
        }
        self.kdf.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VaultState {
    Locked,
    Unlocked,
}

/// Key and decrypted index, present only while Unlocked.
struct OpenVault {
    key: Arc<SymmetricKey>,
    items: Vec<VaultItem>,
    /// Cancelled by `lock()`; parent of every crypto task started in this session
    session: CancellationToken,
}

pub struct Vault {
    config: VaultConfig,
    layout: VaultLayout,
    scratch: ScratchArea,
    biometric: Option<Arc<dyn BiometricUnlock>>,
    open: Mutex<Option<OpenVault>>,
    throttle: Mutex<UnlockThrottle>,
}

impl Vault {
    /// A vault rooted at `config.root`, starting Locked.
    pub fn new(config: VaultConfig, biometric: Option<Arc<dyn BiometricUnlock>>) -> Self {
        let layout = VaultLayout::new(config.root.clone());
        let scratch = ScratchArea::new(
            layout.scratch_dir(),
            Duration::from_secs(config.scratch_lifetime_secs),
        );
        let throttle = UnlockThrottle::new(config.backoff);
        Self {
            config,
            layout,
            scratch,
            biometric,
            open: Mutex::new(None),
            throttle: Mutex::new(throttle),
        }
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.dir()
    }

    pub fn is_set_up(&self) -> bool {
        self.layout.is_set_up()
    }

    pub async fn state(&self) -> VaultState {
        if self.open.lock().await.is_some() {
            VaultState::Unlocked
        } else {
            VaultState::Locked
        }
    }

    pub async fn unlock_status(&self) -> UnlockStatus {
        self.throttle.lock().await.status(Instant::now())
    }

    /// First-time setup. Leaves the vault Unlocked.
    pub async fn setup(&self, password: &str, enable_biometric: bool) -> Result<()> {
        let mut open = self.open.lock().await;
        if self.layout.is_set_up() {
            return Err(Error::VaultAlreadySetUp);
        }
        let biometric = match (enable_biometric, &self.biometric) {
            (true, None) => return Err(Error::BiometricUnavailable),
            (true, Some(biometric)) => Some(Arc::clone(biometric)),
            (false, _) => None,
        };

        let salt = crypto::generate_salt();
        let key = derive(password, salt.to_vec(), self.config.kdf).await?;

        let mut manifest = VaultManifest::new(&salt, self.config.kdf, &key)?;
        if let Some(biometric) = biometric {
            manifest.biometric_key = Some(hex::encode(biometric.seal(&key).await?));
        }

        self.layout.create_dirs()?;
        self.layout.write_index(&key, &[])?;
        self.layout.write_manifest(&manifest)?;

        info!(
            "Vault set up at {} (biometric unlock {})",
            self.layout.root().display(),
            if manifest.biometric_key.is_some() { "on" } else { "off" }
        );

        *open = Some(OpenVault {
            key: Arc::new(key),
            items: Vec::new(),
            session: CancellationToken::new(),
        });
        Ok(())
    }

    pub async fn unlock(&self, password: &str) -> Result<()> {
        let mut open = self.open.lock().await;
        if open.is_some() {
            return Ok(());
        }
        self.throttle.lock().await.check(Instant::now())?;

        let manifest = self.layout.read_manifest()?;
        let key = derive(password, manifest.salt_bytes()?, manifest.kdf).await?;
        self.finish_unlock(&mut open, &manifest, key).await
    }

    pub async fn unlock_with_biometric(&self) -> Result<()> {
        let biometric = self.biometric.as_ref().ok_or(Error::BiometricUnavailable)?;

        let mut open = self.open.lock().await;
        if open.is_some() {
            return Ok(());
        }
        self.throttle.lock().await.check(Instant::now())?;

        let manifest = self.layout.read_manifest()?;
        let sealed = manifest
            .biometric_key
            .as_deref()
            .and_then(|blob| hex::decode(blob).ok())
            .ok_or(Error::BiometricUnavailable)?;

        let key = match biometric.unseal(&sealed).await {
            Ok(key) => key,
            Err(err) => {
                self.throttle.lock().await.register_failure(Instant::now());
                warn!("Biometric vault unlock refused");
                return Err(err);
            }
        };
        self.finish_unlock(&mut open, &manifest, key).await
    }

    async fn finish_unlock(
        &self,
        open: &mut Option<OpenVault>,
        manifest: &VaultManifest,
        key: SymmetricKey,
    ) -> Result<()> {
        if !manifest.verify(&key) {
            self.throttle.lock().await.register_failure(Instant::now());
            warn!("Vault unlock failed");
            return Err(Error::AuthenticationFailed);
        }

        let items = self.layout.read_index(&key)?;
        self.throttle.lock().await.register_success();
        info!("Vault unlocked ({} items)", items.len());

        *open = Some(OpenVault {
            key: Arc::new(key),
            items,
            session: CancellationToken::new(),
        });

        if let Err(err) = self.scratch.purge_expired() {
            warn!("Scratch purge after unlock failed: {}", err);
        }
        Ok(())
    }

    /// Discard the key and every scratch copy. Always ends Locked.
    pub async fn lock(&self) {
        let mut open = self.open.lock().await;
        let was_open = match open.take() {
            Some(closed) => {
                closed.session.cancel();
                true
            }
            None => false,
        };

        match self.scratch.purge_all() {
            Ok(removed) => debug!("Lock purged {} scratch copies", removed),
            Err(err) => warn!("Scratch purge on lock failed: {}", err),
        }
        if was_open {
            info!("Vault locked");
        }
    }

    /// Encrypt `path` into the vault, verify the stored copy, then delete
    /// the original. The original is untouched on any failure.
    pub async fn add_file(&self, path: &Path) -> Result<VaultItem> {
        let mut guard = self.open.lock().await;
        let open = guard.as_mut().ok_or(Error::VaultLocked)?;

        let source = std::fs::canonicalize(path)?;
        if source.starts_with(std::fs::canonicalize(self.layout.root())?) {
            return Err(Error::Io("file is already inside the vault".to_string()));
        }

        let id = Uuid::new_v4();
        let target = self.layout.item_path(&id);
        let key = Arc::clone(&open.key);
        let (cancel, _stop_on_drop) = blocking_token(&open.session);

        let size_bytes = {
            let source = source.clone();
            let target = target.clone();
            tokio::task::spawn_blocking(move || seal_file(&source, &target, &key, &cancel)).await??
        };

        let item = VaultItem {
            id,
            original_path: source.clone(),
            encrypted_path: target.clone(),
            size_bytes,
            added_date: Utc::now(),
        };

        let mut items = open.items.clone();
        items.push(item.clone());
        if let Err(err) = self.layout.write_index(&open.key, &items) {
            discard(&target);
            return Err(err);
        }

        if let Err(err) = std::fs::remove_file(&source) {
            // Roll back so the vault never claims a file whose plaintext survives
            warn!("Could not remove original after encrypting, rolling back: {}", err);
            self.layout.write_index(&open.key, &open.items)?;
            discard(&target);
            return Err(err.into());
        }

        open.items = items;
        info!("Added item {} to vault ({} bytes)", item.id, item.size_bytes);
        Ok(item)
    }

    /// Decrypt `item` back to `destination` (its original path by default),
    /// then delete the blob and the record. Never overwrites an existing file.
    pub async fn remove_file(&self, item: &VaultItem, destination: Option<&Path>) -> Result<PathBuf> {
        let mut guard = self.open.lock().await;
        let open = guard.as_mut().ok_or(Error::VaultLocked)?;

        let position = open
            .items
            .iter()
            .position(|stored| stored.id == item.id)
            .ok_or_else(|| Error::UnknownEntry {
                path: item.id.to_string(),
            })?;
        let stored = open.items[position].clone();
        let destination = destination
            .map(Path::to_path_buf)
            .unwrap_or_else(|| stored.original_path.clone());

        let key = Arc::clone(&open.key);
        let (cancel, _stop_on_drop) = blocking_token(&open.session);
        {
            let blob = stored.encrypted_path.clone();
            let destination = destination.clone();
            tokio::task::spawn_blocking(move || restore_file(&blob, &destination, &key, &cancel))
                .await??;
        }

        let mut items = open.items.clone();
        items.remove(position);
        self.layout.write_index(&open.key, &items)?;
        open.items = items;
        discard(&stored.encrypted_path);

        info!("Removed item {} from vault", stored.id);
        Ok(destination)
    }

    /// Plaintext copy of `item` in the scratch area. The caller deletes it
    /// when done; the vault purges leftovers on expiry and on `lock()`.
    pub async fn decrypt_file(&self, item: &VaultItem) -> Result<PathBuf> {
        let (key, stored, session) = {
            let guard = self.open.lock().await;
            let open = guard.as_ref().ok_or(Error::VaultLocked)?;
            let stored = open
                .items
                .iter()
                .find(|stored| stored.id == item.id)
                .cloned()
                .ok_or_else(|| Error::UnknownEntry {
                    path: item.id.to_string(),
                })?;
            (Arc::clone(&open.key), stored, open.session.clone())
        };

        if let Err(err) = self.scratch.purge_expired() {
            warn!("Scratch purge failed: {}", err);
        }

        let scratch = self.scratch.clone();
        let (cancel, _stop_on_drop) = blocking_token(&session);
        let result = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            checkpoint(&cancel)?;
            let mut copy = scratch.create(stored.extension().as_deref())?;
            let mut blob = BufReader::new(File::open(&stored.encrypted_path)?);
            {
                let mut out = BufWriter::new(copy.as_file_mut());
                crypto::decrypt_stream(&mut blob, &mut out, &key, &cancel)?;
            }
            let (_file, path) = copy.keep().map_err(|e| Error::Io(e.to_string()))?;
            Ok(path)
        })
        .await?;

        // lock() purges scratch under this mutex, so a copy kept after that
        // purge is removed here before the caller ever sees it
        let _open = self.open.lock().await;
        if session.is_cancelled() {
            if let Ok(path) = &result {
                let _ = std::fs::remove_file(path);
            }
            debug!("Vault locked while decrypting item {}", item.id);
            return Err(Error::VaultLocked);
        }

        let path = result?;
        debug!("Decrypted item {} to scratch", item.id);
        Ok(path)
    }

    pub async fn list_files(&self) -> Result<Vec<VaultItem>> {
        let guard = self.open.lock().await;
        let open = guard.as_ref().ok_or(Error::VaultLocked)?;
        Ok(open.items.clone())
    }

    pub fn purge_expired_scratch(&self) -> Result<usize> {
        self.scratch.purge_expired()
    }
}

async fn derive(password: &str, salt: Vec<u8>, kdf: KdfParams) -> Result<SymmetricKey> {
    let password = Zeroizing::new(password.as_bytes().to_vec());
    tokio::task::spawn_blocking(move || crypto::derive_key(&password, &salt, &kdf)).await?
}

/// Token for blocking crypto that is cancelled once the guard drops or the
/// vault session ends.
fn blocking_token(session: &CancellationToken) -> (CancellationToken, tokio_util::sync::DropGuard) {
    let token = session.child_token();
    (token.clone(), token.drop_guard())
}

fn discard(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        warn!("Could not delete vault blob {}: {}", path.display(), err);
    }
}

struct DigestReader<R> {
    inner: R,
    digest: Sha256,
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

struct DigestSink {
    digest: Sha256,
}

impl Write for DigestSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.digest.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Encrypt `source` to `target`, then decrypt what landed on disk and
/// compare digests before the blob becomes visible.
fn seal_file(
    source: &Path,
    target: &Path,
    key: &SymmetricKey,
    cancel: &CancellationToken,
) -> Result<u64> {
    let items_dir = target
        .parent()
        .ok_or_else(|| Error::Io("vault item path has no parent".to_string()))?;
    let mut temp = tempfile::NamedTempFile::new_in(items_dir)?;

    let mut input = DigestReader {
        inner: BufReader::new(File::open(source)?),
        digest: Sha256::new(),
    };
    let size = {
        let mut out = BufWriter::new(temp.as_file_mut());
        crypto::encrypt_stream(&mut input, &mut out, key, cancel)?
    };
    temp.as_file().sync_all()?;
    let expected = input.digest.finalize();

    let mut check = DigestSink {
        digest: Sha256::new(),
    };
    let mut written = BufReader::new(File::open(temp.path())?);
    crypto::decrypt_stream(&mut written, &mut check, key, cancel)?;
    if check.digest.finalize() != expected {
        return Err(Error::Io("vault copy failed verification".to_string()));
    }

    temp.persist_noclobber(target)
        .map_err(|e| Error::Io(e.error.to_string()))?;
    Ok(size)
}

/// Decrypt `blob` next to `destination` and move it into place without
/// replacing anything.
fn restore_file(
    blob: &Path,
    destination: &Path,
    key: &SymmetricKey,
    cancel: &CancellationToken,
) -> Result<()> {
    if destination.exists() {
        return Err(Error::Io(format!(
            "destination {} already exists",
            destination.display()
        )));
    }
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    let mut input = BufReader::new(File::open(blob)?);
    {
        let mut out = BufWriter::new(temp.as_file_mut());
        crypto::decrypt_stream(&mut input, &mut out, key, cancel)?;
    }
    temp.as_file().sync_all()?;
    temp.persist_noclobber(destination)
        .map_err(|e| Error::Io(e.error.to_string()))?;
    Ok(())
}
