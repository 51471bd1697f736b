//! Reading sessions.
//!
//! A [`ComicSession`] ties one opened archive to the shared [`PageCache`]:
//! pages are extracted on demand, adopted into the cache, and the pages
//! around the current one are prefetched in the background.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::archive::{open_reader, ArchiveConfig, ArchiveEntry, ArchiveFormat, ArchiveReader};
use crate::cache::{self, ArchiveId, CachedPage, PageCache, PageKey, PagePayload, PageSource};
use crate::config::ReaderSettings;
use crate::error::{Error, Result};
use crate::task::{with_deadline, CancellationToken};
use crate::vault::{ScratchGuard, Vault, VaultItem};

/// Loads pages of one archive and moves them under the cache's ownership.
/// Holds only the cache directory: the source lives inside in-flight loads
/// the cache itself owns.
struct ReaderPageSource {
    reader: Arc<dyn ArchiveReader>,
    cache_dir: PathBuf,
}

#[async_trait]
impl PageSource for ReaderPageSource {
    async fn load_page(&self, index: usize, cancel: &CancellationToken) -> Result<PagePayload> {
        let entries = self.reader.list_entries().await?;
        let entry = entries.get(index).ok_or(Error::InvalidPageIndex {
            index,
            count: entries.len(),
        })?;
        let extracted = self.reader.extract_entry(entry, cancel).await?;
        cache::adopt_into(self.cache_dir.clone(), &extracted).await
    }
}

pub struct ComicSession {
    reader: Arc<dyn ArchiveReader>,
    archive_id: ArchiveId,
    cache: PageCache,
    source: Arc<dyn PageSource>,
    prefetch_ahead: usize,
    prefetch_behind: usize,
    cancel: CancellationToken,
    /// Decrypted vault copy backing this session, removed on drop
    scratch: Option<ScratchGuard>,
}

impl ComicSession {
    /// Open `path` for reading. The prefetch window defaults to the cache's.
    pub async fn open(path: &Path, config: &ArchiveConfig, cache: PageCache) -> Result<Self> {
        let archive_id = ArchiveId::for_path(path)?;
        let reader = open_reader(path, config).await?;
        let source: Arc<dyn PageSource> = Arc::new(ReaderPageSource {
            reader: Arc::clone(&reader),
            cache_dir: cache.dir().to_path_buf(),
        });

        info!(
            "Opened {} archive {} as {}",
            reader.format(),
            path.display(),
            archive_id
        );

        Ok(Self {
            prefetch_ahead: cache.config().prefetch_ahead,
            prefetch_behind: cache.config().prefetch_behind,
            reader,
            archive_id,
            cache,
            source,
            cancel: CancellationToken::new(),
            scratch: None,
        })
    }

    /// Decrypt a vault item to scratch and open it. The plaintext copy is
    /// deleted when the session drops.
    pub async fn open_from_vault(
        vault: &Vault,
        item: &VaultItem,
        config: &ArchiveConfig,
        cache: PageCache,
    ) -> Result<Self> {
        let copy = ScratchGuard::new(vault.decrypt_file(item).await?);
        let mut session = Self::open(copy.path(), config, cache).await?;
        session.scratch = Some(copy);
        Ok(session)
    }

    pub fn with_prefetch_window(mut self, ahead: usize, behind: usize) -> Self {
        self.prefetch_ahead = ahead;
        self.prefetch_behind = behind;
        self
    }

    /// Apply the user's reading preferences.
    pub fn with_settings(self, settings: &ReaderSettings) -> Self {
        self.with_prefetch_window(settings.prefetch_ahead, settings.prefetch_behind)
    }

    pub fn archive_id(&self) -> &ArchiveId {
        &self.archive_id
    }

    pub fn format(&self) -> ArchiveFormat {
        self.reader.format()
    }

    pub async fn entries(&self) -> Result<Arc<Vec<ArchiveEntry>>> {
        self.reader.list_entries().await
    }

    pub async fn page_count(&self) -> Result<usize> {
        Ok(self.entries().await?.len())
    }

    /// Page `index`, from cache or freshly extracted. Schedules prefetch of
    /// the surrounding window once the page is available.
    pub async fn page(&self, index: usize) -> Result<Arc<CachedPage>> {
        let count = self.page_count().await?;
        if count == 0 {
            return Err(Error::NoPages);
        }
        if index >= count {
            return Err(Error::InvalidPageIndex { index, count });
        }

        let key = PageKey::new(self.archive_id.clone(), index);
        let page = self
            .cache
            .get_or_load(key, Arc::clone(&self.source), &self.cancel)
            .await?;

        self.prefetch_around(index).await?;
        Ok(page)
    }

    pub async fn page_with_deadline(&self, index: usize, deadline: Duration) -> Result<Arc<CachedPage>> {
        with_deadline(deadline, self.page(index)).await
    }

    /// Start background loads for the window around `index`.
    pub async fn prefetch_around(&self, index: usize) -> Result<Vec<JoinHandle<()>>> {
        let count = self.page_count().await?;
        let after = (index + 1)..count.min(index + 1 + self.prefetch_ahead);
        let before = index.saturating_sub(self.prefetch_behind)..index.min(count);
        let indices: Vec<usize> = after.chain(before.rev()).collect();

        if indices.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Prefetching pages {:?} of {}", indices, self.archive_id);
        Ok(self
            .cache
            .prefetch(&self.archive_id, indices, Arc::clone(&self.source), &self.cancel)
            .await)
    }

    /// Stop background work and drop this archive's pages from the cache.
    pub async fn close(self) {
        self.cancel.cancel();
        let removed = self.cache.remove_archive(&self.archive_id).await;
        debug!("Closed session {} ({} cached pages dropped)", self.archive_id, removed);
    }
}

impl Drop for ComicSession {
    fn drop(&mut self) {
        self.cancel.cancel();

        // Plaintext pages of a vault item must not outlive the session.
        if self.scratch.is_some() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let cache = self.cache.clone();
                let archive = self.archive_id.clone();
                handle.spawn(async move {
                    cache.remove_archive(&archive).await;
                });
            }
        }
    }
}

/// Extract only the first page of `path`. Nothing is left on disk.
pub async fn extract_cover(path: &Path, config: &ArchiveConfig) -> Result<Bytes> {
    let reader = open_reader(path, config).await?;
    let cancel = CancellationToken::new();
    let cover = reader.extract_cover(&cancel).await?;

    let read = tokio::fs::read(&cover).await;
    if let Err(e) = tokio::fs::remove_file(&cover).await {
        debug!("Could not remove cover temp file {}: {}", cover.display(), e);
    }
    Ok(Bytes::from(read?))
}
