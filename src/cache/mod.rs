//! Page Cache
//!
//! Bounded LRU store of extracted pages keyed by `(ArchiveId, index)`.
//! Structural mutations go through one async mutex; page payloads are handed
//! out as `Arc<CachedPage>` so reads of cached pages never hold the lock.
//! Loads for the same key coalesce onto one shared future, and loads started
//! before `clear()`/`prune()` finish without inserting.

pub mod page;

pub use page::{ArchiveId, CachedFile, CachedPage, PageKey, PagePayload};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::task::CancellationToken;

/// Cache budget and prefetch window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total payload bytes held (default 256MB)
    pub max_bytes: u64,
    /// Number of pages held (default 64)
    pub max_entries: usize,
    /// Pages prefetched after the current one
    pub prefetch_ahead: usize,
    /// Pages prefetched before the current one
    pub prefetch_behind: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            max_entries: 64,
            prefetch_ahead: 2,
            prefetch_behind: 1,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_bytes == 0 {
            return Err(anyhow::anyhow!("cache max_bytes must be greater than 0"));
        }
        if self.max_entries == 0 {
            return Err(anyhow::anyhow!("cache max_entries must be greater than 0"));
        }
        if self.prefetch_ahead + self.prefetch_behind >= self.max_entries {
            return Err(anyhow::anyhow!(
                "prefetch window must be smaller than cache max_entries"
            ));
        }
        Ok(())
    }
}

/// Produces the payload for one page of one archive.
#[async_trait]
pub trait PageSource: Send + Sync + 'static {
    async fn load_page(&self, index: usize, cancel: &CancellationToken) -> Result<PagePayload>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub in_flight: usize,
}

type PendingLoad = Shared<BoxFuture<'static, Result<Arc<CachedPage>>>>;

struct Slot {
    page: Arc<CachedPage>,
    tick: u64,
}

#[derive(Default)]
struct CacheIndex {
    slots: HashMap<PageKey, Slot>,
    /// Access tick -> key, oldest first
    lru: BTreeMap<u64, PageKey>,
    in_flight: HashMap<PageKey, (u64, PendingLoad)>,
    tick: u64,
    bytes: u64,
    generation: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheIndex {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &PageKey) -> Option<Arc<CachedPage>> {
        let tick = self.next_tick();
        let slot = self.slots.get_mut(key)?;
        self.lru.remove(&slot.tick);
        slot.tick = tick;
        self.lru.insert(tick, key.clone());
        Some(Arc::clone(&slot.page))
    }

    fn remove(&mut self, key: &PageKey) -> Option<Arc<CachedPage>> {
        let slot = self.slots.remove(key)?;
        self.lru.remove(&slot.tick);
        self.bytes -= slot.page.size_bytes();
        Some(slot.page)
    }

    fn insert(&mut self, page: Arc<CachedPage>, config: &CacheConfig) {
        let key = page.key.clone();
        self.remove(&key);

        if page.size_bytes() > config.max_bytes {
            debug!(
                "Page {} of {} exceeds cache budget, not retained",
                key.index, key.archive
            );
            return;
        }

        while !self.slots.is_empty()
            && (self.slots.len() >= config.max_entries
                || self.bytes + page.size_bytes() > config.max_bytes)
        {
            let Some((_, oldest)) = self.lru.pop_first() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&oldest) {
                self.bytes -= slot.page.size_bytes();
                self.evictions += 1;
                debug!("Evicted page {} of {}", oldest.index, oldest.archive);
            }
        }

        let tick = self.next_tick();
        self.bytes += page.size_bytes();
        self.lru.insert(tick, key.clone());
        self.slots.insert(key, Slot { page, tick });
    }

    fn retain(&mut self, keep: impl Fn(&PageKey) -> bool) -> usize {
        let doomed: Vec<PageKey> = self.slots.keys().filter(|k| !keep(k)).cloned().collect();
        for key in &doomed {
            self.remove(key);
        }
        self.in_flight.retain(|key, _| keep(key));
        self.generation += 1;
        doomed.len()
    }
}

struct CacheShared {
    config: CacheConfig,
    index: Mutex<CacheIndex>,
    load_ids: AtomicU64,
    /// Holds adopted page files; declared last so pages drop first
    dir: TempDir,
}

/// Shared handle to the page cache. Cloning is cheap.
#[derive(Clone)]
pub struct PageCache {
    shared: Arc<CacheShared>,
}

impl PageCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("comicvault-cache-").tempdir()?;
        Ok(Self {
            shared: Arc::new(CacheShared {
                config,
                index: Mutex::new(CacheIndex::default()),
                load_ids: AtomicU64::new(0),
                dir,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Take ownership of an extracted file by moving it into the cache
    /// directory, so its lifetime no longer depends on the reader. The move
    /// may be a full copy across filesystems and runs on the blocking pool.
    pub async fn adopt_file(&self, path: &Path) -> Result<PagePayload> {
        adopt_into(self.dir().to_path_buf(), path).await
    }

    /// Directory holding adopted page files.
    pub(crate) fn dir(&self) -> &Path {
        self.shared.dir.path()
    }

    pub async fn get(&self, key: &PageKey) -> Option<Arc<CachedPage>> {
        let mut index = self.shared.index.lock().await;
        let page = index.touch(key);
        if page.is_some() {
            index.hits += 1;
        } else {
            index.misses += 1;
        }
        page
    }

    /// Insert or replace, evicting least-recently-used pages to stay in budget.
    pub async fn put(&self, key: PageKey, payload: PagePayload) -> Arc<CachedPage> {
        let page = Arc::new(CachedPage { key, payload });
        let mut index = self.shared.index.lock().await;
        index.insert(Arc::clone(&page), &self.shared.config);
        page
    }

    /// Cached page, or a load through `source` shared with every concurrent
    /// caller asking for the same key.
    pub async fn get_or_load(
        &self,
        key: PageKey,
        source: Arc<dyn PageSource>,
        cancel: &CancellationToken,
    ) -> Result<Arc<CachedPage>> {
        let pending = {
            let mut index = self.shared.index.lock().await;
            if let Some(page) = index.touch(&key) {
                index.hits += 1;
                return Ok(page);
            }
            index.misses += 1;
            self.pending_load(&mut index, key, source, cancel)
        };
        pending.await
    }

    /// Schedule background loads. Keys already cached or in flight are skipped.
    pub async fn prefetch(
        &self,
        archive: &ArchiveId,
        indices: impl IntoIterator<Item = usize>,
        source: Arc<dyn PageSource>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut index = self.shared.index.lock().await;
        let mut handles = Vec::new();

        for page in indices {
            let key = PageKey::new(archive.clone(), page);
            if index.slots.contains_key(&key) || index.in_flight.contains_key(&key) {
                continue;
            }
            let pending = self.pending_load(&mut index, key, Arc::clone(&source), cancel);
            handles.push(tokio::spawn(async move {
                if let Err(err) = pending.await {
                    debug!("Prefetch of page {} failed: {}", page, err);
                }
            }));
        }

        handles
    }

    fn pending_load(
        &self,
        index: &mut CacheIndex,
        key: PageKey,
        source: Arc<dyn PageSource>,
        cancel: &CancellationToken,
    ) -> PendingLoad {
        if let Some((_, pending)) = index.in_flight.get(&key) {
            return pending.clone();
        }

        let load_id = self.shared.load_ids.fetch_add(1, Ordering::Relaxed);
        let generation = index.generation;
        // The future lives in `in_flight`, so it must not keep the cache alive
        let cache: Weak<CacheShared> = Arc::downgrade(&self.shared);
        let cancel = cancel.clone();
        let load_key = key.clone();

        let pending = async move {
            let loaded = source.load_page(load_key.index, &cancel).await;

            let Some(shared) = cache.upgrade() else {
                debug!("Cache dropped while loading page {}", load_key.index);
                return Ok(Arc::new(CachedPage {
                    key: load_key,
                    payload: loaded?,
                }));
            };
            let mut index = shared.index.lock().await;
            if matches!(index.in_flight.get(&load_key), Some((id, _)) if *id == load_id) {
                index.in_flight.remove(&load_key);
            }

            let page = Arc::new(CachedPage {
                key: load_key,
                payload: loaded?,
            });
            if index.generation == generation {
                index.insert(Arc::clone(&page), &shared.config);
            }
            Ok(page)
        }
        .boxed()
        .shared();

        index.in_flight.insert(key, (load_id, pending.clone()));
        pending
    }

    /// Drop every page. Loads already running complete for their own
    /// callers but are not inserted.
    pub async fn clear(&self) {
        let mut index = self.shared.index.lock().await;
        let removed = index.retain(|_| false);
        info!("Cleared page cache ({} pages)", removed);
    }

    /// Drop pages whose archive is not in `existing`.
    pub async fn prune(&self, existing: &[ArchiveId]) -> usize {
        let keep: HashSet<&ArchiveId> = existing.iter().collect();
        let mut index = self.shared.index.lock().await;
        let removed = index.retain(|key| keep.contains(&key.archive));
        if removed > 0 {
            info!("Pruned {} pages of removed archives", removed);
        }
        removed
    }

    /// Drop every page of one archive.
    pub async fn remove_archive(&self, archive: &ArchiveId) -> usize {
        let mut index = self.shared.index.lock().await;
        index.retain(|key| &key.archive != archive)
    }

    /// Drop pages whose archive no longer exists on disk.
    pub async fn prune_missing(&self) -> usize {
        let mut index = self.shared.index.lock().await;
        let removed = index.retain(|key| key.archive.path().exists());
        if removed > 0 {
            info!("Pruned {} pages of missing archives", removed);
        }
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.shared.index.lock().await;
        CacheStats {
            entries: index.slots.len(),
            bytes: index.bytes,
            hits: index.hits,
            misses: index.misses,
            evictions: index.evictions,
            in_flight: index.in_flight.len(),
        }
    }
}

/// Move `path` into the cache directory `dir` as a cache-owned page file.
pub(crate) async fn adopt_into(dir: PathBuf, path: &Path) -> Result<PagePayload> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<PagePayload> {
        let name = path
            .file_name()
            .map(|n| n.to_owned())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string().into());
        let target = dir.join(name);

        if std::fs::rename(&path, &target).is_err() {
            std::fs::copy(&path, &target)?;
            std::fs::remove_file(&path)?;
        }
        let len = std::fs::metadata(&target)?.len();
        Ok(PagePayload::File(CachedFile::new(target, len)))
    })
    .await?
}
