//! Archive Reader - Modular Implementation
//!
//! Modular implementation of comic archive reading with separated concerns:
//! - format_detection: Archive format detection via magic bytes
//! - security: Path validation, quotas and page ordering
//! - extraction: Bounded streaming copy into reader-scoped temp files
//! - zip_handler / rar_handler / sevenz_handler / tar_handler: container formats
//! - folder_handler / pdf_handler: image folders and PDF image adapters
//! - types: Shared types and configuration structures

pub mod extraction;
pub mod folder_handler;
pub mod format_detection;
pub mod natural_sort;
pub mod pdf_handler;
pub mod rar_handler;
pub mod security;
pub mod sevenz_handler;
pub mod tar_handler;
pub mod types;
pub mod zip_handler;

pub use format_detection::{ArchiveFormat, FormatDetector};
pub use security::SecurityValidator;
pub use types::{ArchiveConfig, ArchiveEntry, ArchiveQuotas, RawEntry};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::task::CancellationToken;
use extraction::PendingExtraction;

/// One comic archive, opened for page-by-page reading.
///
/// A reader is bound to a single archive path for its lifetime. Listing is
/// metadata-only; extraction decompresses exactly one member into a fresh
/// temp file. Concurrent extractions of different entries are safe.
#[async_trait]
pub trait ArchiveReader: Send + Sync {
    fn format(&self) -> ArchiveFormat;

    fn archive_path(&self) -> &Path;

    /// Validated page entries in reading order. Computed once and then stable.
    async fn list_entries(&self) -> Result<Arc<Vec<ArchiveEntry>>>;

    /// Decompress `entry` into a uniquely named temp file and return its path.
    async fn extract_entry(&self, entry: &ArchiveEntry, cancel: &CancellationToken)
        -> Result<PathBuf>;

    /// Extract only the first page, for thumbnails.
    async fn extract_cover(&self, cancel: &CancellationToken) -> Result<PathBuf> {
        let entries = self.list_entries().await?;
        let first = entries.first().ok_or(Error::NoPages)?;
        self.extract_entry(first, cancel).await
    }
}

/// Blocking, format-specific half of a reader. Implementations run on the
/// blocking pool and must not hold decoded data for more than one member.
pub trait FormatHandler: Send + Sync + 'static {
    fn format(&self) -> ArchiveFormat;

    /// Read the archive directory. Never decompresses member payloads.
    fn read_listing(&self, archive: &Path, validator: &SecurityValidator) -> Result<Vec<RawEntry>>;

    /// Stream one member into `out`, enforcing `limit` on actual bytes.
    fn extract_member(
        &self,
        archive: &Path,
        entry: &ArchiveEntry,
        out: &mut PendingExtraction,
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<u64>;
}

/// [`ArchiveReader`] built from a [`FormatHandler`].
pub struct HandlerReader<H: FormatHandler> {
    handler: Arc<H>,
    archive_path: PathBuf,
    validator: Arc<SecurityValidator>,
    scratch: TempDir,
    listing: OnceCell<Arc<Vec<ArchiveEntry>>>,
}

impl<H: FormatHandler> HandlerReader<H> {
    pub fn new(handler: H, archive_path: &Path, config: &ArchiveConfig) -> Result<Self> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("comicvault-reader-");
            builder
        };
        let scratch = match &config.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        Ok(Self {
            handler: Arc::new(handler),
            archive_path: archive_path.to_path_buf(),
            validator: Arc::new(SecurityValidator::new(config.clone())),
            scratch,
            listing: OnceCell::new(),
        })
    }

    /// Directory holding this reader's extracted temp files.
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    async fn load_listing(&self) -> Result<Arc<Vec<ArchiveEntry>>> {
        let handler = Arc::clone(&self.handler);
        let validator = Arc::clone(&self.validator);
        let path = self.archive_path.clone();

        let entries = tokio::task::spawn_blocking(move || {
            let raw = handler.read_listing(&path, &validator)?;
            validator.admit(raw)
        })
        .await??;

        info!(
            "Listed {} pages from {} archive {}",
            entries.len(),
            self.handler.format(),
            self.archive_path.display()
        );
        Ok(Arc::new(entries))
    }

    /// The listed entry matching `entry`, so callers cannot smuggle in
    /// paths that never went through validation.
    fn resolve<'a>(&self, listing: &'a [ArchiveEntry], entry: &ArchiveEntry) -> Result<&'a ArchiveEntry> {
        listing
            .get(entry.index)
            .filter(|listed| listed.id == entry.id && listed.path == entry.path)
            .or_else(|| listing.iter().find(|listed| listed.id == entry.id && listed.path == entry.path))
            .ok_or_else(|| Error::UnknownEntry {
                path: entry.path.clone(),
            })
    }
}

#[async_trait]
impl<H: FormatHandler> ArchiveReader for HandlerReader<H> {
    fn format(&self) -> ArchiveFormat {
        self.handler.format()
    }

    fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    async fn list_entries(&self) -> Result<Arc<Vec<ArchiveEntry>>> {
        let listing = self.listing.get_or_try_init(|| self.load_listing()).await?;
        Ok(Arc::clone(listing))
    }

    async fn extract_entry(
        &self,
        entry: &ArchiveEntry,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let listing = self.list_entries().await?;
        let entry = self.resolve(&listing, entry)?.clone();

        let handler = Arc::clone(&self.handler);
        let archive = self.archive_path.clone();
        let limit = self.validator.config().quotas.max_entry_size;
        let scratch = self.scratch.path().to_path_buf();
        let cancel = cancel.clone();

        debug!("Extracting {} from {}", entry.path, archive.display());

        tokio::task::spawn_blocking(move || {
            let mut pending = PendingExtraction::create(&scratch, &entry)?;
            handler.extract_member(&archive, &entry, &mut pending, limit, &cancel)?;
            pending.finish()
        })
        .await?
    }
}

/// Open the right reader for `path`, chosen by magic bytes.
pub async fn open_reader(path: &Path, config: &ArchiveConfig) -> Result<Arc<dyn ArchiveReader>> {
    let format = FormatDetector::detect_path(path).await?;
    let reader: Arc<dyn ArchiveReader> = match format {
        ArchiveFormat::Zip => Arc::new(HandlerReader::new(zip_handler::ZipHandler, path, config)?),
        ArchiveFormat::Rar => Arc::new(HandlerReader::new(rar_handler::RarHandler, path, config)?),
        ArchiveFormat::SevenZip => {
            Arc::new(HandlerReader::new(sevenz_handler::SevenZipHandler, path, config)?)
        }
        ArchiveFormat::Tar => Arc::new(HandlerReader::new(tar_handler::TarHandler, path, config)?),
        ArchiveFormat::Pdf => Arc::new(HandlerReader::new(
            pdf_handler::PdfHandler::new(config.max_archive_size),
            path,
            config,
        )?),
        ArchiveFormat::Folder => {
            Arc::new(HandlerReader::new(folder_handler::FolderHandler, path, config)?)
        }
    };
    Ok(reader)
}
