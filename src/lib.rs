//! comicvault
//!
//! Secure comic reading core: format detection and safe extraction for
//! comic archives, a bounded page cache with prefetch, and an encrypted
//! vault for files kept away from casual view.

pub mod archive;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod session;
pub mod task;
pub mod vault;

pub use archive::{open_reader, ArchiveConfig, ArchiveEntry, ArchiveFormat, ArchiveReader, FormatDetector};
pub use cache::{ArchiveId, CacheConfig, PageCache};
pub use config::{Config, ReaderSettings, SettingsStore};
pub use error::{Error, Result};
pub use session::{extract_cover, ComicSession};
pub use vault::{Vault, VaultConfig, VaultItem, VaultState};
