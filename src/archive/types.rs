//! Page entries, raw listing records, and the quotas every reader enforces.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Length of an entry id in hex characters (128 bits of SHA-256).
pub const ENTRY_ID_LEN: usize = 32;

/// Metadata for one page image inside an archive.
///
/// Immutable once built by a reader listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ArchiveEntry {
    /// Stable, filesystem-safe hash of `path`
    pub id: String,
    /// Member path as stored in the archive
    pub path: String,
    /// Last path component
    pub file_name: String,
    /// Declared uncompressed size in bytes
    pub uncompressed_size: u64,
    /// Zero-based reading order
    pub index: usize,
}

impl ArchiveEntry {
    pub fn new(path: impl Into<String>, uncompressed_size: u64, index: usize) -> Self {
        let path = path.into();
        let file_name = path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(path.as_str())
            .to_string();
        Self {
            id: entry_id(&path),
            path,
            file_name,
            uncompressed_size,
            index,
        }
    }

    /// Lowercased extension of the member, if any.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }
}

/// Deterministic id for a member path. Depends only on the path, never on data.
pub fn entry_id(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(ENTRY_ID_LEN);
    id
}

/// A member as reported by a format handler before validation and ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub path: String,
    pub size: u64,
    pub is_directory: bool,
}

impl RawEntry {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            is_directory: false,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            is_directory: true,
        }
    }
}

/// Archive processing quotas and limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveQuotas {
    /// Maximum number of members in one archive (default 10 000)
    pub max_entries: usize,
    /// Maximum uncompressed size per member (default 256MB)
    pub max_entry_size: u64,
    /// Maximum total declared uncompressed size (default 8GB)
    pub max_total_size: u64,
}

impl Default for ArchiveQuotas {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_entry_size: 256 * 1024 * 1024,
            max_total_size: 8 * 1024 * 1024 * 1024,
        }
    }
}

impl ArchiveQuotas {
    pub fn new(max_entries: usize, max_entry_size: u64, max_total_size: u64) -> Self {
        Self {
            max_entries,
            max_entry_size,
            max_total_size,
        }
    }

    /// Validate quota values are reasonable
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_entries == 0 {
            return Err(anyhow::anyhow!("max_entries must be greater than 0"));
        }

        if self.max_entry_size == 0 {
            return Err(anyhow::anyhow!("max_entry_size must be greater than 0"));
        }

        if self.max_total_size == 0 {
            return Err(anyhow::anyhow!("max_total_size must be greater than 0"));
        }

        if self.max_entry_size > self.max_total_size {
            return Err(anyhow::anyhow!(
                "max_entry_size cannot exceed max_total_size"
            ));
        }

        const MAX_ENTRIES_LIMIT: usize = 1_000_000;
        const MAX_SIZE_LIMIT: u64 = 64 * 1024 * 1024 * 1024; // 64GB

        if self.max_entries > MAX_ENTRIES_LIMIT {
            return Err(anyhow::anyhow!(
                "max_entries exceeds reasonable limit of {}",
                MAX_ENTRIES_LIMIT
            ));
        }

        if self.max_entry_size > MAX_SIZE_LIMIT || self.max_total_size > MAX_SIZE_LIMIT {
            return Err(anyhow::anyhow!(
                "size quotas exceed reasonable limit of {} bytes",
                MAX_SIZE_LIMIT
            ));
        }

        Ok(())
    }
}

/// Image extensions admitted as pages when no override is configured.
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff", "avif", "heic", "jxl", "jp2",
];

/// Archive processing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Security quotas
    pub quotas: ArchiveQuotas,
    /// Extensions treated as pages
    pub image_extensions: Vec<String>,
    /// Maximum size of archives that must be parsed whole (PDF)
    pub max_archive_size: u64,
    /// Parent for per-reader scratch directories (system temp dir when unset)
    pub scratch_root: Option<PathBuf>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            quotas: ArchiveQuotas::default(),
            image_extensions: DEFAULT_IMAGE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            max_archive_size: 256 * 1024 * 1024,
            scratch_root: None,
        }
    }
}

impl ArchiveConfig {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.quotas.validate()?;

        if self.max_archive_size == 0 {
            return Err(anyhow::anyhow!("max_archive_size must be greater than 0"));
        }

        if self.image_extensions.is_empty() {
            return Err(anyhow::anyhow!("image_extensions cannot be empty"));
        }

        for ext in &self.image_extensions {
            if ext.is_empty() || ext.contains("..") || ext.contains('/') || ext.contains('\\') {
                return Err(anyhow::anyhow!("Invalid extension pattern: {}", ext));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_quotas_default() {
        let quotas = ArchiveQuotas::default();
        assert_eq!(quotas.max_entries, 10_000);
        assert_eq!(quotas.max_entry_size, 256 * 1024 * 1024);
        assert!(quotas.validate().is_ok());
    }

    #[test]
    fn test_archive_quotas_validation() {
        assert!(ArchiveQuotas::new(100, 1024, 10240).validate().is_ok());
        assert!(ArchiveQuotas::new(0, 1024, 10240).validate().is_err());
        assert!(ArchiveQuotas::new(100, 10240, 1024).validate().is_err());
        assert!(ArchiveQuotas::new(10_000_000, 1024, 10240).validate().is_err());
    }

    #[test]
    fn test_archive_config_validation() {
        assert!(ArchiveConfig::default().validate().is_ok());

        let config = ArchiveConfig {
            image_extensions: vec!["../exe".to_string()],
            ..ArchiveConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ArchiveConfig {
            max_archive_size: 0,
            ..ArchiveConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_entry_id_is_deterministic_and_fixed_length() {
        let a = ArchiveEntry::new("chapter1/page_01.jpg", 10, 0);
        let b = ArchiveEntry::new("chapter1/page_01.jpg", 99, 5);
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), ENTRY_ID_LEN);
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.id, ArchiveEntry::new("chapter1/page_02.jpg", 10, 1).id);
    }

    #[test]
    fn test_archive_entry_file_name() {
        let entry = ArchiveEntry::new("vol1/ch2/Page 3.PNG", 1024, 2);
        assert_eq!(entry.file_name, "Page 3.PNG");
        assert_eq!(entry.extension().as_deref(), Some("png"));
        assert_eq!(entry.index, 2);
    }
}
