//! Archive Security Validation Module
//!
//! Every listing passes through [`SecurityValidator::admit`] before a single
//! member is extracted. Violations fail the whole archive; only directories
//! and non-image members are dropped quietly.

use std::collections::HashSet;
use std::path::{Component, Path};
use tracing::{debug, warn};

use super::natural_sort::natural_cmp;
use super::types::{ArchiveConfig, ArchiveEntry, RawEntry};
use crate::error::{Error, Result};

/// Security validator for archive listings
#[derive(Debug, Clone)]
pub struct SecurityValidator {
    config: ArchiveConfig,
}

impl SecurityValidator {
    pub fn new(config: ArchiveConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Validate, filter and order a raw listing into dense page entries.
    pub fn admit(&self, raw: Vec<RawEntry>) -> Result<Vec<ArchiveEntry>> {
        self.validate_entry_count(raw.len())?;

        let mut total_uncompressed = 0u64;
        let mut seen = HashSet::new();
        let mut pages = Vec::new();

        for entry in raw {
            self.validate_path_safety(&entry.path)?;

            if entry.is_directory {
                continue;
            }

            // Members are extracted by name; two with one name are ambiguous
            if !seen.insert(entry.path.clone()) {
                warn!("Archive rejected: duplicate member {}", entry.path);
                return Err(Error::MaliciousPath { path: entry.path });
            }

            self.validate_entry_size(&entry.path, entry.size)?;
            self.validate_total_size(entry.size, &mut total_uncompressed)?;

            if self.is_hidden_member(&entry.path) || !self.is_image_member(&entry.path) {
                debug!("Skipping non-page member {}", entry.path);
                continue;
            }

            pages.push(entry);
        }

        pages.sort_by(|a, b| natural_cmp(&a.path, &b.path));

        Ok(pages
            .into_iter()
            .enumerate()
            .map(|(index, entry)| ArchiveEntry::new(entry.path, entry.size, index))
            .collect())
    }

    /// Validate total number of entries doesn't exceed quota
    pub fn validate_entry_count(&self, count: usize) -> Result<()> {
        let limit = self.config.quotas.max_entries;
        if count > limit {
            warn!("Archive rejected: {} entries exceeds limit of {}", count, limit);
            return Err(Error::TooManyEntries { count, limit });
        }
        Ok(())
    }

    /// Validate individual entry size doesn't exceed quota
    pub fn validate_entry_size(&self, path: &str, size: u64) -> Result<()> {
        let limit = self.config.quotas.max_entry_size;
        if size > limit {
            warn!("Archive rejected: entry {} declares {} bytes", path, size);
            return Err(Error::EntryTooLarge {
                path: path.to_string(),
                size,
                limit,
            });
        }
        Ok(())
    }

    /// Validate total uncompressed size doesn't exceed quota
    fn validate_total_size(&self, size: u64, total_uncompressed: &mut u64) -> Result<()> {
        *total_uncompressed = total_uncompressed.saturating_add(size);
        let limit = self.config.quotas.max_total_size;
        if *total_uncompressed > limit {
            return Err(Error::ArchiveTooLarge {
                size: *total_uncompressed,
                limit,
            });
        }
        Ok(())
    }

    /// Validate path safety for a member path
    pub fn validate_path_safety(&self, path: &str) -> Result<()> {
        if self.is_unsafe_path(path) {
            warn!("Unsafe path detected in archive: {:?}", path);
            return Err(Error::MaliciousPath {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Comprehensive unsafe path detection
    fn is_unsafe_path(&self, path: &str) -> bool {
        path.is_empty()
            || self.has_directory_traversal(path)
            || self.is_absolute_path(path)
            || self.has_control_characters(path)
    }

    /// Check for directory traversal attempts
    fn has_directory_traversal(&self, path: &str) -> bool {
        let normalized = path.replace('\\', "/");
        Path::new(&normalized)
            .components()
            .any(|component| matches!(component, Component::ParentDir))
    }

    /// Check for absolute paths (security risk)
    fn is_absolute_path(&self, path: &str) -> bool {
        if path.starts_with('/') || path.starts_with('\\') {
            return true;
        }

        // Windows drive prefix (C:, D:\, ...)
        let bytes = path.as_bytes();
        bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
    }

    /// Check for control characters in path
    fn has_control_characters(&self, path: &str) -> bool {
        path.chars().any(|c| c.is_control())
    }

    /// Resource forks and dotfiles that archivers leave behind
    fn is_hidden_member(&self, path: &str) -> bool {
        path.split(['/', '\\'])
            .any(|segment| segment == "__MACOSX" || (segment.starts_with('.') && segment != "."))
    }

    /// Check the member extension against the page image set
    pub fn is_image_member(&self, path: &str) -> bool {
        let path_lower = path.to_lowercase();
        self.config
            .image_extensions
            .iter()
            .any(|ext| path_lower.ends_with(&format!(".{}", ext.to_lowercase())))
    }
}

impl Default for SecurityValidator {
    fn default() -> Self {
        Self::new(ArchiveConfig::default())
    }
}
