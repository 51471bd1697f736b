//! Image Folder Handler Module
//!
//! Treats a plain directory of images as a comic. Member paths are relative
//! to the folder with '/' separators. Symlinks are followed only while they
//! resolve inside the folder.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::extraction::PendingExtraction;
use super::format_detection::ArchiveFormat;
use super::security::SecurityValidator;
use super::types::{ArchiveEntry, RawEntry};
use super::FormatHandler;
use crate::error::{Error, Result};
use crate::task::CancellationToken;

/// Directory-of-images handler
pub struct FolderHandler;

impl FolderHandler {
    fn relative_path(root: &Path, path: &Path) -> String {
        path.strip_prefix(root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Resolve `path` and make sure it does not leave `root`.
    fn contained(root: &Path, path: &Path, member: &str) -> Result<PathBuf> {
        let resolved = fs::canonicalize(path)?;
        if !resolved.starts_with(root) {
            warn!("Folder member {} resolves outside the comic folder", member);
            return Err(Error::MaliciousPath {
                path: member.to_string(),
            });
        }
        Ok(resolved)
    }

    fn walk(
        root: &Path,
        dir: &Path,
        validator: &SecurityValidator,
        entries: &mut Vec<RawEntry>,
    ) -> Result<()> {
        for item in fs::read_dir(dir)? {
            let item = item?;
            let path = item.path();
            let member = Self::relative_path(root, &path);
            validator.validate_entry_count(entries.len() + 1)?;

            let file_type = item.file_type()?;
            let resolved = if file_type.is_symlink() {
                Self::contained(root, &path, &member)?
            } else {
                path.clone()
            };

            let metadata = fs::metadata(&resolved)?;
            if metadata.is_dir() {
                entries.push(RawEntry::directory(member));
                // Symlinked directories are not descended into
                if !file_type.is_symlink() {
                    Self::walk(root, &path, validator, entries)?;
                }
            } else if metadata.is_file() {
                entries.push(RawEntry::file(member, metadata.len()));
            }
        }
        Ok(())
    }
}

impl FormatHandler for FolderHandler {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Folder
    }

    fn read_listing(&self, archive: &Path, validator: &SecurityValidator) -> Result<Vec<RawEntry>> {
        let root = fs::canonicalize(archive)?;
        let mut entries = Vec::new();
        Self::walk(&root, &root, validator, &mut entries)?;
        Ok(entries)
    }

    fn extract_member(
        &self,
        archive: &Path,
        entry: &ArchiveEntry,
        out: &mut PendingExtraction,
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let root = fs::canonicalize(archive)?;
        let source = Self::contained(&root, &root.join(&entry.path), &entry.path)?;
        let mut file = File::open(source)?;
        out.fill_from(&mut file, entry, limit, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_listing_is_relative_and_recursive() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("ch1")).unwrap();
        fs::write(dir.path().join("ch1/01.jpg"), b"one").unwrap();
        fs::write(dir.path().join("cover.png"), b"cover!").unwrap();

        let mut listing = FolderHandler
            .read_listing(dir.path(), &SecurityValidator::default())
            .unwrap();
        listing.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(
            listing,
            vec![
                RawEntry::directory("ch1"),
                RawEntry::file("ch1/01.jpg", 3),
                RawEntry::file("cover.png", 6),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escaping_folder_is_malicious() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.jpg"), b"x").unwrap();

        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.jpg"), dir.path().join("page.jpg"))
            .unwrap();

        let result = FolderHandler.read_listing(dir.path(), &SecurityValidator::default());
        assert_eq!(
            result,
            Err(Error::MaliciousPath {
                path: "page.jpg".into()
            })
        );
    }

    #[test]
    fn test_extract_member_copies_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("01.jpg"), b"page").unwrap();
        let scratch = TempDir::new().unwrap();
        let entry = ArchiveEntry::new("01.jpg", 4, 0);

        let mut pending = PendingExtraction::create(scratch.path(), &entry).unwrap();
        FolderHandler
            .extract_member(dir.path(), &entry, &mut pending, 1024, &CancellationToken::new())
            .unwrap();
        assert_eq!(fs::read(pending.finish().unwrap()).unwrap(), b"page");
    }
}
