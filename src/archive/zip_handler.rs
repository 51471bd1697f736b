//! ZIP Archive Handler Module
//!
//! Handles CBZ/ZIP archives. Listing reads the central directory through raw
//! entry handles so no member is ever decompressed to build a page list.

use std::fs::File;
use std::path::Path;

use super::extraction::PendingExtraction;
use super::format_detection::ArchiveFormat;
use super::security::SecurityValidator;
use super::types::{ArchiveEntry, RawEntry};
use super::FormatHandler;
use crate::error::{Error, Result};
use crate::task::CancellationToken;

/// ZIP archive processing handler
pub struct ZipHandler;

impl ZipHandler {
    /// ZIP magic: local header, empty archive, or spanned marker
    pub fn can_open(magic: &[u8]) -> bool {
        magic.starts_with(b"PK\x03\x04")
            || magic.starts_with(b"PK\x05\x06")
            || magic.starts_with(b"PK\x07\x08")
    }

    fn open(path: &Path) -> Result<zip::ZipArchive<File>> {
        let file = File::open(path)?;
        zip::ZipArchive::new(file).map_err(Error::extraction)
    }
}

impl FormatHandler for ZipHandler {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Zip
    }

    fn read_listing(&self, archive: &Path, validator: &SecurityValidator) -> Result<Vec<RawEntry>> {
        let mut zip = Self::open(archive)?;

        // Reject before touching any entry header
        validator.validate_entry_count(zip.len())?;

        let mut entries = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let entry = zip.by_index_raw(i).map_err(Error::extraction)?;
            let raw = if entry.is_dir() {
                RawEntry::directory(entry.name())
            } else {
                RawEntry::file(entry.name(), entry.size())
            };
            entries.push(raw);
        }

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
        let mut zip = Self::open(archive)?;
        let mut member = zip.by_name(&entry.path).map_err(Error::extraction)?;
        out.fill_from(&mut member, entry, limit, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::types::ArchiveConfig;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(dir: &Path, members: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = dir.join("test.cbz");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        for (name, data) in members {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_can_open() {
        assert!(ZipHandler::can_open(b"PK\x03\x04rest"));
        assert!(!ZipHandler::can_open(b"Rar!\x1a\x07\x00"));
        assert!(!ZipHandler::can_open(b"PK"));
    }

    #[test]
    fn test_read_listing_reports_members() {
        let dir = TempDir::new().unwrap();
        let path = write_zip(dir.path(), &[("b.jpg", b"bb"), ("a.jpg", b"a")]);

        let listing = ZipHandler
            .read_listing(&path, &SecurityValidator::default())
            .unwrap();
        assert_eq!(
            listing,
            vec![RawEntry::file("b.jpg", 2), RawEntry::file("a.jpg", 1)]
        );
    }

    #[test]
    fn test_read_listing_enforces_count_before_iteration() {
        let dir = TempDir::new().unwrap();
        let path = write_zip(dir.path(), &[("1.jpg", b"1"), ("2.jpg", b"2"), ("3.jpg", b"3")]);
        let mut config = ArchiveConfig::default();
        config.quotas.max_entries = 2;

        let result = ZipHandler.read_listing(&path, &SecurityValidator::new(config));
        assert_eq!(result, Err(Error::TooManyEntries { count: 3, limit: 2 }));
    }

    #[test]
    fn test_extract_member_streams_bytes() {
        let dir = TempDir::new().unwrap();
        let path = write_zip(dir.path(), &[("page.png", b"png-bytes")]);
        let entry = ArchiveEntry::new("page.png", 9, 0);

        let mut pending = PendingExtraction::create(dir.path(), &entry).unwrap();
        let written = ZipHandler
            .extract_member(&path, &entry, &mut pending, 1024, &CancellationToken::new())
            .unwrap();
        assert_eq!(written, 9);
        let out = pending.finish().unwrap();
        assert_eq!(std::fs::read(out).unwrap(), b"png-bytes");
    }
}
