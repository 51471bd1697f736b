//! RAR Archive Handler Module
//!
//! Handles CBR/RAR archives (RAR 1.5-4.x and 5.x) through the unrar library.
//! The library only hands out a member as a whole buffer, so the declared
//! size is checked against the ceiling before the member is decompressed and
//! the produced buffer is checked again afterwards.

use std::io::Cursor;
use std::path::Path;

use super::extraction::PendingExtraction;
use super::format_detection::ArchiveFormat;
use super::security::SecurityValidator;
use super::types::{ArchiveEntry, RawEntry};
use super::FormatHandler;
use crate::error::{Error, Result};
use crate::task::{checkpoint, CancellationToken};

const RAR4_MAGIC: &[u8] = b"Rar!\x1a\x07\x00";
const RAR5_MAGIC: &[u8] = b"Rar!\x1a\x07\x01\x00";

/// RAR archive processing handler
pub struct RarHandler;

impl RarHandler {
    pub fn can_open(magic: &[u8]) -> bool {
        magic.starts_with(RAR4_MAGIC) || magic.starts_with(RAR5_MAGIC)
    }

    fn normalize(name: &Path) -> String {
        name.to_string_lossy().replace('\\', "/")
    }
}

impl FormatHandler for RarHandler {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Rar
    }

    fn read_listing(&self, archive: &Path, validator: &SecurityValidator) -> Result<Vec<RawEntry>> {
        let listing = unrar::Archive::new(archive)
            .open_for_listing()
            .map_err(Error::extraction)?;

        let mut entries = Vec::new();
        for header in listing {
            let header = header.map_err(Error::extraction)?;

            // Headers stream in one at a time, so the count is checked as we go
            validator.validate_entry_count(entries.len() + 1)?;

            let path = Self::normalize(&header.filename);
            let raw = if header.is_directory() {
                RawEntry::directory(path)
            } else {
                RawEntry::file(path, header.unpacked_size)
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
        let mut cursor = unrar::Archive::new(archive)
            .open_for_processing()
            .map_err(Error::extraction)?;

        loop {
            checkpoint(cancel)?;

            let Some(header) = cursor.read_header().map_err(Error::extraction)? else {
                return Err(Error::UnknownEntry {
                    path: entry.path.clone(),
                });
            };

            let name = Self::normalize(&header.entry().filename);
            if name != entry.path {
                cursor = header.skip().map_err(Error::extraction)?;
                continue;
            }

            let declared = header.entry().unpacked_size;
            if declared > limit {
                return Err(Error::EntryTooLarge {
                    path: entry.path.clone(),
                    size: declared,
                    limit,
                });
            }

            let (data, _rest) = header.read().map_err(Error::extraction)?;
            return out.fill_from(&mut Cursor::new(data), entry, limit, cancel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_open_both_generations() {
        assert!(RarHandler::can_open(b"Rar!\x1a\x07\x00\xcf\x90"));
        assert!(RarHandler::can_open(b"Rar!\x1a\x07\x01\x00\x33"));
        assert!(!RarHandler::can_open(b"Rar!\x1a\x07"));
        assert!(!RarHandler::can_open(b"PK\x03\x04"));
    }

    #[test]
    fn test_normalize_backslashes() {
        assert_eq!(
            RarHandler::normalize(Path::new("vol1\\page01.jpg")),
            "vol1/page01.jpg"
        );
    }

    #[test]
    fn test_corrupt_archive_is_extraction_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.cbr");
        std::fs::write(&path, b"Rar!\x1a\x07\x01\x00not really a rar").unwrap();

        let result = RarHandler.read_listing(&path, &SecurityValidator::default());
        assert!(matches!(result, Err(Error::ExtractionFailed(_))));
    }
}
