//! 7-Zip Archive Handler Module
//!
//! Handles CB7/7z archives. Listing reads only the archive header. 7z uses
//! solid block compression, so extraction walks the entries in archive order
//! and streams only the requested member into the temp file.

use std::path::Path;

use sevenz_rust::{Password, SevenZReader};

use super::extraction::{copy_bounded, PendingExtraction};
use super::format_detection::ArchiveFormat;
use super::security::SecurityValidator;
use super::types::{ArchiveEntry, RawEntry};
use super::FormatHandler;
use crate::error::{Error, Result};
use crate::task::CancellationToken;

const SEVENZ_MAGIC: &[u8] = &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];

/// 7z archive processing handler
pub struct SevenZipHandler;

impl SevenZipHandler {
    pub fn can_open(magic: &[u8]) -> bool {
        magic.starts_with(SEVENZ_MAGIC)
    }

    fn open(path: &Path) -> Result<SevenZReader<std::fs::File>> {
        SevenZReader::open(path, Password::empty()).map_err(Error::extraction)
    }

    fn normalize(name: &str) -> String {
        name.replace('\\', "/")
    }
}

impl FormatHandler for SevenZipHandler {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::SevenZip
    }

    fn read_listing(&self, archive: &Path, validator: &SecurityValidator) -> Result<Vec<RawEntry>> {
        let reader = Self::open(archive)?;
        let files = &reader.archive().files;

        validator.validate_entry_count(files.len())?;

        Ok(files
            .iter()
            .map(|file| {
                let path = Self::normalize(file.name());
                if file.is_directory() {
                    RawEntry::directory(path)
                } else {
                    RawEntry::file(path, file.size())
                }
            })
            .collect())
    }

    fn extract_member(
        &self,
        archive: &Path,
        entry: &ArchiveEntry,
        out: &mut PendingExtraction,
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut reader = Self::open(archive)?;

        // The callback can only report sevenz errors, so ours are parked here
        let mut outcome: Option<Result<u64>> = None;

        let walk = reader.for_each_entries(|member, data| {
            if member.is_directory() {
                return Ok(true);
            }
            let name = Self::normalize(member.name());
            if name != entry.path {
                // Solid blocks: earlier members must be decoded to reach ours
                if let Err(err) = copy_bounded(data, &mut std::io::sink(), u64::MAX, &name, cancel) {
                    outcome = Some(Err(err));
                    return Ok(false);
                }
                return Ok(true);
            }
            outcome = Some(out.fill_from(data, entry, limit, cancel));
            Ok(false)
        });

        match outcome {
            Some(result) => result,
            None => {
                walk.map_err(Error::extraction)?;
                Err(Error::UnknownEntry {
                    path: entry.path.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_open() {
        assert!(SevenZipHandler::can_open(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0, 4]));
        assert!(!SevenZipHandler::can_open(b"7z"));
        assert!(!SevenZipHandler::can_open(b"%PDF-"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(SevenZipHandler::normalize("a\\b\\c.png"), "a/b/c.png");
    }

    #[test]
    fn test_truncated_archive_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.cb7");
        std::fs::write(&path, [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0, 4, 1, 2]).unwrap();

        let result = SevenZipHandler.read_listing(&path, &SecurityValidator::default());
        assert!(matches!(result, Err(Error::ExtractionFailed(_))));
    }
}
