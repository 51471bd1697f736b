//! TAR Archive Handler Module
//!
//! Handles CBT comics (uncompressed TAR). Headers are walked with seeking so
//! listing skips member data instead of reading it.

use std::fs::File;
use std::path::Path;

use super::extraction::PendingExtraction;
use super::format_detection::ArchiveFormat;
use super::security::SecurityValidator;
use super::types::{ArchiveEntry, RawEntry};
use super::FormatHandler;
use crate::error::{Error, Result};
use crate::task::{checkpoint, CancellationToken};

const USTAR_OFFSET: usize = 257;

/// TAR archive processing handler
pub struct TarHandler;

impl TarHandler {
    /// POSIX and GNU tar both carry "ustar" at offset 257 of the first header
    pub fn can_open(magic: &[u8]) -> bool {
        magic
            .get(USTAR_OFFSET..USTAR_OFFSET + 5)
            .is_some_and(|window| window == b"ustar")
    }

    fn entry_path<R: std::io::Read>(entry: &tar::Entry<'_, R>) -> String {
        String::from_utf8_lossy(&entry.path_bytes()).replace('\\', "/")
    }
}

impl FormatHandler for TarHandler {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Tar
    }

    fn read_listing(&self, archive: &Path, validator: &SecurityValidator) -> Result<Vec<RawEntry>> {
        let mut tar = tar::Archive::new(File::open(archive)?);
        let mut entries = Vec::new();

        for entry in tar.entries_with_seek().map_err(Error::extraction)? {
            let entry = entry.map_err(Error::extraction)?;
            validator.validate_entry_count(entries.len() + 1)?;

            let path = Self::entry_path(&entry);
            let header = entry.header();
            let raw = if header.entry_type().is_file() {
                RawEntry::file(path, header.size().map_err(Error::extraction)?)
            } else {
                // Directories, links and special files never become pages
                RawEntry::directory(path)
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
        let mut tar = tar::Archive::new(File::open(archive)?);

        for member in tar.entries_with_seek().map_err(Error::extraction)? {
            checkpoint(cancel)?;
            let mut member = member.map_err(Error::extraction)?;
            if member.header().entry_type().is_file() && Self::entry_path(&member) == entry.path {
                return out.fill_from(&mut member, entry, limit, cancel);
            }
        }

        Err(Error::UnknownEntry {
            path: entry.path.clone(),
        })
    }
}
