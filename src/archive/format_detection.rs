//! Archive Format Detection Module
//!
//! Detection is by magic bytes only. File extensions are never consulted:
//! comics arrive from untrusted sources and `.cbz` files that are really RAR
//! archives (and worse) are common.

use std::path::Path;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::pdf_handler::PdfHandler;
use super::rar_handler::RarHandler;
use super::sevenz_handler::SevenZipHandler;
use super::tar_handler::TarHandler;
use super::zip_handler::ZipHandler;
use crate::error::{Error, Result};

/// Bytes read from the start of a file to decide its format
pub const PROBE_WINDOW: usize = 512;

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    Zip,
    Rar,
    SevenZip,
    Pdf,
    Tar,
    Folder,
}

impl ArchiveFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Rar => "rar",
            ArchiveFormat::SevenZip => "7z",
            ArchiveFormat::Pdf => "pdf",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Folder => "folder",
        }
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type Probe = fn(&[u8]) -> bool;

/// Candidate readers in priority order. The first probe that matches wins.
const CANDIDATES: &[(ArchiveFormat, Probe)] = &[
    (ArchiveFormat::Zip, ZipHandler::can_open),
    (ArchiveFormat::Rar, RarHandler::can_open),
    (ArchiveFormat::SevenZip, SevenZipHandler::can_open),
    (ArchiveFormat::Pdf, PdfHandler::can_open),
    (ArchiveFormat::Tar, TarHandler::can_open),
];

/// Format detection utilities
pub struct FormatDetector;

impl FormatDetector {
    /// Detect format from the first bytes of a file
    pub fn detect(magic: &[u8]) -> Option<ArchiveFormat> {
        CANDIDATES
            .iter()
            .find(|(_, probe)| probe(magic))
            .map(|(format, _)| *format)
    }

    /// Detect the format of a path: directories are folders, files are probed.
    pub async fn detect_path(path: &Path) -> Result<ArchiveFormat> {
        let metadata = fs::metadata(path).await?;
        if metadata.is_dir() {
            return Ok(ArchiveFormat::Folder);
        }

        let magic = Self::read_magic_bytes(path).await?;
        match Self::detect(&magic) {
            Some(format) => {
                debug!("Detected format by magic bytes: {:?}", format);
                Ok(format)
            }
            None => {
                debug!("No reader recognised {}", path.display());
                Err(Error::UnsupportedFormat)
            }
        }
    }

    /// Read at most [`PROBE_WINDOW`] bytes; short files yield a short window.
    async fn read_magic_bytes(path: &Path) -> Result<Vec<u8>> {
        let file = fs::File::open(path).await?;
        let mut magic = Vec::with_capacity(PROBE_WINDOW);
        file.take(PROBE_WINDOW as u64).read_to_end(&mut magic).await?;
        Ok(magic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_detect_by_magic() {
        assert_eq!(
            FormatDetector::detect(&[0x50, 0x4B, 0x03, 0x04, 0x14, 0x00]),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            FormatDetector::detect(&[0x50, 0x4B, 0x05, 0x06]),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            FormatDetector::detect(b"Rar!\x1a\x07\x00rest"),
            Some(ArchiveFormat::Rar)
        );
        assert_eq!(
            FormatDetector::detect(b"Rar!\x1a\x07\x01\x00rest"),
            Some(ArchiveFormat::Rar)
        );
        assert_eq!(
            FormatDetector::detect(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00, 0x04]),
            Some(ArchiveFormat::SevenZip)
        );
        assert_eq!(FormatDetector::detect(b"%PDF-1.7\n"), Some(ArchiveFormat::Pdf));

        let mut tar_header = vec![0u8; 512];
        tar_header[257..262].copy_from_slice(b"ustar");
        assert_eq!(FormatDetector::detect(&tar_header), Some(ArchiveFormat::Tar));

        assert_eq!(FormatDetector::detect(&[0u8; 8]), None);
        assert_eq!(FormatDetector::detect(&[]), None);
        assert_eq!(FormatDetector::detect(b"PK"), None);
    }

    #[tokio::test]
    async fn test_detect_ignores_extension() {
        // RAR signature inside a file named like a zip comic
        let mut temp_file = tempfile::Builder::new().suffix(".cbz").tempfile().unwrap();
        temp_file.write_all(b"Rar!\x1a\x07\x01\x00garbage").unwrap();

        let format = FormatDetector::detect_path(temp_file.path()).await.unwrap();
        assert_eq!(format, ArchiveFormat::Rar);
    }

    #[tokio::test]
    async fn test_detect_unknown_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"just some text").unwrap();

        assert_eq!(
            FormatDetector::detect_path(temp_file.path()).await,
            Err(Error::UnsupportedFormat)
        );
    }

    #[tokio::test]
    async fn test_detect_directory_is_folder() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(
            FormatDetector::detect_path(dir.path()).await.unwrap(),
            ArchiveFormat::Folder
        );
    }
}
