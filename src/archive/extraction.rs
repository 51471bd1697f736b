//! Bounded streaming extraction into reader-scoped temp files.
//!
//! Member data is copied in fixed-size chunks. The running byte count is
//! checked against the entry ceiling on every chunk because declared sizes in
//! archive metadata can lie. Output goes to a `NamedTempFile` that is only
//! kept once the copy finished, so a failed or cancelled extraction never
//! leaves a visible partial file.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::types::ArchiveEntry;
use crate::error::{Error, Result};
use crate::task::{checkpoint, CancellationToken};

pub const CHUNK_SIZE: usize = 64 * 1024;

/// Copy `reader` into `writer`, failing once more than `limit` bytes appear.
pub fn copy_bounded<R, W>(
    reader: &mut R,
    writer: &mut W,
    limit: u64,
    path: &str,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        checkpoint(cancel)?;

        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::extraction(e)),
        };

        total = total.saturating_add(read as u64);
        if total > limit {
            tracing::warn!(
                "Entry {} exceeded ceiling of {} bytes while streaming",
                path,
                limit
            );
            return Err(Error::EntryTooLarge {
                path: path.to_string(),
                size: total,
                limit,
            });
        }

        writer.write_all(&buffer[..read])?;
    }

    Ok(total)
}

/// A temp file being filled with one member's bytes.
pub struct PendingExtraction {
    file: NamedTempFile,
}

impl PendingExtraction {
    /// Create a uniquely named temp file for `entry` inside `scratch_dir`.
    pub fn create(scratch_dir: &Path, entry: &ArchiveEntry) -> Result<Self> {
        let suffix = entry
            .extension()
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let file = tempfile::Builder::new()
            .prefix(&format!("{}-", entry.id))
            .suffix(&suffix)
            .tempfile_in(scratch_dir)?;
        Ok(Self { file })
    }

    /// Stream `reader` into the file under the size ceiling.
    pub fn fill_from<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        entry: &ArchiveEntry,
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        copy_bounded(reader, self.file.as_file_mut(), limit, &entry.path, cancel)
    }

    /// Flush and keep the file, handing its path to the caller.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.file.as_file_mut().flush()?;
        let (_file, path) = self.file.keep().map_err(|e| Error::Io(e.to_string()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_copy_bounded_within_limit() {
        let data = vec![7u8; CHUNK_SIZE * 2 + 10];
        let mut out = Vec::new();
        let copied = copy_bounded(
            &mut Cursor::new(&data),
            &mut out,
            data.len() as u64,
            "a.jpg",
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn test_copy_bounded_stops_past_limit() {
        let data = vec![0u8; 10_000];
        let mut out = Vec::new();
        let result = copy_bounded(
            &mut Cursor::new(&data),
            &mut out,
            100,
            "bomb.jpg",
            &CancellationToken::new(),
        );
        match result {
            Err(Error::EntryTooLarge { path, limit, .. }) => {
                assert_eq!(path, "bomb.jpg");
                assert_eq!(limit, 100);
            }
            other => panic!("expected EntryTooLarge, got {:?}", other),
        }
        assert!(out.is_empty());
    }

    #[test]
    fn test_copy_bounded_honours_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result = copy_bounded(
            &mut Cursor::new(vec![1u8; 10]),
            &mut Vec::new(),
            100,
            "a.jpg",
            &token,
        );
        assert_eq!(result, Err(Error::Cancelled));
    }

    #[test]
    fn test_failed_extraction_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let entry = ArchiveEntry::new("p.jpg", 1, 0);

        let mut pending = PendingExtraction::create(dir.path(), &entry).unwrap();
        let result = pending.fill_from(
            &mut Cursor::new(vec![0u8; 500]),
            &entry,
            10,
            &CancellationToken::new(),
        );
        assert!(result.is_err());
        drop(pending);

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_finished_extraction_is_kept() {
        let dir = TempDir::new().unwrap();
        let entry = ArchiveEntry::new("p.png", 3, 0);

        let mut pending = PendingExtraction::create(dir.path(), &entry).unwrap();
        pending
            .fill_from(&mut Cursor::new(b"abc".to_vec()), &entry, 10, &CancellationToken::new())
            .unwrap();
        let path = pending.finish().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with(".png"));
        assert!(path.starts_with(dir.path()));
    }
}
