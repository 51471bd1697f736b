//! Archive pipeline tests
//!
//! Exercise detection, listing, extraction and the reading session end to
//! end against archives built on the fly.

use anyhow::Result;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use comicvault::{
    extract_cover, open_reader, ArchiveConfig, ArchiveFormat, CacheConfig, ComicSession, Error,
    FormatDetector, PageCache,
};
use comicvault::task::CancellationToken;

fn write_zip(path: &Path, members: &[(&str, &[u8])]) -> Result<()> {
    let mut writer = zip::ZipWriter::new(File::create(path)?);
    for (name, data) in members {
        writer.start_file(*name, SimpleFileOptions::default())?;
        writer.write_all(data)?;
    }
    writer.finish()?;
    Ok(())
}

fn write_tar(path: &Path, members: &[(&str, &[u8])]) -> Result<()> {
    let mut builder = tar::Builder::new(File::create(path)?);
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data)?;
    }
    builder.into_inner()?.flush()?;
    Ok(())
}

fn scratch_config(dir: &Path) -> (ArchiveConfig, PathBuf) {
    let scratch = dir.join("scratch");
    let config = ArchiveConfig {
        scratch_root: Some(scratch.clone()),
        ..ArchiveConfig::default()
    };
    (config, scratch)
}

fn files_under(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                files_under(&path)
            } else {
                1
            }
        })
        .sum()
}

/// Entries are listed in natural order regardless of storage order, and
/// each extraction yields that member's exact bytes.
#[tokio::test]
async fn test_zip_listing_order_and_extraction() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("comic.cbz");
    write_zip(&path, &[("c.png", b"C"), ("a.png", b"A"), ("b.png", b"B")])?;

    assert_eq!(FormatDetector::detect_path(&path).await?, ArchiveFormat::Zip);

    let reader = open_reader(&path, &ArchiveConfig::default()).await?;
    let entries = reader.list_entries().await?;
    let names: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(names, vec!["a.png", "b.png", "c.png"]);
    let indices: Vec<usize> = entries.iter().map(|e| e.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    let cancel = CancellationToken::new();
    let extracted = reader.extract_entry(&entries[1], &cancel).await?;
    assert_eq!(std::fs::read(&extracted)?, b"B");
    Ok(())
}

#[tokio::test]
async fn test_natural_order_of_numbered_pages() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("comic.cbz");
    write_zip(
        &path,
        &[
            ("page10.jpg", b"10"),
            ("page2.jpg", b"2"),
            ("page1.jpg", b"1"),
            ("Page11.JPG", b"11"),
        ],
    )?;

    let reader = open_reader(&path, &ArchiveConfig::default()).await?;
    let names: Vec<String> = reader
        .list_entries()
        .await?
        .iter()
        .map(|e| e.path.clone())
        .collect();
    assert_eq!(names, vec!["page1.jpg", "page2.jpg", "page10.jpg", "Page11.JPG"]);
    Ok(())
}

#[tokio::test]
async fn test_cbt_tar_pipeline() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("comic.cbt");
    write_tar(
        &path,
        &[("02.jpg", b"second"), ("01.jpg", b"first"), ("info.txt", b"meta")],
    )?;

    assert_eq!(FormatDetector::detect_path(&path).await?, ArchiveFormat::Tar);

    let cache = PageCache::new(CacheConfig::default())?;
    let session = ComicSession::open(&path, &ArchiveConfig::default(), cache).await?;
    assert_eq!(session.page_count().await?, 2);

    let first = session.page(0).await?;
    assert_eq!(&first.bytes().await?[..], b"first");
    session.close().await;
    Ok(())
}

#[tokio::test]
async fn test_folder_pipeline() -> Result<()> {
    let dir = TempDir::new()?;
    let comic = dir.path().join("comic");
    std::fs::create_dir_all(comic.join("chapter1"))?;
    std::fs::write(comic.join("chapter1").join("001.png"), b"one")?;
    std::fs::write(comic.join("cover.png"), b"cover")?;

    assert_eq!(FormatDetector::detect_path(&comic).await?, ArchiveFormat::Folder);

    let reader = open_reader(&comic, &ArchiveConfig::default()).await?;
    let names: Vec<String> = reader
        .list_entries()
        .await?
        .iter()
        .map(|e| e.path.clone())
        .collect();
    assert_eq!(names, vec!["chapter1/001.png", "cover.png"]);
    Ok(())
}

#[tokio::test]
async fn test_unknown_format_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("notes.cbz");
    std::fs::write(&path, b"this is plainly not an archive")?;

    assert_eq!(
        FormatDetector::detect_path(&path).await.unwrap_err(),
        Error::UnsupportedFormat
    );
    assert!(matches!(
        open_reader(&path, &ArchiveConfig::default()).await,
        Err(Error::UnsupportedFormat)
    ));
    Ok(())
}

#[tokio::test]
async fn test_cover_is_first_page_only() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("comic.cbz");
    write_zip(&path, &[("b.jpg", b"second"), ("a.jpg", b"first")])?;
    let (config, scratch) = scratch_config(dir.path());

    let cover = extract_cover(&path, &config).await?;
    assert_eq!(&cover[..], b"first");
    assert_eq!(files_under(&scratch), 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_archive_has_no_pages() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("empty.cbz");
    write_zip(&path, &[])?;

    assert_eq!(
        extract_cover(&path, &ArchiveConfig::default()).await.unwrap_err(),
        Error::NoPages
    );
    Ok(())
}

/// Concurrent readers of one page share a single extraction.
#[tokio::test]
async fn test_concurrent_page_requests_coalesce() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("comic.cbz");
    let big = vec![7u8; 512 * 1024];
    write_zip(&path, &[("001.jpg", b"x"), ("002.jpg", &big)])?;

    let cache = PageCache::new(CacheConfig::default())?;
    let session = Arc::new(
        ComicSession::open(&path, &ArchiveConfig::default(), cache.clone())
            .await?
            .with_prefetch_window(0, 0),
    );

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move { session.page(1).await }));
    }

    let mut pages = Vec::new();
    for task in tasks {
        pages.push(task.await??);
    }
    for page in &pages[1..] {
        assert!(Arc::ptr_eq(&pages[0], page));
    }
    assert_eq!(pages[0].size_bytes(), big.len() as u64);

    let stats = cache.stats().await;
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.in_flight, 0);
    Ok(())
}

/// Reading pages beyond the cache budget evicts the oldest.
#[tokio::test]
async fn test_session_respects_cache_budget() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("comic.cbz");
    let members: Vec<(String, Vec<u8>)> = (1..=6)
        .map(|i| (format!("{i:03}.jpg"), vec![i as u8; 100]))
        .collect();
    let borrowed: Vec<(&str, &[u8])> = members
        .iter()
        .map(|(name, data)| (name.as_str(), data.as_slice()))
        .collect();
    write_zip(&path, &borrowed)?;

    let cache = PageCache::new(CacheConfig {
        max_bytes: 1024,
        max_entries: 3,
        prefetch_ahead: 0,
        prefetch_behind: 0,
    })?;
    let session = ComicSession::open(&path, &ArchiveConfig::default(), cache.clone()).await?;

    for index in 0..6 {
        let page = session.page(index).await?;
        assert_eq!(&page.bytes().await?[..], &members[index].1[..]);
    }

    let stats = cache.stats().await;
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.evictions, 3);
    Ok(())
}
