//! Archive inspection commands.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use comicvault::{extract_cover, ComicSession, Config, FormatDetector, PageCache, SettingsStore};

pub struct DetectCommand;

impl DetectCommand {
    pub async fn execute(path: &Path) -> Result<()> {
        let format = FormatDetector::detect_path(path).await?;
        println!("{format}");
        Ok(())
    }
}

pub struct ListCommand;

impl ListCommand {
    pub async fn execute(config: &Config, path: &Path, json: bool) -> Result<()> {
        let cache = PageCache::new(config.cache.clone())?;
        let session = ComicSession::open(path, &config.archive, cache).await?;
        let entries = session.entries().await?;

        if json {
            let rendered =
                serde_json::to_string_pretty(entries.as_slice()).context("Failed to encode listing")?;
            println!("{rendered}");
            return Ok(());
        }

        println!("{} archive, {} pages", session.format(), entries.len());
        for entry in entries.iter() {
            println!("{:>5}  {:>10}  {}", entry.index, entry.uncompressed_size, entry.path);
        }
        Ok(())
    }
}

pub struct CoverCommand;

impl CoverCommand {
    pub async fn execute(config: &Config, path: &Path, output: &Path) -> Result<()> {
        let cover = extract_cover(path, &config.archive).await?;
        tokio::fs::write(output, &cover)
            .await
            .with_context(|| format!("Failed to write {}", output.display()))?;
        info!("Wrote cover ({} bytes) to {}", cover.len(), output.display());
        Ok(())
    }
}

pub struct ExtractCommand;

impl ExtractCommand {
    pub async fn execute(
        config: &Config,
        settings: &Path,
        path: &Path,
        index: usize,
        output: &Path,
    ) -> Result<()> {
        let settings = SettingsStore::open(settings)?.get()?;
        let cache = PageCache::new(config.cache.clone())?;
        let session = ComicSession::open(path, &config.archive, cache)
            .await?
            .with_settings(&settings);

        let page = session.page(index).await?;
        let bytes = page.bytes().await?;
        tokio::fs::write(output, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", output.display()))?;
        info!("Wrote page {} ({} bytes) to {}", index, bytes.len(), output.display());

        session.close().await;
        Ok(())
    }
}
