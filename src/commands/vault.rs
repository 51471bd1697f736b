//! Vault commands. Each invocation unlocks the vault with the supplied
//! password and locks it again before exiting.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use comicvault::{ComicSession, Config, PageCache, Vault, VaultItem};

#[derive(Args, Debug)]
pub struct VaultArgs {
    /// Vault password
    #[arg(long, env = "COMICVAULT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: VaultCommands,
}

#[derive(Subcommand, Debug)]
enum VaultCommands {
    /// Create a new vault protected by the password
    Init,

    /// Encrypt a file into the vault and delete the original
    Add {
        path: PathBuf,
    },

    /// List vault items
    #[command(alias = "ls")]
    List,

    /// Restore an item to disk and drop it from the vault
    Remove {
        /// Item id as shown by `vault list`
        id: Uuid,

        /// Where to restore; defaults to the original location
        #[arg(long)]
        to: Option<PathBuf>,
    },

    /// Write one page of a vault item to a file
    Open {
        id: Uuid,

        /// Zero-based page index
        #[arg(long, default_value = "0")]
        page: usize,

        #[arg(short, long)]
        output: PathBuf,
    },
}

pub struct VaultCommand;

impl VaultCommand {
    pub async fn execute(config: &Config, args: VaultArgs) -> Result<()> {
        let password = args
            .password
            .ok_or_else(|| anyhow!("A password is required (--password or COMICVAULT_PASSWORD)"))?;
        let vault = Vault::new(config.vault.clone(), None);

        if let VaultCommands::Init = args.command {
            vault.setup(&password, false).await?;
            println!("Vault created at {}", vault.root().display());
            vault.lock().await;
            return Ok(());
        }

        vault.unlock(&password).await?;
        let result = run_unlocked(config, &vault, args.command).await;
        vault.lock().await;
        result
    }
}

async fn run_unlocked(config: &Config, vault: &Vault, command: VaultCommands) -> Result<()> {
    match command {
        VaultCommands::Init => Ok(()),
        VaultCommands::Add { path } => {
            let item = vault.add_file(&path).await?;
            println!("{}  {}", item.id, item.file_name());
            Ok(())
        }
        VaultCommands::List => {
            for item in vault.list_files().await? {
                println!(
                    "{}  {:>10}  {}  {}",
                    item.id,
                    item.size_bytes,
                    item.added_date.format("%Y-%m-%d %H:%M"),
                    item.file_name()
                );
            }
            Ok(())
        }
        VaultCommands::Remove { id, to } => {
            let item = find_item(vault, id).await?;
            let restored = vault.remove_file(&item, to.as_deref()).await?;
            println!("Restored to {}", restored.display());
            Ok(())
        }
        VaultCommands::Open { id, page, output } => {
            let item = find_item(vault, id).await?;
            open_page(config, vault, &item, page, &output).await
        }
    }
}

async fn find_item(vault: &Vault, id: Uuid) -> Result<VaultItem> {
    vault
        .list_files()
        .await?
        .into_iter()
        .find(|item| item.id == id)
        .ok_or_else(|| anyhow!("No vault item with id {id}"))
}

async fn open_page(config: &Config, vault: &Vault, item: &VaultItem, index: usize, output: &Path) -> Result<()> {
    let cache = PageCache::new(config.cache.clone())?;
    let session = ComicSession::open_from_vault(vault, item, &config.archive, cache)
        .await?
        .with_prefetch_window(0, 0);

    let bytes = session.page(index).await?.bytes().await?;
    session.close().await;

    tokio::fs::write(output, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!("Wrote page {} of {} to {}", index, item.file_name(), output.display());
    Ok(())
}
