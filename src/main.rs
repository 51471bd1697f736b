use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use comicvault::Config;

mod commands;

/// comicvault - read comic archives and keep private ones encrypted
#[derive(Parser, Debug)]
#[command(name = "comicvault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where reader settings are persisted
    #[arg(long, default_value = ".comicvault/settings.json")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the detected archive format
    Detect {
        path: PathBuf,
    },

    /// List the pages of an archive in reading order
    #[command(alias = "ls")]
    List {
        path: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Write the first page of an archive to a file
    Cover {
        path: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write one page of an archive to a file
    Extract {
        path: PathBuf,

        /// Zero-based page index
        index: usize,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show or change reader settings
    Settings {
        /// Pages to prefetch after the current one
        #[arg(long)]
        prefetch_ahead: Option<usize>,

        /// Pages to prefetch before the current one
        #[arg(long)]
        prefetch_behind: Option<usize>,
    },

    /// Encrypted vault commands
    Vault(commands::vault::VaultArgs),
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("comicvault=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };

    let result = match cli.command {
        Commands::Detect { path } => commands::archive::DetectCommand::execute(&path).await,
        Commands::List { path, json } => commands::archive::ListCommand::execute(&config, &path, json).await,
        Commands::Cover { path, output } => {
            commands::archive::CoverCommand::execute(&config, &path, &output).await
        }
        Commands::Extract {
            path,
            index,
            output,
        } => {
            commands::archive::ExtractCommand::execute(&config, &cli.settings, &path, index, &output).await
        }
        Commands::Settings {
            prefetch_ahead,
            prefetch_behind,
        } => commands::settings::SettingsCommand::execute(&cli.settings, prefetch_ahead, prefetch_behind).await,
        Commands::Vault(args) => commands::vault::VaultCommand::execute(&config, args).await,
    };

    result.map_err(commands::explain)
}
