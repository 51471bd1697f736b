//! Reader settings command.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use comicvault::SettingsStore;

pub struct SettingsCommand;

impl SettingsCommand {
    /// Show the stored settings, applying any values given first.
    pub async fn execute(path: &Path, prefetch_ahead: Option<usize>, prefetch_behind: Option<usize>) -> Result<()> {
        let store = SettingsStore::open(path)?;

        let settings = if prefetch_ahead.is_some() || prefetch_behind.is_some() {
            let updated = store.update(|settings| {
                if let Some(ahead) = prefetch_ahead {
                    settings.prefetch_ahead = ahead;
                }
                if let Some(behind) = prefetch_behind {
                    settings.prefetch_behind = behind;
                }
            })?;
            info!("Saved reader settings to {}", path.display());
            updated
        } else {
            store.get()?
        };

        println!("prefetch_ahead  = {}", settings.prefetch_ahead);
        println!("prefetch_behind = {}", settings.prefetch_behind);
        Ok(())
    }
}
