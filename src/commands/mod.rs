//! CLI subcommands. Library errors are rendered with their user-facing
//! message here; everything else passes through unchanged.

pub mod archive;
pub mod settings;
pub mod vault;

use comicvault::Error;

/// Replace a library error with its user message and recovery hint.
pub fn explain(err: anyhow::Error) -> anyhow::Error {
    let Some(core) = err.downcast_ref::<Error>() else {
        return err;
    };
    tracing::debug!("Command failed: {:?}", core);
    match core.recovery_suggestion() {
        Some(hint) => anyhow::anyhow!("{} {}", core.user_message(), hint),
        None => anyhow::anyhow!("{}", core.user_message()),
    }
}
