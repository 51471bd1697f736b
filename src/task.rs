//! Deadlines and cooperative cancellation for archive and vault work.

use std::future::Future;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Run `fut` under a caller-supplied deadline. Expiry yields the retryable
/// [`Error::Timeout`] instead of hanging.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("Operation exceeded deadline of {:?}", deadline);
            Err(Error::Timeout)
        }
    }
}

/// Checkpoint used inside blocking I/O loops.
pub fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
