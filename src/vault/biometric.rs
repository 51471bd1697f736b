//! Biometric unlock seam.
//!
//! The platform keychain seals the vault key behind a biometric prompt. The
//! sealed blob is opaque to the vault and stored in its manifest.

use async_trait::async_trait;

use crate::crypto::SymmetricKey;
use crate::error::Result;

#[async_trait]
pub trait BiometricUnlock: Send + Sync {
    /// Protect `key` so only a successful biometric check can recover it.
    async fn seal(&self, key: &SymmetricKey) -> Result<Vec<u8>>;

    /// Prompt and recover the key. Fails with
    /// [`Error::AuthenticationFailed`](crate::error::Error::AuthenticationFailed)
    /// when the check is refused.
    async fn unseal(&self, sealed: &[u8]) -> Result<SymmetricKey>;
}
