//! Vault lifecycle tests
//!
//! Setup, lock/unlock, add/decrypt/remove through the public API only,
//! with fast KDF parameters.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use comicvault::crypto::KdfParams;
use comicvault::task::with_deadline;
use comicvault::vault::BackoffConfig;
use comicvault::{Error, Vault, VaultConfig, VaultState};

fn vault_at(root: &Path) -> Vault {
    Vault::new(
        VaultConfig {
            root: root.to_path_buf(),
            kdf: KdfParams {
                log_n: 4,
                r: 8,
                p: 1,
            },
            backoff: BackoffConfig {
                backoff_threshold: 3,
                backoff_base_ms: 60_000,
            },
            ..VaultConfig::default()
        },
        None,
    )
}

#[tokio::test]
async fn test_add_lock_unlock_decrypt_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let vault = vault_at(&dir.path().join("vault"));
    let original = dir.path().join("comic.cbz");
    let content = b"0123456789";
    std::fs::write(&original, content)?;

    vault.setup("p1", false).await?;
    let item = vault.add_file(&original).await?;
    assert!(!original.exists());
    assert_eq!(item.size_bytes, 10);
    assert_eq!(item.file_name(), "comic.cbz");

    let blob = std::fs::read(&item.encrypted_path)?;
    assert!(!blob.windows(content.len()).any(|w| w == content));

    vault.lock().await;
    assert_eq!(vault.state().await, VaultState::Locked);

    vault.unlock("p1").await?;
    let items = vault.list_files().await?;
    assert_eq!(items, vec![item.clone()]);

    let copy = vault.decrypt_file(&item).await?;
    assert_eq!(std::fs::read(&copy)?, content);
    assert!(copy.starts_with(vault.scratch_dir()));

    vault.lock().await;
    assert!(!copy.exists());
    Ok(())
}

#[tokio::test]
async fn test_locked_vault_refuses_content_operations() -> Result<()> {
    let dir = TempDir::new()?;
    let vault = vault_at(&dir.path().join("vault"));
    let original = dir.path().join("comic.cbz");
    std::fs::write(&original, b"pages")?;

    vault.setup("p1", false).await?;
    let item = vault.add_file(&original).await?;
    vault.lock().await;

    assert_eq!(vault.list_files().await.unwrap_err(), Error::VaultLocked);
    assert_eq!(vault.decrypt_file(&item).await.unwrap_err(), Error::VaultLocked);
    assert_eq!(
        vault.remove_file(&item, None).await.unwrap_err(),
        Error::VaultLocked
    );

    let another = dir.path().join("other.cbz");
    std::fs::write(&another, b"more")?;
    assert_eq!(vault.add_file(&another).await.unwrap_err(), Error::VaultLocked);
    assert!(another.exists());
    Ok(())
}

#[tokio::test]
async fn test_wrong_password_and_throttling() -> Result<()> {
    let dir = TempDir::new()?;
    let vault = vault_at(&dir.path().join("vault"));
    vault.setup("p1", false).await?;
    vault.lock().await;

    for _ in 0..3 {
        assert_eq!(vault.unlock("nope").await.unwrap_err(), Error::AuthenticationFailed);
    }
    assert!(matches!(
        vault.unlock("p1").await,
        Err(Error::UnlockThrottled { .. })
    ));
    assert_eq!(vault.state().await, VaultState::Locked);
    assert_eq!(vault.unlock_status().await.consecutive_failures, 3);
    Ok(())
}

#[tokio::test]
async fn test_setup_state_errors() -> Result<()> {
    let dir = TempDir::new()?;
    let vault = vault_at(&dir.path().join("vault"));

    assert!(!vault.is_set_up());
    assert_eq!(vault.unlock("p1").await.unwrap_err(), Error::VaultNotSetUp);

    vault.setup("p1", false).await?;
    assert!(vault.is_set_up());
    assert_eq!(
        vault.setup("p2", false).await.unwrap_err(),
        Error::VaultAlreadySetUp
    );
    assert_eq!(
        vault.setup("p2", true).await.unwrap_err(),
        Error::VaultAlreadySetUp
    );
    Ok(())
}

#[tokio::test]
async fn test_biometric_requires_keychain() -> Result<()> {
    let dir = TempDir::new()?;
    let vault = vault_at(&dir.path().join("vault"));

    assert_eq!(
        vault.setup("p1", true).await.unwrap_err(),
        Error::BiometricUnavailable
    );
    assert!(!vault.is_set_up());
    assert_eq!(
        vault.unlock_with_biometric().await.unwrap_err(),
        Error::BiometricUnavailable
    );
    Ok(())
}

#[tokio::test]
async fn test_remove_restores_original() -> Result<()> {
    let dir = TempDir::new()?;
    let vault = vault_at(&dir.path().join("vault"));
    let original = dir.path().join("comic.cbz");
    std::fs::write(&original, b"restore me")?;

    vault.setup("p1", false).await?;
    let item = vault.add_file(&original).await?;

    let restored = vault.remove_file(&item, None).await?;
    assert_eq!(restored, item.original_path);
    assert_eq!(std::fs::read(&restored)?, b"restore me");
    assert!(!item.encrypted_path.exists());
    assert!(vault.list_files().await?.is_empty());

    vault.lock().await;
    vault.unlock("p1").await?;
    assert!(vault.list_files().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_remove_never_overwrites() -> Result<()> {
    let dir = TempDir::new()?;
    let vault = vault_at(&dir.path().join("vault"));
    let original = dir.path().join("comic.cbz");
    std::fs::write(&original, b"vaulted")?;

    vault.setup("p1", false).await?;
    let item = vault.add_file(&original).await?;

    let occupied = dir.path().join("occupied.cbz");
    std::fs::write(&occupied, b"keep")?;
    assert!(matches!(
        vault.remove_file(&item, Some(&occupied)).await,
        Err(Error::Io(_))
    ));
    assert_eq!(std::fs::read(&occupied)?, b"keep");
    assert_eq!(vault.list_files().await?.len(), 1);
    Ok(())
}

fn scratch_files(vault: &Vault) -> usize {
    std::fs::read_dir(vault.scratch_dir())
        .map(|entries| entries.count())
        .unwrap_or(0)
}

/// However a lock() interleaves with a running decrypt, no plaintext copy
/// survives it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lock_during_decrypt_leaves_no_plaintext() -> Result<()> {
    let dir = TempDir::new()?;
    let vault = Arc::new(vault_at(&dir.path().join("vault")));
    let original = dir.path().join("big.cbz");
    std::fs::write(&original, vec![7u8; 16 * 1024 * 1024])?;

    vault.setup("p1", false).await?;
    let item = vault.add_file(&original).await?;

    for delay_ms in [0, 2, 10, 50] {
        vault.unlock("p1").await?;

        let decrypting = {
            let vault = Arc::clone(&vault);
            let item = item.clone();
            tokio::spawn(async move { vault.decrypt_file(&item).await })
        };
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        vault.lock().await;

        match decrypting.await? {
            Ok(copy) => assert!(!copy.exists(), "copy survived lock at {delay_ms} ms"),
            Err(err) => assert_eq!(err, Error::VaultLocked),
        }
        assert_eq!(scratch_files(&vault), 0, "scratch not empty at {delay_ms} ms");
        assert_eq!(vault.state().await, VaultState::Locked);
    }
    Ok(())
}

#[tokio::test]
async fn test_vault_operations_under_deadline() -> Result<()> {
    let dir = TempDir::new()?;
    let vault = vault_at(&dir.path().join("vault"));
    let original = dir.path().join("comic.cbz");
    std::fs::write(&original, vec![42u8; 300 * 1024])?;

    with_deadline(Duration::from_secs(30), vault.setup("p1", false)).await?;
    let item = with_deadline(Duration::from_secs(30), vault.add_file(&original)).await?;
    let copy = with_deadline(Duration::from_secs(30), vault.decrypt_file(&item)).await?;
    assert_eq!(std::fs::read(&copy)?.len(), 300 * 1024);
    Ok(())
}
