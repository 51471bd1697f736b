//! Error taxonomy shared by the archive pipeline, the page cache and the vault.
//!
//! `Display` output is meant for logs and may name archive members. Anything
//! shown to a reader goes through [`Error::user_message`] instead, which never
//! carries paths.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("archive member has an unsafe path: {path}")]
    MaliciousPath { path: String },

    #[error("archive member {path} is {size} bytes, limit is {limit}")]
    EntryTooLarge { path: String, size: u64, limit: u64 },

    #[error("archive contains {count} entries, limit is {limit}")]
    TooManyEntries { count: usize, limit: usize },

    #[error("archive declares {size} bytes of content, limit is {limit}")]
    ArchiveTooLarge { size: u64, limit: u64 },

    #[error("unsupported archive format")]
    UnsupportedFormat,

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("entry is not part of this archive listing: {path}")]
    UnknownEntry { path: String },

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("vault is locked")]
    VaultLocked,

    #[error("vault has not been set up")]
    VaultNotSetUp,

    #[error("vault is already set up")]
    VaultAlreadySetUp,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("too many failed unlock attempts, retry in {retry_after_ms} ms")]
    UnlockThrottled { retry_after_ms: u64 },

    #[error("biometric unlock is not available")]
    BiometricUnavailable,

    #[error("page index {index} is out of range for {count} pages")]
    InvalidPageIndex { index: usize, count: usize },

    #[error("archive contains no pages")]
    NoPages,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub fn extraction(cause: impl std::fmt::Display) -> Self {
        Error::ExtractionFailed(cause.to_string())
    }

    /// Failures caused by a manipulated or hostile archive. These abort the
    /// whole listing or extraction.
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Error::MaliciousPath { .. }
                | Error::EntryTooLarge { .. }
                | Error::TooManyEntries { .. }
                | Error::ArchiveTooLarge { .. }
        )
    }

    /// Whether a caller may reasonably try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::Io(_) | Error::ExtractionFailed(_) | Error::UnlockThrottled { .. }
        )
    }

    /// Description safe to show in the reading UI.
    pub fn user_message(&self) -> String {
        match self {
            Error::MaliciousPath { .. } => {
                "This archive contains files that try to escape their folder and cannot be opened safely.".to_string()
            }
            Error::EntryTooLarge { .. } => {
                "A page in this archive is larger than the allowed limit.".to_string()
            }
            Error::TooManyEntries { count, .. } => {
                format!("This archive contains too many files ({count}).")
            }
            Error::ArchiveTooLarge { .. } => "This archive is larger than the allowed limit.".to_string(),
            Error::UnsupportedFormat => "This file is not a supported comic format.".to_string(),
            Error::ExtractionFailed(_) => "A page could not be read from the archive.".to_string(),
            Error::UnknownEntry { .. } => "The requested page does not belong to this comic.".to_string(),
            Error::DecryptionFailed => "The protected file could not be decrypted.".to_string(),
            Error::VaultLocked => "The vault is locked.".to_string(),
            Error::VaultNotSetUp => "The vault has not been set up yet.".to_string(),
            Error::VaultAlreadySetUp => "The vault is already set up.".to_string(),
            Error::AuthenticationFailed => "Unlocking the vault failed.".to_string(),
            Error::UnlockThrottled { retry_after_ms } => {
                let seconds = retry_after_ms.div_ceil(1000);
                format!("Too many attempts. Try again in {seconds} seconds.")
            }
            Error::BiometricUnavailable => "Biometric unlock is not available.".to_string(),
            Error::InvalidPageIndex { count, .. } => format!("This comic only has {count} pages."),
            Error::NoPages => "This comic does not contain any pages.".to_string(),
            Error::Cancelled => "The operation was cancelled.".to_string(),
            Error::Timeout => "The operation took too long.".to_string(),
            Error::Io(_) => "A file could not be read or written.".to_string(),
            Error::InvalidConfig(_) => "The reader configuration is invalid.".to_string(),
        }
    }

    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::MaliciousPath { .. }
            | Error::TooManyEntries { .. }
            | Error::EntryTooLarge { .. }
            | Error::ArchiveTooLarge { .. } => Some("Try re-downloading the file from a trusted source."),
            Error::ExtractionFailed(_) => Some("Try re-downloading the file."),
            Error::UnsupportedFormat => Some("Convert the comic to CBZ, CBR, CB7 or PDF."),
            Error::VaultLocked => Some("Unlock the vault and try again."),
            Error::VaultNotSetUp => Some("Set up the vault first."),
            Error::AuthenticationFailed => Some("Check the password and try again."),
            Error::UnlockThrottled { .. } => Some("Wait a moment before trying again."),
            Error::BiometricUnavailable => Some("Unlock with your password instead."),
            Error::Timeout | Error::Io(_) => Some("Try again."),
            Error::DecryptionFailed => Some("The vault copy may be damaged; restore it from a backup."),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::Cancelled
        } else {
            Error::ExtractionFailed(format!("worker task failed: {err}"))
        }
    }
}
