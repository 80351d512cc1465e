//! Error types for fleetlink-sync crate

use crate::store::EnrollmentStatus;
use crate::transport::TransportError;
use thiserror::Error;

/// How the engine reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, timeout, 5xx, 429, vault locked: retried with backoff, never data loss
    Transient,
    /// 401/403 or a rejected enrollment token: re-enrollment required
    AuthFailure,
    /// Server rejected the content: marked failed, not retried
    Validation,
    /// Local storage can no longer hold or read records
    TerminalLocal,
    /// Unexpected local failure: aborts the current cycle only
    Fatal,
}

/// Errors that can occur in the sync engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote API call failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Secure storage is temporarily inaccessible (e.g. device locked)
    #[error("Credential vault unavailable: {0}")]
    VaultUnavailable(String),

    /// Secure storage failed permanently (tampered file, wrong passphrase)
    #[error("Credential vault error: {0}")]
    Vault(String),

    /// State says enrolled but the vault holds no credentials
    #[error("Device credentials missing from vault")]
    CredentialsMissing,

    /// Device not enrolled
    #[error("Device not enrolled")]
    NotEnrolled,

    /// Another enrollment attempt holds the state machine
    #[error("Enrollment already in progress")]
    EnrollmentInProgress,

    /// Empty or malformed enrollment token
    #[error("Invalid enrollment token")]
    InvalidEnrollmentToken,

    /// Token was terminally rejected by the fleet server
    #[error("Enrollment token rejected: {0}")]
    TokenRejected(String),

    /// Enrollment state change that the state machine does not allow
    #[error("Illegal enrollment transition {from} -> {to}")]
    InvalidTransition {
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    },

    /// Fleet server answered the health check with something other than HEALTHY
    #[error("Fleet server is not healthy: {0}")]
    ServerUnhealthy(String),

    /// A batch is already in flight
    #[error("Batch {0} is still in flight")]
    BatchOutstanding(String),

    /// Record storage is full
    #[error("Storage full: {0}")]
    StorageFull(String),

    /// Record storage is corrupt
    #[error("Storage corrupt: {0}")]
    StorageCorrupt(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DiskFull) => SyncError::StorageFull(err.to_string()),
            Some(rusqlite::ErrorCode::DatabaseCorrupt) | Some(rusqlite::ErrorCode::NotADatabase) => {
                SyncError::StorageCorrupt(err.to_string())
            }
            _ => SyncError::Database(err),
        }
    }
}

impl SyncError {
    /// Classify for retry / re-enrollment / data-loss handling
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Transport(e) => e.class(),
            SyncError::VaultUnavailable(_)
            | SyncError::ServerUnhealthy(_)
            | SyncError::EnrollmentInProgress
            | SyncError::BatchOutstanding(_) => ErrorClass::Transient,
            SyncError::CredentialsMissing
            | SyncError::NotEnrolled
            | SyncError::TokenRejected(_) => ErrorClass::AuthFailure,
            SyncError::InvalidEnrollmentToken => ErrorClass::Validation,
            SyncError::StorageFull(_) | SyncError::StorageCorrupt(_) => ErrorClass::TerminalLocal,
            SyncError::Vault(_)
            | SyncError::Database(_)
            | SyncError::Serialization(_)
            | SyncError::Config(_)
            | SyncError::InvalidTransition { .. }
            | SyncError::Io(_) => ErrorClass::Fatal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if this is a network-related error
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(TransportError::Network(_) | TransportError::Timeout)
        )
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
