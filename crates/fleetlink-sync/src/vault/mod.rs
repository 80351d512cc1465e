//! Credential vault implementations
//!
//! Holds the API key issued at enrollment (and the token used to obtain it)
//! encrypted at rest. An inaccessible backend is reported as
//! `VaultUnavailable`, which callers treat as transient and never as
//! "not enrolled".

mod file;
mod keychain;
mod memory;

pub use file::EncryptedFileVault;
pub use keychain::KeychainVault;
pub use memory::MemoryVault;

use crate::error::{SyncError, SyncResult};
use crate::types::VaultSecret;
use fleetlink_core::{FleetlinkConfig, VaultBackend};
use std::sync::Arc;

/// Trait for credential storage backends
pub trait CredentialVault: Send + Sync {
    /// Replace the stored secret
    fn store(&self, secret: &VaultSecret) -> SyncResult<()>;

    /// Load the stored secret, `None` when nothing was stored
    fn load(&self) -> SyncResult<Option<VaultSecret>>;

    /// Remove the stored secret; clearing an empty vault is not an error
    fn clear(&self) -> SyncResult<()>;

    /// Check if a secret is stored
    fn exists(&self) -> bool {
        self.load().map(|s| s.is_some()).unwrap_or(false)
    }
}

/// Build the vault selected by `[vault]`
pub fn from_config(config: &FleetlinkConfig) -> SyncResult<Arc<dyn CredentialVault>> {
    match config.vault.backend {
        VaultBackend::Keychain => Ok(Arc::new(KeychainVault::with_service(
            &config.vault.keychain_service,
        ))),
        VaultBackend::EncryptedFile => {
            let passphrase = std::env::var(&config.vault.passphrase_env).map_err(|_| {
                SyncError::Config(format!(
                    "vault passphrase variable {} is not set",
                    config.vault.passphrase_env
                ))
            })?;
            Ok(Arc::new(EncryptedFileVault::new(
                config.vault_path(),
                passphrase,
            )))
        }
    }
}
