//! OS keychain vault
//!
//! Uses the `keyring` crate for platform-specific secure storage:
//! - macOS: Keychain
//! - Linux: Secret Service (libsecret)
//! - Windows: Credential Manager

use super::CredentialVault;
use crate::error::{SyncError, SyncResult};
use crate::types::VaultSecret;
use tracing::{debug, warn};
use zeroize::Zeroizing;

const DEFAULT_SERVICE: &str = "fleetlink";
const ENTRY_USER: &str = "device-credentials";

pub struct KeychainVault {
    service: String,
    user: String,
}

impl KeychainVault {
    /// Create with default service/user
    pub fn new() -> Self {
        Self::with_service(DEFAULT_SERVICE)
    }

    /// Create with custom service name
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: ENTRY_USER.to_string(),
        }
    }

    fn entry(&self) -> SyncResult<keyring::Entry> {
        keyring::Entry::new(&self.service, &self.user).map_err(map_keyring_error)
    }
}

impl Default for KeychainVault {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialVault for KeychainVault {
    fn store(&self, secret: &VaultSecret) -> SyncResult<()> {
        let json = Zeroizing::new(serde_json::to_string(secret)?);
        self.entry()?
            .set_password(&json)
            .map_err(map_keyring_error)?;

        debug!("Stored device credentials in keychain");
        Ok(())
    }

    fn load(&self) -> SyncResult<Option<VaultSecret>> {
        match self.entry()?.get_password() {
            Ok(json) => {
                let json = Zeroizing::new(json);
                let secret: VaultSecret = serde_json::from_str(&json)
                    .map_err(|e| SyncError::Vault(format!("keychain entry unreadable: {}", e)))?;
                debug!("Loaded device credentials from keychain");
                Ok(Some(secret))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => {
                warn!("Failed to load from keychain: {}", e);
                Err(map_keyring_error(e))
            }
        }
    }

    fn clear(&self) -> SyncResult<()> {
        match self.entry()?.delete_credential() {
            Ok(()) => {
                debug!("Deleted device credentials from keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(map_keyring_error(e)),
        }
    }
}

fn map_keyring_error(err: keyring::Error) -> SyncError {
    match err {
        keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
            SyncError::VaultUnavailable(err.to_string())
        }
        other => SyncError::Vault(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let locked = keyring::Error::NoStorageAccess("device locked".into());
        assert!(matches!(
            map_keyring_error(locked),
            SyncError::VaultUnavailable(_)
        ));

        let platform = keyring::Error::PlatformFailure("dbus gone".into());
        assert!(map_keyring_error(platform).is_retryable());

        let too_long = keyring::Error::TooLong("password".into(), 4096);
        assert!(matches!(map_keyring_error(too_long), SyncError::Vault(_)));
    }

    #[test]
    fn test_service_name() {
        let vault = KeychainVault::with_service("fleetlink-test");
        assert_eq!(vault.service, "fleetlink-test");
        assert_eq!(vault.user, ENTRY_USER);
        assert_eq!(KeychainVault::default().service, DEFAULT_SERVICE);
    }
}
