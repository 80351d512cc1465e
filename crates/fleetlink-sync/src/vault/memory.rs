//! In-memory vault (for testing and embedding)

use super::CredentialVault;
use crate::error::{SyncError, SyncResult};
use crate::types::VaultSecret;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct MemoryVault {
    secret: Mutex<Option<VaultSecret>>,
    unavailable: AtomicBool,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a locked device: every call fails with `VaultUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> SyncResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::VaultUnavailable("vault locked".into()));
        }
        Ok(())
    }
}

impl CredentialVault for MemoryVault {
    fn store(&self, secret: &VaultSecret) -> SyncResult<()> {
        self.check_available()?;
        *self.secret.lock() = Some(secret.clone());
        Ok(())
    }

    fn load(&self) -> SyncResult<Option<VaultSecret>> {
        self.check_available()?;
        Ok(self.secret.lock().clone())
    }

    fn clear(&self) -> SyncResult<()> {
        self.check_available()?;
        *self.secret.lock() = None;
        Ok(())
    }
}
