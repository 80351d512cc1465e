//! Device enrollment
//!
//! Exchanges an enrollment token for a device id and API key exactly once,
//! keeps the API key in the credential vault, and owns every transition of
//! the persisted enrollment state machine.

use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::store::{EnrollmentState, EnrollmentStateStore, EnrollmentStatus};
use crate::transport::Transport;
use crate::types::{AgentMetadata, DeviceCredentials, DeviceIdentity, VaultSecret};
use crate::vault::CredentialVault;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

/// Enrollment behaviour
#[derive(Debug, Clone)]
pub struct EnrollmentConfig {
    /// Require a HEALTHY server status before enrolling
    pub check_server_health: bool,

    /// Metadata sent with the enroll request
    pub metadata: AgentMetadata,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            check_server_health: true,
            metadata: AgentMetadata::default(),
        }
    }
}

/// Outcome of a successful `enroll`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentResult {
    /// A new identity was issued
    Enrolled(DeviceIdentity),

    /// The device was already enrolled; no network call was made
    AlreadyEnrolled(DeviceIdentity),
}

impl EnrollmentResult {
    pub fn identity(&self) -> &DeviceIdentity {
        match self {
            EnrollmentResult::Enrolled(id) | EnrollmentResult::AlreadyEnrolled(id) => id,
        }
    }
}

/// Device enrollment manager
pub struct EnrollmentManager {
    state: EnrollmentStateStore,
    vault: Arc<dyn CredentialVault>,
    transport: Arc<dyn Transport>,
    config: EnrollmentConfig,
    /// Held for writing while the identity changes, for reading by sync cycles
    identity_lock: RwLock<()>,
}

impl EnrollmentManager {
    pub fn new(
        state: EnrollmentStateStore,
        vault: Arc<dyn CredentialVault>,
        transport: Arc<dyn Transport>,
        config: EnrollmentConfig,
    ) -> Self {
        Self {
            state,
            vault,
            transport,
            config,
            identity_lock: RwLock::new(()),
        }
    }

    /// Current persisted state
    pub fn state(&self) -> SyncResult<EnrollmentState> {
        self.state.load()
    }

    pub fn is_enrolled(&self) -> bool {
        self.state
            .load()
            .map(|s| s.is_enrolled())
            .unwrap_or(false)
    }

    /// Identity of the enrolled device, if any
    pub fn identity(&self) -> SyncResult<Option<DeviceIdentity>> {
        Ok(identity_of(&self.state.load()?))
    }

    /// Hold the identity stable; enrollment and unenrollment wait for this guard
    pub async fn identity_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.identity_lock.read().await
    }

    /// A process that died mid-enrollment leaves `Enrolling` behind; turn it
    /// into a retryable failure so `enroll` can run again.
    pub fn recover_interrupted(&self) -> SyncResult<bool> {
        let state = self.state.load()?;
        if state.status != EnrollmentStatus::Enrolling {
            return Ok(false);
        }

        let failed = EnrollmentState::failed("enrollment interrupted", true);
        let recovered = self
            .state
            .compare_and_swap(EnrollmentStatus::Enrolling, &failed)?;
        if recovered {
            warn!("Found interrupted enrollment, marked as retryable failure");
        }
        Ok(recovered)
    }

    /// Enroll the device with `token`.
    ///
    /// Returns the cached identity without a network call when already
    /// enrolled. A token the server terminally rejected is refused locally
    /// until a different token is supplied.
    pub async fn enroll(&self, token: &str) -> SyncResult<EnrollmentResult> {
        let _guard = self.identity_lock.write().await;

        let state = self.state.load()?;
        match state.status {
            EnrollmentStatus::Enrolled => {
                let identity = identity_of(&state).ok_or_else(|| {
                    SyncError::StorageCorrupt("enrolled state without device id".into())
                })?;
                debug!("Already enrolled as {}", identity.device_id);
                return Ok(EnrollmentResult::AlreadyEnrolled(identity));
            }
            EnrollmentStatus::Enrolling => return Err(SyncError::EnrollmentInProgress),
            EnrollmentStatus::Unenrolled | EnrollmentStatus::Failed => {}
        }

        let token = token.trim();
        if token.is_empty() {
            return Err(SyncError::InvalidEnrollmentToken);
        }

        let token_hash = hash_token(token);
        if state.status == EnrollmentStatus::Failed
            && !state.retryable
            && state.rejected_token_hash.as_deref() == Some(token_hash.as_str())
        {
            warn!("Refusing to retry an enrollment token the server already rejected");
            return Err(SyncError::TokenRejected(
                state
                    .last_error
                    .unwrap_or_else(|| "token previously rejected".to_string()),
            ));
        }

        if !self
            .state
            .compare_and_swap(state.status, &EnrollmentState::enrolling())?
        {
            return Err(SyncError::EnrollmentInProgress);
        }
        info!("Enrolling device with fleet server");

        match self.perform_enrollment(token).await {
            Ok(identity) => {
                info!("Device enrolled successfully: {}", identity.device_id);
                Ok(EnrollmentResult::Enrolled(identity))
            }
            Err(e) => Err(self.record_failure(e, token_hash)),
        }
    }

    async fn perform_enrollment(&self, token: &str) -> SyncResult<DeviceIdentity> {
        if self.config.check_server_health {
            let status = self.transport.status().await?;
            if !status.is_healthy() {
                return Err(SyncError::ServerUnhealthy(status.status));
            }
        }

        let response = self.transport.enroll(token, &self.config.metadata).await?;

        let secret = VaultSecret {
            device_id: response.device_id.clone(),
            api_key: response.api_key.clone(),
            api_key_id: response.api_key_id.clone(),
            enrollment_token: Some(token.to_string()),
        };
        self.vault.store(&secret)?;

        let identity = DeviceIdentity {
            device_id: response.device_id.clone(),
            policy_id: response.policy_id.clone(),
            enrolled_at: response.enrolled_at.unwrap_or_else(Utc::now),
        };
        let enrolled = EnrollmentState::enrolled(
            identity.device_id.clone(),
            identity.policy_id.clone(),
            identity.enrolled_at,
        );
        if !self
            .state
            .compare_and_swap(EnrollmentStatus::Enrolling, &enrolled)?
        {
            return Err(SyncError::EnrollmentInProgress);
        }

        Ok(identity)
    }

    /// Persist a failed attempt and shape the error returned to the caller
    fn record_failure(&self, err: SyncError, token_hash: String) -> SyncError {
        let terminal = matches!(err.class(), ErrorClass::AuthFailure | ErrorClass::Validation);

        let mut failed = EnrollmentState::failed(err.to_string(), !terminal);
        if terminal {
            failed.rejected_token_hash = Some(token_hash);
        }
        if let Err(e) = self
            .state
            .compare_and_swap(EnrollmentStatus::Enrolling, &failed)
        {
            error!("Failed to persist enrollment failure: {}", e);
        }

        if terminal {
            error!("Enrollment token rejected: {}", err);
            SyncError::TokenRejected(err.to_string())
        } else {
            warn!("Enrollment failed, may be retried: {}", err);
            err
        }
    }

    /// Credentials for an authenticated call.
    ///
    /// `NotEnrolled` when the state machine is not Enrolled,
    /// `CredentialsMissing` when the vault lost the key, and
    /// `VaultUnavailable` when it cannot be read right now.
    pub fn credentials(&self) -> SyncResult<DeviceCredentials> {
        let state = self.state.load()?;
        if !state.is_enrolled() {
            return Err(SyncError::NotEnrolled);
        }

        let secret = self.vault.load()?.ok_or(SyncError::CredentialsMissing)?;
        if state.device_id.as_deref() != Some(secret.device_id.as_str()) {
            warn!(
                "Vault holds credentials for {} but state says {:?}",
                secret.device_id, state.device_id
            );
            return Err(SyncError::CredentialsMissing);
        }

        Ok(DeviceCredentials {
            device_id: secret.device_id.clone(),
            api_key: secret.api_key.clone(),
        })
    }

    /// Mark the current credential invalid (server answered 401/403).
    ///
    /// Enrolled becomes a retryable Failed; buffered records are untouched.
    /// Does not wait for the identity lock, so a running sync cycle may call it.
    pub fn invalidate(&self, reason: &str) -> SyncResult<bool> {
        let state = self.state.load()?;
        if !state.is_enrolled() {
            return Ok(false);
        }

        let mut failed = EnrollmentState::failed(format!("credentials invalid: {}", reason), true);
        failed.device_id = state.device_id.clone();
        failed.policy_id = state.policy_id.clone();

        let changed = self
            .state
            .compare_and_swap(EnrollmentStatus::Enrolled, &failed)?;
        if changed {
            error!(
                device_id = ?state.device_id,
                "Device credentials invalidated, re-enrollment required: {}", reason
            );
        }
        Ok(changed)
    }

    /// Enroll again with the token stored at the last enrollment
    pub async fn reenroll(&self) -> SyncResult<EnrollmentResult> {
        let token = self
            .vault
            .load()?
            .and_then(|secret| secret.enrollment_token.clone())
            .ok_or(SyncError::InvalidEnrollmentToken)?;
        self.enroll(&token).await
    }

    /// Forget the device identity: clear the vault and reset to Unenrolled.
    ///
    /// Buffered records stay queued and are sent after the next enrollment.
    pub async fn unenroll(&self) -> SyncResult<()> {
        let _guard = self.identity_lock.write().await;

        self.vault.clear()?;
        self.state.save(&EnrollmentState::unenrolled())?;

        info!("Device unenrolled");
        Ok(())
    }

    /// Record a policy assigned by the server
    pub fn set_policy_id(&self, policy_id: Option<&str>) -> SyncResult<()> {
        self.state.set_policy_id(policy_id)?;
        info!("Policy changed to {:?}", policy_id);
        Ok(())
    }
}

fn identity_of(state: &EnrollmentState) -> Option<DeviceIdentity> {
    if !state.is_enrolled() {
        return None;
    }
    Some(DeviceIdentity {
        device_id: state.device_id.clone()?,
        policy_id: state.policy_id.clone(),
        enrolled_at: state.enrolled_at.unwrap_or_default(),
    })
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
