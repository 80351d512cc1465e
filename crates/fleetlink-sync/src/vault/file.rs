//! Passphrase-encrypted file vault
//!
//! File layout: `FLV1 | salt (16) | nonce (24) | ciphertext`. The key is
//! derived from the passphrase with Argon2id and a fresh salt on every write;
//! the secret is sealed with XChaCha20-Poly1305 under a random nonce.

use super::CredentialVault;
use crate::error::{SyncError, SyncResult};
use crate::types::VaultSecret;
use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zeroize::Zeroizing;

const MAGIC: &[u8; 4] = b"FLV1";
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 24;
const KEY_SIZE: usize = 32;
const HEADER_SIZE: usize = MAGIC.len() + SALT_SIZE + NONCE_SIZE;

const CACHEDIR_TAG: &str = "Signature: 8a477f597d28d172789f06886806bc55\n\
# This directory holds encrypted fleetlink credentials.\n\
# Backup tools should skip it.\n";

pub struct EncryptedFileVault {
    path: PathBuf,
    passphrase: Zeroizing<String>,
}

impl EncryptedFileVault {
    pub fn new(path: PathBuf, passphrase: impl Into<String>) -> Self {
        Self {
            path,
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn derive_key(&self, salt: &[u8]) -> SyncResult<Zeroizing<[u8; KEY_SIZE]>> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut *key)
            .map_err(|e| SyncError::Vault(format!("key derivation failed: {}", e)))?;
        Ok(key)
    }

    fn seal(&self, plaintext: &[u8]) -> SyncResult<Vec<u8>> {
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut salt)
            .and_then(|_| getrandom::getrandom(&mut nonce))
            .map_err(|e| SyncError::VaultUnavailable(format!("no entropy: {}", e)))?;

        let key = self.derive_key(&salt)?;
        let cipher = XChaCha20Poly1305::new_from_slice(key.as_slice())
            .map_err(|e| SyncError::Vault(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| SyncError::Vault("encryption failed".into()))?;

        let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, data: &[u8]) -> SyncResult<Zeroizing<Vec<u8>>> {
        if data.len() < HEADER_SIZE || &data[..MAGIC.len()] != MAGIC {
            return Err(SyncError::Vault(format!(
                "{} is not a fleetlink vault",
                self.path.display()
            )));
        }

        let salt = &data[MAGIC.len()..MAGIC.len() + SALT_SIZE];
        let nonce = &data[MAGIC.len() + SALT_SIZE..HEADER_SIZE];
        let ciphertext = &data[HEADER_SIZE..];

        let key = self.derive_key(salt)?;
        let cipher = XChaCha20Poly1305::new_from_slice(key.as_slice())
            .map_err(|e| SyncError::Vault(e.to_string()))?;
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                SyncError::Vault("authentication failed (wrong passphrase or tampered file)".into())
            })?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Ensure the vault directory exists and is excluded from backups
    fn ensure_dir(&self) -> SyncResult<()> {
        let Some(parent) = self.path.parent() else {
            return Ok(());
        };
        fs::create_dir_all(parent).map_err(map_io_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(map_io_error)?;
        }

        let tag = parent.join("CACHEDIR.TAG");
        if !tag.exists() {
            fs::write(&tag, CACHEDIR_TAG).map_err(map_io_error)?;
        }
        Ok(())
    }

    fn write_atomic(&self, bytes: &[u8]) -> io::Result<()> {
        let temp_path = self.path.with_extension("tmp");

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)
    }
}

impl CredentialVault for EncryptedFileVault {
    fn store(&self, secret: &VaultSecret) -> SyncResult<()> {
        self.ensure_dir()?;

        let plaintext = Zeroizing::new(serde_json::to_vec(secret)?);
        let sealed = self.seal(&plaintext)?;
        self.write_atomic(&sealed).map_err(map_io_error)?;

        debug!("Stored device credentials in {:?}", self.path);
        Ok(())
    }

    fn load(&self) -> SyncResult<Option<VaultSecret>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!("Failed to read vault {:?}: {}", self.path, e);
                return Err(map_io_error(e));
            }
        };

        let plaintext = self.open(&data)?;
        let secret: VaultSecret = serde_json::from_slice(&plaintext)
            .map_err(|e| SyncError::Vault(format!("vault contents unreadable: {}", e)))?;

        debug!("Loaded device credentials from {:?}", self.path);
        Ok(Some(secret))
    }

    fn clear(&self) -> SyncResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Deleted device credentials from {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io_error(e)),
        }
    }
}

impl std::fmt::Debug for EncryptedFileVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileVault")
            .field("path", &self.path)
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

fn map_io_error(err: io::Error) -> SyncError {
    match err.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock => {
            SyncError::VaultUnavailable(err.to_string())
        }
        _ => SyncError::Io(err),
    }
}
