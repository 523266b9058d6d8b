//! Encrypted-at-rest credential vault
//!
//! Access tokens are stored in a single file sealed with XChaCha20-Poly1305
//! under a key derived from an operator password with Argon2id. The key and
//! decrypted tokens only exist in process memory while an [`UnlockedVault`] is
//! alive, and are wiped on drop.
//!
//! Nothing in this module logs a token or a secret reference.

pub mod format;

use crate::output::write_atomic;
use format::{open, seal, KdfCost, KdfParams, VaultFile, VaultKey, CHECK_MARKER, VAULT_FORMAT_VERSION};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Default vault file name
pub const DEFAULT_VAULT_FILE: &str = "credentials.enc";

/// Vault errors
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Password does not open the vault
    #[error("wrong vault password")]
    WrongPassword,

    /// Vault file is damaged or has an unsupported format
    #[error("vault is corrupt: {0}")]
    Corrupt(String),

    /// No credential stored under the requested reference
    #[error("no credential stored for the requested instance")]
    NotFound,

    /// Vault file does not exist
    #[error("vault not found at {0}")]
    Missing(String),

    /// Refusing to overwrite an existing vault
    #[error("vault already exists at {0}")]
    AlreadyExists(String),

    /// AEAD encryption failure
    #[error("failed to encrypt vault contents")]
    Encryption,

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

/// Result type for vault operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Locked vault file on disk
#[derive(Debug, Clone)]
pub struct CredentialVault {
    path: PathBuf,
}

impl CredentialVault {
    /// Point at a vault file; nothing is read until [`unlock`](Self::unlock)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Vault file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the vault file exists
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create a new empty vault with default Argon2id cost
    pub fn create(&self, password: &SecretString) -> VaultResult<UnlockedVault> {
        self.create_with_cost(password, KdfCost::default())
    }

    /// Create a new empty vault with explicit Argon2id cost
    pub fn create_with_cost(
        &self,
        password: &SecretString,
        cost: KdfCost,
    ) -> VaultResult<UnlockedVault> {
        if self.exists() {
            return Err(VaultError::AlreadyExists(self.path.display().to_string()));
        }
        let kdf = KdfParams::generate(cost);
        let key = kdf.derive_key(password)?;
        let vault = UnlockedVault {
            path: self.path.clone(),
            kdf,
            key,
            secrets: BTreeMap::new(),
        };
        vault.persist()?;
        info!(path = %self.path.display(), "Created credential vault");
        Ok(vault)
    }

    /// Derive the key from `password` and decrypt the secret index
    ///
    /// A tag failure on the check blob means the password is wrong; any other
    /// structural or authentication problem is reported as corruption.
    pub fn unlock(&self, password: &SecretString) -> VaultResult<UnlockedVault> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::Missing(self.path.display().to_string()))
            }
            Err(e) => return Err(VaultError::IoError(e.to_string())),
        };
        let file = VaultFile::parse(&bytes)?;
        let key = file.kdf.derive_key(password)?;

        let marker = open(&key, &file.check).map_err(|_| VaultError::WrongPassword)?;
        if marker.as_slice() != CHECK_MARKER {
            return Err(VaultError::Corrupt("check marker mismatch".to_string()));
        }

        let plaintext = open(&key, &file.index)
            .map_err(|_| VaultError::Corrupt("secret index failed authentication".to_string()))?;
        let index: SecretIndex = serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::Corrupt(format!("malformed secret index: {e}")))?;

        let secrets = index
            .secrets
            .into_iter()
            .map(|(name, token)| (name, SecretString::from(token)))
            .collect::<BTreeMap<_, _>>();

        debug!(path = %self.path.display(), entries = secrets.len(), "Vault unlocked");
        Ok(UnlockedVault {
            path: self.path.clone(),
            kdf: file.kdf,
            key,
            secrets,
        })
    }
}

#[derive(Serialize)]
struct SecretIndexRef<'a> {
    secrets: BTreeMap<&'a str, &'a str>,
}

#[derive(Deserialize)]
struct SecretIndex {
    #[serde(default)]
    secrets: BTreeMap<String, String>,
}

/// An unlocked vault session holding the derived key.
///
/// Exactly one holder (the orchestrator or a CLI command) owns this value.
pub struct UnlockedVault {
    path: PathBuf,
    kdf: KdfParams,
    key: VaultKey,
    secrets: BTreeMap<String, SecretString>,
}

/// Handle to an unlocked vault session
pub type KeyHandle = UnlockedVault;

impl fmt::Debug for UnlockedVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockedVault")
            .field("path", &self.path)
            .field("entries", &self.secrets.len())
            .finish_non_exhaustive()
    }
}

impl UnlockedVault {
    /// Return a copy of the token stored under `secret_ref`
    pub fn fetch(&self, secret_ref: &str) -> VaultResult<SecretString> {
        self.secrets
            .get(secret_ref)
            .map(|token| SecretString::from(token.expose_secret().to_string()))
            .ok_or(VaultError::NotFound)
    }

    /// Insert or replace a token and rewrite the vault atomically
    pub fn store(&mut self, secret_ref: &str, token: SecretString) -> VaultResult<()> {
        let previous = self.secrets.insert(secret_ref.to_string(), token);
        if let Err(e) = self.persist() {
            match previous {
                Some(old) => self.secrets.insert(secret_ref.to_string(), old),
                None => self.secrets.remove(secret_ref),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove a token; returns whether one was present
    pub fn remove(&mut self, secret_ref: &str) -> VaultResult<bool> {
        let Some(old) = self.secrets.remove(secret_ref) else {
            return Ok(false);
        };
        if let Err(e) = self.persist() {
            self.secrets.insert(secret_ref.to_string(), old);
            return Err(e);
        }
        Ok(true)
    }

    /// Names of stored entries
    pub fn names(&self) -> Vec<&str> {
        self.secrets.keys().map(String::as_str).collect()
    }

    /// Re-seal check marker and index with fresh nonces and replace the file
    fn persist(&self) -> VaultResult<()> {
        let exposed: BTreeMap<&str, &str> = self
            .secrets
            .iter()
            .map(|(name, token)| (name.as_str(), token.expose_secret()))
            .collect();
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&SecretIndexRef { secrets: exposed })
                .map_err(|e| VaultError::IoError(format!("failed to encode index: {e}")))?,
        );

        let file = VaultFile {
            format_version: VAULT_FORMAT_VERSION,
            kdf: self.kdf.clone(),
            check: seal(&self.key, CHECK_MARKER)?,
            index: seal(&self.key, &plaintext)?,
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| VaultError::IoError(format!("failed to encode vault: {e}")))?;
        write_atomic(&self.path, &json).map_err(|e| VaultError::IoError(e.to_string()))?;
        restrict_permissions(&self.path);
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
