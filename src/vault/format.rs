//! On-disk vault format and primitive crypto operations.
//!
//! The vault is a JSON document with hex-encoded binary fields:
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "kdf": {"salt": "..", "iterations": 3, "memory_kib": 19456, "parallelism": 1},
//!   "check": {"nonce": "..", "ciphertext": ".."},
//!   "index": {"nonce": "..", "ciphertext": ".."}
//! }
//! ```
//!
//! `check` seals a fixed marker so a wrong password is distinguishable from a
//! damaged index. Both blobs are XChaCha20-Poly1305 with a fresh 24-byte nonce.

use super::VaultError;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Current vault file format
pub const VAULT_FORMAT_VERSION: u32 = 1;

/// Plaintext sealed in the `check` blob
pub const CHECK_MARKER: &[u8] = b"gitlab-backup vault v1";

/// Derived key length (XChaCha20-Poly1305 key size)
pub const KEY_LEN: usize = 32;

/// XChaCha20 nonce length
pub const NONCE_LEN: usize = 24;

/// Salt length for Argon2id
pub const SALT_LEN: usize = 16;

/// Ceiling on Argon2 memory cost read from a vault file (1 GiB)
pub const MAX_KDF_MEMORY_KIB: u32 = 1024 * 1024;

/// Ceiling on Argon2 passes read from a vault file
pub const MAX_KDF_ITERATIONS: u32 = 10;

/// Ceiling on Argon2 lanes read from a vault file
pub const MAX_KDF_PARALLELISM: u32 = 16;

/// Derived symmetric key, wiped on drop
pub type VaultKey = Zeroizing<[u8; KEY_LEN]>;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfCost {
    /// Time cost (passes)
    pub iterations: u32,
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Lanes
    pub parallelism: u32,
}

impl KdfCost {
    /// Reject costs outside `1..=MAX_*`.
    ///
    /// Checked before any key derivation, so a damaged or crafted file cannot
    /// make Argon2 allocate unbounded memory.
    pub fn check(&self) -> Result<(), VaultError> {
        let within = |value: u32, max: u32| (1..=max).contains(&value);
        if !within(self.memory_kib, MAX_KDF_MEMORY_KIB)
            || !within(self.iterations, MAX_KDF_ITERATIONS)
            || !within(self.parallelism, MAX_KDF_PARALLELISM)
        {
            return Err(VaultError::Corrupt(format!(
                "KDF parameters out of range (m={} KiB, t={}, p={})",
                self.memory_kib, self.iterations, self.parallelism
            )));
        }
        Ok(())
    }
}

impl Default for KdfCost {
    /// OWASP baseline for Argon2id: m=19 MiB, t=2..3, p=1
    fn default() -> Self {
        Self {
            iterations: 3,
            memory_kib: 19 * 1024,
            parallelism: 1,
        }
    }
}

/// Stored key-derivation parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Random salt
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    /// Time cost
    pub iterations: u32,
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Lanes
    pub parallelism: u32,
}

impl KdfParams {
    /// Fresh parameters with a random salt
    pub fn generate(cost: KdfCost) -> Self {
        let mut salt = vec![0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        Self {
            salt,
            iterations: cost.iterations,
            memory_kib: cost.memory_kib,
            parallelism: cost.parallelism,
        }
    }

    /// Cost portion of the parameters
    pub fn cost(&self) -> KdfCost {
        KdfCost {
            iterations: self.iterations,
            memory_kib: self.memory_kib,
            parallelism: self.parallelism,
        }
    }

    /// Derive the vault key from `password`
    pub fn derive_key(&self, password: &SecretString) -> Result<VaultKey, VaultError> {
        self.cost().check()?;
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| VaultError::Corrupt(format!("invalid KDF parameters: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key: VaultKey = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(password.expose_secret().as_bytes(), &self.salt, &mut *key)
            .map_err(|e| VaultError::Corrupt(format!("key derivation failed: {e}")))?;
        Ok(key)
    }
}

/// Nonce and ciphertext (with appended Poly1305 tag)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    /// 24-byte XChaCha20 nonce
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    /// Ciphertext followed by the 16-byte tag
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Authentication failure while opening a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagMismatch;

/// Encrypt `plaintext` under `key` with a fresh random nonce
pub fn seal(key: &VaultKey, plaintext: &[u8]) -> Result<SealedBlob, VaultError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| VaultError::Encryption)?;
    Ok(SealedBlob {
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Decrypt and authenticate a blob. No plaintext is returned on failure.
pub fn open(key: &VaultKey, blob: &SealedBlob) -> Result<Zeroizing<Vec<u8>>, TagMismatch> {
    if blob.nonce.len() != NONCE_LEN {
        return Err(TagMismatch);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
    cipher
        .decrypt(XNonce::from_slice(&blob.nonce), blob.ciphertext.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| TagMismatch)
}

/// Whole vault document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultFile {
    /// Format version, must equal [`VAULT_FORMAT_VERSION`]
    pub format_version: u32,
    /// KDF parameters
    pub kdf: KdfParams,
    /// Sealed marker used for password verification
    pub check: SealedBlob,
    /// Sealed JSON index of secrets
    pub index: SealedBlob,
}

impl VaultFile {
    /// Parse and structurally validate a vault document
    pub fn parse(bytes: &[u8]) -> Result<Self, VaultError> {
        let file: VaultFile = serde_json::from_slice(bytes)
            .map_err(|e| VaultError::Corrupt(format!("malformed vault file: {e}")))?;
        if file.format_version != VAULT_FORMAT_VERSION {
            return Err(VaultError::Corrupt(format!(
                "unsupported vault format version {} (expected {VAULT_FORMAT_VERSION})",
                file.format_version
            )));
        }
        if file.kdf.salt.len() < 8 {
            return Err(VaultError::Corrupt("salt too short".to_string()));
        }
        file.kdf.cost().check()?;
        Ok(file)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
