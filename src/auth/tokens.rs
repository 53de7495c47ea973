//! Key identities, secrets and digests
//!
//! - Identity: random UUID, the non-secret handle used for listing and revocation
//! - Secret: random bytes from the OS, base64url without padding, shown once at issuance
//! - Digest: SHA-256 of the secret, the only form that is ever stored

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, TryRngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

/// Minimum number of random bytes in a secret
pub const MIN_SECRET_LEN: usize = 32;

/// Default number of random bytes in a secret
pub const DEFAULT_SECRET_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid key id '{0}'")]
    InvalidId(String),

    #[error("entropy source failed: {0}")]
    Entropy(String),
}

/// Identity of an issued key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(Uuid);

impl KeyId {
    /// Generate a fresh random identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for KeyId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for KeyId {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| TokenError::InvalidId(s.chars().take(64).collect()))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// SHA-256 digest of a plaintext secret
///
/// Equality is constant-time so comparisons do not leak how many leading bytes matched.
#[derive(Clone, Copy)]
pub struct KeyDigest([u8; 32]);

impl KeyDigest {
    /// Digest a plaintext secret
    pub fn of(secret: &str) -> Self {
        Self(Sha256::digest(secret.as_bytes()).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// base64url (no padding) rendering, the form a record store persists
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }
}

impl PartialEq for KeyDigest {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for KeyDigest {}

impl Hash for KeyDigest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDigest({})", self.encode())
    }
}

/// Generate a new plaintext secret of `len` random bytes (at least [`MIN_SECRET_LEN`])
pub fn generate_secret(len: usize) -> Result<String, TokenError> {
    let mut bytes = vec![0u8; len.max(MIN_SECRET_LEN)];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| TokenError::Entropy(e.to_string()))?;

    Ok(URL_SAFE_NO_PAD.encode(&bytes))
}

/// Admin key guarding the key management routes
#[derive(Clone)]
pub struct AdminKey {
    key: String,
}

impl AdminKey {
    pub fn new(key: String) -> Self {
        Self { key }
    }

    pub fn matches(&self, token: &str) -> bool {
        if token.len() != self.key.len() {
            return false;
        }

        token.as_bytes().ct_eq(self.key.as_bytes()).into()
    }
}

impl fmt::Debug for AdminKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AdminKey([REDACTED])")
    }
}
