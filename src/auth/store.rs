//! Key issuance, validation and revocation

use crate::auth::revocation::{Revocation, RevocationReceiver, Subscribers, Unsubscribe};
use crate::auth::tokens::{generate_secret, KeyDigest, KeyId, TokenError};
use crate::auth::{KeyResolver, KeyValidator, RevocationSource};
use crate::config::StoreConfig;
use crate::storage::{KeyRecord, KeyRepository, MemoryKeyRepository, StorageError};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key id: {0}")]
    InvalidId(String),

    #[error("key not found")]
    NotFound,

    #[error("entropy source failed: {0}")]
    Entropy(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<TokenError> for KeyError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::InvalidId(id) => KeyError::InvalidId(id),
            TokenError::Entropy(msg) => KeyError::Entropy(msg),
        }
    }
}

/// A freshly issued key. `key` is the plaintext secret and is never available again.
#[derive(Clone, Serialize)]
pub struct IssuedKey {
    pub id: KeyId,
    pub name: String,
    pub key: String,
}

impl fmt::Debug for IssuedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Public view of a key record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySummary {
    pub id: KeyId,
    pub name: String,
}

impl From<KeyRecord> for KeySummary {
    fn from(record: KeyRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
        }
    }
}

/// Source of truth for key lifecycle and the publisher of revocations
pub struct KeyStore {
    repo: Arc<dyn KeyRepository>,
    subscribers: Subscribers,
    config: StoreConfig,
}

impl KeyStore {
    pub fn new(repo: Arc<dyn KeyRepository>, config: StoreConfig) -> Self {
        Self {
            repo,
            subscribers: Subscribers::new(),
            config,
        }
    }

    /// Store backed by an in-memory repository
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyRepository::new()), StoreConfig::default())
    }

    /// Issue a new key. The returned secret is the only copy of it.
    pub async fn issue(&self, name: &str) -> Result<IssuedKey, KeyError> {
        let key = generate_secret(self.config.secret_len)?;
        let digest = KeyDigest::of(&key);

        let record = self.repo.create(name, digest).await.map_err(|e| match e {
            StorageError::Conflict(msg) => KeyError::Internal(msg),
            other => KeyError::Storage(other),
        })?;

        info!(key_id = %record.id, name = %record.name, "Issued key");

        Ok(IssuedKey {
            id: record.id,
            name: record.name,
            key,
        })
    }

    /// Whether `secret` belongs to a live key
    pub async fn validate(&self, secret: &str) -> bool {
        self.resolve(secret).await.is_some()
    }

    /// Identity of the live key `secret` belongs to
    pub async fn resolve(&self, secret: &str) -> Option<KeyId> {
        if secret.is_empty() {
            return None;
        }

        match self.repo.get_by_digest(&KeyDigest::of(secret)).await {
            Ok(record) => Some(record.id),
            Err(StorageError::NotFound) => None,
            Err(e) => {
                warn!(error = %e, "Key lookup failed");
                None
            }
        }
    }

    /// All live keys, newest first
    pub async fn list(&self) -> Result<Vec<KeySummary>, KeyError> {
        let records = self.repo.list().await.map_err(KeyError::Storage)?;
        Ok(records.into_iter().map(KeySummary::from).collect())
    }

    /// Revoke a key by identity and notify subscribers
    pub async fn revoke(&self, id: &str) -> Result<KeySummary, KeyError> {
        let key_id: KeyId = id.parse()?;

        let record = self.repo.delete_by_id(&key_id).await.map_err(|e| match e {
            StorageError::NotFound => KeyError::NotFound,
            other => KeyError::Storage(other),
        })?;

        let delivered = self.subscribers.publish(Revocation { key_id });
        info!(key_id = %key_id, name = %record.name, subscribers = delivered, "Revoked key");

        Ok(record.into())
    }

    /// Lossy subscription using the configured buffer size
    pub fn subscribe(&self) -> (RevocationReceiver, Unsubscribe) {
        self.subscribers.subscribe(self.config.subscriber_buffer)
    }

    /// Subscription that never drops an event
    pub fn subscribe_reliable(&self) -> (RevocationReceiver, Unsubscribe) {
        self.subscribers.subscribe_reliable()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.count()
    }
}

#[async_trait]
impl KeyValidator for KeyStore {
    async fn validate(&self, secret: &str) -> bool {
        KeyStore::validate(self, secret).await
    }

    fn resolver(&self) -> Option<&dyn KeyResolver> {
        Some(self)
    }
}

#[async_trait]
impl KeyResolver for KeyStore {
    async fn resolve(&self, secret: &str) -> Option<KeyId> {
        KeyStore::resolve(self, secret).await
    }
}

impl RevocationSource for KeyStore {
    fn subscribe_revocations(&self) -> (RevocationReceiver, Unsubscribe) {
        self.subscribe_reliable()
    }
}
