//! Storage backends for keyhub
//!
//! - Memory: in-process key records, identity and digest indexes behind one lock
//!
//! The key service only talks to [`KeyRepository`]; a database-backed repository
//! plugs in the same way as the in-memory one.

mod memory;

pub use memory::MemoryKeyRepository;

use crate::auth::{KeyDigest, KeyId};
pub use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("record not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// A persisted key record. The plaintext secret is never part of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub id: KeyId,
    pub name: String,
    pub digest: KeyDigest,
    pub created_at: DateTime<Utc>,
}

/// Trait for key record storage
///
/// Implementations must keep the identity and digest lookups consistent: a record
/// is visible through both or through neither.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Store a new record under a freshly assigned identity
    async fn create(&self, name: &str, digest: KeyDigest) -> Result<KeyRecord, StorageError>;

    /// Remove a record by identity, returning what was removed
    async fn delete_by_id(&self, id: &KeyId) -> Result<KeyRecord, StorageError>;

    /// Look up a record by secret digest
    async fn get_by_digest(&self, digest: &KeyDigest) -> Result<KeyRecord, StorageError>;

    /// All live records, newest first
    async fn list(&self) -> Result<Vec<KeyRecord>, StorageError>;
}
