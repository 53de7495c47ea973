//! In-memory key repository

use crate::auth::{KeyDigest, KeyId};
use crate::storage::{KeyRecord, KeyRepository, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

#[derive(Default)]
struct Tables {
    by_id: HashMap<KeyId, KeyRecord>,
    by_digest: HashMap<KeyDigest, KeyId>,
}

/// Key records held in process memory
///
/// Both indexes live behind a single lock so inserts and deletes are atomic across them.
#[derive(Default)]
pub struct MemoryKeyRepository {
    tables: RwLock<Tables>,
}

impl MemoryKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.tables.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().by_id.is_empty()
    }
}

#[async_trait]
impl KeyRepository for MemoryKeyRepository {
    async fn create(&self, name: &str, digest: KeyDigest) -> Result<KeyRecord, StorageError> {
        let record = KeyRecord {
            id: KeyId::new(),
            name: name.to_string(),
            digest,
            created_at: Utc::now(),
        };

        let mut tables = self.tables.write();

        if tables.by_digest.contains_key(&record.digest) {
            return Err(StorageError::Conflict("duplicate key digest".to_string()));
        }
        if tables.by_id.contains_key(&record.id) {
            return Err(StorageError::Conflict(format!("duplicate key id {}", record.id)));
        }

        tables.by_digest.insert(record.digest, record.id);
        tables.by_id.insert(record.id, record.clone());

        debug!(key_id = %record.id, "Stored key record");
        Ok(record)
    }

    async fn delete_by_id(&self, id: &KeyId) -> Result<KeyRecord, StorageError> {
        let mut tables = self.tables.write();

        let record = tables.by_id.remove(id).ok_or(StorageError::NotFound)?;
        tables.by_digest.remove(&record.digest);

        Ok(record)
    }

    async fn get_by_digest(&self, digest: &KeyDigest) -> Result<KeyRecord, StorageError> {
        let tables = self.tables.read();

        tables
            .by_digest
            .get(digest)
            .and_then(|id| tables.by_id.get(id))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn list(&self) -> Result<Vec<KeyRecord>, StorageError> {
        let mut records: Vec<KeyRecord> = self.tables.read().by_id.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
