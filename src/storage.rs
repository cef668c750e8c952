//! Saga state storage trait

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::{CorrelationKey, SagaId, SagaInstance};

/// State storage collaborator.
///
/// Implementations must guarantee at most one concurrent writer per
/// instance id; the dispatcher relies on it to avoid lost updates.
pub trait StateStorage: Send + Sync + 'static {
    /// Load an instance of `saga_type`
    fn load(&self, saga_type: &str, instance_id: SagaId) -> Result<Option<SagaInstance>, StorageError>;

    /// Ids of all unfinished instances of `saga_type` that answer to `key`
    fn find_by_key(&self, saga_type: &str, key: &CorrelationKey) -> Result<Vec<SagaId>, StorageError>;

    /// Insert or replace an instance
    fn save(&self, instance: &SagaInstance) -> Result<(), StorageError>;

    /// Remove an instance; removing a missing instance is not an error
    fn delete(&self, instance_id: SagaId) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage error: {0}")]
    Storage(Box<str>),
    #[error("Not found: {0}")]
    NotFound(SagaId),
    #[error("Codec error: {0}")]
    Codec(Box<str>),
}

/// In-memory state storage for testing and single-process use
pub struct InMemoryStateStorage {
    data: RwLock<HashMap<SagaId, SagaInstance>>,
    writes: AtomicU64,
}

impl InMemoryStateStorage {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of `save` and `delete` calls so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of stored instances
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStorage for InMemoryStateStorage {
    fn load(&self, saga_type: &str, instance_id: SagaId) -> Result<Option<SagaInstance>, StorageError> {
        let data = self.data.read().map_err(|e| StorageError::Storage(e.to_string().into()))?;
        Ok(data
            .get(&instance_id)
            .filter(|i| i.saga_type.as_ref() == saga_type)
            .cloned())
    }

    fn find_by_key(&self, saga_type: &str, key: &CorrelationKey) -> Result<Vec<SagaId>, StorageError> {
        let data = self.data.read().map_err(|e| StorageError::Storage(e.to_string().into()))?;
        let mut matches: Vec<&SagaInstance> = data
            .values()
            .filter(|i| i.saga_type.as_ref() == saga_type && !i.finished && i.has_key(key))
            .collect();
        // Oldest first, so repeated lookups yield a stable order.
        matches.sort_by_key(|i| (i.created_at_millis, i.id));
        Ok(matches.into_iter().map(|i| i.id).collect())
    }

    fn save(&self, instance: &SagaInstance) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.write().map_err(|e| StorageError::Storage(e.to_string().into()))?;
        data.insert(instance.id, instance.clone());
        Ok(())
    }

    fn delete(&self, instance_id: SagaId) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.write().map_err(|e| StorageError::Storage(e.to_string().into()))?;
        data.remove(&instance_id);
        Ok(())
    }
}

impl Default for InMemoryStateStorage {
    fn default() -> Self {
        Self::new()
    }
}
