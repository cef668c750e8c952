//! Timeout storage trait

use std::collections::HashMap;
use std::sync::RwLock;

use crate::{SagaId, Timeout, TimeoutId};

/// Storage for pending timeouts.
///
/// Records are written when a timeout is scheduled so they survive a
/// restart when the store is durable.
pub trait TimeoutStore: Send + Sync + 'static {
    /// Insert or replace a timeout
    fn insert(&self, timeout: &Timeout) -> Result<(), TimeoutError>;
    /// Remove a timeout, returning whether it existed
    fn remove(&self, id: TimeoutId) -> Result<bool, TimeoutError>;
    /// Remove every timeout owned by an instance
    fn remove_for_instance(&self, instance_id: SagaId) -> Result<Vec<TimeoutId>, TimeoutError>;
    /// All pending timeouts, in no particular order
    fn load_all(&self) -> Result<Vec<Timeout>, TimeoutError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("Storage error: {0}")]
    Storage(Box<str>),
    #[error("Codec error: {0}")]
    Codec(Box<str>),
    #[error("Timeout loop failed: {0}")]
    Task(Box<str>),
}

/// In-memory timeout store for testing
pub struct InMemoryTimeoutStore {
    data: RwLock<HashMap<TimeoutId, Timeout>>,
}

impl InMemoryTimeoutStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TimeoutStore for InMemoryTimeoutStore {
    fn insert(&self, timeout: &Timeout) -> Result<(), TimeoutError> {
        let mut data = self.data.write().map_err(|e| TimeoutError::Storage(e.to_string().into()))?;
        data.insert(timeout.id, timeout.clone());
        Ok(())
    }

    fn remove(&self, id: TimeoutId) -> Result<bool, TimeoutError> {
        let mut data = self.data.write().map_err(|e| TimeoutError::Storage(e.to_string().into()))?;
        Ok(data.remove(&id).is_some())
    }

    fn remove_for_instance(&self, instance_id: SagaId) -> Result<Vec<TimeoutId>, TimeoutError> {
        let mut data = self.data.write().map_err(|e| TimeoutError::Storage(e.to_string().into()))?;
        let ids: Vec<TimeoutId> = data
            .values()
            .filter(|t| t.instance_id == instance_id)
            .map(|t| t.id)
            .collect();
        for id in &ids {
            data.remove(id);
        }
        Ok(ids)
    }

    fn load_all(&self) -> Result<Vec<Timeout>, TimeoutError> {
        let data = self.data.read().map_err(|e| TimeoutError::Storage(e.to_string().into()))?;
        Ok(data.values().cloned().collect())
    }
}

impl Default for InMemoryTimeoutStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout(instance_id: SagaId, name: &str) -> Timeout {
        Timeout {
            id: TimeoutId::new(),
            instance_id,
            saga_type: "order".into(),
            name: name.into(),
            due_at_millis: 100,
            sequence: 0,
            attempt: 0,
            payload: Vec::new(),
        }
    }

    #[test]
    fn remove_for_instance_only_touches_its_own_records() {
        let store = InMemoryTimeoutStore::new();
        let owner = SagaId::new();
        let first = timeout(owner, "a");
        let second = timeout(owner, "b");
        let foreign = timeout(SagaId::new(), "c");
        for t in [&first, &second, &foreign] {
            store.insert(t).unwrap();
        }

        let mut removed = store.remove_for_instance(owner).unwrap();
        removed.sort();
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(removed, expected);
        assert_eq!(store.load_all().unwrap(), vec![foreign.clone()]);

        assert!(store.remove_for_instance(owner).unwrap().is_empty());
        assert!(store.remove(foreign.id).unwrap());
        assert!(!store.remove(foreign.id).unwrap());
        assert!(store.is_empty());
    }
}
