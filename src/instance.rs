//! Persisted saga instance record

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{now_millis, CorrelationKey, SagaId};

/// One running saga.
///
/// `state` is an opaque blob owned by the saga implementation; only the
/// typed adapter registered through [`SagaDefinition`](crate::SagaDefinition)
/// ever decodes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Instance identifier
    pub id: SagaId,
    /// Saga type this instance belongs to
    pub saga_type: Box<str>,
    /// Encoded saga state
    pub state: Vec<u8>,
    /// Correlation keys this instance answers to
    pub keys: BTreeSet<CorrelationKey>,
    /// Set once the saga has completed
    pub finished: bool,
    /// When the instance was created (millis since UNIX epoch)
    pub created_at_millis: u64,
    /// Last successful dispatch (millis since UNIX epoch)
    pub updated_at_millis: u64,
}

impl SagaInstance {
    /// Create a fresh, unfinished instance
    pub fn new(saga_type: impl Into<Box<str>>, state: Vec<u8>) -> Self {
        let now = now_millis();
        Self {
            id: SagaId::new(),
            saga_type: saga_type.into(),
            state,
            keys: BTreeSet::new(),
            finished: false,
            created_at_millis: now,
            updated_at_millis: now,
        }
    }

    /// Add a correlation key
    pub fn with_key(mut self, key: CorrelationKey) -> Self {
        self.keys.insert(key);
        self
    }

    /// Check if this instance answers to `key`
    pub fn has_key(&self, key: &CorrelationKey) -> bool {
        self.keys.contains(key)
    }
}
