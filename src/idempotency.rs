//! Idempotency keys for duplicate-tolerant saga handlers

use serde::{Deserialize, Serialize};

use crate::{SagaId, Timeout};

/// Idempotency key for deduplicating side effects.
///
/// Timeouts are delivered at least once. A saga that must not repeat a side
/// effect can remember the keys it has already acted on in its own state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(pub Box<str>);

impl IdempotencyKey {
    /// Key for a timeout; identical for every redelivery of the same timeout
    pub fn for_timeout(timeout: &Timeout) -> Self {
        Self(format!("saga:{}:timeout:{}", timeout.instance_id, timeout.id).into_boxed_str())
    }

    /// Key for a message handled by an instance, given a message identifier
    /// chosen by the transport
    pub fn for_message(instance_id: SagaId, message_id: &str) -> Self {
        Self(format!("saga:{}:message:{}", instance_id, message_id).into_boxed_str())
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TimeoutId;

    #[test]
    fn timeout_key_survives_redelivery() {
        let mut timeout = Timeout {
            id: TimeoutId::new(),
            instance_id: SagaId::new(),
            saga_type: "order".into(),
            name: "reminder".into(),
            due_at_millis: 10,
            sequence: 0,
            attempt: 0,
            payload: Vec::new(),
        };
        let first = timeout.idempotency_key();

        timeout.attempt = 1;
        timeout.due_at_millis = 2_000;
        timeout.sequence = 9;

        assert_eq!(first, timeout.idempotency_key());
        assert!(first.as_str().starts_with("saga:"));
        assert_ne!(first, IdempotencyKey::for_message(timeout.instance_id, "m-1"));
    }
}
