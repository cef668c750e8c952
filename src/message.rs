//! Type-erased messages and correlation keys

use std::any::{Any, TypeId};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An incoming message of any type.
///
/// Cloning is cheap: the payload is shared.
#[derive(Clone)]
pub struct Message {
    payload: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl Message {
    /// Wrap a message value
    pub fn new<M: Any + Send + Sync>(message: M) -> Self {
        Self {
            payload: Arc::new(message),
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
        }
    }

    /// Borrow the payload as `M` if it has that type
    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        (*self.payload).downcast_ref::<M>()
    }

    /// Check if the payload is of type `M`
    pub fn is<M: Any>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }

    /// Concrete type of the payload
    pub fn message_type(&self) -> TypeId {
        self.type_id
    }

    /// Name of the payload type, for logs
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message({})", self.type_name)
    }
}

/// Value used to find the saga instances a message belongs to.
///
/// Two keys are equal iff their values are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey(Box<str>);

impl CorrelationKey {
    const PART_SEPARATOR: char = '\u{1f}';

    /// Create a key from a single value
    pub fn new(value: impl Into<Box<str>>) -> Self {
        Self(value.into())
    }

    /// Create a key from several values, e.g. `(tenant, order_id)`.
    ///
    /// Each part is prefixed with its byte length, so parts containing the
    /// separator cannot make two different part lists equal.
    pub fn composite<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: std::fmt::Display,
    {
        let mut key = String::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                key.push(Self::PART_SEPARATOR);
            }
            let part = part.to_string();
            key.push_str(&part.len().to_string());
            key.push(':');
            key.push_str(&part);
        }
        Self(key.into_boxed_str())
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationKey {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for CorrelationKey {
    fn from(value: String) -> Self {
        Self(value.into_boxed_str())
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
