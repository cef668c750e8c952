//! Saga identity and the per-dispatch execution context

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CorrelationKey, Message};

/// Unique identifier for a saga instance
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SagaId(pub Uuid);

impl SagaId {
    /// Create a new random saga ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the raw ID value
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SagaId({})", self.0)
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current time in milliseconds since UNIX epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(duration_millis)
        .unwrap_or(0)
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Message headers. Setting a name twice keeps the last value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(HashMap<Box<str>, Box<str>>);

impl Headers {
    /// Create an empty header set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, returning the previous value if any
    pub fn insert(&mut self, name: impl Into<Box<str>>, value: impl Into<Box<str>>) -> Option<Box<str>> {
        self.0.insert(name.into(), value.into())
    }

    /// Get a header value
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.as_ref())
    }

    /// Iterate over all headers in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_ref(), v.as_ref()))
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<Box<str>>,
    V: Into<Box<str>>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// A timeout requested by saga logic, scheduled once the unit succeeds
#[derive(Clone, Debug)]
pub(crate) struct TimeoutRequest {
    pub name: Box<str>,
    pub delay: Duration,
    pub payload: Vec<u8>,
}

/// Effects collected from one dispatch unit
#[derive(Debug, Default)]
pub(crate) struct UnitEffects {
    pub finished: bool,
    pub timeouts: Vec<TimeoutRequest>,
    pub keys: Vec<CorrelationKey>,
}

#[derive(Debug)]
struct UnitScope {
    saga_type: Box<str>,
    instance_id: SagaId,
    is_new: bool,
    effects: UnitEffects,
}

/// Context for dispatching a single message.
///
/// Built fresh for every incoming message and dropped when the dispatch
/// returns. While a handler runs, the context is scoped to the instance being
/// handled; timeout requests, key additions and the finish flag recorded
/// during that unit are applied only if the unit succeeds.
#[derive(Debug)]
pub struct ExecutionContext {
    message: Message,
    headers: Headers,
    received_at_millis: u64,
    unit: Option<UnitScope>,
}

impl ExecutionContext {
    /// Create a context for an incoming message
    pub fn new(message: Message, headers: Headers) -> Self {
        Self {
            message,
            headers,
            received_at_millis: now_millis(),
            unit: None,
        }
    }

    /// The message being dispatched
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// When the dispatch started (millis since UNIX epoch)
    pub fn received_at_millis(&self) -> u64 {
        self.received_at_millis
    }

    /// All headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Set a header value, replacing any previous value
    pub fn set_header(&mut self, name: impl Into<Box<str>>, value: impl Into<Box<str>>) {
        self.headers.insert(name, value);
    }

    /// Saga type of the unit currently being dispatched
    pub fn saga_type(&self) -> Option<&str> {
        self.unit.as_ref().map(|u| u.saga_type.as_ref())
    }

    /// Instance currently being dispatched
    pub fn instance_id(&self) -> Option<SagaId> {
        self.unit.as_ref().map(|u| u.instance_id)
    }

    /// Check if the current instance was created by this dispatch
    pub fn is_new_instance(&self) -> bool {
        self.unit.as_ref().map(|u| u.is_new).unwrap_or(false)
    }

    /// Request a timeout for the current instance.
    ///
    /// The timeout is scheduled after the handler and module teardown
    /// succeed, and discarded if the unit fails or the saga finishes.
    pub fn request_timeout(&mut self, name: impl Into<Box<str>>, delay: Duration, payload: impl Into<Vec<u8>>) {
        let request = TimeoutRequest {
            name: name.into(),
            delay,
            payload: payload.into(),
        };
        match self.unit.as_mut() {
            Some(unit) => unit.effects.timeouts.push(request),
            None => tracing::warn!(timeout = %request.name, "timeout requested outside of a saga dispatch, ignored"),
        }
    }

    /// Mark the current instance as finished.
    ///
    /// Its state is deleted and its pending timeouts cancelled once the
    /// unit completes.
    pub fn finish_saga(&mut self) {
        match self.unit.as_mut() {
            Some(unit) => unit.effects.finished = true,
            None => tracing::warn!("finish requested outside of a saga dispatch, ignored"),
        }
    }

    /// Check if the current instance has been marked finished
    pub fn is_saga_finished(&self) -> bool {
        self.unit.as_ref().map(|u| u.effects.finished).unwrap_or(false)
    }

    /// Make the current instance answer to an additional correlation key
    pub fn add_instance_key(&mut self, key: impl Into<CorrelationKey>) {
        let key = key.into();
        match self.unit.as_mut() {
            Some(unit) => unit.effects.keys.push(key),
            None => tracing::warn!(key = %key, "instance key added outside of a saga dispatch, ignored"),
        }
    }

    pub(crate) fn enter_unit(&mut self, saga_type: &str, instance_id: SagaId, is_new: bool) {
        self.unit = Some(UnitScope {
            saga_type: saga_type.into(),
            instance_id,
            is_new,
            effects: UnitEffects::default(),
        });
    }

    /// Put back the headers a failed unit started with
    pub(crate) fn reset_headers(&mut self, headers: Headers) {
        self.headers = headers;
    }

    pub(crate) fn leave_unit(&mut self) -> UnitEffects {
        self.unit.take().map(|u| u.effects).unwrap_or_default()
    }
}
