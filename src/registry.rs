//! Immutable mapping from message types to saga handlers

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::{CorrelationKey, DispatchError, ExecutionContext, Message, SagaDefinition, SagaInstance};

pub(crate) type InvokeFn =
    dyn Fn(&mut SagaInstance, &Message, &mut ExecutionContext) -> Result<(), DispatchError> + Send + Sync;

type StateFactoryFn = dyn Fn() -> Result<Vec<u8>, serde_json::Error> + Send + Sync;

/// Extracts the correlation key from a message.
///
/// `None` means no key could be computed for this message.
#[derive(Clone)]
pub struct KeyExtractor(Arc<dyn Fn(&Message) -> Option<CorrelationKey> + Send + Sync>);

impl KeyExtractor {
    /// Wrap a typed extractor for messages of type `M`
    pub fn new<M, K>(extract: K) -> Self
    where
        M: Any + Send + Sync,
        K: Fn(&M) -> Option<CorrelationKey> + Send + Sync + 'static,
    {
        Self(Arc::new(move |message: &Message| {
            message.downcast_ref::<M>().and_then(|m| extract(m))
        }))
    }

    pub fn extract(&self, message: &Message) -> Option<CorrelationKey> {
        (self.0)(message)
    }
}

impl std::fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyExtractor")
    }
}

/// How a handler finds the instances it runs against
#[derive(Clone, Debug)]
pub enum HandlerKind {
    /// May create a new instance. A key, when computable, is attached to the
    /// new instance and is also used to continue an instance that already
    /// answers to it.
    Start { key: Option<KeyExtractor> },
    /// Runs only against existing instances matching the key
    Continue { key: KeyExtractor },
    /// Runs against the instance named by a fired [`Timeout`](crate::Timeout)
    Timeout,
}

/// One registered handler of a saga
#[derive(Clone)]
pub struct HandlerDescriptor {
    message_type: TypeId,
    message_type_name: &'static str,
    kind: HandlerKind,
    invoke: Arc<InvokeFn>,
}

impl HandlerDescriptor {
    pub(crate) fn new<M: Any>(kind: HandlerKind, invoke: Arc<InvokeFn>) -> Self {
        Self {
            message_type: TypeId::of::<M>(),
            message_type_name: std::any::type_name::<M>(),
            kind,
            invoke,
        }
    }

    pub fn message_type(&self) -> TypeId {
        self.message_type
    }

    pub fn message_type_name(&self) -> &'static str {
        self.message_type_name
    }

    pub fn kind(&self) -> &HandlerKind {
        &self.kind
    }

    /// Check if this handler may create new instances
    pub fn is_start_handler(&self) -> bool {
        matches!(self.kind, HandlerKind::Start { .. })
    }

    /// Key extractor, if this handler has one
    pub fn key_extractor(&self) -> Option<&KeyExtractor> {
        match &self.kind {
            HandlerKind::Start { key } => key.as_ref(),
            HandlerKind::Continue { key } => Some(key),
            HandlerKind::Timeout => None,
        }
    }

    /// Run the handler against `instance`.
    ///
    /// `instance.state` is only replaced when the handler succeeds.
    pub fn invoke(
        &self,
        instance: &mut SagaInstance,
        message: &Message,
        context: &mut ExecutionContext,
    ) -> Result<(), DispatchError> {
        (self.invoke)(instance, message, context)
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("message_type", &self.message_type_name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A registered saga implementation
pub struct SagaType {
    name: Box<str>,
    handlers: Vec<HandlerDescriptor>,
    new_state: Arc<StateFactoryFn>,
}

impl SagaType {
    pub(crate) fn new(name: Box<str>, handlers: Vec<HandlerDescriptor>, new_state: Arc<StateFactoryFn>) -> Self {
        Self {
            name,
            handlers,
            new_state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handlers(&self) -> &[HandlerDescriptor] {
        &self.handlers
    }

    /// Build a fresh instance with the saga's initial state
    pub fn new_instance(&self) -> Result<SagaInstance, DispatchError> {
        let state = (self.new_state)()?;
        Ok(SagaInstance::new(self.name.clone(), state))
    }
}

impl std::fmt::Debug for SagaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaType")
            .field("name", &self.name)
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// A handler together with the saga it belongs to
#[derive(Clone, Debug)]
pub struct HandlerRoute {
    pub saga: Arc<SagaType>,
    pub handler: HandlerDescriptor,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("saga type {0} registered twice")]
    DuplicateSagaType(Box<str>),
    #[error("saga type {0} has no handlers")]
    NoHandlers(Box<str>),
}

/// All sagas of the process and the handlers they declare.
///
/// Built once at startup and never changed afterwards.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    sagas: Vec<Arc<SagaType>>,
    routes: HashMap<TypeId, Vec<HandlerRoute>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Handlers registered for exactly this message type, in registration order
    pub fn handlers_for(&self, message: &Message) -> &[HandlerRoute] {
        self.routes
            .get(&message.message_type())
            .map(|r| r.as_slice())
            .unwrap_or(&[])
    }

    pub fn saga_types(&self) -> &[Arc<SagaType>] {
        &self.sagas
    }

    pub fn saga_type(&self, name: &str) -> Option<&Arc<SagaType>> {
        self.sagas.iter().find(|s| s.name() == name)
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    sagas: Vec<SagaType>,
}

impl HandlerRegistryBuilder {
    /// Register a saga
    pub fn saga<S>(mut self, definition: SagaDefinition<S>) -> Self
    where
        S: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
    {
        self.sagas.push(definition.into_saga_type());
        self
    }

    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        let mut names = HashSet::new();
        let mut registry = HandlerRegistry::default();

        for saga in self.sagas {
            if !names.insert(saga.name.clone()) {
                return Err(RegistryError::DuplicateSagaType(saga.name));
            }
            if saga.handlers.is_empty() {
                return Err(RegistryError::NoHandlers(saga.name));
            }

            let saga = Arc::new(saga);
            for handler in saga.handlers() {
                registry
                    .routes
                    .entry(handler.message_type())
                    .or_default()
                    .push(HandlerRoute {
                        saga: Arc::clone(&saga),
                        handler: handler.clone(),
                    });
            }
            tracing::debug!(saga_type = %saga.name(), handlers = saga.handlers().len(), "saga registered");
            registry.sagas.push(saga);
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Timeout;
    use serde::{Deserialize, Serialize};

    #[derive(Default, Serialize, Deserialize)]
    struct Count(u32);

    struct Begin(&'static str);
    struct Step(&'static str);

    fn order() -> SagaDefinition<Count> {
        SagaDefinition::new("order")
            .start::<Begin, _>(|_, _, _| Ok(()))
            .on::<Step, _, _>(|m| Some(m.0.into()), |_, _, _| Ok(()))
            .on_timeout(|_, _, _| Ok(()))
    }

    #[test]
    fn routes_messages_by_exact_type() {
        let audit = SagaDefinition::<Count>::new("audit").on::<Step, _, _>(|m| Some(m.0.into()), |_, _, _| Ok(()));
        let registry = HandlerRegistry::builder().saga(order()).saga(audit).build().unwrap();

        let begin = registry.handlers_for(&Message::new(Begin("A1")));
        assert_eq!(begin.len(), 1);
        assert!(begin[0].handler.is_start_handler());
        assert!(begin[0].handler.key_extractor().is_none());

        let step = Message::new(Step("A1"));
        let routes = registry.handlers_for(&step);
        let sagas: Vec<&str> = routes.iter().map(|r| r.saga.name()).collect();
        assert_eq!(sagas, vec!["order", "audit"]);
        assert_eq!(
            routes[0].handler.key_extractor().unwrap().extract(&step),
            Some(CorrelationKey::from("A1"))
        );

        assert!(registry.handlers_for(&Message::new("unrelated")).is_empty());
        assert_eq!(registry.handlers_for(&Message::new(Timeout {
            id: crate::TimeoutId::new(),
            instance_id: crate::SagaId::new(),
            saga_type: "order".into(),
            name: "t".into(),
            due_at_millis: 0,
            sequence: 0,
            attempt: 0,
            payload: Vec::new(),
        })).len(), 1);
    }

    #[test]
    fn rejects_duplicate_and_empty_sagas() {
        let err = HandlerRegistry::builder().saga(order()).saga(order()).build().unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateSagaType(name) if name.as_ref() == "order"));

        let err = HandlerRegistry::builder()
            .saga(SagaDefinition::<Count>::new("empty"))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoHandlers(_)));
    }

    #[test]
    fn new_instance_uses_saga_factory() {
        let registry = HandlerRegistry::builder()
            .saga(SagaDefinition::with_factory("order", || Count(41)).start::<Begin, _>(|_, _, _| Ok(())))
            .build()
            .unwrap();

        let instance = registry.saga_type("order").unwrap().new_instance().unwrap();
        assert_eq!(instance.saga_type.as_ref(), "order");
        assert_eq!(instance.state, b"41".to_vec());
        assert!(!instance.finished);
    }
}
