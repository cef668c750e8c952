//! Typed saga registration

use std::any::{type_name, Any};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::registry::{HandlerKind, InvokeFn, KeyExtractor, SagaType};
use crate::{
    BoxError, CorrelationKey, DispatchError, ExecutionContext, HandlerDescriptor, Message,
    SagaInstance, Timeout,
};

/// Result returned by saga handlers
pub type HandlerResult = Result<(), BoxError>;

/// Declares a saga: its state type, how to create that state, and which
/// messages it handles.
///
/// The state is decoded before each handler call and encoded again only if
/// the handler returns `Ok`, so a failing handler never leaks partial
/// changes.
///
/// # Example
///
/// ```rust
/// use saga_orchestration::{CorrelationKey, SagaDefinition};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Default, Serialize, Deserialize)]
/// struct OrderState {
///     steps: u32,
/// }
///
/// struct Begin {
///     order_id: String,
/// }
///
/// struct Step {
///     order_id: String,
/// }
///
/// let order = SagaDefinition::<OrderState>::new("order")
///     .start_keyed::<Begin, _, _>(
///         |m| Some(CorrelationKey::from(m.order_id.as_str())),
///         |_state, _msg, _ctx| Ok(()),
///     )
///     .on::<Step, _, _>(
///         |m| Some(CorrelationKey::from(m.order_id.as_str())),
///         |state, _msg, ctx| {
///             state.steps += 1;
///             if state.steps == 3 {
///                 ctx.finish_saga();
///             }
///             Ok(())
///         },
///     );
/// assert_eq!(order.name(), "order");
/// ```
pub struct SagaDefinition<S> {
    name: Box<str>,
    factory: Arc<dyn Fn() -> S + Send + Sync>,
    handlers: Vec<HandlerDescriptor>,
}

impl<S> SagaDefinition<S>
where
    S: Serialize + DeserializeOwned + Send + 'static,
{
    /// Declare a saga whose initial state is `S::default()`
    pub fn new(name: impl Into<Box<str>>) -> Self
    where
        S: Default,
    {
        Self::with_factory(name, S::default)
    }

    /// Declare a saga with a custom initial state factory
    pub fn with_factory<F>(name: impl Into<Box<str>>, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            handlers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle `M` by always starting a new instance
    pub fn start<M, H>(self, handler: H) -> Self
    where
        M: Any + Send + Sync,
        H: Fn(&mut S, &M, &mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.push(HandlerKind::Start { key: None }, handler)
    }

    /// Handle `M` by continuing the instances answering to the extracted
    /// key, or starting a new instance carrying that key if there are none
    pub fn start_keyed<M, K, H>(self, key: K, handler: H) -> Self
    where
        M: Any + Send + Sync,
        K: Fn(&M) -> Option<CorrelationKey> + Send + Sync + 'static,
        H: Fn(&mut S, &M, &mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
    {
        let key = Some(KeyExtractor::new(key));
        self.push(HandlerKind::Start { key }, handler)
    }

    /// Handle `M` on every open instance answering to the extracted key
    pub fn on<M, K, H>(self, key: K, handler: H) -> Self
    where
        M: Any + Send + Sync,
        K: Fn(&M) -> Option<CorrelationKey> + Send + Sync + 'static,
        H: Fn(&mut S, &M, &mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
    {
        let key = KeyExtractor::new(key);
        self.push(HandlerKind::Continue { key }, handler)
    }

    /// Handle timeouts requested by this saga
    pub fn on_timeout<H>(self, handler: H) -> Self
    where
        H: Fn(&mut S, &Timeout, &mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.push(HandlerKind::Timeout, handler)
    }

    fn push<M, H>(mut self, kind: HandlerKind, handler: H) -> Self
    where
        M: Any + Send + Sync,
        H: Fn(&mut S, &M, &mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
    {
        let saga_type = self.name.clone();
        let invoke = move |instance: &mut SagaInstance,
                           message: &Message,
                           context: &mut ExecutionContext|
              -> Result<(), DispatchError> {
            let typed = message
                .downcast_ref::<M>()
                .ok_or_else(|| DispatchError::MessageType {
                    expected: type_name::<M>(),
                    actual: message.type_name(),
                })?;

            let mut state: S = serde_json::from_slice(&instance.state)?;
            handler(&mut state, typed, context).map_err(|source| DispatchError::Handler {
                saga_type: saga_type.clone(),
                message_type: type_name::<M>(),
                source,
            })?;
            instance.state = serde_json::to_vec(&state)?;
            Ok(())
        };

        let invoke: Arc<InvokeFn> = Arc::new(invoke);
        self.handlers.push(HandlerDescriptor::new::<M>(kind, invoke));
        self
    }

    pub(crate) fn into_saga_type(self) -> SagaType {
        let factory = self.factory;
        SagaType::new(
            self.name,
            self.handlers,
            Arc::new(move || serde_json::to_vec(&factory())),
        )
    }
}
