//! Mapping an incoming message to the saga instances that should handle it

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::registry::{HandlerKind, SagaType};
use crate::{
    CorrelationKey, DispatchError, DispatchStats, HandlerDescriptor, Message, NoOpObserver,
    SagaInstance, SagaObserver, StateStorage, Timeout,
};

/// An instance selected for one handler, and whether it was just created
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedInstance {
    pub instance: SagaInstance,
    pub is_new: bool,
}

/// Finds or creates the instances a handler runs against.
///
/// Resolution only reads from storage. A new instance exists in memory until
/// its dispatch unit decides to persist it.
pub struct InstanceResolver {
    storage: Arc<dyn StateStorage>,
    observer: Arc<dyn SagaObserver>,
    stats: Arc<DispatchStats>,
}

impl InstanceResolver {
    pub fn new(storage: Arc<dyn StateStorage>) -> Self {
        Self {
            storage,
            observer: Arc::new(NoOpObserver),
            stats: Arc::new(DispatchStats::new()),
        }
    }

    pub(crate) fn with_reporting(
        storage: Arc<dyn StateStorage>,
        observer: Arc<dyn SagaObserver>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            storage,
            observer,
            stats,
        }
    }

    /// Instances `handler` of `saga` should run against for `message`.
    ///
    /// - start handlers continue the open instances answering to their key,
    ///   or get a single new instance when there are none or no key;
    /// - continuation handlers get every open instance answering to their
    ///   key, possibly none;
    /// - timeout handlers get the instance the timeout belongs to, if it is
    ///   still open.
    pub fn resolve(
        &self,
        saga: &SagaType,
        handler: &HandlerDescriptor,
        message: &Message,
    ) -> Result<Vec<ResolvedInstance>, DispatchError> {
        match handler.kind() {
            HandlerKind::Start { key } => {
                let key = key.as_ref().and_then(|k| k.extract(message));
                if let Some(key) = &key {
                    let existing = self.load_matching(saga, key)?;
                    if !existing.is_empty() {
                        return Ok(existing);
                    }
                }

                let mut instance = saga.new_instance()?;
                if let Some(key) = key {
                    instance.keys.insert(key);
                }
                Ok(vec![ResolvedInstance {
                    instance,
                    is_new: true,
                }])
            }

            HandlerKind::Continue { key } => {
                let key = key
                    .extract(message)
                    .ok_or_else(|| DispatchError::KeyExtraction {
                        saga_type: saga.name().into(),
                        message_type: message.type_name(),
                    })?;

                let found = self.load_matching(saga, &key)?;
                if found.is_empty() {
                    self.stats
                        .unmatched_continuations
                        .fetch_add(1, Ordering::Relaxed);
                    self.observer
                        .on_no_instance(saga.name(), message.type_name(), &key);
                }
                Ok(found)
            }

            HandlerKind::Timeout => {
                let Some(timeout) = message.downcast_ref::<Timeout>() else {
                    return Err(DispatchError::MessageType {
                        expected: std::any::type_name::<Timeout>(),
                        actual: message.type_name(),
                    });
                };
                if timeout.saga_type.as_ref() != saga.name() {
                    return Ok(Vec::new());
                }

                match self.storage.load(saga.name(), timeout.instance_id)? {
                    Some(instance) if !instance.finished => Ok(vec![ResolvedInstance {
                        instance,
                        is_new: false,
                    }]),
                    _ => {
                        tracing::debug!(
                            saga_type = %saga.name(),
                            instance_id = %timeout.instance_id,
                            timeout_id = %timeout.id,
                            "timeout for a missing or finished instance, ignored"
                        );
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    fn load_matching(&self, saga: &SagaType, key: &CorrelationKey) -> Result<Vec<ResolvedInstance>, DispatchError> {
        let ids = self.storage.find_by_key(saga.name(), key)?;
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match self.storage.load(saga.name(), id)? {
                Some(instance) if !instance.finished => found.push(ResolvedInstance {
                    instance,
                    is_new: false,
                }),
                // Removed between lookup and load.
                _ => tracing::debug!(saga_type = %saga.name(), instance_id = %id, "matched instance no longer open"),
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HandlerRegistry, InMemoryStateStorage, SagaDefinition, SagaId, TimeoutId};
    use serde::{Deserialize, Serialize};

    #[derive(Default, Serialize, Deserialize)]
    struct Empty {}

    struct Begin(&'static str);
    struct Step(&'static str);
    struct Restart(&'static str);

    fn key(id: &str) -> Option<CorrelationKey> {
        (!id.is_empty()).then(|| CorrelationKey::from(id))
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::builder()
            .saga(
                SagaDefinition::<Empty>::new("order")
                    .start::<Begin, _>(|_, _, _| Ok(()))
                    .start_keyed::<Restart, _, _>(|m| key(m.0), |_, _, _| Ok(()))
                    .on::<Step, _, _>(|m| key(m.0), |_, _, _| Ok(()))
                    .on_timeout(|_, _, _| Ok(())),
            )
            .build()
            .unwrap()
    }

    fn resolve(
        resolver: &InstanceResolver,
        registry: &HandlerRegistry,
        message: Message,
    ) -> Result<Vec<ResolvedInstance>, DispatchError> {
        let route = &registry.handlers_for(&message)[0];
        resolver.resolve(&route.saga, &route.handler, &message)
    }

    fn stored(storage: &InMemoryStateStorage, key: &str) -> SagaInstance {
        let instance = SagaInstance::new("order", b"{}".to_vec()).with_key(key.into());
        storage.save(&instance).unwrap();
        instance
    }

    fn timeout_for(instance_id: SagaId, saga_type: &str) -> Timeout {
        Timeout {
            id: TimeoutId::new(),
            instance_id,
            saga_type: saga_type.into(),
            name: "t".into(),
            due_at_millis: 0,
            sequence: 0,
            attempt: 0,
            payload: Vec::new(),
        }
    }

    #[test]
    fn start_without_key_creates_new_instance_without_writing() {
        let storage = Arc::new(InMemoryStateStorage::new());
        let resolver = InstanceResolver::new(storage.clone());

        let resolved = resolve(&resolver, &registry(), Message::new(Begin("A1"))).unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].is_new);
        assert!(resolved[0].instance.keys.is_empty());
        assert_eq!(storage.write_count(), 0);
    }

    #[test]
    fn keyed_start_continues_existing_or_creates_with_key() {
        let storage = Arc::new(InMemoryStateStorage::new());
        let resolver = InstanceResolver::new(storage.clone());
        let registry = registry();
        let existing = stored(&storage, "A1");

        let resolved = resolve(&resolver, &registry, Message::new(Restart("A1"))).unwrap();
        assert_eq!(resolved, vec![ResolvedInstance { instance: existing, is_new: false }]);

        let resolved = resolve(&resolver, &registry, Message::new(Restart("B9"))).unwrap();
        assert!(resolved[0].is_new);
        assert!(resolved[0].instance.has_key(&"B9".into()));

        let resolved = resolve(&resolver, &registry, Message::new(Restart(""))).unwrap();
        assert!(resolved[0].is_new);
        assert!(resolved[0].instance.keys.is_empty());
    }

    #[test]
    fn continuation_returns_every_open_match() {
        let storage = Arc::new(InMemoryStateStorage::new());
        let resolver = InstanceResolver::new(storage.clone());
        let registry = registry();
        let first = stored(&storage, "A1");
        let second = stored(&storage, "A1");
        let mut finished = SagaInstance::new("order", b"{}".to_vec()).with_key("A1".into());
        finished.finished = true;
        storage.save(&finished).unwrap();

        let resolved = resolve(&resolver, &registry, Message::new(Step("A1"))).unwrap();
        let mut ids: Vec<SagaId> = resolved.iter().map(|r| r.instance.id).collect();
        ids.sort();
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(resolved.iter().all(|r| !r.is_new));
    }

    #[test]
    fn continuation_without_match_is_empty() {
        let storage = Arc::new(InMemoryStateStorage::new());
        let stats = Arc::new(DispatchStats::new());
        let resolver = InstanceResolver::with_reporting(storage.clone(), Arc::new(NoOpObserver), stats.clone());

        let resolved = resolve(&resolver, &registry(), Message::new(Step("B9"))).unwrap();
        assert!(resolved.is_empty());
        assert_eq!(stats.snapshot().unmatched_continuations, 1);
        assert_eq!(storage.write_count(), 0);
    }

    #[test]
    fn continuation_without_key_is_a_key_extraction_error() {
        let resolver = InstanceResolver::new(Arc::new(InMemoryStateStorage::new()));

        let err = resolve(&resolver, &registry(), Message::new(Step(""))).unwrap_err();
        assert!(matches!(err, DispatchError::KeyExtraction { saga_type, .. } if saga_type.as_ref() == "order"));
    }

    #[test]
    fn timeout_goes_straight_to_its_instance() {
        let storage = Arc::new(InMemoryStateStorage::new());
        let resolver = InstanceResolver::new(storage.clone());
        let registry = registry();
        let target = stored(&storage, "A1");
        stored(&storage, "A1");

        let resolved = resolve(&resolver, &registry, Message::new(timeout_for(target.id, "order"))).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].instance.id, target.id);

        let foreign = resolve(&resolver, &registry, Message::new(timeout_for(target.id, "shipping"))).unwrap();
        assert!(foreign.is_empty());

        let gone = resolve(&resolver, &registry, Message::new(timeout_for(SagaId::new(), "order"))).unwrap();
        assert!(gone.is_empty());
    }
}
