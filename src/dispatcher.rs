//! Routing one incoming message through every matching (instance, handler) unit

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::registry::{HandlerDescriptor, SagaType};
use crate::{
    now_millis, BoxError, DispatchError, DispatchStats, ExecutionContext, HandlerRegistry, Headers,
    InstanceResolver, Message, ModulePipeline, ResolvedInstance, SagaId, SagaInstance, SagaModule,
    SagaObserver, StateStorage, Timeout, TimeoutCoordinator, TimeoutDelivery, TracingObserver,
};

/// How a dispatch unit ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitStatus {
    /// Handler succeeded and the updated state was saved
    Persisted,
    /// Handler succeeded and finished the saga; state deleted, timeouts cancelled
    Finished,
    /// Nothing was persisted
    Failed,
}

/// Result of one (instance, handler) unit.
///
/// `errors` may be non-empty for a successful unit: module teardown and
/// timeout scheduling failures are reported without rolling the unit back.
#[derive(Debug)]
pub struct UnitOutcome {
    pub saga_type: Box<str>,
    /// `None` when the unit failed before an instance was resolved
    pub instance_id: Option<SagaId>,
    pub is_new: bool,
    pub status: UnitStatus,
    pub errors: Vec<DispatchError>,
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        self.status != UnitStatus::Failed
    }
}

/// Everything that happened while dispatching one message
#[derive(Debug)]
pub struct DispatchOutcome {
    message_type: &'static str,
    handlers: usize,
    units: Vec<UnitOutcome>,
}

impl DispatchOutcome {
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    /// Units in the order they ran
    pub fn units(&self) -> &[UnitOutcome] {
        &self.units
    }

    /// Check if no handler is registered for the message type
    pub fn is_unhandled(&self) -> bool {
        self.handlers == 0
    }

    /// Check if every unit succeeded. Vacuously true for zero units.
    pub fn is_success(&self) -> bool {
        self.units.iter().all(UnitOutcome::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.units.iter().filter(|u| !u.is_success())
    }

    /// Every error of every unit, fatal or not
    pub fn errors(&self) -> impl Iterator<Item = &DispatchError> {
        self.units.iter().flat_map(|u| u.errors.iter())
    }
}

/// Returned by [`Dispatcher`] as a [`TimeoutDelivery`] when a fired timeout
/// could not be handled
#[derive(Debug, thiserror::Error)]
#[error("timeout delivery failed in {failed} of {total} dispatch units")]
pub struct DeliveryFailed {
    pub failed: usize,
    pub total: usize,
}

/// Dispatches messages to saga instances.
///
/// Each (instance, handler) pair is an independent, all-or-nothing unit: its
/// state change, key additions, finish and timeout requests are applied only
/// if the handler succeeds, and a failing unit never affects the others.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    resolver: InstanceResolver,
    storage: Arc<dyn StateStorage>,
    pipeline: ModulePipeline,
    timeouts: Arc<TimeoutCoordinator>,
    observer: Arc<dyn SagaObserver>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn builder(
        registry: Arc<HandlerRegistry>,
        storage: Arc<dyn StateStorage>,
        timeouts: Arc<TimeoutCoordinator>,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            registry,
            storage,
            timeouts,
            modules: Vec::new(),
            observer: None,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn timeouts(&self) -> &Arc<TimeoutCoordinator> {
        &self.timeouts
    }

    /// Statistics shared with the timeout coordinator
    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Dispatch `message` to every handler registered for its type.
    ///
    /// Never fails as a whole; inspect the returned outcome.
    pub fn dispatch(&self, message: Message, headers: Headers) -> DispatchOutcome {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        let message_type = message.type_name();
        let routes = self.registry.handlers_for(&message);
        if routes.is_empty() {
            self.stats.messages_unhandled.fetch_add(1, Ordering::Relaxed);
            self.observer.on_unhandled(message_type);
        }

        let mut context = ExecutionContext::new(message, headers);
        let mut units = Vec::new();

        for route in routes {
            let resolved = match self
                .resolver
                .resolve(&route.saga, &route.handler, context.message())
            {
                Ok(resolved) => resolved,
                Err(error) => {
                    let errors = vec![error];
                    self.stats.units_failed.fetch_add(1, Ordering::Relaxed);
                    self.observer.on_unit_failed(route.saga.name(), None, &errors);
                    units.push(UnitOutcome {
                        saga_type: route.saga.name().into(),
                        instance_id: None,
                        is_new: false,
                        status: UnitStatus::Failed,
                        errors,
                    });
                    continue;
                }
            };

            for ResolvedInstance { instance, is_new } in resolved {
                units.push(self.run_unit(&route.saga, &route.handler, instance, is_new, &mut context));
            }
        }

        DispatchOutcome {
            message_type,
            handlers: routes.len(),
            units,
        }
    }

    /// Run one unit. Headers written by a unit that fails are discarded.
    fn run_unit(
        &self,
        saga: &SagaType,
        handler: &HandlerDescriptor,
        instance: SagaInstance,
        is_new: bool,
        context: &mut ExecutionContext,
    ) -> UnitOutcome {
        let headers = context.headers().clone();
        let outcome = self.execute_unit(saga, handler, instance, is_new, context);
        if !outcome.is_success() {
            context.reset_headers(headers);
        }
        outcome
    }

    fn execute_unit(
        &self,
        saga: &SagaType,
        handler: &HandlerDescriptor,
        mut instance: SagaInstance,
        is_new: bool,
        context: &mut ExecutionContext,
    ) -> UnitOutcome {
        let started_at = Instant::now();
        self.stats.units_started.fetch_add(1, Ordering::Relaxed);
        context.enter_unit(saga.name(), instance.id, is_new);
        let message = context.message().clone();

        let invoker = match self.pipeline.start(context) {
            Ok(invoker) => invoker,
            Err(error) => {
                context.leave_unit();
                return self.failed(saga, &instance, is_new, vec![error.into()]);
            }
        };

        if let Err(error) = handler.invoke(&mut instance, &message, context) {
            let teardown = invoker.error(context, &message, &error);
            context.leave_unit();
            let mut errors = vec![error];
            errors.extend(teardown.into_iter().map(DispatchError::from));
            return self.failed(saga, &instance, is_new, errors);
        }

        let mut warnings: Vec<DispatchError> = invoker
            .finish(context)
            .into_iter()
            .map(DispatchError::from)
            .collect();
        let effects = context.leave_unit();

        instance.keys.extend(effects.keys);
        instance.updated_at_millis = now_millis();

        let status = if effects.finished {
            instance.finished = true;
            // A new instance has nothing persisted and no timeouts yet.
            if !is_new {
                if let Err(e) = self.storage.delete(instance.id) {
                    warnings.push(e.into());
                    return self.failed(saga, &instance, is_new, warnings);
                }
                if let Err(e) = self.timeouts.cancel_all(instance.id) {
                    warnings.push(e.into());
                }
            }
            if !effects.timeouts.is_empty() {
                tracing::debug!(instance_id = %instance.id, count = effects.timeouts.len(), "saga finished, discarding requested timeouts");
            }
            UnitStatus::Finished
        } else {
            if let Err(e) = self.storage.save(&instance) {
                warnings.push(e.into());
                return self.failed(saga, &instance, is_new, warnings);
            }
            for request in effects.timeouts {
                if let Err(e) = self.timeouts.schedule(
                    instance.id,
                    saga.name(),
                    &request.name,
                    request.delay,
                    request.payload,
                ) {
                    warnings.push(e.into());
                }
            }
            UnitStatus::Persisted
        };

        self.stats.units_succeeded.fetch_add(1, Ordering::Relaxed);
        if is_new {
            self.stats.instances_created.fetch_add(1, Ordering::Relaxed);
            self.observer.on_instance_created(saga.name(), instance.id);
        }
        if status == UnitStatus::Finished {
            self.stats.instances_finished.fetch_add(1, Ordering::Relaxed);
            self.observer.on_instance_finished(saga.name(), instance.id);
        }
        if !warnings.is_empty() {
            self.observer.on_unit_warnings(saga.name(), instance.id, &warnings);
        }
        self.observer
            .on_unit_completed(saga.name(), instance.id, started_at.elapsed());

        UnitOutcome {
            saga_type: saga.name().into(),
            instance_id: Some(instance.id),
            is_new,
            status,
            errors: warnings,
        }
    }

    fn failed(
        &self,
        saga: &SagaType,
        instance: &SagaInstance,
        is_new: bool,
        errors: Vec<DispatchError>,
    ) -> UnitOutcome {
        self.stats.units_failed.fetch_add(1, Ordering::Relaxed);
        self.observer
            .on_unit_failed(saga.name(), Some(instance.id), &errors);
        UnitOutcome {
            saga_type: saga.name().into(),
            instance_id: Some(instance.id),
            is_new,
            status: UnitStatus::Failed,
            errors,
        }
    }
}

impl TimeoutDelivery for Dispatcher {
    fn deliver(&self, timeout: Timeout) -> Result<(), BoxError> {
        let outcome = self.dispatch(Message::new(timeout), Headers::new());
        if outcome.is_success() {
            return Ok(());
        }
        Err(Box::new(DeliveryFailed {
            failed: outcome.failures().count(),
            total: outcome.units().len(),
        }))
    }
}

/// Builder for [`Dispatcher`]
pub struct DispatcherBuilder {
    registry: Arc<HandlerRegistry>,
    storage: Arc<dyn StateStorage>,
    timeouts: Arc<TimeoutCoordinator>,
    modules: Vec<Arc<dyn SagaModule>>,
    observer: Option<Arc<dyn SagaObserver>>,
}

impl DispatcherBuilder {
    /// Append a module; modules start in the order they are added
    pub fn module(mut self, module: impl SagaModule) -> Self {
        self.modules.push(Arc::new(module));
        self
    }

    /// Append an already shared module
    pub fn shared_module(mut self, module: Arc<dyn SagaModule>) -> Self {
        self.modules.push(module);
        self
    }

    /// Defaults to [`TracingObserver`]
    pub fn observer(mut self, observer: Arc<dyn SagaObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Dispatcher {
        let observer = self
            .observer
            .unwrap_or_else(|| Arc::new(TracingObserver) as Arc<dyn SagaObserver>);
        let stats = Arc::clone(self.timeouts.stats());
        Dispatcher {
            resolver: InstanceResolver::with_reporting(
                Arc::clone(&self.storage),
                Arc::clone(&observer),
                Arc::clone(&stats),
            ),
            registry: self.registry,
            storage: self.storage,
            pipeline: ModulePipeline::new(self.modules),
            timeouts: self.timeouts,
            observer,
            stats,
        }
    }
}
