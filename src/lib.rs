//! Orchestration core for long-running sagas
//!
//! A saga is a stateful workflow driven by messages. This crate decides which
//! saga instances an incoming message belongs to, runs the matching handlers
//! inside a pipeline of cross-cutting modules, persists the resulting state,
//! and wakes instances up again through durable timeouts.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use saga_orchestration::{
//!     CorrelationKey, Dispatcher, HandlerRegistry, Headers, InMemoryStateStorage,
//!     InMemoryTimeoutStore, Message, SagaDefinition, TimeoutConfig, TimeoutCoordinator,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct Payment {
//!     charged: bool,
//! }
//!
//! struct OrderPlaced(String);
//! struct PaymentCaptured(String);
//!
//! // 1. Declare the saga
//! let payment = SagaDefinition::<Payment>::new("payment")
//!     .start_keyed::<OrderPlaced, _, _>(
//!         |m| Some(CorrelationKey::from(m.0.as_str())),
//!         |_state, _msg, ctx| {
//!             ctx.request_timeout("give-up", Duration::from_secs(900), Vec::new());
//!             Ok(())
//!         },
//!     )
//!     .on::<PaymentCaptured, _, _>(
//!         |m| Some(CorrelationKey::from(m.0.as_str())),
//!         |state, _msg, ctx| {
//!             state.charged = true;
//!             ctx.finish_saga();
//!             Ok(())
//!         },
//!     )
//!     .on_timeout(|_state, _timeout, ctx| {
//!         ctx.finish_saga();
//!         Ok(())
//!     });
//!
//! // 2. Wire the dispatcher
//! let registry = Arc::new(HandlerRegistry::builder().saga(payment).build().unwrap());
//! let timeouts = Arc::new(TimeoutCoordinator::new(
//!     Arc::new(InMemoryTimeoutStore::new()),
//!     TimeoutConfig::default(),
//! ));
//! let dispatcher = Dispatcher::builder(registry, Arc::new(InMemoryStateStorage::new()), timeouts).build();
//!
//! // 3. Dispatch messages
//! let placed = dispatcher.dispatch(Message::new(OrderPlaced("o-1".into())), Headers::new());
//! assert!(placed.is_success());
//! let captured = dispatcher.dispatch(Message::new(PaymentCaptured("o-1".into())), Headers::new());
//! assert_eq!(captured.units().len(), 1);
//! assert!(dispatcher.timeouts().is_empty());
//! ```
//!
//! In a service, start the timeout loop with
//! `timeouts.spawn(Arc::new(dispatcher))` inside a tokio runtime.

#![warn(missing_docs)]

// === Core Types ===
mod context;
mod errors;
mod idempotency;
mod instance;
mod message;

// === Sagas ===
mod registry;
mod saga;

// === Dispatch ===
mod dispatcher;
mod module;
mod resolver;

// === Timeouts ===
mod config;
mod timeout;

// === Storage ===
mod storage;
mod timeout_store;

#[cfg(feature = "lmdb")]
mod lmdb;

// === Observability ===
mod observer;
mod stats;

// === Test Support ===
#[cfg(any(test, feature = "test-harness"))]
pub mod test_support;

// === Re-exports ===

// Types
pub use context::{now_millis, ExecutionContext, Headers, SagaId};
pub use idempotency::IdempotencyKey;
pub use instance::SagaInstance;
pub use message::{CorrelationKey, Message};

// Errors
pub use errors::{BoxError, DispatchError, ModuleStartError, ModuleTeardownError, TeardownPhase};

// Sagas
pub use registry::{
    HandlerDescriptor, HandlerKind, HandlerRegistry, HandlerRegistryBuilder, HandlerRoute,
    KeyExtractor, RegistryError, SagaType,
};
pub use saga::{HandlerResult, SagaDefinition};

// Dispatch
pub use dispatcher::{
    DeliveryFailed, DispatchOutcome, Dispatcher, DispatcherBuilder, UnitOutcome, UnitStatus,
};
pub use module::{ModuleInvoker, ModulePipeline, SagaModule, StartOutcome};
pub use resolver::{InstanceResolver, ResolvedInstance};

// Timeouts
pub use config::{RetryPolicy, TimeoutConfig};
pub use timeout::{FireReport, Timeout, TimeoutCoordinator, TimeoutDelivery, TimeoutHandle, TimeoutId};

// Storage
pub use storage::{InMemoryStateStorage, StateStorage, StorageError};
pub use timeout_store::{InMemoryTimeoutStore, TimeoutError, TimeoutStore};

#[cfg(feature = "lmdb")]
pub use lmdb::LmdbStore;

// Observability
pub use observer::{NoOpObserver, SagaObserver, TracingObserver};
pub use stats::{DispatchStats, DispatchStatsSnapshot};
