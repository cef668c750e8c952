//! Error types for dispatch, module hooks and handler execution

use crate::{StorageError, TimeoutError};

/// Error type produced by application code (handlers, modules, key extractors).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which teardown hook a module failed in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownPhase {
    /// `on_finished` after a successful handler
    Finish,
    /// `on_error` after a failed start or handler
    Error,
}

impl std::fmt::Display for TeardownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Finish => f.write_str("finish"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// A module failed in `on_start`.
///
/// The modules before `index` were started and have already been unwound
/// through `on_error`; failures from that unwind are kept in `unwind_errors`.
#[derive(Debug, thiserror::Error)]
#[error("module {module} (#{index}) failed to start: {source}")]
pub struct ModuleStartError {
    /// Position of the failing module in the pipeline
    pub index: usize,
    /// Name of the failing module
    pub module: &'static str,
    /// Error raised by the module
    #[source]
    pub source: BoxError,
    /// Errors raised while unwinding the already-started modules
    pub unwind_errors: Vec<ModuleTeardownError>,
}

/// A module failed in `on_finished` or `on_error`
#[derive(Debug, thiserror::Error)]
#[error("module {module} (#{index}) failed during {phase}: {source}")]
pub struct ModuleTeardownError {
    /// Position of the failing module in the pipeline
    pub index: usize,
    /// Name of the failing module
    pub module: &'static str,
    /// Hook that failed
    pub phase: TeardownPhase,
    /// Error raised by the module
    #[source]
    pub source: BoxError,
}

/// Everything that can go wrong for a single (instance, handler) dispatch unit.
///
/// Errors never leave their unit: the dispatcher collects them into the
/// [`DispatchOutcome`](crate::DispatchOutcome) and carries on with the
/// remaining units of the message.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The key extractor could not produce a correlation key
    #[error("no correlation key for {message_type} in saga {saga_type}")]
    KeyExtraction {
        /// Saga owning the handler
        saga_type: Box<str>,
        /// Message type that was being resolved
        message_type: &'static str,
    },

    /// A module failed to start; the handler did not run
    #[error(transparent)]
    ModuleStart(#[from] ModuleStartError),

    /// Saga business logic failed
    #[error("handler for {message_type} in saga {saga_type} failed: {source}")]
    Handler {
        /// Saga owning the handler
        saga_type: Box<str>,
        /// Message type that was handled
        message_type: &'static str,
        /// Error returned by the handler
        #[source]
        source: BoxError,
    },

    /// A module failed during teardown
    #[error(transparent)]
    ModuleTeardown(#[from] ModuleTeardownError),

    /// The state storage collaborator failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The timeout store failed
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// Saga state could not be encoded or decoded
    #[error("saga state codec error: {0}")]
    StateCodec(#[from] serde_json::Error),

    /// A descriptor was invoked with a message of another type
    #[error("handler expects {expected} but message is {actual}")]
    MessageType {
        /// Type the descriptor was registered for
        expected: &'static str,
        /// Type of the delivered message
        actual: &'static str,
    },
}

impl DispatchError {
    /// Check if this error was raised by a module hook
    pub fn is_module_error(&self) -> bool {
        matches!(self, Self::ModuleStart(_) | Self::ModuleTeardown(_))
    }

    /// Check if this error was raised by saga business logic
    pub fn is_handler_error(&self) -> bool {
        matches!(self, Self::Handler { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_start_error_display_names_module() {
        let err = ModuleStartError {
            index: 1,
            module: "metrics",
            source: "boom".into(),
            unwind_errors: Vec::new(),
        };
        assert_eq!(err.to_string(), "module metrics (#1) failed to start: boom");
    }

    #[test]
    fn teardown_error_converts_into_dispatch_error() {
        let err: DispatchError = ModuleTeardownError {
            index: 0,
            module: "uow",
            phase: TeardownPhase::Finish,
            source: "commit failed".into(),
        }
        .into();
        assert!(err.is_module_error());
        assert!(!err.is_handler_error());
        assert_eq!(err.to_string(), "module uow (#0) failed during finish: commit failed");
    }

    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<DispatchError>();
            assert_send_sync::<ModuleStartError>();
        }
    };
}
