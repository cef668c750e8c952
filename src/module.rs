//! Cross-cutting hooks around every dispatch unit.
//!
//! Modules are started in configuration order and torn down in reverse, like
//! a stack. A failing `on_start` stops the start immediately; teardown is
//! isolated per module so one failing module never hides another.

use std::sync::Arc;

use crate::{BoxError, ExecutionContext, Message, ModuleStartError, ModuleTeardownError, TeardownPhase};

/// A cross-cutting concern (metrics, unit of work, tracing, ...).
///
/// Every hook defaults to a no-op, so a module only implements the
/// capabilities it needs.
pub trait SagaModule: Send + Sync + 'static {
    /// Name used in errors and logs
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Called before the handler runs
    fn on_start(&self, _context: &mut ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called after the handler succeeded
    fn on_finished(&self, _context: &mut ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called after the handler, or a later module's start, failed
    fn on_error(
        &self,
        _context: &mut ExecutionContext,
        _message: &Message,
        _error: &(dyn std::error::Error + Send + Sync + 'static),
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Result of [`ModulePipeline::start`].
///
/// The invoker only exists when every module started.
pub type StartOutcome<'m> = Result<ModuleInvoker<'m>, ModuleStartError>;

/// Ordered module list, fixed at construction
#[derive(Clone, Default)]
pub struct ModulePipeline {
    modules: Vec<Arc<dyn SagaModule>>,
}

impl ModulePipeline {
    pub fn new(modules: Vec<Arc<dyn SagaModule>>) -> Self {
        Self { modules }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Start every module in order.
    ///
    /// Stops at the first failure. The modules started before it are unwound
    /// through `on_error` (last first) and the failing module and everything
    /// after it are left untouched.
    pub fn start(&self, context: &mut ExecutionContext) -> StartOutcome<'_> {
        for (index, module) in self.modules.iter().enumerate() {
            if let Err(source) = module.on_start(context) {
                let started = ModuleInvoker {
                    modules: &self.modules[..index],
                };
                let message = context.message().clone();
                let unwind_errors = started.error(context, &message, source.as_ref());
                return Err(ModuleStartError {
                    index,
                    module: module.name(),
                    source,
                    unwind_errors,
                });
            }
        }

        Ok(ModuleInvoker {
            modules: &self.modules,
        })
    }
}

/// Teardown handle for a successfully started pipeline.
///
/// Single use: `finish` and `error` consume it.
#[must_use = "started modules must be finished or errored"]
pub struct ModuleInvoker<'m> {
    modules: &'m [Arc<dyn SagaModule>],
}

impl ModuleInvoker<'_> {
    /// Number of started modules
    pub fn started(&self) -> usize {
        self.modules.len()
    }

    /// Call `on_finished` on every started module, last started first.
    ///
    /// Returns every error raised; never stops early.
    pub fn finish(self, context: &mut ExecutionContext) -> Vec<ModuleTeardownError> {
        let mut errors = Vec::new();
        for (index, module) in self.modules.iter().enumerate().rev() {
            if let Err(source) = module.on_finished(context) {
                errors.push(ModuleTeardownError {
                    index,
                    module: module.name(),
                    phase: TeardownPhase::Finish,
                    source,
                });
            }
        }
        errors
    }

    /// Call `on_error` on every started module, last started first.
    ///
    /// Returns every error raised; never stops early.
    pub fn error(
        self,
        context: &mut ExecutionContext,
        message: &Message,
        cause: &(dyn std::error::Error + Send + Sync + 'static),
    ) -> Vec<ModuleTeardownError> {
        let mut errors = Vec::new();
        for (index, module) in self.modules.iter().enumerate().rev() {
            if let Err(source) = module.on_error(context, message, cause) {
                errors.push(ModuleTeardownError {
                    index,
                    module: module.name(),
                    phase: TeardownPhase::Error,
                    source,
                });
            }
        }
        errors
    }
}
