//! Helpers for testing sagas and modules

use std::sync::{Arc, Mutex};

use crate::{BoxError, ExecutionContext, Message, SagaModule};

/// Install a fmt subscriber honouring `RUST_LOG`, writing to the test output.
///
/// Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ordered record of module hook calls, e.g. `"M1.finish"`
#[derive(Default)]
pub struct CallLog {
    entries: Mutex<Vec<String>>,
    causes: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn record(&self, entry: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.into());
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of entries starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Error causes passed to `on_error`, in call order
    pub fn causes(&self) -> Vec<String> {
        self.causes.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
        if let Ok(mut causes) = self.causes.lock() {
            causes.clear();
        }
    }
}

/// Error raised by a [`RecordingModule`] configured to fail
#[derive(Debug, thiserror::Error)]
#[error("{module} failed in {hook}")]
pub struct ModuleFailure {
    pub module: &'static str,
    pub hook: &'static str,
}

/// Module that logs every hook call and fails on demand
pub struct RecordingModule {
    name: &'static str,
    log: Arc<CallLog>,
    fail_start: bool,
    fail_finish: bool,
    fail_error: bool,
}

impl RecordingModule {
    pub fn new(name: &'static str, log: Arc<CallLog>) -> Self {
        Self {
            name,
            log,
            fail_start: false,
            fail_finish: false,
            fail_error: false,
        }
    }

    pub fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn fail_finish(mut self) -> Self {
        self.fail_finish = true;
        self
    }

    pub fn fail_error(mut self) -> Self {
        self.fail_error = true;
        self
    }

    fn hook(&self, hook: &'static str, fail: bool) -> Result<(), BoxError> {
        self.log.record(format!("{}.{}", self.name, hook));
        if fail {
            return Err(Box::new(ModuleFailure {
                module: self.name,
                hook,
            }));
        }
        Ok(())
    }
}

impl SagaModule for RecordingModule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn on_start(&self, _context: &mut ExecutionContext) -> Result<(), BoxError> {
        self.hook("start", self.fail_start)
    }

    fn on_finished(&self, _context: &mut ExecutionContext) -> Result<(), BoxError> {
        self.hook("finish", self.fail_finish)
    }

    fn on_error(
        &self,
        _context: &mut ExecutionContext,
        _message: &Message,
        error: &(dyn std::error::Error + Send + Sync + 'static),
    ) -> Result<(), BoxError> {
        if let Ok(mut causes) = self.log.causes.lock() {
            causes.push(error.to_string());
        }
        self.hook("error", self.fail_error)
    }
}
