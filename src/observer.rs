//! Dispatch observer trait

use std::time::Duration;

use crate::context::duration_millis;
use crate::{CorrelationKey, DispatchError, SagaId, Timeout};

/// Observer trait for external observability.
///
/// This is where failures are reported: the dispatcher never logs directly.
pub trait SagaObserver: Send + Sync + 'static {
    fn on_instance_created(&self, saga_type: &str, instance_id: SagaId);
    fn on_unit_completed(&self, saga_type: &str, instance_id: SagaId, duration: Duration);
    fn on_unit_failed(&self, saga_type: &str, instance_id: Option<SagaId>, errors: &[DispatchError]);
    /// Errors that did not roll the unit back (module teardown, timeout scheduling)
    fn on_unit_warnings(&self, saga_type: &str, instance_id: SagaId, errors: &[DispatchError]);
    fn on_instance_finished(&self, saga_type: &str, instance_id: SagaId);
    fn on_no_instance(&self, saga_type: &str, message_type: &str, key: &CorrelationKey);
    fn on_unhandled(&self, message_type: &str);
    fn on_timeout_fired(&self, timeout: &Timeout);
    fn on_timeout_rearmed(&self, timeout: &Timeout, error: &str);
    fn on_timeout_dropped(&self, timeout: &Timeout, reason: &str);
}

/// No-op observer
pub struct NoOpObserver;

impl SagaObserver for NoOpObserver {
    fn on_instance_created(&self, _saga_type: &str, _instance_id: SagaId) {}
    fn on_unit_completed(&self, _saga_type: &str, _instance_id: SagaId, _duration: Duration) {}
    fn on_unit_failed(&self, _saga_type: &str, _instance_id: Option<SagaId>, _errors: &[DispatchError]) {}
    fn on_unit_warnings(&self, _saga_type: &str, _instance_id: SagaId, _errors: &[DispatchError]) {}
    fn on_instance_finished(&self, _saga_type: &str, _instance_id: SagaId) {}
    fn on_no_instance(&self, _saga_type: &str, _message_type: &str, _key: &CorrelationKey) {}
    fn on_unhandled(&self, _message_type: &str) {}
    fn on_timeout_fired(&self, _timeout: &Timeout) {}
    fn on_timeout_rearmed(&self, _timeout: &Timeout, _error: &str) {}
    fn on_timeout_dropped(&self, _timeout: &Timeout, _reason: &str) {}
}

/// Tracing-based observer
pub struct TracingObserver;

impl SagaObserver for TracingObserver {
    fn on_instance_created(&self, saga_type: &str, instance_id: SagaId) {
        tracing::info!(saga_type = %saga_type, instance_id = %instance_id, "Saga instance created");
    }

    fn on_unit_completed(&self, saga_type: &str, instance_id: SagaId, duration: Duration) {
        tracing::debug!(saga_type = %saga_type, instance_id = %instance_id, duration_ms = duration_millis(duration), "Dispatch unit completed");
    }

    fn on_unit_failed(&self, saga_type: &str, instance_id: Option<SagaId>, errors: &[DispatchError]) {
        let instance_id = instance_id.map(|id| id.to_string()).unwrap_or_default();
        for error in errors {
            tracing::warn!(saga_type = %saga_type, instance_id = %instance_id, error = %error, "Dispatch unit failed");
        }
    }

    fn on_unit_warnings(&self, saga_type: &str, instance_id: SagaId, errors: &[DispatchError]) {
        for error in errors {
            tracing::warn!(saga_type = %saga_type, instance_id = %instance_id, error = %error, "Dispatch unit completed with errors");
        }
    }

    fn on_instance_finished(&self, saga_type: &str, instance_id: SagaId) {
        tracing::info!(saga_type = %saga_type, instance_id = %instance_id, "Saga instance finished");
    }

    fn on_no_instance(&self, saga_type: &str, message_type: &str, key: &CorrelationKey) {
        tracing::debug!(saga_type = %saga_type, message_type = %message_type, key = %key, "No saga instance for message");
    }

    fn on_unhandled(&self, message_type: &str) {
        tracing::debug!(message_type = %message_type, "No handler registered for message");
    }

    fn on_timeout_fired(&self, timeout: &Timeout) {
        tracing::debug!(timeout_id = %timeout.id, instance_id = %timeout.instance_id, name = %timeout.name, "Timeout fired");
    }

    fn on_timeout_rearmed(&self, timeout: &Timeout, error: &str) {
        tracing::warn!(timeout_id = %timeout.id, instance_id = %timeout.instance_id, attempt = timeout.attempt, error = %error, "Timeout delivery failed, re-armed");
    }

    fn on_timeout_dropped(&self, timeout: &Timeout, reason: &str) {
        tracing::error!(timeout_id = %timeout.id, instance_id = %timeout.instance_id, name = %timeout.name, reason = %reason, "Timeout dropped");
    }
}
