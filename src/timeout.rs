//! Time-driven reactivation of saga instances.
//!
//! Saga logic requests timeouts through the [`ExecutionContext`](crate::ExecutionContext);
//! the dispatcher schedules them on the [`TimeoutCoordinator`] once the
//! requesting unit succeeds. A background loop started with
//! [`TimeoutCoordinator::spawn`] delivers every due timeout back through a
//! [`TimeoutDelivery`] (normally the [`Dispatcher`](crate::Dispatcher)) as an
//! ordinary [`Timeout`] message addressed to its owning instance.
//!
//! Delivery is at-least-once. A record is removed from the store before it is
//! delivered; if delivery fails it is re-armed with backoff until the retry
//! policy is exhausted. Saga handlers for timeouts must tolerate duplicates,
//! see [`IdempotencyKey::for_timeout`](crate::IdempotencyKey::for_timeout).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::duration_millis;
use crate::{
    now_millis, BoxError, DispatchStats, IdempotencyKey, SagaId, SagaObserver, TimeoutConfig,
    TimeoutError, TimeoutStore, TracingObserver,
};

/// Unique identifier for a scheduled timeout
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeoutId(pub Uuid);

impl TimeoutId {
    /// Create a new random timeout ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TimeoutId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimeoutId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimeoutId({})", self.0)
    }
}

impl std::fmt::Display for TimeoutId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scheduled wake-up for one saga instance.
///
/// This is both the persisted record and the message delivered to the
/// saga's timeout handler when it fires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeout {
    /// Timeout identifier, stable across redeliveries
    pub id: TimeoutId,
    /// Owning instance
    pub instance_id: SagaId,
    /// Saga type of the owning instance
    pub saga_type: Box<str>,
    /// Name given by the saga when requesting the timeout
    pub name: Box<str>,
    /// When the timeout is due (millis since UNIX epoch)
    pub due_at_millis: u64,
    /// Registration order, breaks ties between equal `due_at_millis`
    pub sequence: u64,
    /// Failed delivery attempts so far
    pub attempt: u32,
    /// Opaque data supplied by the saga
    pub payload: Vec<u8>,
}

impl Timeout {
    /// Key identifying this timeout across duplicate deliveries
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::for_timeout(self)
    }

    fn order_key(&self) -> (u64, u64) {
        (self.due_at_millis, self.sequence)
    }
}

/// Receiver of fired timeouts
pub trait TimeoutDelivery: Send + Sync + 'static {
    /// Deliver a due timeout. An error re-arms it for a bounded retry.
    fn deliver(&self, timeout: Timeout) -> Result<(), BoxError>;
}

/// What happened during one [`TimeoutCoordinator::fire_due`] pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FireReport {
    /// Timeouts delivered successfully
    pub delivered: usize,
    /// Timeouts whose delivery failed and that were scheduled again
    pub rearmed: usize,
    /// Timeouts given up on
    pub dropped: usize,
}

/// Owns all pending timeouts of the process.
///
/// Keeps an ordered in-memory index over the [`TimeoutStore`] so the firing
/// loop can find the next due timeout without scanning the store.
pub struct TimeoutCoordinator {
    store: Arc<dyn TimeoutStore>,
    config: TimeoutConfig,
    pending: Mutex<BTreeMap<(u64, u64), Timeout>>,
    sequence: AtomicU64,
    wake: tokio::sync::Notify,
    observer: Arc<dyn SagaObserver>,
    stats: Arc<DispatchStats>,
}

impl TimeoutCoordinator {
    /// Create a coordinator over `store`.
    ///
    /// Call [`init`](Self::init) to pick up timeouts persisted by a previous
    /// run.
    pub fn new(store: Arc<dyn TimeoutStore>, config: TimeoutConfig) -> Self {
        Self {
            store,
            config,
            pending: Mutex::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
            wake: tokio::sync::Notify::new(),
            observer: Arc::new(TracingObserver),
            stats: Arc::new(DispatchStats::new()),
        }
    }

    /// Replace the observer used to report fired and dropped timeouts
    pub fn with_observer(mut self, observer: Arc<dyn SagaObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Share a statistics block, typically the dispatcher's
    pub fn with_stats(mut self, stats: Arc<DispatchStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Statistics updated by this coordinator
    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Load pending timeouts from the store. Returns how many were loaded.
    pub fn init(&self) -> Result<usize, TimeoutError> {
        let loaded = self.store.load_all()?;
        let count = loaded.len();
        if let Some(max) = loaded.iter().map(|t| t.sequence).max() {
            self.sequence.fetch_max(max + 1, Ordering::SeqCst);
        }

        let mut pending = self.lock_pending()?;
        for timeout in loaded {
            pending.insert(timeout.order_key(), timeout);
        }
        drop(pending);

        tracing::info!(count, "timeout coordinator initialised");
        self.wake.notify_one();
        Ok(count)
    }

    /// Schedule a timeout for `instance_id` after `delay`.
    ///
    /// The record is persisted before this returns.
    pub fn schedule(
        &self,
        instance_id: SagaId,
        saga_type: &str,
        name: &str,
        delay: Duration,
        payload: Vec<u8>,
    ) -> Result<TimeoutId, TimeoutError> {
        let timeout = Timeout {
            id: TimeoutId::new(),
            instance_id,
            saga_type: saga_type.into(),
            name: name.into(),
            due_at_millis: now_millis().saturating_add(duration_millis(delay)),
            sequence: self.next_sequence(),
            attempt: 0,
            payload,
        };
        let id = timeout.id;

        self.store.insert(&timeout)?;
        self.lock_pending()?.insert(timeout.order_key(), timeout);
        self.stats.timeouts_scheduled.fetch_add(1, Ordering::Relaxed);
        self.wake.notify_one();

        tracing::debug!(timeout_id = %id, instance_id = %instance_id, saga_type = %saga_type, name = %name, "timeout scheduled");
        Ok(id)
    }

    /// Cancel every pending timeout of an instance.
    ///
    /// Cancelling an instance without timeouts is not an error.
    pub fn cancel_all(&self, instance_id: SagaId) -> Result<usize, TimeoutError> {
        let removed = self.store.remove_for_instance(instance_id)?;
        self.lock_pending()?
            .retain(|_, t| t.instance_id != instance_id);

        if !removed.is_empty() {
            self.stats
                .timeouts_cancelled
                .fetch_add(removed.len() as u64, Ordering::Relaxed);
            tracing::debug!(instance_id = %instance_id, count = removed.len(), "timeouts cancelled");
        }
        Ok(removed.len())
    }

    /// Pending timeouts of an instance, in firing order
    pub fn pending_for(&self, instance_id: SagaId) -> Vec<Timeout> {
        self.lock_pending()
            .map(|p| {
                p.values()
                    .filter(|t| t.instance_id == instance_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of pending timeouts
    pub fn len(&self) -> usize {
        self.lock_pending().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Due time of the earliest pending timeout
    pub fn next_due_millis(&self) -> Option<u64> {
        self.lock_pending()
            .ok()
            .and_then(|p| p.keys().next().map(|(due, _)| *due))
    }

    /// Deliver every timeout due at `now_millis`, in due order.
    pub fn fire_due(&self, delivery: &dyn TimeoutDelivery, now_millis: u64) -> FireReport {
        let mut report = FireReport::default();

        let due = match self.take_due(now_millis) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "failed to collect due timeouts");
                return report;
            }
        };

        for timeout in due {
            match delivery.deliver(timeout.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    self.stats.timeouts_fired.fetch_add(1, Ordering::Relaxed);
                    self.observer.on_timeout_fired(&timeout);
                }
                Err(error) => self.rearm(timeout, &error, now_millis, &mut report),
            }
        }

        report
    }

    /// Start the firing loop on the current tokio runtime
    pub fn spawn(self: &Arc<Self>, delivery: Arc<dyn TimeoutDelivery>) -> TimeoutHandle {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(run_timeout_loop(Arc::clone(self), delivery, shutdown_rx));
        TimeoutHandle {
            shutdown_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    /// Remove due timeouts from the index and the store.
    ///
    /// A timeout whose record cannot be removed stays pending, so it is never
    /// delivered while still persisted.
    fn take_due(&self, now_millis: u64) -> Result<Vec<Timeout>, TimeoutError> {
        let due = {
            let mut pending = self.lock_pending()?;
            let later = pending.split_off(&(now_millis.saturating_add(1), 0));
            std::mem::replace(&mut *pending, later)
        };

        let mut fired = Vec::with_capacity(due.len());
        for (key, timeout) in due {
            match self.store.remove(timeout.id) {
                Ok(_) => fired.push(timeout),
                Err(e) => {
                    tracing::warn!(timeout_id = %timeout.id, error = %e, "could not remove due timeout, keeping it pending");
                    self.lock_pending()?.insert(key, timeout);
                }
            }
        }
        Ok(fired)
    }

    fn rearm(&self, mut timeout: Timeout, error: &BoxError, now_millis: u64, report: &mut FireReport) {
        timeout.attempt += 1;
        if !self.config.redelivery.allows_retry(timeout.attempt) {
            report.dropped += 1;
            self.stats.timeouts_dropped.fetch_add(1, Ordering::Relaxed);
            self.observer.on_timeout_dropped(&timeout, &error.to_string());
            return;
        }

        let delay = self.config.redelivery.delay_for_attempt(timeout.attempt);
        timeout.due_at_millis = now_millis.saturating_add(duration_millis(delay));
        timeout.sequence = self.next_sequence();

        let stored = self
            .store
            .insert(&timeout)
            .and_then(|()| self.lock_pending().map(|mut p| p.insert(timeout.order_key(), timeout.clone())));
        match stored {
            Ok(_) => {
                report.rearmed += 1;
                self.stats.timeouts_rearmed.fetch_add(1, Ordering::Relaxed);
                self.observer.on_timeout_rearmed(&timeout, &error.to_string());
            }
            Err(e) => {
                report.dropped += 1;
                self.stats.timeouts_dropped.fetch_add(1, Ordering::Relaxed);
                self.observer.on_timeout_dropped(&timeout, &e.to_string());
            }
        }
    }

    /// Pause before retrying timeouts that could not be taken out of the store
    fn stall_backoff(&self) -> Duration {
        self.config
            .redelivery
            .delay_for_attempt(1)
            .min(self.config.max_idle)
            .max(Duration::from_millis(1))
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, BTreeMap<(u64, u64), Timeout>>, TimeoutError> {
        self.pending
            .lock()
            .map_err(|e| TimeoutError::Storage(e.to_string().into()))
    }
}

/// Handle for stopping a running firing loop.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct TimeoutHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl TimeoutHandle {
    /// Stop the firing loop and wait for it to exit.
    ///
    /// Pending timeouts stay in the store. Calling this more than once is
    /// safe.
    pub async fn shutdown(&self) -> Result<(), TimeoutError> {
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            join_handle
                .await
                .map_err(|e| TimeoutError::Task(format!("timeout loop panicked: {e}").into()))?;
        }
        Ok(())
    }
}

async fn run_timeout_loop(
    coordinator: Arc<TimeoutCoordinator>,
    delivery: Arc<dyn TimeoutDelivery>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    tracing::debug!("timeout loop started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let now = now_millis();
        let wait = match coordinator.next_due_millis() {
            Some(due) if due <= now => {
                let report = coordinator.fire_due(delivery.as_ref(), now);
                tracing::trace!(?report, "timeouts fired");
                tokio::task::yield_now().await;

                match coordinator.next_due_millis() {
                    // Still due after a pass: its record could not be removed.
                    Some(due) if due <= now => coordinator.stall_backoff(),
                    Some(due) => Duration::from_millis(due.saturating_sub(now_millis()))
                        .min(coordinator.config.max_idle),
                    None => coordinator.config.max_idle,
                }
            }
            Some(due) => Duration::from_millis(due - now).min(coordinator.config.max_idle),
            None => coordinator.config.max_idle,
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = coordinator.wake.notified() => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    tracing::debug!("timeout loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryTimeoutStore, NoOpObserver, RetryPolicy};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingDelivery {
        delivered: Mutex<Vec<Timeout>>,
        failures_left: Mutex<u32>,
        store: Option<Arc<InMemoryTimeoutStore>>,
        still_stored: Mutex<Vec<bool>>,
    }

    impl RecordingDelivery {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: Mutex::new(times),
                ..Self::default()
            }
        }

        fn names(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|t| t.name.to_string())
                .collect()
        }
    }

    impl TimeoutDelivery for RecordingDelivery {
        fn deliver(&self, timeout: Timeout) -> Result<(), BoxError> {
            if let Some(store) = &self.store {
                let stored = store.load_all()?.iter().any(|t| t.id == timeout.id);
                self.still_stored.lock().unwrap().push(stored);
            }
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err("transport down".into());
            }
            self.delivered.lock().unwrap().push(timeout);
            Ok(())
        }
    }

    /// Store whose `remove` always fails
    #[derive(Default)]
    struct StuckStore {
        inner: InMemoryTimeoutStore,
        removes: AtomicUsize,
    }

    impl TimeoutStore for StuckStore {
        fn insert(&self, timeout: &Timeout) -> Result<(), TimeoutError> {
            self.inner.insert(timeout)
        }

        fn remove(&self, _id: TimeoutId) -> Result<bool, TimeoutError> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Err(TimeoutError::Storage("disk full".into()))
        }

        fn remove_for_instance(&self, instance_id: SagaId) -> Result<Vec<TimeoutId>, TimeoutError> {
            self.inner.remove_for_instance(instance_id)
        }

        fn load_all(&self) -> Result<Vec<Timeout>, TimeoutError> {
            self.inner.load_all()
        }
    }

    fn coordinator(store: Arc<InMemoryTimeoutStore>, config: TimeoutConfig) -> Arc<TimeoutCoordinator> {
        Arc::new(TimeoutCoordinator::new(store, config).with_observer(Arc::new(NoOpObserver)))
    }

    fn record(instance_id: SagaId, name: &str, due_at_millis: u64, sequence: u64) -> Timeout {
        Timeout {
            id: TimeoutId::new(),
            instance_id,
            saga_type: "order".into(),
            name: name.into(),
            due_at_millis,
            sequence,
            attempt: 0,
            payload: Vec::new(),
        }
    }

    #[test]
    fn schedule_persists_immediately() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let coordinator = coordinator(store.clone(), TimeoutConfig::default());
        let instance = SagaId::new();

        let id = coordinator
            .schedule(instance, "order", "payment_due", Duration::from_secs(60), b"p".to_vec())
            .unwrap();

        let stored = store.load_all().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].payload, b"p".to_vec());
        assert_eq!(coordinator.pending_for(instance).len(), 1);
        assert_eq!(coordinator.stats().snapshot().timeouts_scheduled, 1);
    }

    #[test]
    fn cancel_all_is_idempotent_and_scoped_to_instance() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let coordinator = coordinator(store.clone(), TimeoutConfig::default());
        let a = SagaId::new();
        let b = SagaId::new();

        for name in ["t1", "t2"] {
            coordinator
                .schedule(a, "order", name, Duration::from_secs(60), Vec::new())
                .unwrap();
        }
        coordinator
            .schedule(b, "order", "t3", Duration::from_secs(60), Vec::new())
            .unwrap();

        assert_eq!(coordinator.cancel_all(a).unwrap(), 2);
        assert_eq!(coordinator.cancel_all(a).unwrap(), 0);
        assert!(coordinator.pending_for(a).is_empty());
        assert_eq!(coordinator.pending_for(b).len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn init_restores_order_by_due_time_then_registration() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let instance = SagaId::new();
        for t in [
            record(instance, "late", 300, 0),
            record(instance, "second", 100, 7),
            record(instance, "first", 100, 2),
        ] {
            store.insert(&t).unwrap();
        }

        let coordinator = coordinator(store.clone(), TimeoutConfig::default());
        assert_eq!(coordinator.init().unwrap(), 3);
        assert_eq!(coordinator.next_due_millis(), Some(100));

        // New registrations continue after the highest restored sequence.
        let id = coordinator
            .schedule(instance, "order", "fresh", Duration::from_secs(3600), Vec::new())
            .unwrap();
        let fresh = coordinator
            .pending_for(instance)
            .into_iter()
            .find(|t| t.id == id)
            .unwrap();
        assert!(fresh.sequence > 7);

        let delivery = RecordingDelivery::default();
        let report = coordinator.fire_due(&delivery, 1_000);
        assert_eq!(report.delivered, 3);
        assert_eq!(delivery.names(), vec!["first", "second", "late"]);
        assert_eq!(coordinator.len(), 1);
    }

    #[test]
    fn fire_due_removes_record_before_delivery() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let instance = SagaId::new();
        store.insert(&record(instance, "t", 10, 0)).unwrap();
        let coordinator = coordinator(store.clone(), TimeoutConfig::default());
        coordinator.init().unwrap();

        let delivery = RecordingDelivery {
            store: Some(store.clone()),
            ..RecordingDelivery::default()
        };
        assert_eq!(coordinator.fire_due(&delivery, 5).delivered, 0);
        assert_eq!(coordinator.fire_due(&delivery, 10).delivered, 1);
        assert_eq!(*delivery.still_stored.lock().unwrap(), vec![false]);
        assert!(store.is_empty());
    }

    #[test]
    fn failed_delivery_is_rearmed_then_dropped() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let instance = SagaId::new();
        store.insert(&record(instance, "t", 10, 0)).unwrap();
        let config = TimeoutConfig {
            redelivery: RetryPolicy {
                max_attempts: 2,
                initial_delay_millis: 50,
                ..RetryPolicy::default()
            },
            ..TimeoutConfig::default()
        };
        let coordinator = coordinator(store.clone(), config);
        coordinator.init().unwrap();
        let delivery = RecordingDelivery::failing(5);

        let report = coordinator.fire_due(&delivery, 10);
        assert_eq!(report.rearmed, 1);
        let rearmed = coordinator.pending_for(instance);
        assert_eq!(rearmed.len(), 1);
        assert_eq!(rearmed[0].attempt, 1);
        assert_eq!(rearmed[0].due_at_millis, 60);
        assert_eq!(store.len(), 1);

        let report = coordinator.fire_due(&delivery, 60);
        assert_eq!(report.dropped, 1);
        assert!(coordinator.is_empty());
        assert!(store.is_empty());
        assert_eq!(coordinator.stats().snapshot().timeouts_dropped, 1);
    }

    #[tokio::test]
    async fn spawned_loop_fires_and_shutdown_keeps_pending_records() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let config = TimeoutConfig {
            max_idle: Duration::from_millis(20),
            ..TimeoutConfig::default()
        };
        let coordinator = coordinator(store.clone(), config);
        let delivery = Arc::new(RecordingDelivery::default());
        let handle = coordinator.spawn(delivery.clone());

        let instance = SagaId::new();
        coordinator
            .schedule(instance, "order", "soon", Duration::from_millis(10), Vec::new())
            .unwrap();
        coordinator
            .schedule(instance, "order", "much_later", Duration::from_secs(3600), Vec::new())
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while delivery.names().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timeout was not fired");

        handle.shutdown().await.unwrap();
        handle.shutdown().await.unwrap();

        assert_eq!(delivery.names(), vec!["soon"]);
        let remaining = store.load_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name.as_ref(), "much_later");
    }

    #[test]
    fn huge_delay_saturates_instead_of_wrapping() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let coordinator = coordinator(store.clone(), TimeoutConfig::default());
        let instance = SagaId::new();

        // Just past u64::MAX milliseconds; a plain cast would wrap to 385 ms.
        coordinator
            .schedule(instance, "order", "far", Duration::from_secs(18_446_744_073_709_552), Vec::new())
            .unwrap();

        assert_eq!(coordinator.next_due_millis(), Some(u64::MAX));
        let delivery = RecordingDelivery::default();
        assert_eq!(coordinator.fire_due(&delivery, now_millis() + 60_000).delivered, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unremovable_record_stays_pending_and_undelivered() {
        let store = Arc::new(StuckStore::default());
        let instance = SagaId::new();
        store.inner.insert(&record(instance, "t", 10, 0)).unwrap();
        let coordinator = TimeoutCoordinator::new(store.clone(), TimeoutConfig::default())
            .with_observer(Arc::new(NoOpObserver));
        coordinator.init().unwrap();

        let delivery = RecordingDelivery::default();
        let report = coordinator.fire_due(&delivery, 10);
        assert_eq!(report.delivered, 0);
        assert!(delivery.names().is_empty());
        assert_eq!(store.removes.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pending_for(instance).len(), 1);
        assert_eq!(coordinator.next_due_millis(), Some(10));
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test]
    async fn loop_backs_off_while_a_due_record_cannot_be_removed() {
        let store = Arc::new(StuckStore::default());
        let config = TimeoutConfig {
            max_idle: Duration::from_millis(100),
            ..TimeoutConfig::default()
        };
        let coordinator = Arc::new(
            TimeoutCoordinator::new(store.clone(), config).with_observer(Arc::new(NoOpObserver)),
        );
        let delivery = Arc::new(RecordingDelivery::default());
        let handle = coordinator.spawn(delivery.clone());

        coordinator
            .schedule(SagaId::new(), "order", "stuck", Duration::ZERO, Vec::new())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The loop must leave room for this task on a current-thread runtime.
        tokio::time::timeout(Duration::from_secs(3), handle.shutdown())
            .await
            .expect("timeout loop did not stop")
            .unwrap();

        let removes = store.removes.load(Ordering::SeqCst);
        assert!(removes >= 1);
        assert!(removes <= 6, "{removes} remove attempts in 200ms");
        assert!(delivery.names().is_empty());
        assert_eq!(coordinator.len(), 1);
    }
}
