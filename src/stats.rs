//! Dispatch statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the dispatcher and the timeout coordinator
pub struct DispatchStats {
    pub messages_received: AtomicU64,
    pub messages_unhandled: AtomicU64,
    pub units_started: AtomicU64,
    pub units_succeeded: AtomicU64,
    pub units_failed: AtomicU64,
    pub instances_created: AtomicU64,
    pub instances_finished: AtomicU64,
    pub unmatched_continuations: AtomicU64,
    pub timeouts_scheduled: AtomicU64,
    pub timeouts_cancelled: AtomicU64,
    pub timeouts_fired: AtomicU64,
    pub timeouts_rearmed: AtomicU64,
    pub timeouts_dropped: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_unhandled: AtomicU64::new(0),
            units_started: AtomicU64::new(0),
            units_succeeded: AtomicU64::new(0),
            units_failed: AtomicU64::new(0),
            instances_created: AtomicU64::new(0),
            instances_finished: AtomicU64::new(0),
            unmatched_continuations: AtomicU64::new(0),
            timeouts_scheduled: AtomicU64::new(0),
            timeouts_cancelled: AtomicU64::new(0),
            timeouts_fired: AtomicU64::new(0),
            timeouts_rearmed: AtomicU64::new(0),
            timeouts_dropped: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_unhandled: self.messages_unhandled.load(Ordering::Relaxed),
            units_started: self.units_started.load(Ordering::Relaxed),
            units_succeeded: self.units_succeeded.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            instances_created: self.instances_created.load(Ordering::Relaxed),
            instances_finished: self.instances_finished.load(Ordering::Relaxed),
            unmatched_continuations: self.unmatched_continuations.load(Ordering::Relaxed),
            timeouts_scheduled: self.timeouts_scheduled.load(Ordering::Relaxed),
            timeouts_cancelled: self.timeouts_cancelled.load(Ordering::Relaxed),
            timeouts_fired: self.timeouts_fired.load(Ordering::Relaxed),
            timeouts_rearmed: self.timeouts_rearmed.load(Ordering::Relaxed),
            timeouts_dropped: self.timeouts_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub messages_received: u64,
    pub messages_unhandled: u64,
    pub units_started: u64,
    pub units_succeeded: u64,
    pub units_failed: u64,
    pub instances_created: u64,
    pub instances_finished: u64,
    pub unmatched_continuations: u64,
    pub timeouts_scheduled: u64,
    pub timeouts_cancelled: u64,
    pub timeouts_fired: u64,
    pub timeouts_rearmed: u64,
    pub timeouts_dropped: u64,
}
