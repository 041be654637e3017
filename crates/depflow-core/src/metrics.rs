//! Global atomic counters for the orchestrator.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the daemon does so on every report tick and at
//! shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    items_enqueued: AtomicU64,
    items_processed: AtomicU64,
    items_abandoned: AtomicU64,
    updates_applied: AtomicU64,
    updates_skipped: AtomicU64,
    update_failures: AtomicU64,
    worker_restarts: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            items_enqueued: AtomicU64::new(0),
            items_processed: AtomicU64::new(0),
            items_abandoned: AtomicU64::new(0),
            updates_applied: AtomicU64::new(0),
            updates_skipped: AtomicU64::new(0),
            update_failures: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
        }
    }

    pub fn inc_items_enqueued(&self) {
        self.items_enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "items_enqueued", "counter incremented");
    }

    pub fn inc_items_processed(&self) {
        self.items_processed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "items_processed", "counter incremented");
    }

    /// An item kept failing transiently and was dropped from the queue.
    pub fn inc_items_abandoned(&self) {
        self.items_abandoned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "items_abandoned", "counter incremented");
    }

    pub fn inc_updates_applied(&self) {
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "updates_applied", "counter incremented");
    }

    /// An update was dropped because its build was not newer than the
    /// subscription's last applied build.
    pub fn inc_updates_skipped(&self) {
        self.updates_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "updates_skipped", "counter incremented");
    }

    pub fn inc_update_failures(&self) {
        self.update_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "update_failures", "counter incremented");
    }

    pub fn inc_worker_restarts(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "worker_restarts", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            items_enqueued = self.items_enqueued(),
            items_processed = self.items_processed(),
            items_abandoned = self.items_abandoned(),
            updates_applied = self.updates_applied(),
            updates_skipped = self.updates_skipped(),
            update_failures = self.update_failures(),
            worker_restarts = self.worker_restarts(),
        );
    }

    pub fn items_enqueued(&self) -> u64 {
        self.items_enqueued.load(Ordering::Relaxed)
    }

    pub fn items_processed(&self) -> u64 {
        self.items_processed.load(Ordering::Relaxed)
    }

    pub fn items_abandoned(&self) -> u64 {
        self.items_abandoned.load(Ordering::Relaxed)
    }

    pub fn updates_applied(&self) -> u64 {
        self.updates_applied.load(Ordering::Relaxed)
    }

    pub fn updates_skipped(&self) -> u64 {
        self.updates_skipped.load(Ordering::Relaxed)
    }

    pub fn update_failures(&self) -> u64 {
        self.update_failures.load(Ordering::Relaxed)
    }

    pub fn worker_restarts(&self) -> u64 {
        self.worker_restarts.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.items_enqueued,
            &self.items_processed,
            &self.items_abandoned,
            &self.updates_applied,
            &self.updates_skipped,
            &self.update_failures,
            &self.worker_restarts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_items_enqueued();
        m.inc_items_enqueued();
        m.inc_updates_skipped();
        m.inc_worker_restarts();
        m.inc_items_abandoned();
        assert_eq!(m.items_enqueued(), 2);
        assert_eq!(m.items_abandoned(), 1);
        assert_eq!(m.updates_skipped(), 1);
        assert_eq!(m.worker_restarts(), 1);
        assert_eq!(m.updates_applied(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_items_processed();
        m.inc_updates_applied();
        m.inc_update_failures();
        m.reset();
        assert_eq!(m.items_processed(), 0);
        assert_eq!(m.updates_applied(), 0);
        assert_eq!(m.update_failures(), 0);
    }
}
