//! Async wait signals.
//!
//! Both events are cancel-safe: dropping a pending `wait()` future removes
//! only that waiter. A signal consumed by a waiter that is dropped before it
//! observes it is handed to the next waiter.

use std::time::Duration;

use tokio::sync::{watch, Notify};

/// Releases exactly one waiter per `set()`.
///
/// Waiters are released in FIFO order. With no waiter present, `set()`
/// leaves a single pending signal that the next `wait()` consumes
/// immediately; repeated sets do not accumulate.
#[derive(Debug, Default)]
pub struct AsyncAutoResetEvent {
    notify: Notify,
}

impl AsyncAutoResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wait for a signal or until `timeout` elapses. Returns `true` if signaled.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

/// Releases all current and future waiters until `reset()`.
#[derive(Debug)]
pub struct AsyncManualResetEvent {
    state: watch::Sender<bool>,
}

impl Default for AsyncManualResetEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

impl AsyncManualResetEvent {
    pub fn new(initially_set: bool) -> Self {
        let (state, _) = watch::channel(initially_set);
        Self { state }
    }

    pub fn set(&self) {
        self.state.send_replace(true);
    }

    pub fn reset(&self) {
        self.state.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = rx.wait_for(|set| *set).await;
    }
}
