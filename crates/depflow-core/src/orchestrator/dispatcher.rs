//! Durable work handoff and the worker pool that drains it.
//!
//! Producers go through [`Dispatcher`], which enqueues and wakes one idle
//! worker. Each worker claims an item inside a queue transaction and
//! commits only once the item is settled: success, or a failure that
//! redelivery cannot fix. Shutdown rolls back so the item is delivered
//! again. A transient failure sends the item to the back of the queue with
//! a delay that doubles per delivery; after `max_deliveries` attempts it is
//! abandoned.
//!
//! The pool supervisor restarts any worker that returns or panics. Restarts
//! closer together than the cooldown are delayed by one cooldown.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flow_state::{EnqueueOutcome, QueueTransaction, UpdateWorkItem, WorkQueue};
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorClass, FlowResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::sync::{AsyncAutoResetEvent, AsyncManualResetEvent};

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Enqueue side of the work queue.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn WorkQueue>,
    wake: Arc<AsyncAutoResetEvent>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            queue,
            wake: Arc::new(AsyncAutoResetEvent::new()),
        }
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    /// Signal set on every enqueue; workers wait on it while idle.
    pub fn wake_signal(&self) -> Arc<AsyncAutoResetEvent> {
        Arc::clone(&self.wake)
    }

    pub async fn enqueue(&self, item: UpdateWorkItem) -> FlowResult<EnqueueOutcome> {
        let message_id = item.message_id();
        let outcome = self.queue.enqueue(item.clone()).await?;
        match outcome {
            EnqueueOutcome::Enqueued => {
                METRICS.inc_items_enqueued();
                obs::emit_work_enqueued(&item, &message_id);
                self.wake.set();
            }
            EnqueueOutcome::Deduplicated => {
                debug!(message_id = %message_id, kind = item.kind(), "work item already pending");
            }
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Processes one dequeued item.
///
/// Implementations log their own failures; the returned class only decides
/// whether the item is committed or redelivered.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, item: &UpdateWorkItem) -> Result<(), ErrorClass>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// How long an idle worker waits before polling the queue again.
    pub idle_poll: Duration,
    /// Minimum spacing between worker restarts before a delay is inserted.
    pub restart_cooldown: Duration,
    /// Attempts before a transiently failing item is given up on.
    pub max_deliveries: u32,
    /// Redelivery delay after the first transient failure.
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_poll: Duration::from_secs(1),
            restart_cooldown: Duration::from_secs(30),
            max_deliveries: 10,
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    /// Delay before redelivering an item that has failed `deliveries` times.
    pub fn retry_delay(&self, deliveries: u32) -> Duration {
        let doublings = deliveries.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1 << doublings)
            .min(self.max_retry_backoff)
    }
}

pub struct WorkerPool {
    queue: Arc<dyn WorkQueue>,
    handler: Arc<dyn WorkHandler>,
    wake: Arc<AsyncAutoResetEvent>,
    shutdown: Arc<AsyncManualResetEvent>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(dispatcher: &Dispatcher, handler: Arc<dyn WorkHandler>, config: PoolConfig) -> Self {
        Self {
            queue: Arc::clone(dispatcher.queue()),
            handler,
            wake: dispatcher.wake_signal(),
            shutdown: Arc::new(AsyncManualResetEvent::new(false)),
            config,
        }
    }

    /// Setting this event stops the pool. Items being processed are rolled
    /// back and will be redelivered.
    pub fn shutdown_handle(&self) -> Arc<AsyncManualResetEvent> {
        Arc::clone(&self.shutdown)
    }

    /// Run until shutdown, supervising the workers.
    pub async fn run(self) {
        let workers = self.config.workers.max(1);
        info!(workers, "worker pool starting");

        let mut set = JoinSet::new();
        for id in 0..workers {
            self.spawn_worker(&mut set, id);
        }

        let mut last_restart: Option<Instant> = None;
        loop {
            let joined = tokio::select! {
                joined = set.join_next() => joined,
                _ = self.shutdown.wait() => break,
            };
            let Some(joined) = joined else { break };
            let (id, reason) = match joined {
                Ok((id, Ok(()))) => (id, "returned".to_string()),
                Ok((id, Err(panic))) => (id, format!("panicked: {panic}")),
                Err(e) => {
                    // The wrapper never panics; this only happens on abort.
                    error!(error = %e, "worker task lost");
                    continue;
                }
            };
            if self.shutdown.is_set() {
                break;
            }

            let now = Instant::now();
            let mut delayed_ms = 0;
            if let Some(last) = last_restart {
                if now.duration_since(last) < self.config.restart_cooldown {
                    delayed_ms = self.config.restart_cooldown.as_millis() as u64;
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.restart_cooldown) => {}
                        _ = self.shutdown.wait() => break,
                    }
                }
            }
            last_restart = Some(Instant::now());

            METRICS.inc_worker_restarts();
            obs::emit_worker_restarted(id, &reason, delayed_ms);
            self.spawn_worker(&mut set, id);
        }

        while set.join_next().await.is_some() {}
        info!("worker pool stopped");
    }

    fn spawn_worker(&self, set: &mut JoinSet<(usize, Result<(), String>)>, id: usize) {
        let worker = Worker {
            id,
            queue: Arc::clone(&self.queue),
            handler: Arc::clone(&self.handler),
            wake: Arc::clone(&self.wake),
            shutdown: Arc::clone(&self.shutdown),
            config: self.config.clone(),
        };
        set.spawn(async move {
            let outcome = AssertUnwindSafe(worker.run())
                .catch_unwind()
                .await
                .map_err(|panic| panic_message(panic.as_ref()));
            (id, outcome)
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Worker {
    id: usize,
    queue: Arc<dyn WorkQueue>,
    handler: Arc<dyn WorkHandler>,
    wake: Arc<AsyncAutoResetEvent>,
    shutdown: Arc<AsyncManualResetEvent>,
    config: PoolConfig,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "worker started");
        while !self.shutdown.is_set() {
            match self.queue.try_dequeue().await {
                Ok(Some(tx)) => self.process(tx).await,
                Ok(None) => self.idle().await,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "dequeue failed");
                    self.idle().await;
                }
            }
        }
        debug!(worker = self.id, "worker stopped");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.wake.wait_timeout(self.config.idle_poll) => {}
            _ = self.shutdown.wait() => {}
        }
    }

    async fn process(&self, tx: Box<dyn QueueTransaction>) {
        let item = tx.item().clone();
        let result = tokio::select! {
            result = self.handler.handle(&item) => result,
            _ = self.shutdown.wait() => Err(ErrorClass::Cancelled),
        };
        METRICS.inc_items_processed();

        let settled = match result {
            Ok(()) => tx.commit().await,
            Err(ErrorClass::Business) | Err(ErrorClass::Invariant) => {
                debug!(worker = self.id, kind = item.kind(), "abandoning failed work item");
                tx.commit().await
            }
            Err(ErrorClass::Transient) => {
                let deliveries = tx.delivery_count();
                if deliveries >= self.config.max_deliveries {
                    METRICS.inc_items_abandoned();
                    obs::emit_work_abandoned(&item, deliveries);
                    tx.commit().await
                } else {
                    let delay = self.config.retry_delay(deliveries);
                    info!(
                        worker = self.id,
                        kind = item.kind(),
                        deliveries,
                        retry_in_ms = delay.as_millis() as u64,
                        "work item will be redelivered"
                    );
                    tx.retry_later(delay).await
                }
            }
            Err(ErrorClass::Cancelled) => tx.rollback().await,
        };
        if let Err(e) = settled {
            warn!(worker = self.id, kind = item.kind(), error = %e, "queue transaction not settled");
        }
    }
}
