//! At most one in-flight update per subscription.
//!
//! Each subscription id owns a single-permit semaphore. Callers for the same
//! subscription queue behind one another (mutual exclusion, not FIFO);
//! different subscriptions run in parallel. Gates are dropped once nobody
//! holds or waits on them.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use flow_state::{BuildId, SubscriptionId};
use tokio::sync::Semaphore;
use tracing::{debug, Instrument};

use crate::error::{ErrorClass, FlowResult};
use crate::metrics::METRICS;
use crate::obs;

#[derive(Default)]
pub struct SubscriptionSerializer {
    gates: DashMap<SubscriptionId, Arc<Semaphore>>,
}

impl SubscriptionSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` exclusively for `subscription_id`.
    ///
    /// A failure is logged with the subscription and build id and reduced to
    /// its [`ErrorClass`]; it never reaches other subscriptions.
    pub async fn execute<F, Fut, T>(
        &self,
        subscription_id: SubscriptionId,
        build_id: BuildId,
        work: F,
    ) -> Result<T, ErrorClass>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlowResult<T>>,
    {
        let gate = self
            .gates
            .entry(subscription_id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let result = async {
            let _permit = gate.acquire().await.ok();
            work().await
        }
        .instrument(obs::subscription_span(subscription_id, build_id))
        .await;

        drop(gate);
        self.gates
            .remove_if(&subscription_id, |_, gate| Arc::strong_count(gate) == 1);

        result.map_err(|e| {
            let class = e.class();
            if class == ErrorClass::Cancelled {
                debug!(subscription_id = %subscription_id, build_id = %build_id, "update cancelled");
            } else {
                METRICS.inc_update_failures();
                obs::emit_update_failed(subscription_id, build_id, &e);
            }
            class
        })
    }

    /// Subscriptions with an update running or waiting.
    pub fn active(&self) -> usize {
        self.gates.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;
    use crate::error::FlowError;

    #[derive(Default)]
    struct Overlap {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Overlap {
        async fn hold(&self) -> FlowResult<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn same_subscription_never_overlaps() {
        let serializer = SubscriptionSerializer::new();
        let sub = SubscriptionId::new();
        let overlap = Overlap::default();

        let calls = (0..8).map(|i| {
            let overlap = &overlap;
            serializer.execute(sub, BuildId(i), move || async move { overlap.hold().await })
        });
        let results = join_all(calls).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(overlap.peak.load(Ordering::SeqCst), 1);
        assert_eq!(serializer.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn different_subscriptions_run_in_parallel() {
        let serializer = SubscriptionSerializer::new();
        let overlap = Overlap::default();

        let calls = (0..4).map(|i| {
            let overlap = &overlap;
            serializer.execute(SubscriptionId::new(), BuildId(i), move || async move {
                overlap.hold().await
            })
        });
        join_all(calls).await;
        assert_eq!(overlap.peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn updates_can_move_between_runtime_threads() {
        let serializer = Arc::new(SubscriptionSerializer::new());
        let sub = SubscriptionId::new();

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let serializer = Arc::clone(&serializer);
                tokio::spawn(async move {
                    serializer
                        .execute(sub, BuildId(i), move || async move {
                            tokio::task::yield_now().await;
                            Ok(i)
                        })
                        .await
                })
            })
            .collect();
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), Ok(i as u64));
        }
        assert_eq!(serializer.active(), 0);
    }

    #[tokio::test]
    async fn failure_is_contained_and_classified() {
        let serializer = SubscriptionSerializer::new();
        let sub = SubscriptionId::new();

        let failed: Result<(), ErrorClass> = serializer
            .execute(sub, BuildId(5), || async {
                Err(FlowError::UpdateFailed {
                    subscription_id: sub,
                    build_id: BuildId(5),
                    reason: "push rejected".into(),
                    retryable: true,
                })
            })
            .await;
        assert_eq!(failed, Err(ErrorClass::Transient));

        let ok = serializer.execute(sub, BuildId(6), || async { Ok(42) }).await;
        assert_eq!(ok, Ok(42));
    }
}
