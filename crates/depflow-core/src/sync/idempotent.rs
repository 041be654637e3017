//! Single-flight execution per key.
//!
//! The first caller for a key runs the producer; concurrent callers for the
//! same key wait on a one-permit semaphore and then read the cached result.
//! Results stay cached for the TTL of the backing [`ExpiringCache`], so a
//! producer runs at most once per key within that window unless it opts out
//! through [`OperationContext::skip_caching`].

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;

use super::ExpiringCache;

/// Per-call handle passed to the producer.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    skip: Arc<AtomicBool>,
}

impl OperationContext {
    /// Do not cache this call's result; the next caller re-executes.
    pub fn skip_caching(&self) {
        self.skip.store(true, Ordering::Release);
    }

    pub fn caching_skipped(&self) -> bool {
        self.skip.load(Ordering::Acquire)
    }
}

pub struct IdempotentOperator<K, V>
where
    K: Eq + Hash,
{
    cache: ExpiringCache<K, V>,
    gates: DashMap<K, Arc<Semaphore>>,
}

impl<K, V> IdempotentOperator<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: ExpiringCache::new(ttl),
            gates: DashMap::new(),
        }
    }

    /// Run `producer` for `key` unless a cached result exists.
    ///
    /// Errors are returned to the caller that produced them and never cached.
    pub async fn execute<F, Fut, E>(&self, key: K, producer: F) -> Result<V, E>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let gate = self
            .gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let result = {
            // Gates are never closed, so acquire cannot fail.
            let _permit = gate.acquire().await.ok();
            match self.cache.get(&key) {
                Some(hit) => Ok(hit),
                None => {
                    let ctx = OperationContext::default();
                    let result = producer(ctx.clone()).await;
                    if let Ok(value) = &result {
                        if !ctx.caching_skipped() {
                            self.cache.insert(key.clone(), value.clone());
                        }
                    }
                    result
                }
            }
        };

        drop(gate);
        self.gates
            .remove_if(&key, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    /// Forget a cached result.
    pub fn invalidate(&self, key: &K) {
        self.cache.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::future::join_all;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let op = Arc::new(IdempotentOperator::<&'static str, usize>::new(
            Duration::from_secs(300),
        ));
        let counter = Arc::new(AtomicUsize::new(0));

        let calls = (0..16).map(|_| {
            let op = Arc::clone(&op);
            let counter = Arc::clone(&counter);
            async move {
                op.execute("key", |_ctx| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, String>(counter.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await
            }
        });
        let results = join_all(calls).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap() == &1));
        assert!(op.gates.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn skip_caching_forces_re_execution() {
        let op = IdempotentOperator::<u32, u32>::new(Duration::from_secs(300));
        let counter = AtomicUsize::new(0);
        let runs = &counter;

        for _ in 0..2 {
            op.execute(1, |ctx| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                ctx.skip_caching();
                Ok::<_, ()>(7)
            })
            .await
            .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_not_cached() {
        let op = IdempotentOperator::<u32, u32>::new(Duration::from_secs(300));
        let first: Result<u32, &str> = op.execute(5, |_| async { Err("boom") }).await;
        assert!(first.is_err());
        let second: Result<u32, &str> = op.execute(5, |_| async { Ok(9) }).await;
        assert_eq!(second, Ok(9));
    }

    #[tokio::test(start_paused = true)]
    async fn result_expires_with_ttl() {
        let op = IdempotentOperator::<u32, u32>::new(Duration::from_secs(10));
        let counter = AtomicUsize::new(0);
        let runs = &counter;
        let run = || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(1)
        };

        op.execute(1, |_| run()).await.unwrap();
        op.execute(1, |_| run()).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        op.execute(1, |_| run()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
