//! Bounded fan-out over async work.
//!
//! At most `max_parallelism` transforms are in flight at once; when one
//! finishes the next queued input is admitted immediately. A limit of zero
//! is treated as one.

use std::future::Future;

use futures::stream::{self, Stream, StreamExt};

/// Transform every input and collect the results in input order.
pub async fn bounded_map<I, F, Fut>(items: I, max_parallelism: usize, f: F) -> Vec<Fut::Output>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future,
{
    stream::iter(items)
        .map(f)
        .buffered(max_parallelism.max(1))
        .collect()
        .await
}

/// Transform every input, yielding results lazily in completion order.
pub fn bounded_unordered<I, F, Fut>(
    items: I,
    max_parallelism: usize,
    f: F,
) -> impl Stream<Item = Fut::Output>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future,
{
    stream::iter(items)
        .map(f)
        .buffer_unordered(max_parallelism.max(1))
}
