//! Concurrency primitives shared by the orchestrator.
//!
//! - [`AsyncAutoResetEvent`] / [`AsyncManualResetEvent`]: async wait signals
//! - [`ExpiringCache`]: concurrent map with TTL and amortized sweeping
//! - [`IdempotentOperator`]: single-flight execution per key
//! - [`bounded_map`] / [`bounded_unordered`]: capped fan-out over async work

pub mod expiring_cache;
pub mod fanout;
pub mod idempotent;
pub mod signal;

pub use expiring_cache::ExpiringCache;
pub use fanout::{bounded_map, bounded_unordered};
pub use idempotent::{IdempotentOperator, OperationContext};
pub use signal::{AsyncAutoResetEvent, AsyncManualResetEvent};
