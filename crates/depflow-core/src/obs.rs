//! Structured observability hooks for the update lifecycle.
//!
//! This module provides:
//! - Subscription-scoped tracing spans for `Instrument`-ed update futures
//! - Emission functions for enqueue, update start/skip/failure, frequency
//!   checks and worker restarts
//!
//! Every update event carries `subscription_id` and `build_id` so a single
//! subscription's history can be filtered out of the log stream.

use flow_state::{BuildId, SubscriptionId, UpdateFrequency, UpdateWorkItem};
use tracing::{error, info, info_span, warn, Span};

/// Span tagging everything inside an update with its subscription and build.
///
/// ```ignore
/// work().instrument(obs::subscription_span(sub_id, build_id)).await
/// ```
pub fn subscription_span(subscription_id: SubscriptionId, build_id: BuildId) -> Span {
    info_span!(
        "depflow.subscription",
        subscription_id = %subscription_id,
        build_id = %build_id,
    )
}

/// Emit event: a work item landed on the queue.
pub fn emit_work_enqueued(item: &UpdateWorkItem, message_id: &str) {
    info!(
        event = "work.enqueued",
        kind = item.kind(),
        message_id = %message_id,
        subscription_id = ?item.subscription_id().map(|s| s.to_string()),
    );
}

pub fn emit_update_started(subscription_id: SubscriptionId, build_id: BuildId) {
    info!(
        event = "update.started",
        subscription_id = %subscription_id,
        build_id = %build_id,
    );
}

/// Emit event: the build was not newer than the last applied one.
pub fn emit_update_skipped(
    subscription_id: SubscriptionId,
    build_id: BuildId,
    last_applied: Option<BuildId>,
) {
    info!(
        event = "update.skipped",
        subscription_id = %subscription_id,
        build_id = %build_id,
        last_applied = ?last_applied.map(|b| b.0),
    );
}

/// Emit event: an update failed (warning level).
pub fn emit_update_failed(
    subscription_id: SubscriptionId,
    build_id: BuildId,
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "update.failed",
        subscription_id = %subscription_id,
        build_id = %build_id,
        error = %error,
    );
}

pub fn emit_frequency_check_finished(
    frequency: UpdateFrequency,
    candidates: usize,
    enqueued: usize,
    failed: usize,
) {
    info!(
        event = "check.finished",
        frequency = %frequency,
        candidates = candidates,
        enqueued = enqueued,
        failed = failed,
    );
}

/// Emit event: a work item exhausted its deliveries (error level).
pub fn emit_work_abandoned(item: &UpdateWorkItem, deliveries: u32) {
    error!(
        event = "work.abandoned",
        kind = item.kind(),
        message_id = %item.message_id(),
        subscription_id = ?item.subscription_id().map(|s| s.to_string()),
        deliveries = deliveries,
    );
}

/// Emit event: a worker exited or panicked and is being restarted.
pub fn emit_worker_restarted(worker: usize, reason: &str, delayed_ms: u64) {
    warn!(
        event = "worker.restarted",
        worker = worker,
        reason = %reason,
        delayed_ms = delayed_ms,
    );
}
