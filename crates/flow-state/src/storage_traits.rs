//! Storage trait definitions for depflow
//!
//! These traits define the boundaries the orchestrator talks to:
//! - `Catalog`: subscriptions, builds, channels and reports
//! - `WorkQueue` / `QueueTransaction`: durable, transactional work handoff
//! - `BuildTimeProvider`: expected build durations per repository/branch
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{
    Build, BuildId, BuildIncoherence, BuildTime, Channel, ChannelId, DefaultChannel,
    LongestBuildPath, NewBuild, Subscription, SubscriptionId, UpdateFrequency, UpdateWorkItem,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// The subscription/build/channel store.
///
/// Guarantees:
/// - `set_last_applied_build` never moves a subscription backwards.
/// - `add_build_to_channel` and `add_incoherencies` are idempotent.
/// - `builds_on_channel` is ordered by `date_produced`, newest first.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Persist a new build and assign it the next id.
    async fn create_build(&self, build: NewBuild) -> StorageResult<Build>;

    /// Fetch a build. Returns `StorageError::BuildNotFound` if absent.
    async fn get_build(&self, id: BuildId) -> StorageResult<Build>;

    /// Associate a build with a channel. Returns `false` if it already was.
    async fn add_build_to_channel(
        &self,
        build_id: BuildId,
        channel_id: ChannelId,
    ) -> StorageResult<bool>;

    /// Attach incoherencies to a build, skipping ones already present.
    /// Returns the number newly recorded.
    async fn add_incoherencies(
        &self,
        build_id: BuildId,
        incoherencies: Vec<BuildIncoherence>,
    ) -> StorageResult<usize>;

    /// Builds from `repository` on `channel_id`, newest first.
    async fn builds_on_channel(
        &self,
        channel_id: ChannelId,
        repository: &str,
    ) -> StorageResult<Vec<Build>>;

    /// Latest build from `repository` on `channel_id`, if any.
    async fn latest_build_on_channel(
        &self,
        channel_id: ChannelId,
        repository: &str,
    ) -> StorageResult<Option<Build>> {
        Ok(self
            .builds_on_channel(channel_id, repository)
            .await?
            .into_iter()
            .next())
    }

    async fn channels(&self) -> StorageResult<Vec<Channel>>;

    /// Fetch a channel. Returns `StorageError::ChannelNotFound` if absent.
    async fn get_channel(&self, id: ChannelId) -> StorageResult<Channel>;

    async fn default_channels(&self) -> StorageResult<Vec<DefaultChannel>>;

    async fn subscriptions(&self) -> StorageResult<Vec<Subscription>>;

    /// Fetch a subscription. Returns `StorageError::SubscriptionNotFound` if absent.
    async fn get_subscription(&self, id: SubscriptionId) -> StorageResult<Subscription>;

    /// Enabled subscriptions with the given update frequency.
    async fn enabled_subscriptions_by_frequency(
        &self,
        frequency: UpdateFrequency,
    ) -> StorageResult<Vec<Subscription>>;

    /// Enabled subscriptions listening on `channel_id`.
    async fn enabled_subscriptions_on_channel(
        &self,
        channel_id: ChannelId,
    ) -> StorageResult<Vec<Subscription>>;

    /// Record `build_id` as the subscription's high-water mark.
    ///
    /// Returns `false` and leaves the subscription untouched when `build_id`
    /// is not strictly newer than the current mark.
    async fn set_last_applied_build(
        &self,
        subscription_id: SubscriptionId,
        build_id: BuildId,
    ) -> StorageResult<bool>;

    async fn record_longest_build_path(&self, path: LongestBuildPath) -> StorageResult<()>;

    /// Reports for a channel, oldest first.
    async fn longest_build_paths(&self, channel_id: ChannelId)
        -> StorageResult<Vec<LongestBuildPath>>;
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

/// Outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// An identical item is already pending; nothing was added.
    Deduplicated,
}

/// Durable work queue with at-least-once delivery.
///
/// Guarantees:
/// - A dequeued item stays invisible to other consumers until its
///   transaction is committed (item removed) or rolled back (item visible again).
/// - A transaction that is neither committed nor rolled back is eventually
///   redelivered.
/// - An item put back with `retry_later` waits behind every item already
///   visible and stays invisible until its delay has passed.
/// - Enqueueing an item equal to one still pending is a no-op.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, item: UpdateWorkItem) -> StorageResult<EnqueueOutcome>;

    /// Claim the next visible item, or `None` if the queue is idle.
    async fn try_dequeue(&self) -> StorageResult<Option<Box<dyn QueueTransaction>>>;

    /// Items not yet committed, including ones currently claimed.
    async fn pending(&self) -> StorageResult<usize>;
}

/// A claimed work item. Dropping it without `commit` implies rollback.
#[async_trait]
pub trait QueueTransaction: Send {
    fn item(&self) -> &UpdateWorkItem;

    /// How many times this item has been handed out, including this one.
    fn delivery_count(&self) -> u32;

    /// Remove the item permanently.
    async fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Make the item visible again for redelivery.
    async fn rollback(self: Box<Self>) -> StorageResult<()>;

    /// Release the item to the back of the queue, hidden for `delay`.
    async fn retry_later(self: Box<Self>, delay: Duration) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// BuildTimeProvider
// ---------------------------------------------------------------------------

/// Source of expected official and PR build durations.
#[async_trait]
pub trait BuildTimeProvider: Send + Sync {
    /// Expected durations for the repository/branch behind `default_channel`,
    /// looking back `days` days. Unknown pairs yield zero durations.
    async fn build_time(
        &self,
        default_channel: &DefaultChannel,
        days: u32,
    ) -> StorageResult<BuildTime>;
}
