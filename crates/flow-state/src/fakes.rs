//! In-memory fakes for storage traits
//!
//! Provides `MemoryCatalog`, `MemoryWorkQueue`, and `StaticBuildTimes`
//! that satisfy the trait contracts without any external dependencies.
//! The CLI also uses `MemoryCatalog` to evaluate JSON catalog snapshots.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::StorageError;
use crate::model::*;
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryCatalog
// ---------------------------------------------------------------------------

/// Serializable catalog contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub default_channels: Vec<DefaultChannel>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub builds: Vec<Build>,
}

#[derive(Debug, Default)]
struct CatalogState {
    next_build_id: u64,
    builds: BTreeMap<BuildId, Build>,
    channels: BTreeMap<ChannelId, Channel>,
    default_channels: Vec<DefaultChannel>,
    subscriptions: Vec<Subscription>,
    longest_paths: Vec<LongestBuildPath>,
}

/// In-memory catalog. Subscriptions keep insertion order.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        let catalog = Self::new();
        for channel in snapshot.channels {
            catalog.insert_channel(channel);
        }
        for dc in snapshot.default_channels {
            catalog.insert_default_channel(dc);
        }
        for sub in snapshot.subscriptions {
            catalog.insert_subscription(sub);
        }
        for build in snapshot.builds {
            catalog.insert_build(build);
        }
        catalog
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        let state = lock(&self.state);
        CatalogSnapshot {
            channels: state.channels.values().cloned().collect(),
            default_channels: state.default_channels.clone(),
            subscriptions: state.subscriptions.clone(),
            builds: state.builds.values().cloned().collect(),
        }
    }

    pub fn insert_channel(&self, channel: Channel) {
        lock(&self.state).channels.insert(channel.id, channel);
    }

    pub fn insert_default_channel(&self, default_channel: DefaultChannel) {
        lock(&self.state).default_channels.push(default_channel);
    }

    /// Insert or replace a subscription.
    pub fn insert_subscription(&self, subscription: Subscription) {
        let mut state = lock(&self.state);
        match state
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription.id)
        {
            Some(existing) => *existing = subscription,
            None => state.subscriptions.push(subscription),
        }
    }

    /// Insert a build with a caller-chosen id. Later `create_build` calls
    /// allocate ids above it.
    pub fn insert_build(&self, build: Build) {
        let mut state = lock(&self.state);
        state.next_build_id = state.next_build_id.max(build.id.0);
        state.builds.insert(build.id, build);
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn create_build(&self, build: NewBuild) -> StorageResult<Build> {
        let mut state = lock(&self.state);
        state.next_build_id += 1;
        let record = Build {
            id: BuildId(state.next_build_id),
            repository: build.repository,
            branch: build.branch,
            commit: build.commit,
            date_produced: build.date_produced,
            channels: Vec::new(),
            assets: build.assets,
            dependencies: build.dependencies,
            incoherencies: Vec::new(),
        };
        state.builds.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_build(&self, id: BuildId) -> StorageResult<Build> {
        lock(&self.state)
            .builds
            .get(&id)
            .cloned()
            .ok_or(StorageError::BuildNotFound(id))
    }

    async fn add_build_to_channel(
        &self,
        build_id: BuildId,
        channel_id: ChannelId,
    ) -> StorageResult<bool> {
        let mut state = lock(&self.state);
        if !state.channels.contains_key(&channel_id) {
            return Err(StorageError::ChannelNotFound(channel_id));
        }
        let build = state
            .builds
            .get_mut(&build_id)
            .ok_or(StorageError::BuildNotFound(build_id))?;
        Ok(build.add_channel(channel_id, Utc::now()))
    }

    async fn add_incoherencies(
        &self,
        build_id: BuildId,
        incoherencies: Vec<BuildIncoherence>,
    ) -> StorageResult<usize> {
        let mut state = lock(&self.state);
        let build = state
            .builds
            .get_mut(&build_id)
            .ok_or(StorageError::BuildNotFound(build_id))?;
        Ok(build.add_incoherencies(incoherencies))
    }

    async fn builds_on_channel(
        &self,
        channel_id: ChannelId,
        repository: &str,
    ) -> StorageResult<Vec<Build>> {
        let state = lock(&self.state);
        let mut builds: Vec<Build> = state
            .builds
            .values()
            .filter(|b| b.is_on_channel(channel_id) && b.repository.matches(repository))
            .cloned()
            .collect();
        builds.sort_by(|a, b| {
            b.date_produced
                .cmp(&a.date_produced)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(builds)
    }

    async fn channels(&self) -> StorageResult<Vec<Channel>> {
        Ok(lock(&self.state).channels.values().cloned().collect())
    }

    async fn get_channel(&self, id: ChannelId) -> StorageResult<Channel> {
        lock(&self.state)
            .channels
            .get(&id)
            .cloned()
            .ok_or(StorageError::ChannelNotFound(id))
    }

    async fn default_channels(&self) -> StorageResult<Vec<DefaultChannel>> {
        Ok(lock(&self.state).default_channels.clone())
    }

    async fn subscriptions(&self) -> StorageResult<Vec<Subscription>> {
        Ok(lock(&self.state).subscriptions.clone())
    }

    async fn get_subscription(&self, id: SubscriptionId) -> StorageResult<Subscription> {
        lock(&self.state)
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(StorageError::SubscriptionNotFound(id))
    }

    async fn enabled_subscriptions_by_frequency(
        &self,
        frequency: UpdateFrequency,
    ) -> StorageResult<Vec<Subscription>> {
        Ok(lock(&self.state)
            .subscriptions
            .iter()
            .filter(|s| s.enabled && s.frequency() == frequency)
            .cloned()
            .collect())
    }

    async fn enabled_subscriptions_on_channel(
        &self,
        channel_id: ChannelId,
    ) -> StorageResult<Vec<Subscription>> {
        Ok(lock(&self.state)
            .subscriptions
            .iter()
            .filter(|s| s.enabled && s.channel_id == channel_id)
            .cloned()
            .collect())
    }

    async fn set_last_applied_build(
        &self,
        subscription_id: SubscriptionId,
        build_id: BuildId,
    ) -> StorageResult<bool> {
        let mut state = lock(&self.state);
        let sub = state
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
            .ok_or(StorageError::SubscriptionNotFound(subscription_id))?;
        if !sub.is_newer(build_id) {
            return Ok(false);
        }
        sub.last_applied_build_id = Some(build_id);
        Ok(true)
    }

    async fn record_longest_build_path(&self, path: LongestBuildPath) -> StorageResult<()> {
        lock(&self.state).longest_paths.push(path);
        Ok(())
    }

    async fn longest_build_paths(
        &self,
        channel_id: ChannelId,
    ) -> StorageResult<Vec<LongestBuildPath>> {
        Ok(lock(&self.state)
            .longest_paths
            .iter()
            .filter(|p| p.channel_id == channel_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryWorkQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Delivery {
    message_id: String,
    item: UpdateWorkItem,
    deliveries: u32,
    /// Hidden from `try_dequeue` until this instant.
    not_before: Option<Instant>,
}

impl Delivery {
    fn is_visible(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    /// Message ids that are ready or claimed.
    pending: HashSet<String>,
}

/// Single-process queue. A transaction dropped or rolled back without commit
/// puts its item back at the head of the queue; `retry_later` puts it at the
/// tail.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items currently visible to `try_dequeue`, head first.
    pub fn ready_items(&self) -> Vec<UpdateWorkItem> {
        let now = Instant::now();
        lock(&self.state)
            .ready
            .iter()
            .filter(|d| d.is_visible(now))
            .map(|d| d.item.clone())
            .collect()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, item: UpdateWorkItem) -> StorageResult<EnqueueOutcome> {
        let message_id = item.message_id();
        let mut state = lock(&self.state);
        if !state.pending.insert(message_id.clone()) {
            return Ok(EnqueueOutcome::Deduplicated);
        }
        state.ready.push_back(Delivery {
            message_id,
            item,
            deliveries: 0,
            not_before: None,
        });
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn try_dequeue(&self) -> StorageResult<Option<Box<dyn QueueTransaction>>> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let Some(at) = state.ready.iter().position(|d| d.is_visible(now)) else {
            return Ok(None);
        };
        let Some(mut delivery) = state.ready.remove(at) else {
            return Ok(None);
        };
        delivery.deliveries += 1;
        delivery.not_before = None;
        Ok(Some(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            delivery,
            open: true,
        })))
    }

    async fn pending(&self) -> StorageResult<usize> {
        Ok(lock(&self.state).pending.len())
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<QueueState>>,
    delivery: Delivery,
    open: bool,
}

impl MemoryTransaction {
    fn requeue(&mut self) {
        if std::mem::take(&mut self.open) {
            lock(&self.state).ready.push_front(self.delivery.clone());
        }
    }
}

#[async_trait]
impl QueueTransaction for MemoryTransaction {
    fn item(&self) -> &UpdateWorkItem {
        &self.delivery.item
    }

    fn delivery_count(&self) -> u32 {
        self.delivery.deliveries
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let mut this = self;
        if std::mem::take(&mut this.open) {
            lock(&this.state).pending.remove(&this.delivery.message_id);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        let mut this = self;
        this.requeue();
        Ok(())
    }

    async fn retry_later(self: Box<Self>, delay: Duration) -> StorageResult<()> {
        let mut this = self;
        if std::mem::take(&mut this.open) {
            let mut delivery = this.delivery.clone();
            delivery.not_before = Some(Instant::now() + delay);
            lock(&this.state).ready.push_back(delivery);
        }
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.requeue();
    }
}

// ---------------------------------------------------------------------------
// StaticBuildTimes
// ---------------------------------------------------------------------------

/// Fixed build durations keyed by `repository@branch` (case-insensitive).
#[derive(Debug, Default)]
pub struct StaticBuildTimes {
    times: HashMap<String, BuildTime>,
}

impl StaticBuildTimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, repository: &str, branch: &str, official: f64, pr: f64) -> Self {
        self.times.insert(
            repo_branch_key(repository, branch),
            BuildTime {
                official_build_minutes: official,
                pr_build_minutes: pr,
            },
        );
        self
    }
}

#[async_trait]
impl BuildTimeProvider for StaticBuildTimes {
    async fn build_time(
        &self,
        default_channel: &DefaultChannel,
        _days: u32,
    ) -> StorageResult<BuildTime> {
        Ok(self
            .times
            .get(&repo_branch_key(
                &default_channel.repository,
                &default_channel.branch,
            ))
            .copied()
            .unwrap_or_default())
    }
}
