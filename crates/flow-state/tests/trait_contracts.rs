//! Trait contract tests for Catalog and WorkQueue.
//!
//! Queue contracts run against both the in-memory fake and the SurrealDB
//! queue (on `mem://`). Any conforming implementation must pass these.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use flow_state::fakes::MemoryCatalog;
use flow_state::fakes::MemoryWorkQueue;
use flow_state::*;
use uuid::Uuid;

// ===========================================================================
// Helpers
// ===========================================================================

const REPO: &str = "https://github.com/org/runtime";

fn update(sub: u128, build: u64) -> UpdateWorkItem {
    UpdateWorkItem::SubscriptionUpdate {
        subscription_id: SubscriptionId(Uuid::from_u128(sub)),
        build_id: BuildId(build),
    }
}

fn channel(id: u32) -> Channel {
    Channel {
        id: ChannelId(id),
        name: format!("channel-{id}"),
        classification: "product".into(),
    }
}

fn new_build(day: u32) -> NewBuild {
    NewBuild {
        repository: RepoAddress::github(REPO),
        branch: "main".into(),
        commit: format!("sha-{day}"),
        date_produced: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
        assets: vec![],
        dependencies: vec![],
    }
}

async fn surreal_queue(visibility: Duration) -> SurrealWorkQueue {
    SurrealWorkQueue::in_memory(visibility).await.unwrap()
}

// ===========================================================================
// WorkQueue contract tests
// ===========================================================================

async fn assert_fifo_and_commit_removes(queue: &dyn WorkQueue) {
    queue.enqueue(update(1, 10)).await.unwrap();
    queue.enqueue(update(2, 20)).await.unwrap();
    assert_eq!(queue.pending().await.unwrap(), 2);

    let tx = queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(tx.item(), &update(1, 10));
    assert_eq!(tx.delivery_count(), 1);
    tx.commit().await.unwrap();

    let tx = queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(tx.item(), &update(2, 20));
    tx.commit().await.unwrap();

    assert!(queue.try_dequeue().await.unwrap().is_none());
    assert_eq!(queue.pending().await.unwrap(), 0);
}

async fn assert_rollback_redelivers(queue: &dyn WorkQueue) {
    queue.enqueue(update(3, 30)).await.unwrap();

    let tx = queue.try_dequeue().await.unwrap().unwrap();
    // Claimed items are invisible to other consumers.
    assert!(queue.try_dequeue().await.unwrap().is_none());
    tx.rollback().await.unwrap();

    let tx = queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(tx.item(), &update(3, 30));
    assert_eq!(tx.delivery_count(), 2);
    tx.commit().await.unwrap();
}

async fn assert_pending_duplicates_collapse(queue: &dyn WorkQueue) {
    assert_eq!(
        queue.enqueue(update(4, 40)).await.unwrap(),
        EnqueueOutcome::Enqueued
    );
    assert_eq!(
        queue.enqueue(update(4, 40)).await.unwrap(),
        EnqueueOutcome::Deduplicated
    );
    assert_eq!(queue.pending().await.unwrap(), 1);

    let tx = queue.try_dequeue().await.unwrap().unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        queue.enqueue(update(4, 40)).await.unwrap(),
        EnqueueOutcome::Enqueued
    );
}

async fn assert_retry_later_defers_behind_waiting_items(queue: &dyn WorkQueue) {
    queue.enqueue(update(7, 70)).await.unwrap();
    queue.enqueue(update(8, 80)).await.unwrap();

    let tx = queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(tx.item(), &update(7, 70));
    tx.retry_later(Duration::ZERO).await.unwrap();

    let tx = queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(tx.item(), &update(8, 80));
    tx.retry_later(Duration::from_secs(60)).await.unwrap();

    let tx = queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(tx.item(), &update(7, 70));
    assert_eq!(tx.delivery_count(), 2);
    tx.commit().await.unwrap();

    // The deferred item is hidden but still pending, so still deduplicated.
    assert!(queue.try_dequeue().await.unwrap().is_none());
    assert_eq!(queue.pending().await.unwrap(), 1);
    assert_eq!(
        queue.enqueue(update(8, 80)).await.unwrap(),
        EnqueueOutcome::Deduplicated
    );
}

#[tokio::test]
async fn memory_queue_fifo_and_commit() {
    assert_fifo_and_commit_removes(&MemoryWorkQueue::new()).await;
}

#[tokio::test]
async fn memory_queue_rollback_redelivers() {
    assert_rollback_redelivers(&MemoryWorkQueue::new()).await;
}

#[tokio::test]
async fn memory_queue_collapses_pending_duplicates() {
    assert_pending_duplicates_collapse(&MemoryWorkQueue::new()).await;
}

#[tokio::test]
async fn memory_queue_retry_later_defers_behind_waiting_items() {
    assert_retry_later_defers_behind_waiting_items(&MemoryWorkQueue::new()).await;
}

#[tokio::test]
async fn surreal_queue_fifo_and_commit() {
    let queue = surreal_queue(Duration::from_secs(60)).await;
    assert_fifo_and_commit_removes(&queue).await;
}

#[tokio::test]
async fn surreal_queue_rollback_redelivers() {
    let queue = surreal_queue(Duration::from_secs(60)).await;
    assert_rollback_redelivers(&queue).await;
}

#[tokio::test]
async fn surreal_queue_collapses_pending_duplicates() {
    let queue = surreal_queue(Duration::from_secs(60)).await;
    assert_pending_duplicates_collapse(&queue).await;
}

#[tokio::test]
async fn surreal_queue_retry_later_defers_behind_waiting_items() {
    let queue = surreal_queue(Duration::from_secs(60)).await;
    assert_retry_later_defers_behind_waiting_items(&queue).await;
}

#[tokio::test]
async fn surreal_queue_redelivers_after_lease_expiry() {
    let queue = surreal_queue(Duration::from_millis(50)).await;
    queue.enqueue(update(5, 50)).await.unwrap();

    let abandoned = queue.try_dequeue().await.unwrap().unwrap();
    // Simulate a consumer that stalls past its lease.
    std::mem::forget(abandoned);
    tokio::time::sleep(Duration::from_millis(120)).await;

    let tx = queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(tx.item(), &update(5, 50));
    assert_eq!(tx.delivery_count(), 2);
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn surreal_queue_commit_after_lost_lease_conflicts() {
    let queue = surreal_queue(Duration::from_millis(50)).await;
    queue.enqueue(update(6, 60)).await.unwrap();

    let stale = queue.try_dequeue().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    let fresh = queue.try_dequeue().await.unwrap().unwrap();

    let err = stale.commit().await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
    assert!(err.is_transient());
    fresh.commit().await.unwrap();
}

// ===========================================================================
// Catalog contract tests
// ===========================================================================

#[tokio::test]
async fn catalog_create_build_assigns_increasing_ids() {
    let catalog = MemoryCatalog::new();
    let a = catalog.create_build(new_build(1)).await.unwrap();
    let b = catalog.create_build(new_build(2)).await.unwrap();
    assert!(b.id > a.id);
    assert_eq!(catalog.get_build(a.id).await.unwrap().commit, "sha-1");
}

#[tokio::test]
async fn catalog_get_build_not_found() {
    let catalog = MemoryCatalog::new();
    let err = catalog.get_build(BuildId(404)).await.unwrap_err();
    assert!(matches!(err, StorageError::BuildNotFound(BuildId(404))));
    assert!(err.is_not_found());
}

#[tokio::test]
async fn catalog_builds_on_channel_newest_first() {
    let catalog = MemoryCatalog::new();
    catalog.insert_channel(channel(1));
    catalog.insert_channel(channel(2));

    let older = catalog.create_build(new_build(1)).await.unwrap();
    let newer = catalog.create_build(new_build(5)).await.unwrap();
    let other = catalog.create_build(new_build(9)).await.unwrap();
    catalog.add_build_to_channel(older.id, ChannelId(1)).await.unwrap();
    catalog.add_build_to_channel(newer.id, ChannelId(1)).await.unwrap();
    catalog.add_build_to_channel(other.id, ChannelId(2)).await.unwrap();

    let ids: Vec<BuildId> = catalog
        .builds_on_channel(ChannelId(1), REPO)
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(ids, vec![newer.id, older.id]);

    let latest = catalog
        .latest_build_on_channel(ChannelId(1), REPO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, newer.id);

    assert!(catalog
        .latest_build_on_channel(ChannelId(1), "https://github.com/org/other")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn catalog_channel_assignment_is_idempotent() {
    let catalog = MemoryCatalog::new();
    catalog.insert_channel(channel(1));
    let build = catalog.create_build(new_build(1)).await.unwrap();

    assert!(catalog.add_build_to_channel(build.id, ChannelId(1)).await.unwrap());
    assert!(!catalog.add_build_to_channel(build.id, ChannelId(1)).await.unwrap());
    assert_eq!(catalog.get_build(build.id).await.unwrap().channels.len(), 1);
}

#[tokio::test]
async fn catalog_rejects_unknown_channel() {
    let catalog = MemoryCatalog::new();
    let build = catalog.create_build(new_build(1)).await.unwrap();
    let err = catalog
        .add_build_to_channel(build.id, ChannelId(77))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ChannelNotFound(ChannelId(77))));
}

#[tokio::test]
async fn catalog_snapshot_restores_contents() {
    let catalog = MemoryCatalog::new();
    catalog.insert_channel(channel(3));
    let build = catalog.create_build(new_build(2)).await.unwrap();
    catalog.add_build_to_channel(build.id, ChannelId(3)).await.unwrap();

    let json = serde_json::to_string(&catalog.snapshot()).unwrap();
    let restored = MemoryCatalog::from_snapshot(serde_json::from_str(&json).unwrap());

    assert_eq!(restored.snapshot(), catalog.snapshot());
    let next = restored.create_build(new_build(3)).await.unwrap();
    assert!(next.id > build.id);
}
