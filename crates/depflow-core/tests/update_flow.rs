use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use depflow_core::orchestrator::PoolConfig;
use depflow_core::{
    BuildIngestor, Dispatcher, LogOnlyAction, SubscriptionSerializer, SubscriptionUpdater,
    UpdateScheduler, UpdateWorkHandler, WorkerPool,
};
use flow_state::fakes::{MemoryCatalog, MemoryWorkQueue};
use flow_state::{
    Build, BuildId, Catalog, Channel, ChannelId, DefaultChannel, NewBuild, RepoAddress,
    Subscription, SubscriptionId, SubscriptionPolicy, UpdateFrequency, UpdateWorkItem, WorkQueue,
};

const RUNTIME: &str = "https://github.com/org/runtime";
const SDK: &str = "https://github.com/org/sdk";

fn channel_catalog() -> Arc<MemoryCatalog> {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_channel(Channel {
        id: ChannelId(7),
        name: ".NET 10".into(),
        classification: "product".into(),
    });
    catalog.insert_default_channel(DefaultChannel {
        id: 1,
        repository: RUNTIME.into(),
        branch: "main".into(),
        channel_id: ChannelId(7),
        enabled: true,
        pipelines: None,
    });
    catalog
}

fn subscription(frequency: UpdateFrequency, last_applied: Option<u64>) -> Subscription {
    Subscription {
        id: SubscriptionId::new(),
        channel_id: ChannelId(7),
        source_repository: RUNTIME.into(),
        target_repository: SDK.into(),
        target_branch: "main".into(),
        enabled: true,
        policy: SubscriptionPolicy {
            update_frequency: frequency,
            batchable: false,
        },
        last_applied_build_id: last_applied.map(BuildId),
    }
}

fn runtime_build(id: u64) -> Build {
    Build {
        id: BuildId(id),
        repository: RepoAddress::github(RUNTIME),
        branch: "main".into(),
        commit: format!("c{id}"),
        date_produced: Utc::now(),
        channels: vec![],
        assets: vec![],
        dependencies: vec![],
        incoherencies: vec![],
    }
}

#[tokio::test]
async fn daily_check_enqueues_the_newer_build_once() {
    depflow_core::init_tracing(false, tracing::Level::DEBUG);
    let catalog = channel_catalog();
    let sub = subscription(UpdateFrequency::EveryDay, Some(100));
    catalog.insert_subscription(sub.clone());
    catalog.insert_build(runtime_build(100));
    catalog.insert_build(runtime_build(101));
    for id in [100, 101] {
        catalog
            .add_build_to_channel(BuildId(id), ChannelId(7))
            .await
            .unwrap();
    }

    let queue = MemoryWorkQueue::new();
    let scheduler = UpdateScheduler::new(
        catalog.clone(),
        Dispatcher::new(Arc::new(queue.clone())),
        4,
    );

    let first = scheduler
        .check_frequency(UpdateFrequency::EveryDay)
        .await
        .unwrap();
    assert_eq!(first.candidates, 1);
    assert_eq!(first.enqueued, 1);
    assert_eq!(
        queue.ready_items(),
        vec![UpdateWorkItem::SubscriptionUpdate {
            subscription_id: sub.id,
            build_id: BuildId(101),
        }]
    );

    // No new build has landed: the pending item absorbs the repeat.
    let second = scheduler
        .check_frequency(UpdateFrequency::EveryDay)
        .await
        .unwrap();
    assert_eq!(second.enqueued, 0);
    assert_eq!(second.unchanged, 1);
    assert_eq!(queue.pending().await.unwrap(), 1);

    // Other tiers are untouched.
    let weekly = scheduler
        .check_frequency(UpdateFrequency::EveryWeek)
        .await
        .unwrap();
    assert_eq!(weekly.candidates, 0);
}

#[tokio::test]
async fn applied_subscription_is_not_rescheduled() {
    let catalog = channel_catalog();
    let sub = subscription(UpdateFrequency::TwiceDaily, Some(100));
    catalog.insert_subscription(sub.clone());
    catalog.insert_build(runtime_build(101));
    catalog
        .add_build_to_channel(BuildId(101), ChannelId(7))
        .await
        .unwrap();
    catalog
        .set_last_applied_build(sub.id, BuildId(101))
        .await
        .unwrap();

    let queue = MemoryWorkQueue::new();
    let scheduler = UpdateScheduler::new(
        catalog.clone(),
        Dispatcher::new(Arc::new(queue.clone())),
        4,
    );
    let summary = scheduler
        .check_frequency(UpdateFrequency::TwiceDaily)
        .await
        .unwrap();
    assert_eq!(summary.enqueued, 0);
    assert_eq!(summary.unchanged, 1);
    assert!(queue.ready_items().is_empty());
}

#[tokio::test]
async fn ingested_build_flows_through_the_pool_to_the_subscription() {
    let catalog = channel_catalog();
    let every_build = subscription(UpdateFrequency::EveryBuild, None);
    let daily = subscription(UpdateFrequency::EveryDay, None);
    catalog.insert_subscription(every_build.clone());
    catalog.insert_subscription(daily.clone());

    let queue: Arc<dyn WorkQueue> = Arc::new(MemoryWorkQueue::new());
    let dispatcher = Dispatcher::new(Arc::clone(&queue));
    let scheduler = Arc::new(UpdateScheduler::new(
        catalog.clone(),
        dispatcher.clone(),
        4,
    ));
    let updater = Arc::new(SubscriptionUpdater::new(
        catalog.clone(),
        Arc::new(LogOnlyAction),
    ));
    let handler = Arc::new(UpdateWorkHandler::new(
        scheduler,
        updater,
        Arc::new(SubscriptionSerializer::new()),
        Duration::from_secs(60),
    ));
    let pool = WorkerPool::new(
        &dispatcher,
        handler,
        PoolConfig {
            workers: 2,
            idle_poll: Duration::from_millis(20),
            restart_cooldown: Duration::from_millis(50),
            ..PoolConfig::default()
        },
    );
    let shutdown = pool.shutdown_handle();
    let running = tokio::spawn(pool.run());

    let ingestor = BuildIngestor::new(catalog.clone(), dispatcher.clone());
    let build = ingestor
        .create_build(
            NewBuild {
                repository: RepoAddress::github(RUNTIME),
                branch: "refs/heads/main".into(),
                commit: "abc123".into(),
                date_produced: Utc::now(),
                assets: vec![],
                dependencies: vec![],
            },
            None,
        )
        .await
        .unwrap();
    assert!(build.is_on_channel(ChannelId(7)));

    let applied = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let sub = catalog.get_subscription(every_build.id).await.unwrap();
            if sub.last_applied_build_id == Some(build.id) && queue.pending().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(applied.is_ok(), "every-build subscription never advanced");

    shutdown.set();
    running.await.unwrap();

    // Daily subscriptions wait for their timer.
    let daily = catalog.get_subscription(daily.id).await.unwrap();
    assert_eq!(daily.last_applied_build_id, None);
}
