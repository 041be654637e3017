//! Build ingestion: persist, assign channels, annotate, announce.

use std::sync::Arc;

use flow_state::{Build, BuildId, Catalog, ChannelId, NewBuild, UpdateWorkItem};
use tracing::{info, warn};

use super::dispatcher::Dispatcher;
use crate::error::{FlowError, FlowResult};
use crate::flow::{CoherencyAnalyzer, ManifestReader};

fn normalize_branch(branch: &str) -> &str {
    branch.strip_prefix("refs/heads/").unwrap_or(branch)
}

pub struct BuildIngestor {
    catalog: Arc<dyn Catalog>,
    dispatcher: Dispatcher,
    manifests: Option<Arc<dyn ManifestReader>>,
    max_parallelism: usize,
}

impl BuildIngestor {
    pub fn new(catalog: Arc<dyn Catalog>, dispatcher: Dispatcher) -> Self {
        Self {
            catalog,
            dispatcher,
            manifests: None,
            max_parallelism: 8,
        }
    }

    /// Compute incoherencies for every ingested build.
    pub fn with_manifests(mut self, reader: Arc<dyn ManifestReader>, max_parallelism: usize) -> Self {
        self.manifests = Some(reader);
        self.max_parallelism = max_parallelism;
        self
    }

    /// Persist `new`, then [`publish_build`](Self::publish_build) it.
    ///
    /// A failure after the build is stored comes back as
    /// [`FlowError::BuildNotPublished`] carrying the new id.
    pub async fn create_build(&self, new: NewBuild, channel: Option<ChannelId>) -> FlowResult<Build> {
        let build = self.catalog.create_build(new).await?;
        self.publish_build(build.id, channel).await.map_err(|e| {
            warn!(build_id = %build.id, error = %e, "build stored but not published");
            FlowError::BuildNotPublished {
                build_id: build.id,
                source: Box::new(e),
            }
        })
    }

    /// Place a stored build on `channel` plus every enabled default channel
    /// of its repository and branch, announce it with one `BuildAdded` per
    /// channel it is on, then record its incoherencies.
    ///
    /// Repeatable: channel assignment and incoherency recording are
    /// idempotent, and an announcement still pending is deduplicated.
    pub async fn publish_build(&self, build_id: BuildId, channel: Option<ChannelId>) -> FlowResult<Build> {
        let build = self.catalog.get_build(build_id).await?;

        let mut channels: Vec<ChannelId> = build.channels.iter().map(|c| c.channel_id).collect();
        channels.extend(channel);
        let branch = normalize_branch(&build.branch);
        for dc in self.catalog.default_channels().await? {
            if dc.enabled
                && build.repository.matches(&dc.repository)
                && normalize_branch(&dc.branch) == branch
            {
                channels.push(dc.channel_id);
            }
        }
        channels.sort();
        channels.dedup();

        for channel_id in &channels {
            self.catalog.add_build_to_channel(build.id, *channel_id).await?;
        }
        for channel_id in &channels {
            self.dispatcher
                .enqueue(UpdateWorkItem::BuildAdded {
                    build_id: build.id,
                    channel_id: *channel_id,
                })
                .await?;
        }

        if let Some(reader) = &self.manifests {
            let analyzer = CoherencyAnalyzer::new(reader.as_ref(), self.max_parallelism);
            match analyzer.analyze(&build.repository.url(), &build.commit).await {
                Ok(report) if !report.is_coherent() => {
                    let added = self
                        .catalog
                        .add_incoherencies(build.id, report.incoherencies)
                        .await?;
                    warn!(build_id = %build.id, incoherencies = added, "build has incoherent dependencies");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(build_id = %build.id, error = %e, "coherency analysis failed");
                }
            }
        }

        info!(
            build_id = %build.id,
            repository = %build.repository,
            commit = %build.commit,
            channels = channels.len(),
            "build published"
        );
        Ok(self.catalog.get_build(build.id).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use flow_state::fakes::{MemoryCatalog, MemoryWorkQueue};
    use flow_state::{
        Channel, DefaultChannel, EnqueueOutcome, QueueTransaction, RepoAddress, StorageError,
        StorageResult, WorkQueue,
    };

    use super::*;
    use crate::error::ErrorClass;
    use crate::flow::{ManifestDependency, StaticManifests};

    const CORE: &str = "https://github.com/org/core";

    fn catalog() -> Arc<MemoryCatalog> {
        let catalog = Arc::new(MemoryCatalog::new());
        for (id, name) in [(1, ".NET 9"), (2, ".NET 9 Internal")] {
            catalog.insert_channel(Channel {
                id: ChannelId(id),
                name: name.into(),
                classification: "product".into(),
            });
        }
        catalog.insert_default_channel(DefaultChannel {
            id: 1,
            repository: CORE.into(),
            branch: "main".into(),
            channel_id: ChannelId(1),
            enabled: true,
            pipelines: None,
        });
        catalog.insert_default_channel(DefaultChannel {
            id: 2,
            repository: CORE.into(),
            branch: "main".into(),
            channel_id: ChannelId(2),
            enabled: false,
            pipelines: None,
        });
        catalog
    }

    fn new_build(commit: &str) -> NewBuild {
        NewBuild {
            repository: RepoAddress::github(CORE),
            branch: "refs/heads/main".into(),
            commit: commit.into(),
            date_produced: Utc::now(),
            assets: vec![],
            dependencies: vec![],
        }
    }

    #[tokio::test]
    async fn assigns_enabled_default_channels_and_announces() {
        let catalog = catalog();
        let queue = MemoryWorkQueue::new();
        let ingestor = BuildIngestor::new(catalog.clone(), Dispatcher::new(Arc::new(queue.clone())));

        let build = ingestor.create_build(new_build("abc"), None).await.unwrap();
        assert!(build.is_on_channel(ChannelId(1)));
        assert!(!build.is_on_channel(ChannelId(2)));
        assert_eq!(
            queue.ready_items(),
            vec![UpdateWorkItem::BuildAdded {
                build_id: build.id,
                channel_id: ChannelId(1),
            }]
        );
    }

    #[tokio::test]
    async fn explicit_channel_is_added_once() {
        let catalog = catalog();
        let queue = MemoryWorkQueue::new();
        let ingestor = BuildIngestor::new(catalog.clone(), Dispatcher::new(Arc::new(queue.clone())));

        let build = ingestor
            .create_build(new_build("abc"), Some(ChannelId(1)))
            .await
            .unwrap();
        assert_eq!(build.channels.len(), 1);
        assert_eq!(queue.ready_items().len(), 1);
    }

    /// Rejects the first `failures` enqueues.
    struct FlakyQueue {
        inner: MemoryWorkQueue,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl WorkQueue for FlakyQueue {
        async fn enqueue(&self, item: UpdateWorkItem) -> StorageResult<EnqueueOutcome> {
            let refused = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(StorageError::Backend("queue offline".into()));
            }
            self.inner.enqueue(item).await
        }

        async fn try_dequeue(&self) -> StorageResult<Option<Box<dyn QueueTransaction>>> {
            self.inner.try_dequeue().await
        }

        async fn pending(&self) -> StorageResult<usize> {
            self.inner.pending().await
        }
    }

    #[tokio::test]
    async fn failed_announcement_is_recovered_by_publishing_again() {
        let catalog = catalog();
        let queue = MemoryWorkQueue::new();
        let flaky = Arc::new(FlakyQueue {
            inner: queue.clone(),
            failures: AtomicUsize::new(1),
        });
        let ingestor = BuildIngestor::new(catalog.clone(), Dispatcher::new(flaky));

        let err = ingestor.create_build(new_build("abc"), None).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
        let build_id = match &err {
            FlowError::BuildNotPublished { build_id, .. } => *build_id,
            other => panic!("unexpected error: {other}"),
        };
        let stored = catalog.get_build(build_id).await.unwrap();
        assert!(stored.is_on_channel(ChannelId(1)));
        assert!(queue.ready_items().is_empty());

        // The channel is already assigned; the announcement still goes out.
        ingestor.publish_build(build_id, None).await.unwrap();
        assert_eq!(
            queue.ready_items(),
            vec![UpdateWorkItem::BuildAdded {
                build_id,
                channel_id: ChannelId(1),
            }]
        );

        // A second retry while that is pending adds nothing.
        ingestor.publish_build(build_id, None).await.unwrap();
        assert_eq!(queue.ready_items().len(), 1);
    }

    #[tokio::test]
    async fn incoherencies_are_attached() {
        let catalog = catalog();
        let queue = MemoryWorkQueue::new();
        let dep = |version: &str, commit: &str| ManifestDependency {
            name: "Pkg.Shared".into(),
            version: version.into(),
            repository: "https://github.com/org/shared".into(),
            commit: commit.into(),
        };
        let manifests = StaticManifests::new()
            .with(
                CORE,
                "abc",
                vec![
                    dep("1.0", "s1"),
                    ManifestDependency {
                        name: "Pkg.Lib".into(),
                        version: "2.0".into(),
                        repository: "https://github.com/org/lib".into(),
                        commit: "l1".into(),
                    },
                ],
            )
            .with("https://github.com/org/lib", "l1", vec![dep("1.1", "s2")]);

        let ingestor = BuildIngestor::new(catalog.clone(), Dispatcher::new(Arc::new(queue)))
            .with_manifests(Arc::new(manifests), 4);
        let build = ingestor.create_build(new_build("abc"), None).await.unwrap();
        assert_eq!(build.incoherencies.len(), 2);
        assert!(build.incoherencies.iter().all(|i| i.name == "Pkg.Shared"));
    }
}
