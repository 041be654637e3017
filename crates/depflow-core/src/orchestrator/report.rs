//! Nightly longest-build-path report.
//!
//! For every channel, build the pruned flow graph and record the best and
//! worst case of the marked path together with the repositories on it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flow_state::{BuildTimeProvider, Catalog, ChannelId, LongestBuildPath};
use tracing::{info, warn};

use crate::error::FlowResult;
use crate::flow::{FlowGraph, FlowGraphBuilder, GraphOptions};

/// Summarize the marked path of `graph`, or `None` if nothing is marked.
pub fn longest_build_path(
    graph: &FlowGraph,
    channel_id: ChannelId,
    reported_at: DateTime<Utc>,
) -> Option<LongestBuildPath> {
    let mut on_path: Vec<_> = graph
        .nodes()
        .map(|(_, n)| n)
        .filter(|n| n.on_longest_build_path)
        .collect();
    if on_path.is_empty() {
        return None;
    }
    on_path.sort_by(|a, b| b.best_case_path_time.total_cmp(&a.best_case_path_time));

    Some(LongestBuildPath {
        channel_id,
        reported_at,
        best_case_minutes: on_path
            .iter()
            .map(|n| n.best_case_path_time)
            .fold(0.0, f64::max),
        worst_case_minutes: on_path
            .iter()
            .map(|n| n.worst_case_path_time)
            .fold(0.0, f64::max),
        contributing_repositories: on_path.iter().map(|n| n.key()).collect(),
    })
}

pub struct LongestBuildPathReporter {
    catalog: Arc<dyn Catalog>,
    build_times: Arc<dyn BuildTimeProvider>,
    days: u32,
    max_parallelism: usize,
}

impl LongestBuildPathReporter {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        build_times: Arc<dyn BuildTimeProvider>,
        days: u32,
        max_parallelism: usize,
    ) -> Self {
        Self {
            catalog,
            build_times,
            days,
            max_parallelism,
        }
    }

    /// Report one channel. Returns the recorded row, if any.
    pub async fn report_channel(
        &self,
        channel_id: ChannelId,
        now: DateTime<Utc>,
    ) -> FlowResult<Option<LongestBuildPath>> {
        let options = GraphOptions {
            channel_id: Some(channel_id),
            days: self.days,
            frequencies: Vec::new(),
            include_disabled: false,
            max_parallelism: self.max_parallelism,
        };
        let graph = FlowGraphBuilder::new(self.catalog.as_ref(), self.build_times.as_ref())
            .build(&options)
            .await?;

        let Some(path) = longest_build_path(&graph, channel_id, now) else {
            return Ok(None);
        };
        self.catalog.record_longest_build_path(path.clone()).await?;
        info!(
            channel_id = %channel_id,
            best_case = path.best_case_minutes,
            worst_case = path.worst_case_minutes,
            repositories = path.contributing_repositories.len(),
            "longest build path recorded"
        );
        Ok(Some(path))
    }

    /// Report every channel; a failing channel is logged and skipped.
    pub async fn run(&self, now: DateTime<Utc>) -> FlowResult<Vec<LongestBuildPath>> {
        let mut recorded = Vec::new();
        for channel in self.catalog.channels().await? {
            match self.report_channel(channel.id, now).await {
                Ok(Some(path)) => recorded.push(path),
                Ok(None) => {}
                Err(e) => warn!(
                    channel_id = %channel.id,
                    channel = %channel.name,
                    error = %e,
                    "longest build path report failed"
                ),
            }
        }
        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use flow_state::fakes::{MemoryCatalog, StaticBuildTimes};
    use flow_state::{
        Channel, DefaultChannel, Subscription, SubscriptionId, SubscriptionPolicy, UpdateFrequency,
    };

    use super::*;

    fn dc(id: u32, repo: &str, channel: u32) -> DefaultChannel {
        DefaultChannel {
            id,
            repository: repo.into(),
            branch: "main".into(),
            channel_id: ChannelId(channel),
            enabled: true,
            pipelines: None,
        }
    }

    fn sub(source: &str, target: &str, channel: u32, enabled: bool) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            channel_id: ChannelId(channel),
            source_repository: source.into(),
            target_repository: target.into(),
            target_branch: "main".into(),
            enabled,
            policy: SubscriptionPolicy {
                update_frequency: UpdateFrequency::EveryDay,
                batchable: false,
            },
            last_applied_build_id: None,
        }
    }

    #[tokio::test]
    async fn records_a_row_per_channel_with_a_path() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert_channel(Channel {
            id: ChannelId(1),
            name: ".NET 9".into(),
            classification: "product".into(),
        });
        catalog.insert_channel(Channel {
            id: ChannelId(2),
            name: "empty".into(),
            classification: "test".into(),
        });
        catalog.insert_default_channel(dc(1, "core", 1));
        catalog.insert_default_channel(dc(2, "lib", 1));
        catalog.insert_default_channel(dc(3, "sdk", 1));
        catalog.insert_subscription(sub("core", "lib", 1, true));
        catalog.insert_subscription(sub("lib", "sdk", 1, true));
        // Disabled edges are not part of the report.
        catalog.insert_subscription(sub("core", "sdk", 1, false));

        let times = Arc::new(
            StaticBuildTimes::new()
                .with("core", "main", 60.0, 10.0)
                .with("lib", "main", 30.0, 20.0)
                .with("sdk", "main", 90.0, 30.0),
        );
        let reporter = LongestBuildPathReporter::new(catalog.clone(), times, 30, 4);
        let now = Utc::now();
        let rows = reporter.run(now).await.unwrap();

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.channel_id, ChannelId(1));
        assert_eq!(row.best_case_minutes, 180.0);
        // core 60 + (lib 30 + sdk 90 + 30) + 20
        assert_eq!(row.worst_case_minutes, 230.0);
        assert_eq!(
            row.contributing_repositories,
            vec!["core@main", "lib@main", "sdk@main"]
        );
        assert_eq!(catalog.longest_build_paths(ChannelId(1)).await.unwrap().len(), 1);
        assert!(catalog.longest_build_paths(ChannelId(2)).await.unwrap().is_empty());
    }
}
