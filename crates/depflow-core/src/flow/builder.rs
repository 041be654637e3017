//! Assembles a [`FlowGraph`] from catalog data.
//!
//! Nodes come from default channels (so repositories with no subscribers
//! still appear) and from subscription targets. Each subscription yields one
//! edge per default channel publishing the subscription's source repository
//! to the subscription's channel.

use std::collections::{HashMap, HashSet};

use flow_state::{
    BuildId, BuildTime, BuildTimeProvider, Catalog, ChannelId, DefaultChannel, UpdateFrequency,
};
use tracing::{debug, info, warn};

use super::graph::{FlowEdge, FlowGraph, FlowNode};
use crate::error::FlowResult;
use crate::sync::bounded_map;

/// Inputs that shape a graph build.
#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// Prune to the nodes that feed this channel. `None` keeps everything.
    pub channel_id: Option<ChannelId>,
    /// Look-back window for build durations.
    pub days: u32,
    /// Frequencies whose edges survive pruning. Empty means all.
    pub frequencies: Vec<UpdateFrequency>,
    pub include_disabled: bool,
    /// Cap on concurrent catalog and build-history calls.
    pub max_parallelism: usize,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            channel_id: None,
            days: 30,
            frequencies: Vec::new(),
            include_disabled: false,
            max_parallelism: 8,
        }
    }
}

impl GraphOptions {
    pub fn for_channel(channel_id: ChannelId) -> Self {
        Self {
            channel_id: Some(channel_id),
            ..Self::default()
        }
    }

    fn allows(&self, frequency: UpdateFrequency) -> bool {
        self.frequencies.is_empty() || self.frequencies.contains(&frequency)
    }
}

/// A node feeds the target channel directly.
pub fn is_interesting_node(target_channel: &str, node: &FlowNode) -> bool {
    node.output_channels.contains(target_channel)
}

/// An edge survives pruning when it is enabled (or disabled edges were
/// requested) and its frequency is allowed.
pub fn is_interesting_edge(edge: &FlowEdge, options: &GraphOptions) -> bool {
    if !options.include_disabled && !edge.subscription.enabled {
        return false;
    }
    options.allows(edge.subscription.frequency())
}

/// Builds flow graphs against a catalog and a build-duration source.
pub struct FlowGraphBuilder<'a> {
    catalog: &'a dyn Catalog,
    build_times: &'a dyn BuildTimeProvider,
}

impl<'a> FlowGraphBuilder<'a> {
    pub fn new(catalog: &'a dyn Catalog, build_times: &'a dyn BuildTimeProvider) -> Self {
        Self {
            catalog,
            build_times,
        }
    }

    /// Build, prune, classify edges, then compute and mark the longest path.
    pub async fn build(&self, options: &GraphOptions) -> FlowResult<FlowGraph> {
        let channel_names: HashMap<ChannelId, String> = self
            .catalog
            .channels()
            .await?
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect();
        let default_channels = self.catalog.default_channels().await?;
        let subscriptions = self.catalog.subscriptions().await?;

        let times = self
            .fetch_build_times(&default_channels, options.days, options.max_parallelism)
            .await;

        let mut graph = FlowGraph::new();
        for (dc, time) in default_channels.iter().zip(times) {
            let id = graph.get_or_create_node(&dc.repository, &dc.branch);
            if let Some(node) = graph.node_mut(id) {
                node.official_build_time = node.official_build_time.max(time.official_build_minutes);
                node.pr_build_time = node.pr_build_time.max(time.pr_build_minutes);
                if let Some(name) = channel_names.get(&dc.channel_id) {
                    node.output_channels.insert(name.clone());
                }
            }
        }

        for sub in subscriptions {
            let channel = channel_names
                .get(&sub.channel_id)
                .cloned()
                .unwrap_or_else(|| sub.channel_id.to_string());
            let target = graph.get_or_create_node(&sub.target_repository, &sub.target_branch);
            if let Some(node) = graph.node_mut(target) {
                node.input_channels.insert(channel.clone());
            }

            let sources = default_channels.iter().filter(|dc| {
                dc.channel_id == sub.channel_id
                    && dc.repository.eq_ignore_ascii_case(&sub.source_repository)
            });
            for dc in sources {
                let source = graph.get_or_create_node(&dc.repository, &dc.branch);
                graph.add_edge(source, target, sub.clone(), channel.clone())?;
            }
        }

        if let Some(channel_id) = options.channel_id {
            let target = self.catalog.get_channel(channel_id).await?;
            graph.prune(
                |node| is_interesting_node(&target.name, node),
                |edge| is_interesting_edge(edge, options),
            );
            debug!(
                channel = %target.name,
                nodes = graph.node_count(),
                edges = graph.edge_count(),
                "flow graph pruned"
            );
        }

        self.classify_tooling_edges(&mut graph, options.max_parallelism)
            .await;
        graph.calculate_longest_build_paths()?;
        graph.mark_longest_build_path();

        info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "flow graph built"
        );
        Ok(graph)
    }

    async fn fetch_build_times(
        &self,
        default_channels: &[DefaultChannel],
        days: u32,
        max_parallelism: usize,
    ) -> Vec<BuildTime> {
        bounded_map(default_channels.iter().cloned(), max_parallelism, |dc| async move {
            match self.build_times.build_time(&dc, days).await {
                Ok(time) => time,
                Err(e) => {
                    warn!(
                        repository = %dc.repository,
                        branch = %dc.branch,
                        error = %e,
                        "build time unavailable, assuming zero"
                    );
                    BuildTime::default()
                }
            }
        })
        .await
    }

    /// Mark edges whose last applied build carried no product dependency.
    async fn classify_tooling_edges(&self, graph: &mut FlowGraph, max_parallelism: usize) {
        let build_ids: HashSet<BuildId> = graph
            .edges()
            .filter_map(|(_, e)| e.subscription.last_applied_build_id)
            .collect();

        let lookups = bounded_map(build_ids, max_parallelism, |id| async move {
            match self.catalog.get_build(id).await {
                Ok(build) => Some((id, !build.has_product_dependency())),
                Err(e) => {
                    warn!(build_id = %id, error = %e, "last applied build lookup failed");
                    None
                }
            }
        })
        .await;
        let tooling: HashMap<BuildId, bool> = lookups.into_iter().flatten().collect();

        let edge_ids: Vec<_> = graph.edges().map(|(id, _)| id).collect();
        for id in edge_ids {
            if let Some(edge) = graph.edge_mut(id) {
                edge.is_tooling_only = edge
                    .subscription
                    .last_applied_build_id
                    .and_then(|b| tooling.get(&b).copied())
                    .unwrap_or(false);
            }
        }
    }
}
