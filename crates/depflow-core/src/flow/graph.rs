//! Dependency flow graph.
//!
//! Nodes are `repository@branch` pairs; an edge `A -> B` means B subscribes
//! to builds A publishes, so builds flow along edge direction. Nodes and
//! edges live in arenas addressed by [`NodeId`] / [`EdgeId`]. Removal leaves
//! a tombstone so ids stay valid for the lifetime of the graph, and every
//! live edge references two live nodes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use flow_state::{repo_branch_key, Subscription};
use serde::Serialize;

use crate::error::{FlowError, FlowResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EdgeId(usize);

#[derive(Debug, Clone, Serialize)]
pub struct FlowNode {
    pub repository: String,
    pub branch: String,
    /// Expected duration of an official build of this node, in minutes.
    pub official_build_time: f64,
    /// Expected duration of a validation (PR) build, in minutes.
    pub pr_build_time: f64,
    /// Valid once the longest build paths have been calculated.
    pub best_case_path_time: f64,
    pub worst_case_path_time: f64,
    pub on_longest_build_path: bool,
    /// Channels this node publishes to.
    pub output_channels: BTreeSet<String>,
    /// Channels this node receives builds from.
    pub input_channels: BTreeSet<String>,
    /// Nodes on the worst-case path starting here, this one included.
    #[serde(skip)]
    pub(crate) worst_path_len: usize,
    #[serde(skip)]
    outgoing: Vec<EdgeId>,
    #[serde(skip)]
    incoming: Vec<EdgeId>,
}

impl FlowNode {
    fn new(repository: &str, branch: &str) -> Self {
        Self {
            repository: repository.to_string(),
            branch: branch.to_string(),
            official_build_time: 0.0,
            pr_build_time: 0.0,
            best_case_path_time: 0.0,
            worst_case_path_time: 0.0,
            on_longest_build_path: false,
            output_channels: BTreeSet::new(),
            input_channels: BTreeSet::new(),
            worst_path_len: 1,
            outgoing: Vec::new(),
            incoming: Vec::new(),
        }
    }

    /// `repository@branch`, as first registered.
    pub fn key(&self) -> String {
        format!("{}@{}", self.repository, self.branch)
    }
}

impl fmt::Display for FlowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.branch)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowEdge {
    /// Producer.
    pub from: NodeId,
    /// Consumer.
    pub to: NodeId,
    pub subscription: Subscription,
    /// Name of the channel the subscription listens on.
    pub channel: String,
    /// The consumer's last applied build pulled in no product dependency.
    pub is_tooling_only: bool,
    pub on_longest_build_path: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    nodes: Vec<Option<FlowNode>>,
    edges: Vec<Option<FlowEdge>>,
    /// Case-insensitive `repository@branch` -> node.
    index: HashMap<String, NodeId>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the node for `repository@branch`, creating it if needed.
    pub fn get_or_create_node(&mut self, repository: &str, branch: &str) -> NodeId {
        let key = repo_branch_key(repository, branch);
        if let Some(id) = self.index.get(&key) {
            return *id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(FlowNode::new(repository, branch)));
        self.index.insert(key, id);
        id
    }

    pub fn find_node(&self, repository: &str, branch: &str) -> Option<NodeId> {
        self.index.get(&repo_branch_key(repository, branch)).copied()
    }

    /// Connect producer `from` to consumer `to`.
    pub fn add_edge(
        &mut self,
        from: NodeId,
        to: NodeId,
        subscription: Subscription,
        channel: impl Into<String>,
    ) -> FlowResult<EdgeId> {
        self.require(from)?;
        self.require(to)?;
        let channel = channel.into();
        let id = EdgeId(self.edges.len());

        if let Some(node) = self.node_slot(from) {
            node.outgoing.push(id);
        }
        if let Some(node) = self.node_slot(to) {
            node.incoming.push(id);
            node.input_channels.insert(channel.clone());
        }
        self.edges.push(Some(FlowEdge {
            from,
            to,
            subscription,
            channel,
            is_tooling_only: false,
            on_longest_build_path: false,
        }));
        Ok(id)
    }

    /// Remove an edge and recompute the consumer's input channels.
    pub fn remove_edge(&mut self, id: EdgeId) {
        let Some(edge) = self.edges.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        if let Some(node) = self.node_slot(edge.from) {
            node.outgoing.retain(|e| *e != id);
        }
        if let Some(node) = self.node_slot(edge.to) {
            node.incoming.retain(|e| *e != id);
        }
        self.recalculate_input_channels(edge.to);
    }

    /// Remove a node together with every edge touching it.
    pub fn remove_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(id.0).and_then(Option::as_ref) else {
            return;
        };
        let incident: Vec<EdgeId> = node
            .incoming
            .iter()
            .chain(node.outgoing.iter())
            .copied()
            .collect();
        for edge in incident {
            self.remove_edge(edge);
        }
        if let Some(node) = self.nodes.get_mut(id.0).and_then(Option::take) {
            self.index
                .remove(&repo_branch_key(&node.repository, &node.branch));
        }
    }

    fn recalculate_input_channels(&mut self, id: NodeId) {
        let channels: BTreeSet<String> = self
            .incoming(id)
            .map(|(_, e)| e.channel.clone())
            .collect();
        if let Some(node) = self.node_slot(id) {
            node.input_channels = channels;
        }
    }

    /// Keep interesting nodes plus everything that reaches them through
    /// interesting edges; drop the rest.
    pub fn prune<N, E>(&mut self, is_interesting_node: N, is_interesting_edge: E)
    where
        N: Fn(&FlowNode) -> bool,
        E: Fn(&FlowEdge) -> bool,
    {
        let mut reachable_nodes = HashSet::new();
        let mut reachable_edges = HashSet::new();
        let mut stack: Vec<NodeId> = self
            .nodes()
            .filter(|(_, n)| is_interesting_node(*n))
            .map(|(id, _)| id)
            .collect();

        while let Some(current) = stack.pop() {
            if !reachable_nodes.insert(current) {
                continue;
            }
            for (edge_id, edge) in self.incoming(current) {
                if is_interesting_edge(edge) {
                    reachable_edges.insert(edge_id);
                    stack.push(edge.from);
                }
            }
        }

        let dead_nodes: Vec<NodeId> = self
            .nodes()
            .map(|(id, _)| id)
            .filter(|id| !reachable_nodes.contains(id))
            .collect();
        for id in dead_nodes {
            self.remove_node(id);
        }
        let dead_edges: Vec<EdgeId> = self
            .edges()
            .map(|(id, _)| id)
            .filter(|id| !reachable_edges.contains(id))
            .collect();
        for id in dead_edges {
            self.remove_edge(id);
        }
    }

    // -- accessors -----------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&FlowNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut FlowNode> {
        self.node_slot(id)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&FlowEdge> {
        self.edges.get(id.0).and_then(Option::as_ref)
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> Option<&mut FlowEdge> {
        self.edges.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Live nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &FlowNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId(i), n)))
    }

    /// Live edges in creation order.
    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &FlowEdge)> {
        self.edges
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (EdgeId(i), e)))
    }

    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = (EdgeId, &FlowEdge)> {
        self.node(id)
            .into_iter()
            .flat_map(|n| n.outgoing.iter())
            .filter_map(move |e| self.edge(*e).map(|edge| (*e, edge)))
    }

    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = (EdgeId, &FlowEdge)> {
        self.node(id)
            .into_iter()
            .flat_map(|n| n.incoming.iter())
            .filter_map(move |e| self.edge(*e).map(|edge| (*e, edge)))
    }

    pub fn node_count(&self) -> usize {
        self.index.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges().count()
    }

    /// A node is tooling-only when it feeds others and every one of those
    /// edges is tooling-only.
    pub fn is_tooling_only_node(&self, id: NodeId) -> bool {
        let mut outgoing = self.outgoing(id).peekable();
        outgoing.peek().is_some() && outgoing.all(|(_, e)| e.is_tooling_only)
    }

    fn require(&self, id: NodeId) -> FlowResult<()> {
        match self.node(id) {
            Some(_) => Ok(()),
            None => Err(FlowError::NodeNotFound {
                node: format!("#{}", id.0),
            }),
        }
    }

    fn node_slot(&mut self, id: NodeId) -> Option<&mut FlowNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }
}

#[cfg(test)]
mod tests {
    use flow_state::{ChannelId, SubscriptionId, SubscriptionPolicy, UpdateFrequency};

    use super::*;

    fn subscription(frequency: UpdateFrequency, enabled: bool) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            channel_id: ChannelId(1),
            source_repository: "src".into(),
            target_repository: "dst".into(),
            target_branch: "main".into(),
            enabled,
            policy: SubscriptionPolicy {
                update_frequency: frequency,
                batchable: false,
            },
            last_applied_build_id: None,
        }
    }

    #[test]
    fn node_keys_are_case_insensitive() {
        let mut g = FlowGraph::new();
        let a = g.get_or_create_node("https://github.com/Org/Repo", "Main");
        let b = g.get_or_create_node("https://github.com/org/repo", "main");
        assert_eq!(a, b);
        assert_eq!(g.node_count(), 1);
        assert_eq!(g.node(a).unwrap().key(), "https://github.com/Org/Repo@Main");
    }

    #[test]
    fn removing_edge_recomputes_input_channels() {
        let mut g = FlowGraph::new();
        let a = g.get_or_create_node("a", "main");
        let b = g.get_or_create_node("b", "main");
        let c = g.get_or_create_node("c", "main");
        let ac = g
            .add_edge(a, c, subscription(UpdateFrequency::EveryBuild, true), ".NET 9")
            .unwrap();
        g.add_edge(b, c, subscription(UpdateFrequency::EveryBuild, true), ".NET Eng")
            .unwrap();
        assert_eq!(g.node(c).unwrap().input_channels.len(), 2);

        g.remove_edge(ac);
        let inputs: Vec<_> = g.node(c).unwrap().input_channels.iter().cloned().collect();
        assert_eq!(inputs, vec![".NET Eng".to_string()]);
        assert_eq!(g.outgoing(a).count(), 0);
    }

    #[test]
    fn removing_node_drops_incident_edges() {
        let mut g = FlowGraph::new();
        let a = g.get_or_create_node("a", "main");
        let b = g.get_or_create_node("b", "main");
        g.add_edge(a, b, subscription(UpdateFrequency::EveryDay, true), "ch")
            .unwrap();

        g.remove_node(a);
        assert!(g.node(a).is_none());
        assert_eq!(g.edge_count(), 0);
        assert!(g.node(b).unwrap().input_channels.is_empty());
        assert!(g.find_node("a", "main").is_none());
    }

    #[test]
    fn add_edge_to_removed_node_fails() {
        let mut g = FlowGraph::new();
        let a = g.get_or_create_node("a", "main");
        let b = g.get_or_create_node("b", "main");
        g.remove_node(b);
        let err = g
            .add_edge(a, b, subscription(UpdateFrequency::EveryDay, true), "ch")
            .unwrap_err();
        assert!(matches!(err, FlowError::NodeNotFound { .. }));
    }

    #[test]
    fn prune_keeps_nodes_feeding_the_target_channel() {
        // a -> b -> c(publishes to "target"), d -> c disabled, e unrelated
        let mut g = FlowGraph::new();
        let a = g.get_or_create_node("a", "main");
        let b = g.get_or_create_node("b", "main");
        let c = g.get_or_create_node("c", "main");
        let d = g.get_or_create_node("d", "main");
        let e = g.get_or_create_node("e", "main");
        g.node_mut(c).unwrap().output_channels.insert("target".into());
        g.add_edge(a, b, subscription(UpdateFrequency::EveryDay, true), "x")
            .unwrap();
        g.add_edge(b, c, subscription(UpdateFrequency::EveryBuild, true), "x")
            .unwrap();
        g.add_edge(d, c, subscription(UpdateFrequency::EveryBuild, false), "x")
            .unwrap();

        g.prune(
            |n| n.output_channels.contains("target"),
            |edge| edge.subscription.enabled,
        );

        assert!(g.node(a).is_some());
        assert!(g.node(b).is_some());
        assert!(g.node(c).is_some());
        assert!(g.node(d).is_none());
        assert!(g.node(e).is_none());
        assert_eq!(g.edge_count(), 2);
    }

    #[test]
    fn tooling_only_node_needs_outgoing_edges() {
        let mut g = FlowGraph::new();
        let a = g.get_or_create_node("arcade", "main");
        let b = g.get_or_create_node("runtime", "main");
        assert!(!g.is_tooling_only_node(a));

        let e = g
            .add_edge(a, b, subscription(UpdateFrequency::EveryWeek, true), "eng")
            .unwrap();
        assert!(!g.is_tooling_only_node(a));
        g.edge_mut(e).unwrap().is_tooling_only = true;
        assert!(g.is_tooling_only_node(a));
    }
}
