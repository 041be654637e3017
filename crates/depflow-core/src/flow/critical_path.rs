//! Best- and worst-case propagation time through the flow graph.
//!
//! A node's path time is its own official build time plus the slowest
//! downstream chain its builds must travel through. Tooling-only edges are
//! ignored: they do not gate functional correctness and must not inflate
//! the critical path. The worst case also pays each consumer's PR build,
//! the validation run that has to pass before the update can merge.
//!
//! Best and worst case are two independent maxima and may follow different
//! edges out of the same node.

use std::cmp::Ordering;
use std::collections::VecDeque;

use tracing::debug;

use super::graph::{EdgeId, FlowGraph, NodeId};
use crate::error::{FlowError, FlowResult};

/// Path times for a single node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathTimes {
    pub best_case: f64,
    pub worst_case: f64,
}

/// What a node needs to know about one downstream edge.
#[derive(Debug, Clone, Copy)]
pub struct DownstreamEdge {
    pub is_tooling_only: bool,
    pub target_best_case: f64,
    pub target_worst_case: f64,
    pub target_pr_build_time: f64,
}

/// Compute one node's path times from its already-computed successors.
///
/// With no qualifying edge both times equal `official_build_time`.
pub fn longest_path_time<I>(official_build_time: f64, edges: I) -> PathTimes
where
    I: IntoIterator<Item = DownstreamEdge>,
{
    let mut best_tail = 0.0_f64;
    let mut worst_tail = 0.0_f64;
    for edge in edges.into_iter().filter(|e| !e.is_tooling_only) {
        best_tail = best_tail.max(edge.target_best_case);
        worst_tail = worst_tail.max(edge.target_worst_case + edge.target_pr_build_time);
    }
    PathTimes {
        best_case: official_build_time + best_tail,
        worst_case: official_build_time + worst_tail,
    }
}

impl FlowGraph {
    fn downstream_edges(&self, id: NodeId) -> Vec<DownstreamEdge> {
        self.outgoing(id)
            .filter_map(|(_, edge)| {
                let target = self.node(edge.to)?;
                Some(DownstreamEdge {
                    is_tooling_only: edge.is_tooling_only,
                    target_best_case: target.best_case_path_time,
                    target_worst_case: target.worst_case_path_time,
                    target_pr_build_time: target.pr_build_time,
                })
            })
            .collect()
    }

    /// Recompute one node from its successors' current values.
    pub fn calculate_longest_path_time(&mut self, id: NodeId) -> FlowResult<PathTimes> {
        let official = self
            .node(id)
            .ok_or_else(|| FlowError::NodeNotFound {
                node: format!("#{id:?}"),
            })?
            .official_build_time;
        let times = longest_path_time(official, self.downstream_edges(id));
        let len = self.worst_chain(id).map_or(1, |(_, target_len)| target_len + 1);
        if let Some(node) = self.node_mut(id) {
            node.best_case_path_time = times.best_case;
            node.worst_case_path_time = times.worst_case;
            node.worst_path_len = len;
        }
        Ok(times)
    }

    /// Evaluate every node bottom-up (consumers before producers).
    ///
    /// Fails with [`FlowError::DependencyCycle`] if non-tooling edges form
    /// a cycle, listing the nodes that could not be ordered.
    pub fn calculate_longest_build_paths(&mut self) -> FlowResult<()> {
        let order = self.evaluation_order()?;
        for id in order {
            self.calculate_longest_path_time(id)?;
        }
        Ok(())
    }

    /// Kahn's algorithm on reversed non-tooling edges: a node is ready once
    /// all of its downstream targets are.
    fn evaluation_order(&self) -> FlowResult<Vec<NodeId>> {
        let mut pending: std::collections::HashMap<NodeId, usize> = self
            .nodes()
            .map(|(id, _)| {
                let n = self.outgoing(id).filter(|(_, e)| !e.is_tooling_only).count();
                (id, n)
            })
            .collect();

        let mut ready: VecDeque<NodeId> = self
            .nodes()
            .map(|(id, _)| id)
            .filter(|id| pending.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(pending.len());

        while let Some(id) = ready.pop_front() {
            order.push(id);
            for (_, edge) in self.incoming(id).filter(|(_, e)| !e.is_tooling_only) {
                if let Some(n) = pending.get_mut(&edge.from) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push_back(edge.from);
                    }
                }
            }
        }

        if order.len() != pending.len() {
            let mut nodes: Vec<String> = pending
                .iter()
                .filter(|(_, n)| **n > 0)
                .filter_map(|(id, _)| self.node(*id).map(|n| n.key()))
                .collect();
            nodes.sort();
            return Err(FlowError::DependencyCycle { nodes });
        }
        Ok(order)
    }

    /// The non-tooling edge out of `id` that determines its worst case,
    /// with the target's worst-path length. Ties prefer the longer path.
    fn worst_chain(&self, id: NodeId) -> Option<(EdgeId, usize)> {
        self.outgoing(id)
            .filter(|(_, e)| !e.is_tooling_only)
            .filter_map(|(edge_id, edge)| {
                let t = self.node(edge.to)?;
                Some((edge_id, t.worst_case_path_time + t.pr_build_time, t.worst_path_len))
            })
            .fold(None, |best: Option<(EdgeId, f64, usize)>, cand| match best {
                None => Some(cand),
                Some(b) => match cand.1.partial_cmp(&b.1) {
                    Some(Ordering::Greater) => Some(cand),
                    Some(Ordering::Equal) if cand.2 > b.2 => Some(cand),
                    _ => Some(b),
                },
            })
            .map(|(edge_id, _, len)| (edge_id, len))
    }

    /// Mark the single path whose worst-case time is the global maximum.
    ///
    /// Starts at the non-tooling node with the largest worst-case time
    /// (ties: longer path, then creation order) and follows the edge that
    /// determined each node's worst case. Requires
    /// [`calculate_longest_build_paths`](Self::calculate_longest_build_paths)
    /// to have run. Returns the marked nodes in path order.
    pub fn mark_longest_build_path(&mut self) -> Vec<NodeId> {
        let start = self
            .nodes()
            .filter(|(id, _)| !self.is_tooling_only_node(*id))
            .fold(None, |best: Option<(NodeId, f64, usize)>, (id, n)| {
                let cand = (id, n.worst_case_path_time, n.worst_path_len);
                match best {
                    None => Some(cand),
                    Some(b) => match cand.1.partial_cmp(&b.1) {
                        Some(Ordering::Greater) => Some(cand),
                        Some(Ordering::Equal) if cand.2 > b.2 => Some(cand),
                        _ => Some(b),
                    },
                }
            })
            .map(|(id, _, _)| id);

        let Some(mut current) = start else {
            return Vec::new();
        };
        let mut path = vec![current];
        if let Some(node) = self.node_mut(current) {
            node.on_longest_build_path = true;
        }

        while let Some((edge_id, _)) = self.worst_chain(current) {
            let Some(next) = self.edge(edge_id).map(|e| e.to) else {
                break;
            };
            if self.node(next).map_or(true, |n| n.on_longest_build_path) {
                break;
            }
            if let Some(edge) = self.edge_mut(edge_id) {
                edge.on_longest_build_path = true;
            }
            if let Some(node) = self.node_mut(next) {
                node.on_longest_build_path = true;
            }
            path.push(next);
            current = next;
        }

        debug!(nodes = path.len(), "longest build path marked");
        path
    }
}
