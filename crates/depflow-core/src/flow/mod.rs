//! Dependency flow graph: model, builder, critical path and coherency.

pub mod builder;
pub mod coherency;
pub mod critical_path;
pub mod graph;

pub use builder::{is_interesting_edge, is_interesting_node, FlowGraphBuilder, GraphOptions};
pub use coherency::{
    CoherencyAnalyzer, CoherencyReport, ManifestDependency, ManifestEntry, ManifestReader,
    StaticManifests,
};
pub use critical_path::{longest_path_time, DownstreamEdge, PathTimes};
pub use graph::{EdgeId, FlowEdge, FlowGraph, FlowNode, NodeId};
