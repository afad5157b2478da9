//! The output of compilation: a validated DAG with every edge's schema
//! resolved, represented the way [`crate::compiler::Compiler`] builds it and
//! [`crate::executor::GraphExecutor`] consumes it — a `daggy::Dag` of nodes
//! and edges.

use daggy::petgraph::visit::{EdgeRef, IntoEdgesDirected};
use daggy::petgraph::Direction;
use daggy::{Dag, EdgeIndex, NodeIndex};

use crate::descriptor::{IterKind, NodeConfig};
use crate::operator::OperatorRef;
use crate::schema::SchemaEntry;

/// A node as it appears in the compiled plan: its identity plus everything
/// the executor needs to build a runner for it.
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub name: String,
    pub iter_kind: IterKind,
    pub op_ref: Option<OperatorRef>,
    pub config: NodeConfig,
    /// The declared column names this node reads, in declaration order.
    pub inputs: Vec<String>,
    /// The declared column names this node writes, in declaration order.
    pub outputs: Vec<String>,
}

/// An edge as it appears in the compiled plan: the index assigned during
/// compilation and the resolved schema of columns carried across it.
#[derive(Debug, Clone)]
pub struct CompiledEdge {
    pub edge_num: usize,
    pub schema: Vec<SchemaEntry>,
}

impl CompiledEdge {
    pub fn column(&self, name: &str) -> Option<&SchemaEntry> {
        self.schema.iter().find(|entry| entry.name == name)
    }
}

/// The compiled DAG: a `daggy::Dag<CompiledNode, CompiledEdge>` plus the
/// bookkeeping the executor needs to find its source and sink quickly.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub graph: Dag<CompiledNode, CompiledEdge>,
    pub input_index: NodeIndex,
    pub output_index: NodeIndex,
    /// Compiled topological order, `_input` first and `_output` last. Kept
    /// alongside the graph so the Executor never needs to re-derive it.
    pub topo_order: Vec<NodeIndex>,
    /// The single queue the caller reads results from. `_output` cannot
    /// have a real outgoing graph edge (it would be a self-loop, which a
    /// DAG forbids), so its terminal edge is kept here instead of in
    /// `graph`. When `_output` has exactly one in-edge this *is* that
    /// edge's number; when it has several, it is a fresh number the
    /// `output` runner merges them into.
    pub terminal_edge: CompiledEdge,
}

impl CompiledPlan {
    pub fn node(&self, index: NodeIndex) -> &CompiledNode {
        &self.graph[index]
    }

    pub fn edge(&self, index: EdgeIndex) -> &CompiledEdge {
        &self.graph[index]
    }

    pub fn find_node(&self, name: &str) -> Option<NodeIndex> {
        self.graph
            .raw_nodes()
            .iter()
            .position(|n| n.weight.name == name)
            .map(NodeIndex::new)
    }

    /// The edges leaving `node`, in the edge-index order assigned during
    /// compilation (so `CompiledNode::outputs`-adjacent logic can zip them
    /// against a node's declared successors where that matters, e.g.
    /// `_input`'s fan-out).
    pub fn out_edges(&self, node: NodeIndex) -> Vec<EdgeIndex> {
        let mut edges: Vec<EdgeIndex> = self
            .graph
            .edges_directed(node, Direction::Outgoing)
            .map(|e| e.id())
            .collect();
        edges.sort_by_key(|&e| self.graph[e].edge_num);
        edges
    }

    pub fn in_edges(&self, node: NodeIndex) -> Vec<EdgeIndex> {
        let mut edges: Vec<EdgeIndex> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .map(|e| e.id())
            .collect();
        edges.sort_by_key(|&e| self.graph[e].edge_num);
        edges
    }
}
