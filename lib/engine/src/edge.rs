//! Edge types for workflow graphs.
//!
//! Edges connect ports between nodes. Each edge specifies:
//! - The source port (output from one node)
//! - The target port (input on another node)

use crate::node::NodeId;
use serde::{Deserialize, Serialize};

/// An edge connecting two ports in a workflow graph.
///
/// Edges carry data from a source node's output port to a target node's input port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// The name of the output port on the source node.
    pub source_port: String,
    /// The name of the input port on the target node.
    pub target_port: String,
}

impl Edge {
    /// Creates a new edge between ports.
    #[must_use]
    pub fn new(source_port: impl Into<String>, target_port: impl Into<String>) -> Self {
        Self {
            source_port: source_port.into(),
            target_port: target_port.into(),
        }
    }

    /// Creates an edge using default port names ("output" -> "input").
    #[must_use]
    pub fn default_ports() -> Self {
        Self::new("output", "input")
    }
}

impl Default for Edge {
    fn default() -> Self {
        Self::default_ports()
    }
}

/// A connection between two nodes in a workflow snapshot.
///
/// This is the externally visible, fully-qualified form of an edge: the one
/// that appears in a snapshot's `connections` list and that the resolver
/// validates node ids and ports against. The graph's internal storage keeps
/// only the port pair ([`Edge`]) on each petgraph edge weight; a
/// `Connection` is assembled from an `Edge` plus the endpoints it joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// The source node id.
    pub source_node_id: NodeId,
    /// The output port name on the source node.
    pub source_output: String,
    /// The target node id.
    pub target_node_id: NodeId,
    /// The input port name on the target node.
    pub target_input: String,
}

impl Connection {
    /// Creates a new connection.
    #[must_use]
    pub fn new(
        source_node_id: NodeId,
        source_output: impl Into<String>,
        target_node_id: NodeId,
        target_input: impl Into<String>,
    ) -> Self {
        Self {
            source_node_id,
            source_output: source_output.into(),
            target_node_id,
            target_input: target_input.into(),
        }
    }

    /// Creates a connection using default port names.
    #[must_use]
    pub fn with_default_ports(source_node_id: NodeId, target_node_id: NodeId) -> Self {
        Self::new(source_node_id, "output", target_node_id, "input")
    }

    /// Splits this connection into its node endpoints and the port-only
    /// edge used as the graph's internal edge weight.
    #[must_use]
    pub fn into_parts(self) -> (NodeId, NodeId, Edge) {
        (
            self.source_node_id,
            self.target_node_id,
            Edge::new(self.source_output, self.target_input),
        )
    }
}
