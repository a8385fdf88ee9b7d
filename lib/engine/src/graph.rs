//! Workflow graph storage and the dependency resolver built on top of it.
//!
//! The graph itself is a thin petgraph wrapper: nodes keyed by [`NodeId`],
//! edges carrying only the port-pair ([`Edge`]) they connect. The resolver
//! operations (`dependencies_of`, `dependents_of`, `topo_order`,
//! `reachable_from`, `validate_safety`) are what the scheduling loop and the
//! trigger concurrency manager actually consume; they never touch the
//! petgraph API directly.

use crate::edge::{Connection, Edge};
use crate::error::GraphError;
use crate::node::{Node, NodeId};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// A workflow graph using petgraph's directed graph.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowGraph {
    /// The underlying directed graph.
    #[serde(with = "graph_serde")]
    graph: DiGraph<Node, Edge>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    #[serde(skip)]
    node_index_map: HashMap<NodeId, NodeIndex>,
}

/// Deserializing only restores `graph` (`node_index_map` is `#[serde(skip)]`
/// on the wire): every deserialized snapshot would otherwise carry an empty
/// index map and reject every lookup, including the admission check on the
/// node the run starts from. A manual impl closes that gap in the one place
/// a derived impl can't — by rebuilding the map right after the graph comes
/// back, instead of relying on every caller to remember to.
impl<'de> Deserialize<'de> for WorkflowGraph {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(with = "graph_serde")]
            graph: DiGraph<Node, Edge>,
        }

        let wire = Wire::deserialize(deserializer)?;
        let mut graph = Self {
            graph: wire.graph,
            node_index_map: HashMap::new(),
        };
        graph.rebuild_index_map();
        Ok(graph)
    }
}

impl WorkflowGraph {
    /// Creates a new empty workflow graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_index_map: HashMap::new(),
        }
    }

    /// Builds a graph from a snapshot's node list and connections, running
    /// the full safety validation before any node or edge is trusted.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DanglingEdge`] if a connection names a node
    /// that isn't in `nodes`, or [`GraphError::CycleDetected`] if the
    /// resulting graph has a cycle.
    pub fn try_from_snapshot(
        nodes: Vec<Node>,
        connections: Vec<Connection>,
    ) -> Result<Self, GraphError> {
        let known_ids: HashSet<NodeId> = nodes.iter().map(|n| n.id).collect();
        Self::validate_safety(&known_ids, &connections)?;

        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node);
        }
        for connection in connections {
            let (source, target, edge) = connection.into_parts();
            graph.add_edge(source, target, edge)?;
        }
        Ok(graph)
    }

    /// Hard gate run before a snapshot is trusted: every connection must
    /// reference a node id present in `known_ids`, and the connections must
    /// not close a cycle.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DanglingEdge`] for a connection naming an
    /// unknown node, or [`GraphError::CycleDetected`] for a cyclic graph.
    pub fn validate_safety(
        known_ids: &HashSet<NodeId>,
        connections: &[Connection],
    ) -> Result<(), GraphError> {
        for connection in connections {
            if !known_ids.contains(&connection.source_node_id) {
                return Err(GraphError::DanglingEdge {
                    node_id: connection.source_node_id,
                });
            }
            if !known_ids.contains(&connection.target_node_id) {
                return Err(GraphError::DanglingEdge {
                    node_id: connection.target_node_id,
                });
            }
        }

        let mut index_of = HashMap::new();
        let mut probe: DiGraph<NodeId, ()> = DiGraph::new();
        for &id in known_ids {
            index_of.insert(id, probe.add_node(id));
        }
        for connection in connections {
            probe.add_edge(
                index_of[&connection.source_node_id],
                index_of[&connection.target_node_id],
                (),
            );
        }
        if petgraph::algo::is_cyclic_directed(&probe) {
            return Err(GraphError::CycleDetected);
        }

        Ok(())
    }

    /// Adds a node to the graph.
    ///
    /// Returns the node ID.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let node_id = node.id;
        let index = self.graph.add_node(node);
        self.node_index_map.insert(node_id, index);
        node_id
    }

    /// Removes a node from the graph.
    ///
    /// Also removes all edges connected to this node.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<Node> {
        let index = self.node_index_map.remove(&node_id)?;
        let removed = self.graph.remove_node(index);
        self.rebuild_index_map();
        removed
    }

    /// Returns a reference to a node by its ID.
    #[must_use]
    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        let index = self.node_index_map.get(&node_id)?;
        self.graph.node_weight(*index)
    }

    /// Returns a mutable reference to a node by its ID.
    pub fn get_node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        let index = self.node_index_map.get(&node_id)?;
        self.graph.node_weight_mut(*index)
    }

    /// Adds an edge between two nodes.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::NodeNotFound`] if either endpoint is missing
    /// from the graph.
    pub fn add_edge(
        &mut self,
        source_id: NodeId,
        target_id: NodeId,
        edge: Edge,
    ) -> Result<(), GraphError> {
        let source_index = self
            .node_index_map
            .get(&source_id)
            .copied()
            .ok_or(GraphError::NodeNotFound { node_id: source_id })?;

        let target_index = self
            .node_index_map
            .get(&target_id)
            .copied()
            .ok_or(GraphError::NodeNotFound { node_id: target_id })?;

        self.graph.add_edge(source_index, target_index, edge);
        Ok(())
    }

    /// Returns all nodes in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns nodes that have no incoming edges (entry points).
    pub fn entry_nodes(&self) -> Vec<&Node> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, Direction::Incoming).count() == 0)
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Returns nodes that have no outgoing edges (terminal nodes).
    pub fn terminal_nodes(&self) -> Vec<&Node> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, Direction::Outgoing).count() == 0)
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Returns the successors (downstream nodes) of a given node.
    pub fn successors(&self, node_id: NodeId) -> Vec<(&Node, &Edge)> {
        let Some(&index) = self.node_index_map.get(&node_id) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(index, Direction::Outgoing)
            .filter_map(|edge| {
                let target = self.graph.node_weight(edge.target())?;
                Some((target, edge.weight()))
            })
            .collect()
    }

    /// Returns the predecessors (upstream nodes) of a given node.
    pub fn predecessors(&self, node_id: NodeId) -> Vec<(&Node, &Edge)> {
        let Some(&index) = self.node_index_map.get(&node_id) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(index, Direction::Incoming)
            .filter_map(|edge| {
                let source = self.graph.node_weight(edge.source())?;
                Some((source, edge.weight()))
            })
            .collect()
    }

    /// Returns the ids of nodes this node directly depends on (its
    /// predecessors).
    #[must_use]
    pub fn dependencies_of(&self, node_id: NodeId) -> Vec<NodeId> {
        self.predecessors(node_id).iter().map(|(n, _)| n.id).collect()
    }

    /// Returns the ids of nodes that directly depend on this node (its
    /// successors).
    #[must_use]
    pub fn dependents_of(&self, node_id: NodeId) -> Vec<NodeId> {
        self.successors(node_id).iter().map(|(n, _)| n.id).collect()
    }

    /// Computes a topological order over the whole graph using Kahn's
    /// algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] if the graph isn't a DAG; a
    /// self-loop counts as a cycle.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        for idx in self.graph.node_indices() {
            in_degree.insert(idx, self.graph.edges_directed(idx, Direction::Incoming).count());
        }

        let mut queue: VecDeque<NodeIndex> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&idx, _)| idx)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(idx) = queue.pop_front() {
            if let Some(node) = self.graph.node_weight(idx) {
                order.push(node.id);
            }
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                let target = edge.target();
                let degree = in_degree.get_mut(&target).expect("target tracked");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(target);
                }
            }
        }

        if order.len() != self.graph.node_count() {
            return Err(GraphError::CycleDetected);
        }

        Ok(order)
    }

    /// Returns every node reachable by following outgoing edges from
    /// `start`, not including `start` itself.
    ///
    /// Used to compute the forward-reachable affected set for a
    /// cancellation or a skip cascade.
    #[must_use]
    pub fn reachable_from(&self, start: NodeId) -> Vec<NodeId> {
        let Some(&start_index) = self.node_index_map.get(&start) else {
            return Vec::new();
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([start_index]);
        let mut reachable = Vec::new();

        while let Some(idx) = queue.pop_front() {
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                let target = edge.target();
                if visited.insert(target) {
                    if let Some(node) = self.graph.node_weight(target) {
                        reachable.push(node.id);
                    }
                    queue.push_back(target);
                }
            }
        }

        reachable
    }

    /// Checks the graph is a valid DAG.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] if the graph contains a cycle.
    pub fn validate(&self) -> Result<(), GraphError> {
        if petgraph::algo::is_cyclic_directed(&self.graph) {
            return Err(GraphError::CycleDetected);
        }
        Ok(())
    }

    /// Rebuilds the node index map after deserialization or node removal.
    pub fn rebuild_index_map(&mut self) {
        self.node_index_map.clear();
        for index in self.graph.node_indices() {
            if let Some(node) = self.graph.node_weight(index) {
                self.node_index_map.insert(node.id, index);
            }
        }
    }
}

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Custom serde for petgraph DiGraph.
mod graph_serde {
    use super::*;
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeStruct;

    pub fn serialize<S>(graph: &DiGraph<Node, Edge>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let nodes: Vec<_> = graph.node_weights().cloned().collect();
        let edges: Vec<_> = graph
            .edge_references()
            .map(|e| {
                let source_id = graph.node_weight(e.source()).map(|n| n.id);
                let target_id = graph.node_weight(e.target()).map(|n| n.id);
                (source_id, target_id, e.weight().clone())
            })
            .collect();

        let mut state = serializer.serialize_struct("Graph", 2)?;
        state.serialize_field("nodes", &nodes)?;
        state.serialize_field("edges", &edges)?;
        state.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DiGraph<Node, Edge>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        type EdgeTuple = (Option<NodeId>, Option<NodeId>, Edge);

        struct GraphVisitor;

        impl<'de> Visitor<'de> for GraphVisitor {
            type Value = DiGraph<Node, Edge>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a workflow graph with nodes and edges")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut nodes: Option<Vec<Node>> = None;
                let mut edges: Option<Vec<EdgeTuple>> = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "nodes" => nodes = Some(map.next_value()?),
                        "edges" => edges = Some(map.next_value()?),
                        _ => {
                            let _ = map.next_value::<serde::de::IgnoredAny>()?;
                        }
                    }
                }

                let nodes = nodes.unwrap_or_default();
                let edges = edges.unwrap_or_default();

                let mut graph = DiGraph::new();
                let mut id_to_index = HashMap::new();

                for node in nodes {
                    let id = node.id;
                    let index = graph.add_node(node);
                    id_to_index.insert(id, index);
                }

                for (source_id, target_id, edge) in edges {
                    let (Some(source), Some(target)) = (source_id, target_id) else {
                        continue;
                    };
                    let (Some(&source_idx), Some(&target_idx)) =
                        (id_to_index.get(&source), id_to_index.get(&target))
                    else {
                        continue;
                    };
                    graph.add_edge(source_idx, target_idx, edge);
                }

                Ok(graph)
            }
        }

        deserializer.deserialize_struct("Graph", &["nodes", "edges"], GraphVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_node(name: &str) -> Node {
        Node::new("noop", name)
    }

    #[test]
    fn add_and_get_node() {
        let mut graph = WorkflowGraph::new();
        let node = create_node("Test Trigger");
        let node_id = node.id;
        graph.add_node(node);

        let retrieved = graph.get_node(node_id);
        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap().name, "Test Trigger");
    }

    #[test]
    fn add_edge_succeeds_for_known_nodes() {
        let mut graph = WorkflowGraph::new();
        let a = create_node("A");
        let b = create_node("B");
        let (a_id, b_id) = (a.id, b.id);

        graph.add_node(a);
        graph.add_node(b);

        let result = graph.add_edge(a_id, b_id, Edge::new("output", "input"));
        assert!(result.is_ok());
    }

    #[test]
    fn add_edge_rejects_unknown_node() {
        let mut graph = WorkflowGraph::new();
        let a = create_node("A");
        let a_id = a.id;
        graph.add_node(a);

        let result = graph.add_edge(a_id, NodeId::new(), Edge::default_ports());
        assert!(result.is_err());
    }

    #[test]
    fn entry_nodes_returns_nodes_without_incoming() {
        let mut graph = WorkflowGraph::new();
        let a = create_node("A");
        let b = create_node("B");
        let (a_id, b_id) = (a.id, b.id);

        graph.add_node(a);
        graph.add_node(b);
        graph.add_edge(a_id, b_id, Edge::default_ports()).unwrap();

        let entries = graph.entry_nodes();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "A");
    }

    #[test]
    fn topo_order_respects_dependencies() {
        let mut graph = WorkflowGraph::new();
        let a = create_node("A");
        let b = create_node("B");
        let c = create_node("C");
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);

        graph.add_node(a);
        graph.add_node(b);
        graph.add_node(c);
        graph.add_edge(a_id, b_id, Edge::default_ports()).unwrap();
        graph.add_edge(b_id, c_id, Edge::default_ports()).unwrap();

        let order = graph.topo_order().expect("acyclic");
        let pos = |id: NodeId| order.iter().position(|&n| n == id).unwrap();
        assert!(pos(a_id) < pos(b_id));
        assert!(pos(b_id) < pos(c_id));
    }

    #[test]
    fn topo_order_detects_self_loop() {
        let mut graph = WorkflowGraph::new();
        let a = create_node("A");
        let a_id = a.id;
        graph.add_node(a);
        graph.add_edge(a_id, a_id, Edge::default_ports()).unwrap();

        assert!(matches!(graph.topo_order(), Err(GraphError::CycleDetected)));
    }

    #[test]
    fn reachable_from_excludes_start_and_unrelated_branches() {
        let mut graph = WorkflowGraph::new();
        let a = create_node("A");
        let b = create_node("B");
        let c = create_node("C");
        let d = create_node("D (unrelated)");
        let (a_id, b_id, c_id, d_id) = (a.id, b.id, c.id, d.id);

        graph.add_node(a);
        graph.add_node(b);
        graph.add_node(c);
        graph.add_node(d);
        graph.add_edge(a_id, b_id, Edge::default_ports()).unwrap();
        graph.add_edge(b_id, c_id, Edge::default_ports()).unwrap();

        let reachable = graph.reachable_from(a_id);
        assert!(reachable.contains(&b_id));
        assert!(reachable.contains(&c_id));
        assert!(!reachable.contains(&a_id));
        assert!(!reachable.contains(&d_id));
    }

    #[test]
    fn validate_safety_detects_dangling_edge() {
        let known_ids = HashSet::from([NodeId::new()]);
        let dangling = NodeId::new();
        let connections = vec![Connection::with_default_ports(dangling, dangling)];

        let result = WorkflowGraph::validate_safety(&known_ids, &connections);
        assert!(matches!(result, Err(GraphError::DanglingEdge { .. })));
    }

    #[test]
    fn validate_safety_detects_cycle() {
        let a = NodeId::new();
        let b = NodeId::new();
        let known_ids = HashSet::from([a, b]);
        let connections = vec![
            Connection::with_default_ports(a, b),
            Connection::with_default_ports(b, a),
        ];

        let result = WorkflowGraph::validate_safety(&known_ids, &connections);
        assert!(matches!(result, Err(GraphError::CycleDetected)));
    }

    #[test]
    fn try_from_snapshot_builds_valid_graph() {
        let a = create_node("A");
        let b = create_node("B");
        let (a_id, b_id) = (a.id, b.id);
        let connections = vec![Connection::with_default_ports(a_id, b_id)];

        let graph = WorkflowGraph::try_from_snapshot(vec![a, b], connections).expect("valid");
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn graph_serde_roundtrip() {
        let mut graph = WorkflowGraph::new();
        let a = create_node("A");
        let b = create_node("B");
        let (a_id, b_id) = (a.id, b.id);

        graph.add_node(a);
        graph.add_node(b);
        graph.add_edge(a_id, b_id, Edge::default_ports()).unwrap();

        let json = serde_json::to_string(&graph).expect("serialize");
        let parsed: WorkflowGraph = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(parsed.node_count(), 2);
        assert_eq!(parsed.edge_count(), 1);
        assert!(parsed.get_node(a_id).is_some(), "deserialize must rebuild the node index map");
        assert!(parsed.get_node(b_id).is_some());
    }
}
