//! Readiness tracking for a single run.
//!
//! The engine used to track "what's left to run" as a second graph,
//! marking in-progress and failed nodes with self-edges. That graph was
//! mutated as the run progressed, which made two different runs of the
//! same workflow share no code path for "what counts as ready" versus
//! "what the workflow looks like" — and a self-edge on a failed node is
//! indistinguishable from an accidental cycle to anything that later reads
//! the graph back.
//!
//! This tracker instead keeps one counter per node: the number of
//! dependencies it's still waiting on. The workflow graph itself is never
//! touched during a run. A node becomes ready exactly when its counter
//! hits zero; nothing about "ready" is ever a graph query.
use crate::graph::WorkflowGraph;
use crate::node::NodeId;
use std::collections::{HashMap, HashSet, VecDeque};

/// Tracks, for a single run, which nodes are still waiting on
/// dependencies, which are ready to execute, and which have reached a
/// terminal state.
#[derive(Debug, Clone)]
pub struct ReadinessTracker {
    dependents: HashMap<NodeId, Vec<NodeId>>,
    remaining: HashMap<NodeId, usize>,
    ready: VecDeque<NodeId>,
    finished: HashSet<NodeId>,
    total_nodes: usize,
}

impl ReadinessTracker {
    /// Builds a tracker from a workflow snapshot's graph. Nodes with no
    /// dependencies start in the ready queue, in the graph's entry-node
    /// order.
    #[must_use]
    pub fn from_graph(graph: &WorkflowGraph) -> Self {
        let mut dependents = HashMap::new();
        let mut remaining = HashMap::new();
        let mut ready = VecDeque::new();
        let mut total_nodes = 0;

        for node in graph.nodes() {
            total_nodes += 1;
            let deps = graph.dependencies_of(node.id);
            remaining.insert(node.id, deps.len());
            dependents.insert(node.id, graph.dependents_of(node.id));
            if deps.is_empty() {
                ready.push_back(node.id);
            }
        }

        Self {
            dependents,
            remaining,
            ready,
            finished: HashSet::new(),
            total_nodes,
        }
    }

    /// Pops the next ready node, if any.
    pub fn pop_ready(&mut self) -> Option<NodeId> {
        self.ready.pop_front()
    }

    /// True if at least one node is ready to execute.
    #[must_use]
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Records that `node_id` reached a terminal state — completed,
    /// failed, skipped, or cancelled, it doesn't matter which. Every
    /// dependent's remaining-dependency counter is decremented regardless
    /// of how `node_id` finished; any that reach zero are appended to the
    /// ready queue and returned.
    ///
    /// This only tracks *when* a dependent has heard back from all of its
    /// predecessors, not whether any of them actually produced input for
    /// it — a dependent popped off the ready queue may still need to be
    /// skipped rather than run, if none of its predecessors fed it. That
    /// call is the caller's, made by inspecting node state once the
    /// dependent comes off the queue.
    pub fn record_finished(&mut self, node_id: NodeId) -> Vec<NodeId> {
        self.finished.insert(node_id);
        let mut newly_ready = Vec::new();

        if let Some(dependents) = self.dependents.get(&node_id).cloned() {
            for dependent in dependents {
                if self.finished.contains(&dependent) {
                    continue;
                }
                if let Some(count) = self.remaining.get_mut(&dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.ready.push_back(dependent);
                        newly_ready.push(dependent);
                    }
                }
            }
        }

        newly_ready
    }

    /// True once every node the tracker was built with has reached a
    /// terminal state.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.finished.len() == self.total_nodes
    }

    /// Nodes that are neither finished nor currently ready — every node
    /// still waiting on at least one dependency. Non-empty only once the
    /// ready queue has drained with the run incomplete, which means every
    /// node left here is permanently blocked: the dependency it needs
    /// will never reach a state that satisfies it.
    #[must_use]
    pub fn stalled(&self) -> Vec<NodeId> {
        self.remaining
            .keys()
            .filter(|id| !self.finished.contains(id))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Connection;
    use crate::node::Node;

    fn diamond() -> (WorkflowGraph, NodeId, NodeId, NodeId, NodeId) {
        let a = Node::new("noop", "A");
        let b = Node::new("noop", "B");
        let c = Node::new("noop", "C");
        let d = Node::new("noop", "D");
        let (a_id, b_id, c_id, d_id) = (a.id, b.id, c.id, d.id);

        let graph = WorkflowGraph::try_from_snapshot(
            vec![a, b, c, d],
            vec![
                Connection::with_default_ports(a_id, b_id),
                Connection::with_default_ports(a_id, c_id),
                Connection::with_default_ports(b_id, d_id),
                Connection::with_default_ports(c_id, d_id),
            ],
        )
        .expect("valid diamond");

        (graph, a_id, b_id, c_id, d_id)
    }

    #[test]
    fn entry_node_starts_ready() {
        let (graph, a_id, ..) = diamond();
        let mut tracker = ReadinessTracker::from_graph(&graph);
        assert_eq!(tracker.pop_ready(), Some(a_id));
        assert!(!tracker.has_ready());
    }

    #[test]
    fn diamond_join_waits_for_both_branches() {
        let (graph, a_id, b_id, c_id, d_id) = diamond();
        let mut tracker = ReadinessTracker::from_graph(&graph);

        tracker.pop_ready();
        let newly_ready = tracker.record_finished(a_id);
        assert_eq!(newly_ready.len(), 2);
        assert!(newly_ready.contains(&b_id));
        assert!(newly_ready.contains(&c_id));

        tracker.pop_ready();
        let newly_ready = tracker.record_finished(b_id);
        assert!(newly_ready.is_empty(), "D still waits on C");

        tracker.pop_ready();
        let newly_ready = tracker.record_finished(c_id);
        assert_eq!(newly_ready, vec![d_id]);
    }

    #[test]
    fn run_completes_once_every_node_finishes() {
        let (graph, a_id, b_id, c_id, d_id) = diamond();
        let mut tracker = ReadinessTracker::from_graph(&graph);
        for id in [a_id, b_id, c_id, d_id] {
            tracker.record_finished(id);
        }
        assert!(tracker.is_complete());
    }

    #[test]
    fn a_failed_node_still_decrements_its_dependents() {
        let a = Node::new("noop", "A");
        let b = Node::new("noop", "B");
        let c = Node::new("noop", "C");
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        let graph = WorkflowGraph::try_from_snapshot(
            vec![a, b, c],
            vec![
                Connection::with_default_ports(a_id, b_id),
                Connection::with_default_ports(b_id, c_id),
            ],
        )
        .expect("valid chain");

        let mut tracker = ReadinessTracker::from_graph(&graph);
        tracker.pop_ready();
        // The tracker doesn't know or care that `a` failed rather than
        // completed — it's the caller's job to look at node state and
        // decide whether a newly-ready dependent should actually run or
        // be skipped as unreachable.
        let newly_ready = tracker.record_finished(a_id);
        assert_eq!(newly_ready, vec![b_id]);

        tracker.record_finished(b_id);
        assert!(!tracker.is_complete());
        assert_eq!(tracker.stalled(), vec![c_id]);

        tracker.record_finished(c_id);
        assert!(tracker.is_complete());
    }

    #[test]
    fn edge_without_its_own_dependency_ignores_graph_mutation() {
        let (graph, a_id, b_id, c_id, d_id) = diamond();
        let tracker = ReadinessTracker::from_graph(&graph);
        // The graph is untouched by construction: four nodes still exist.
        assert_eq!(graph.node_count(), 4);
        drop(tracker);
        // A fresh tracker built again from the same graph behaves
        // identically — no state leaked into the graph itself.
        let mut second = ReadinessTracker::from_graph(&graph);
        assert_eq!(second.pop_ready(), Some(a_id));
        let _ = (b_id, c_id, d_id);
    }
}
