//! Per-run execution state: the mutable record the Flow Execution Engine
//! owns and updates while driving a single execution to completion.
//!
//! An [`ExecutionContext`] is created once, at admission, and lives until
//! the run reaches a terminal [`FlowStatus`]. Exactly one task ever holds
//! it at a time — the Engine's scheduling loop — so none of this module's
//! types need internal synchronization.

use crate::bundle::Bundle;
use crate::error::SandboxError;
use crate::node::NodeId;
use crate::snapshot::RetryPolicy;
use crate::trigger::TriggerType;
use chrono::{DateTime, Utc};
use flowcore_core::{UserId, WorkflowId, WorkflowRunId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet, VecDeque};

/// The lifecycle status of a single node within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl NodeStatus {
    /// A terminal status never transitions further within one execution.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

/// Per-node state tracked for the lifetime of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub dependencies: HashSet<NodeId>,
    pub dependents: HashSet<NodeId>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Coarse progress, 0-100. Most node types only ever report 0 and 100;
    /// long-running ones (bulk imports, polling waits) may report between.
    pub progress: u8,
    pub input_bundle: Bundle,
    pub output_bundle: Bundle,
    pub error: Option<SandboxError>,
    /// Set on a `Failed` node whose catalog entry opts into
    /// `continueOnFail`: its dependents are still considered fed (with
    /// whatever input they have, possibly empty for this channel) rather
    /// than cascaded as unreachable.
    pub continue_on_fail: bool,
}

impl NodeState {
    #[must_use]
    pub fn new(dependencies: HashSet<NodeId>, dependents: HashSet<NodeId>) -> Self {
        Self {
            status: NodeStatus::Idle,
            dependencies,
            dependents,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            progress: 0,
            input_bundle: Bundle::new(),
            output_bundle: Bundle::new(),
            error: None,
            continue_on_fail: false,
        }
    }

    pub fn queue(&mut self) {
        self.status = NodeStatus::Queued;
    }

    pub fn start(&mut self, input_bundle: Bundle) {
        self.status = NodeStatus::Running;
        self.started_at = Some(Utc::now());
        self.input_bundle = input_bundle;
        self.progress = 0;
    }

    fn finish_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = self.started_at.map(|start| (now - start).num_milliseconds());
        now
    }

    pub fn complete(&mut self, output_bundle: Bundle) {
        self.finish_at();
        self.status = NodeStatus::Completed;
        self.output_bundle = output_bundle;
        self.progress = 100;
    }

    pub fn fail(&mut self, error: SandboxError) {
        self.finish_at();
        self.status = NodeStatus::Failed;
        self.error = Some(error);
    }

    pub fn cancel(&mut self) {
        self.finish_at();
        self.status = NodeStatus::Cancelled;
    }

    /// Marks the node Skipped without ever having run — the branching
    /// not-taken path or a node unreachable after an upstream failure.
    pub fn skip(&mut self) {
        self.finished_at = Some(Utc::now());
        self.status = NodeStatus::Skipped;
    }
}

/// Run-scoped overrides of the workflow's default timeout/retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOptions {
    pub timeout_ms: Option<u64>,
    pub retry: Option<RetryPolicy>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            retry: None,
        }
    }
}

/// The final classification of a completed, failed, or cancelled
/// execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Completed,
    /// At least one node failed and no node completed.
    Failed,
    Cancelled,
    /// At least one node failed and at least one node completed.
    Partial,
}

/// One run's mutable state, owned by a single Flow Execution Engine
/// instance for its entire lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: WorkflowRunId,
    pub workflow_id: WorkflowId,
    pub user_id: UserId,
    pub trigger_type: TriggerType,
    pub trigger_data: JsonValue,
    pub started_at: DateTime<Utc>,
    pub options: ExecutionOptions,
    pub cancelled: bool,
    pub paused: bool,
    pub node_states: HashMap<NodeId, NodeState>,
    pub execution_path: Vec<NodeId>,
    pub ready_queue: VecDeque<NodeId>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        user_id: UserId,
        trigger_type: TriggerType,
        trigger_data: JsonValue,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            execution_id: WorkflowRunId::new(),
            workflow_id,
            user_id,
            trigger_type,
            trigger_data,
            started_at: Utc::now(),
            options,
            cancelled: false,
            paused: false,
            node_states: HashMap::new(),
            execution_path: Vec::new(),
            ready_queue: VecDeque::new(),
        }
    }

    /// Sets the cancellation flag. Idempotent: cancelling an
    /// already-cancelled context is a no-op.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.ready_queue.clear();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Idempotent: pausing an already-paused context is a no-op. Has no
    /// effect on a cancelled context (cancellation is terminal).
    pub fn pause(&mut self) {
        if !self.cancelled {
            self.paused = true;
        }
    }

    /// Idempotent; has no effect on a cancelled context.
    pub fn resume(&mut self) {
        if !self.cancelled {
            self.paused = false;
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Records a node reaching a terminal status in the completed path.
    pub fn push_path(&mut self, node_id: NodeId) {
        self.execution_path.push(node_id);
    }

    /// Classifies the final [`FlowResult`] from the current node states.
    /// Only meaningful once the scheduling loop has actually stopped
    /// (ready queue drained or cancellation requested).
    #[must_use]
    pub fn to_result(&self) -> FlowResult {
        let mut executed = Vec::new();
        let mut failed = Vec::new();

        for node_id in &self.execution_path {
            if let Some(state) = self.node_states.get(node_id) {
                match state.status {
                    NodeStatus::Completed => executed.push(*node_id),
                    NodeStatus::Failed => failed.push(*node_id),
                    _ => {}
                }
            }
        }

        let status = if self.cancelled {
            FlowStatus::Cancelled
        } else if failed.is_empty() {
            FlowStatus::Completed
        } else if executed.is_empty() {
            FlowStatus::Failed
        } else {
            FlowStatus::Partial
        };

        let total_duration_ms = (Utc::now() - self.started_at).num_milliseconds();

        FlowResult {
            status,
            executed,
            failed,
            path: self.execution_path.clone(),
            total_duration_ms,
            node_results: self.node_states.clone(),
        }
    }
}

/// The outcome of one completed, failed, or cancelled execution, returned
/// by `executeFromNode`/`executeFromTrigger` once the scheduling loop
/// stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResult {
    pub status: FlowStatus,
    pub executed: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    pub path: Vec<NodeId>,
    pub total_duration_ms: i64,
    pub node_results: HashMap<NodeId, NodeState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_context() -> ExecutionContext {
        ExecutionContext::new(
            WorkflowId::new(),
            UserId::new(),
            TriggerType::Manual,
            json!({}),
            ExecutionOptions::default(),
        )
    }

    #[test]
    fn node_status_terminal_classification() {
        assert!(!NodeStatus::Idle.is_terminal());
        assert!(!NodeStatus::Queued.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(NodeStatus::Completed.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(NodeStatus::Cancelled.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
    }

    #[test]
    fn node_state_lifecycle_records_duration() {
        let mut state = NodeState::new(HashSet::new(), HashSet::new());
        state.start(Bundle::seed_main(json!({"x": 1})));
        assert_eq!(state.status, NodeStatus::Running);
        state.complete(Bundle::seed_main(json!({"y": 2})));
        assert_eq!(state.status, NodeStatus::Completed);
        assert_eq!(state.progress, 100);
        assert!(state.duration_ms.is_some());
    }

    #[test]
    fn node_state_failure_carries_error() {
        let mut state = NodeState::new(HashSet::new(), HashSet::new());
        state.start(Bundle::new());
        state.fail(SandboxError::transient("upstream 503"));
        assert_eq!(state.status, NodeStatus::Failed);
        assert!(state.error.is_some());
    }

    #[test]
    fn cancel_is_idempotent_and_empties_queue() {
        let mut ctx = new_context();
        ctx.ready_queue.push_back(NodeId::new());
        ctx.cancel();
        ctx.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.ready_queue.is_empty());
    }

    #[test]
    fn pause_then_cancel_is_terminal() {
        let mut ctx = new_context();
        ctx.pause();
        assert!(ctx.is_paused());
        ctx.cancel();
        ctx.resume();
        assert!(ctx.is_paused(), "resume must not un-pause a cancelled context");
    }

    #[test]
    fn to_result_completed_when_all_nodes_succeed() {
        let mut ctx = new_context();
        let a = NodeId::new();
        let mut state = NodeState::new(HashSet::new(), HashSet::new());
        state.start(Bundle::new());
        state.complete(Bundle::new());
        ctx.node_states.insert(a, state);
        ctx.push_path(a);

        let result = ctx.to_result();
        assert_eq!(result.status, FlowStatus::Completed);
        assert_eq!(result.executed, vec![a]);
        assert!(result.failed.is_empty());
    }

    #[test]
    fn to_result_partial_when_some_nodes_fail_and_some_succeed() {
        let mut ctx = new_context();
        let a = NodeId::new();
        let b = NodeId::new();

        let mut completed = NodeState::new(HashSet::new(), HashSet::new());
        completed.start(Bundle::new());
        completed.complete(Bundle::new());
        ctx.node_states.insert(a, completed);
        ctx.push_path(a);

        let mut failed = NodeState::new(HashSet::new(), HashSet::new());
        failed.start(Bundle::new());
        failed.fail(SandboxError::permanent("boom"));
        ctx.node_states.insert(b, failed);
        ctx.push_path(b);

        let result = ctx.to_result();
        assert_eq!(result.status, FlowStatus::Partial);
        assert_eq!(result.executed, vec![a]);
        assert_eq!(result.failed, vec![b]);
    }

    #[test]
    fn to_result_failed_when_nothing_completes() {
        let mut ctx = new_context();
        let a = NodeId::new();
        let mut failed = NodeState::new(HashSet::new(), HashSet::new());
        failed.start(Bundle::new());
        failed.fail(SandboxError::permanent("boom"));
        ctx.node_states.insert(a, failed);
        ctx.push_path(a);

        assert_eq!(ctx.to_result().status, FlowStatus::Failed);
    }

    #[test]
    fn to_result_cancelled_overrides_node_outcomes() {
        let mut ctx = new_context();
        let a = NodeId::new();
        let mut completed = NodeState::new(HashSet::new(), HashSet::new());
        completed.start(Bundle::new());
        completed.complete(Bundle::new());
        ctx.node_states.insert(a, completed);
        ctx.push_path(a);
        ctx.cancel();

        assert_eq!(ctx.to_result().status, FlowStatus::Cancelled);
    }
}
