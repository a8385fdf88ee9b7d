//! Immutable run-time view of a workflow: the snapshot.
//!
//! A [`Workflow`](crate::definition::Workflow) is the mutable, editable
//! record a workflow gets stored and updated as. A [`WorkflowSnapshot`] is
//! the frozen form the execution engine actually runs against: the exact
//! graph and settings in effect at admission time, so an edit made to the
//! workflow mid-run never changes the shape of a run already underway.

use crate::definition::Workflow;
use crate::graph::WorkflowGraph;
use flowcore_core::WorkflowId;
use serde::{Deserialize, Serialize};

/// Retry policy applied to a node (or, as a default, to every node in a
/// workflow that doesn't override it) when it fails with a retryable
/// [`crate::error::ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retry attempts after the first failure. 0 means no retry.
    pub max_attempts: u32,
    /// Base delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each retry (exponential
    /// backoff). A value of 1.0 means a constant delay.
    pub backoff_multiplier: f64,
    /// Upper bound on any single retry delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// No retries: any failure fails the node immediately.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 0,
            backoff_multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// The delay to wait before retry attempt number `attempt` (1-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        if attempt == 0 {
            return std::time::Duration::ZERO;
        }
        let exponent = (attempt - 1) as i32;
        let scaled = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay_ms as f64).max(0.0);
        std::time::Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

/// Workflow-wide settings in effect for a run, frozen into the snapshot
/// at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Default per-node timeout, applied when a node doesn't declare its
    /// own. `None` means no timeout.
    pub default_timeout_ms: Option<u64>,
    /// Default retry policy, applied when a node doesn't declare its own.
    pub retry: RetryPolicy,
    /// Whether nodes in this workflow may address private/loopback/
    /// link-local network ranges. Defaults to `false`: outbound requests
    /// are restricted to public addresses unless explicitly allowed.
    pub allow_private_networks: bool,
    /// Hard ceiling on total run wall-clock time, in milliseconds. `None`
    /// means no run-level timeout beyond the per-node ones.
    pub max_run_duration_ms: Option<u64>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: Some(300_000),
            retry: RetryPolicy::default(),
            allow_private_networks: false,
            max_run_duration_ms: None,
        }
    }
}

/// The frozen graph and settings a single run executes against.
///
/// Built once, at admission time, from the workflow's current state; never
/// mutated afterward. A `WorkflowRun` carries one of these rather than a
/// live reference to the editable `Workflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: WorkflowId,
    pub workflow_version: String,
    pub graph: WorkflowGraph,
    pub settings: WorkflowSettings,
}

impl WorkflowSnapshot {
    /// Freezes a workflow into a snapshot suitable for a new run.
    #[must_use]
    pub fn from_workflow(workflow: &Workflow, settings: WorkflowSettings) -> Self {
        Self {
            workflow_id: workflow.id,
            workflow_version: workflow.metadata.version.clone(),
            graph: workflow.graph.clone(),
            settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retry_delay_is_zero() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.delay_for_attempt(1), std::time::Duration::ZERO);
    }

    #[test]
    fn retry_delay_backs_off_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        };
        assert_eq!(policy.delay_for_attempt(1).as_millis(), 100);
        assert_eq!(policy.delay_for_attempt(2).as_millis(), 200);
        assert_eq!(policy.delay_for_attempt(3).as_millis(), 400);
    }

    #[test]
    fn retry_delay_caps_at_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 1000,
            backoff_multiplier: 10.0,
            max_delay_ms: 5000,
        };
        assert_eq!(policy.delay_for_attempt(5).as_millis(), 5000);
    }

    #[test]
    fn snapshot_freezes_workflow_state() {
        let workflow = Workflow::new("Snapshot Test");
        let snapshot = WorkflowSnapshot::from_workflow(&workflow, WorkflowSettings::default());
        assert_eq!(snapshot.workflow_id, workflow.id);
        assert_eq!(snapshot.graph.node_count(), 0);
    }

    #[test]
    fn settings_default_denies_private_networks() {
        assert!(!WorkflowSettings::default().allow_private_networks);
    }
}
