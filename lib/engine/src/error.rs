//! Error types for the engine crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `GraphError`: Low-level graph operations (nodes, ports, edges)
//! - `ExecutionError`: Workflow execution failures
//! - `WorkflowError`: High-level workflow operations (wraps lower errors via context)
//! - `SandboxError`: Node execution failures, carrying the taxonomy a retry
//!   policy decides against

use crate::node::NodeId;
use flowcore_core::WorkflowId;
use std::fmt;

/// Errors from graph operations.
///
/// These errors contain only information available at the graph layer.
/// Workflow-level context (like workflow_id) should be added by the caller
/// using `.context()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Node with the given ID was not found in the graph.
    NodeNotFound { node_id: NodeId },
    /// Source port not found on node.
    SourcePortNotFound { node_id: NodeId, port_name: String },
    /// Target port not found on node.
    TargetPortNotFound { node_id: NodeId, port_name: String },
    /// Port schemas are incompatible.
    IncompatibleSchemas {
        source_node: NodeId,
        source_port: String,
        target_node: NodeId,
        target_port: String,
    },
    /// A required input port has no incoming edge.
    RequiredInputMissing { node_id: NodeId, port_name: String },
    /// A connection names a node id that isn't present in the snapshot.
    DanglingEdge { node_id: NodeId },
    /// Graph contains cycles.
    CycleDetected,
    /// A run's ready queue emptied with unfinished nodes still pending —
    /// every remaining node is blocked on a dependency that will never
    /// complete (typically one upstream of it failed or was skipped
    /// without the failure being recorded against it).
    DependencyDeadlock { node_id: NodeId },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => {
                write!(f, "node not found: {node_id}")
            }
            Self::SourcePortNotFound { node_id, port_name } => {
                write!(f, "source port '{port_name}' not found on node {node_id}")
            }
            Self::TargetPortNotFound { node_id, port_name } => {
                write!(f, "target port '{port_name}' not found on node {node_id}")
            }
            Self::IncompatibleSchemas {
                source_node,
                source_port,
                target_node,
                target_port,
            } => {
                write!(
                    f,
                    "incompatible schemas: {source_node}:{source_port} -> {target_node}:{target_port}"
                )
            }
            Self::RequiredInputMissing { node_id, port_name } => {
                write!(
                    f,
                    "required input port '{port_name}' on node {node_id} has no incoming edge"
                )
            }
            Self::DanglingEdge { node_id } => {
                write!(f, "connection references unknown node {node_id}")
            }
            Self::CycleDetected => write!(f, "graph contains cycles"),
            Self::DependencyDeadlock { node_id } => {
                write!(f, "node {node_id} can never become ready: a dependency will not complete")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Classification of a node execution failure, consumed by the retry
/// policy and surfaced in history for operators.
///
/// Only `Transient` failures are retried; every other kind fails the node
/// on first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input failed validation against the node's declared schema.
    Validation,
    /// A failure expected to be intermittent: network blip, rate limit,
    /// upstream 5xx. Eligible for retry.
    Transient,
    /// A failure that will recur identically on retry: bad credentials,
    /// malformed parameters, node-type bug.
    Permanent,
    /// Credential resolution or an upstream auth challenge failed.
    Auth,
    /// A configured resource cap (timeout, memory, output size, network
    /// egress rule) was hit.
    ResourceLimit,
    /// A node's output attempted something unsafe: a reserved/
    /// prototype-pollution key, or a credential appeared in plaintext
    /// where a masked value was expected.
    Security,
}

impl ErrorKind {
    /// Whether this kind of failure should be retried under a node's
    /// retry policy.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// An error raised by the node sandbox while preparing, executing, or
/// validating the output of a single node invocation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SandboxError {
    pub message: String,
    pub kind: ErrorKind,
    pub stack: Option<String>,
}

impl SandboxError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            stack: None,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    #[must_use]
    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceLimit, message)
    }

    #[must_use]
    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Security, message)
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for SandboxError {}

/// Errors during workflow execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Node execution failed.
    NodeFailed { node_id: NodeId, reason: String, kind: ErrorKind },
    /// Node execution timed out.
    NodeTimeout { node_id: NodeId },
    /// Required input data was not provided.
    MissingInput { node_id: NodeId, port_name: String },
    /// Output schema or safety validation failed.
    OutputValidationFailed { node_id: NodeId, reason: String },
    /// Execution was cancelled.
    Cancelled,
    /// The run's admission was rejected before any node ran.
    AdmissionRejected { reason: String },
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeFailed { node_id, reason, kind } => {
                write!(f, "node {node_id} failed ({kind:?}): {reason}")
            }
            Self::NodeTimeout { node_id } => {
                write!(f, "node {node_id} timed out")
            }
            Self::MissingInput { node_id, port_name } => {
                write!(f, "missing input '{port_name}' for node {node_id}")
            }
            Self::OutputValidationFailed { node_id, reason } => {
                write!(f, "output validation failed for node {node_id}: {reason}")
            }
            Self::Cancelled => write!(f, "execution cancelled"),
            Self::AdmissionRejected { reason } => write!(f, "admission rejected: {reason}"),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// High-level workflow errors.
///
/// Use these to add workflow context when wrapping lower-level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// Workflow not found.
    NotFound { workflow_id: WorkflowId },
    /// Invalid state transition.
    InvalidStateTransition { from: String, to: String },
    /// Error in graph operation (use as context wrapper).
    GraphOperation { workflow_id: WorkflowId },
    /// Error during execution (use as context wrapper).
    Execution { workflow_id: WorkflowId },
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::InvalidStateTransition { from, to } => {
                write!(f, "invalid state transition from {from} to {to}")
            }
            Self::GraphOperation { workflow_id } => {
                write!(f, "graph operation failed for workflow {workflow_id}")
            }
            Self::Execution { workflow_id } => {
                write!(f, "execution failed for workflow {workflow_id}")
            }
        }
    }
}

impl std::error::Error for WorkflowError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_display() {
        let node_id = NodeId::new();
        let err = GraphError::NodeNotFound { node_id };
        assert!(err.to_string().contains("node not found"));
    }

    #[test]
    fn graph_error_source_port_not_found() {
        let node_id = NodeId::new();
        let err = GraphError::SourcePortNotFound {
            node_id,
            port_name: "output".to_string(),
        };
        assert!(err.to_string().contains("source port 'output' not found"));
    }

    #[test]
    fn graph_error_dangling_edge_display() {
        let node_id = NodeId::new();
        let err = GraphError::DanglingEdge { node_id };
        assert!(err.to_string().contains("unknown node"));
    }

    #[test]
    fn graph_error_dependency_deadlock_display() {
        let node_id = NodeId::new();
        let err = GraphError::DependencyDeadlock { node_id };
        assert!(err.to_string().contains("never become ready"));
    }

    #[test]
    fn execution_error_display() {
        let node_id = NodeId::new();
        let err = ExecutionError::NodeFailed {
            node_id,
            reason: "timeout".to_string(),
            kind: ErrorKind::Transient,
        };
        assert!(err.to_string().contains("failed"));
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn workflow_error_display() {
        let workflow_id = WorkflowId::new();
        let err = WorkflowError::NotFound { workflow_id };
        assert!(err.to_string().contains("workflow not found"));
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::ResourceLimit.is_retryable());
        assert!(!ErrorKind::Security.is_retryable());
    }

    #[test]
    fn sandbox_error_carries_kind_and_message() {
        let err = SandboxError::transient("upstream 503").with_stack("at line 4");
        assert_eq!(err.kind, ErrorKind::Transient);
        assert_eq!(err.stack.as_deref(), Some("at line 4"));
    }
}
