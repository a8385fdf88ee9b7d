//! Error types for the concurrency crate.

use flowcore_core::{UserId, WorkflowId};
use std::fmt;

/// Why an admission request was rejected outright, rather than queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The global concurrent-execution cap is at capacity and the
    /// request's strategy doesn't queue.
    GlobalCapacity,
    /// The workflow's concurrent-execution cap is at capacity.
    WorkflowCapacity,
    /// The user's concurrent-execution cap is at capacity.
    UserCapacity,
    /// An isolated run overlaps this request's affected node set and the
    /// strategy doesn't queue.
    IsolationConflict,
    /// The admission queue is already at its maximum length.
    QueueFull,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GlobalCapacity => write!(f, "global concurrency cap reached"),
            Self::WorkflowCapacity => write!(f, "per-workflow concurrency cap reached"),
            Self::UserCapacity => write!(f, "per-user concurrency cap reached"),
            Self::IsolationConflict => write!(f, "overlaps an in-flight isolated execution"),
            Self::QueueFull => write!(f, "admission queue is full"),
        }
    }
}

/// Errors surfaced by [`crate::manager::ConcurrencyManager`] operations
/// other than admission itself (admission's own rejection path is
/// [`RejectReason`], not this type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// `release`/`cancel_queued` named an id the manager has no record of.
    UnknownExecution,
    /// Attempted to acquire a lock already held by another execution.
    LockHeld { workflow_id: WorkflowId, node_id: flowcore_engine::NodeId },
    /// Attempted an operation on behalf of a user that doesn't own the
    /// referenced admission.
    NotOwner { user_id: UserId },
}

impl fmt::Display for ConcurrencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownExecution => write!(f, "no admitted or queued execution with this id"),
            Self::LockHeld { workflow_id, node_id } => {
                write!(f, "lock already held for {workflow_id}/{node_id}")
            }
            Self::NotOwner { user_id } => write!(f, "user {user_id} does not own this admission"),
        }
    }
}

impl std::error::Error for ConcurrencyError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_display() {
        assert!(RejectReason::GlobalCapacity.to_string().contains("global"));
        assert!(RejectReason::IsolationConflict.to_string().contains("isolated"));
    }
}
