//! History Sink: the narrow write interface the Flow Execution Engine
//! uses to persist execution and node-execution records.
//!
//! This module only defines the contract and an in-memory reference
//! implementation for tests; [`crate::nats`] provides the durable,
//! NATS-backed implementation the runtime wires up in production.

use crate::execution::FlowStatus;
use crate::fanout::LogLevel;
use crate::node::NodeId;
use crate::snapshot::WorkflowSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore_core::{UserId, WorkflowId, WorkflowRunId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// The execution/node-execution status vocabulary as persisted on the
/// wire (§6). Distinct from [`crate::execution::FlowStatus`] and
/// [`crate::execution::NodeStatus`], which are the Engine's richer
/// in-memory vocabulary for a run still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistedStatus {
    Running,
    Success,
    Error,
    Cancelled,
    Paused,
}

impl From<FlowStatus> for PersistedStatus {
    /// `Partial` has no dedicated wire value; it persists as `Error`
    /// (some node failed) while `failed[]`/`executed[]` on the in-memory
    /// [`crate::execution::FlowResult`] retain the finer distinction for
    /// callers that need it.
    fn from(status: FlowStatus) -> Self {
        match status {
            FlowStatus::Completed => Self::Success,
            FlowStatus::Failed | FlowStatus::Partial => Self::Error,
            FlowStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// A durable record of one execution, written once at admission (status
/// `Running`) and again at completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: WorkflowRunId,
    pub workflow_id: WorkflowId,
    pub user_id: UserId,
    pub status: PersistedStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub trigger_data: JsonValue,
    pub workflow_snapshot: WorkflowSnapshot,
    pub error: Option<JsonValue>,
}

/// A durable record of one node's execution within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub id: String,
    pub execution_id: WorkflowRunId,
    pub node_id: NodeId,
    pub status: PersistedStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input_data: JsonValue,
    pub output_data: JsonValue,
    pub error: Option<JsonValue>,
}

impl NodeExecutionRecord {
    /// The `executionId_nodeId` composite key §6 specifies as this
    /// record's primary key.
    #[must_use]
    pub fn composite_id(execution_id: WorkflowRunId, node_id: NodeId) -> String {
        format!("{execution_id}_{node_id}")
    }
}

/// Errors writing to or reading from the history sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    WriteFailed { reason: String },
    ReadFailed { reason: String },
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteFailed { reason } => write!(f, "history write failed: {reason}"),
            Self::ReadFailed { reason } => write!(f, "history read failed: {reason}"),
        }
    }
}

impl std::error::Error for HistoryError {}

/// The narrow write (and single read) interface the Engine uses for
/// durable persistence. Deliberately not a general-purpose repository:
/// the Engine never queries history for scheduling decisions, only
/// writes it and, via `find_execution`, answers status lookups.
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// # Errors
    /// Returns [`HistoryError::WriteFailed`] if the record can't be
    /// durably written.
    async fn create_execution(&self, record: ExecutionRecord) -> Result<(), HistoryError>;

    /// # Errors
    /// Returns [`HistoryError::WriteFailed`] if the record can't be
    /// durably written.
    async fn create_node_execution(&self, record: NodeExecutionRecord) -> Result<(), HistoryError>;

    /// # Errors
    /// Returns [`HistoryError::WriteFailed`] if the log line can't be
    /// durably written.
    async fn append_log(
        &self,
        execution_id: WorkflowRunId,
        level: LogLevel,
        message: &str,
        node_id: Option<NodeId>,
    ) -> Result<(), HistoryError>;

    /// Looks up an execution record by id, scoped to the requesting
    /// user. Returns `Ok(None)` for "not found" and for "found but owned
    /// by a different user" alike — the caller learns nothing about
    /// records it doesn't own.
    ///
    /// # Errors
    /// Returns [`HistoryError::ReadFailed`] on a storage-layer failure.
    async fn find_execution(
        &self,
        id: WorkflowRunId,
        user_id: UserId,
    ) -> Result<Option<ExecutionRecord>, HistoryError>;
}

#[derive(Debug, Clone)]
struct LoggedLine {
    level: LogLevel,
    message: String,
    node_id: Option<NodeId>,
}

/// An in-memory history sink, used by tests and as the default when no
/// durable backend is configured.
#[derive(Default)]
pub struct InMemoryHistorySink {
    executions: RwLock<HashMap<WorkflowRunId, ExecutionRecord>>,
    node_executions: RwLock<HashMap<String, NodeExecutionRecord>>,
    logs: RwLock<HashMap<WorkflowRunId, Vec<LoggedLine>>>,
}

impl InMemoryHistorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/inspection helper: every node-execution record written for
    /// one execution, in insertion order is not guaranteed (map-backed).
    #[must_use]
    pub fn node_executions_for(&self, execution_id: WorkflowRunId) -> Vec<NodeExecutionRecord> {
        self.node_executions
            .read()
            .expect("lock poisoned")
            .values()
            .filter(|record| record.execution_id == execution_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn log_count(&self, execution_id: WorkflowRunId) -> usize {
        self.logs
            .read()
            .expect("lock poisoned")
            .get(&execution_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl HistorySink for InMemoryHistorySink {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<(), HistoryError> {
        self.executions
            .write()
            .map_err(|_| HistoryError::WriteFailed { reason: "lock poisoned".to_string() })?
            .insert(record.id, record);
        Ok(())
    }

    async fn create_node_execution(&self, record: NodeExecutionRecord) -> Result<(), HistoryError> {
        self.node_executions
            .write()
            .map_err(|_| HistoryError::WriteFailed { reason: "lock poisoned".to_string() })?
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn append_log(
        &self,
        execution_id: WorkflowRunId,
        level: LogLevel,
        message: &str,
        node_id: Option<NodeId>,
    ) -> Result<(), HistoryError> {
        self.logs
            .write()
            .map_err(|_| HistoryError::WriteFailed { reason: "lock poisoned".to_string() })?
            .entry(execution_id)
            .or_default()
            .push(LoggedLine {
                level,
                message: message.to_string(),
                node_id,
            });
        Ok(())
    }

    async fn find_execution(
        &self,
        id: WorkflowRunId,
        user_id: UserId,
    ) -> Result<Option<ExecutionRecord>, HistoryError> {
        Ok(self
            .executions
            .read()
            .map_err(|_| HistoryError::ReadFailed { reason: "lock poisoned".to_string() })?
            .get(&id)
            .filter(|record| record.user_id == user_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::WorkflowGraph;
    use crate::snapshot::WorkflowSettings;
    use serde_json::json;

    fn sample_snapshot() -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: WorkflowId::new(),
            workflow_version: "1".to_string(),
            graph: WorkflowGraph::new(),
            settings: WorkflowSettings::default(),
        }
    }

    fn sample_record(user_id: UserId) -> ExecutionRecord {
        ExecutionRecord {
            id: WorkflowRunId::new(),
            workflow_id: WorkflowId::new(),
            user_id,
            status: PersistedStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            trigger_data: json!({}),
            workflow_snapshot: sample_snapshot(),
            error: None,
        }
    }

    #[test]
    fn partial_persists_as_error() {
        assert_eq!(PersistedStatus::from(FlowStatus::Partial), PersistedStatus::Error);
        assert_eq!(PersistedStatus::from(FlowStatus::Failed), PersistedStatus::Error);
        assert_eq!(PersistedStatus::from(FlowStatus::Completed), PersistedStatus::Success);
        assert_eq!(PersistedStatus::from(FlowStatus::Cancelled), PersistedStatus::Cancelled);
    }

    #[tokio::test]
    async fn find_execution_returns_none_for_other_users() {
        let sink = InMemoryHistorySink::new();
        let owner = UserId::new();
        let record = sample_record(owner);
        let id = record.id;
        sink.create_execution(record).await.expect("write");

        assert!(sink.find_execution(id, owner).await.expect("read").is_some());
        assert!(sink.find_execution(id, UserId::new()).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn node_execution_composite_id_round_trips() {
        let sink = InMemoryHistorySink::new();
        let execution_id = WorkflowRunId::new();
        let node_id = NodeId::new();
        let id = NodeExecutionRecord::composite_id(execution_id, node_id);

        sink.create_node_execution(NodeExecutionRecord {
            id: id.clone(),
            execution_id,
            node_id,
            status: PersistedStatus::Success,
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
            input_data: json!({}),
            output_data: json!({}),
            error: None,
        })
        .await
        .expect("write");

        assert_eq!(sink.node_executions_for(execution_id).len(), 1);
    }

    #[tokio::test]
    async fn logs_accumulate_per_execution() {
        let sink = InMemoryHistorySink::new();
        let execution_id = WorkflowRunId::new();
        sink.append_log(execution_id, LogLevel::Info, "starting", None)
            .await
            .expect("write");
        sink.append_log(execution_id, LogLevel::Warn, "retrying", None)
            .await
            .expect("write");
        assert_eq!(sink.log_count(execution_id), 2);
    }
}
