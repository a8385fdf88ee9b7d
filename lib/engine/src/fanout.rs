//! Event fan-out: per-execution and per-workflow publish/subscribe with a
//! bounded replay buffer.
//!
//! Subscribers never block a publisher: each topic is a
//! [`tokio::sync::broadcast`] channel, so a slow consumer falls behind and
//! eventually observes a `Lagged` gap rather than stalling the Flow
//! Execution Engine. A late-attaching subscriber (a UI opening a run
//! that's already in progress) is caught up from a short in-memory replay
//! buffer kept per execution.

use crate::error::SandboxError;
use crate::execution::{FlowStatus, NodeStatus};
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use flowcore_core::{WorkflowId, WorkflowRunId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tokio::sync::broadcast;

/// Severity of a [`ExecutionEvent::Log`] line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single typed event published during one execution's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExecutionEvent {
    NodeStarted {
        execution_id: WorkflowRunId,
        node_id: NodeId,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        execution_id: WorkflowRunId,
        node_id: NodeId,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: WorkflowRunId,
        node_id: NodeId,
        error: SandboxError,
        timestamp: DateTime<Utc>,
    },
    NodeStatusUpdate {
        execution_id: WorkflowRunId,
        node_id: NodeId,
        status: NodeStatus,
        timestamp: DateTime<Utc>,
    },
    ExecutionProgress {
        execution_id: WorkflowRunId,
        completed_nodes: usize,
        total_nodes: usize,
        timestamp: DateTime<Utc>,
    },
    Completed {
        execution_id: WorkflowRunId,
        status: FlowStatus,
        timestamp: DateTime<Utc>,
    },
    Cancelled {
        execution_id: WorkflowRunId,
        timestamp: DateTime<Utc>,
    },
    Paused {
        execution_id: WorkflowRunId,
        timestamp: DateTime<Utc>,
    },
    Resumed {
        execution_id: WorkflowRunId,
        timestamp: DateTime<Utc>,
    },
    Log {
        execution_id: WorkflowRunId,
        level: LogLevel,
        message: String,
        node_id: Option<NodeId>,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    #[must_use]
    pub fn execution_id(&self) -> WorkflowRunId {
        match self {
            Self::NodeStarted { execution_id, .. }
            | Self::NodeCompleted { execution_id, .. }
            | Self::NodeFailed { execution_id, .. }
            | Self::NodeStatusUpdate { execution_id, .. }
            | Self::ExecutionProgress { execution_id, .. }
            | Self::Completed { execution_id, .. }
            | Self::Cancelled { execution_id, .. }
            | Self::Paused { execution_id, .. }
            | Self::Resumed { execution_id, .. }
            | Self::Log { execution_id, .. } => *execution_id,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::NodeStarted { timestamp, .. }
            | Self::NodeCompleted { timestamp, .. }
            | Self::NodeFailed { timestamp, .. }
            | Self::NodeStatusUpdate { timestamp, .. }
            | Self::ExecutionProgress { timestamp, .. }
            | Self::Completed { timestamp, .. }
            | Self::Cancelled { timestamp, .. }
            | Self::Paused { timestamp, .. }
            | Self::Resumed { timestamp, .. }
            | Self::Log { timestamp, .. } => *timestamp,
        }
    }

    /// True for the event that ends an execution's stream: no further
    /// events should be expected on this topic after one of these.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Cancelled { .. })
    }
}

/// Replay window / capacity, per §6's `EVENT_REPLAY_WINDOW_MS` /
/// `EVENT_REPLAY_MAX`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanoutConfig {
    pub replay_window: chrono::Duration,
    pub replay_max: usize,
    /// Capacity of each broadcast channel's internal ring buffer. Not the
    /// replay buffer — this only bounds how far a live subscriber may lag
    /// before it is dropped and reports `Lagged`.
    pub channel_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            replay_window: chrono::Duration::milliseconds(10_000),
            replay_max: 50,
            channel_capacity: 256,
        }
    }
}

struct Topic {
    sender: broadcast::Sender<ExecutionEvent>,
    replay: VecDeque<ExecutionEvent>,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            replay: VecDeque::new(),
        }
    }
}

/// Per-execution and per-workflow event topics, with a bounded replay
/// buffer kept per execution.
pub struct Fanout {
    config: FanoutConfig,
    executions: RwLock<HashMap<WorkflowRunId, Topic>>,
    workflows: RwLock<HashMap<WorkflowId, Topic>>,
}

impl Fanout {
    #[must_use]
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            config,
            executions: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Publishes to an execution's topic (creating it if this is the
    /// first event) and appends to its replay buffer. Never blocks: a
    /// subscriber with no room left in its channel just lags.
    pub fn publish_execution(&self, event: ExecutionEvent) {
        let execution_id = event.execution_id();
        let mut executions = self.executions.write().expect("fanout lock poisoned");
        let topic = executions
            .entry(execution_id)
            .or_insert_with(|| Topic::new(self.config.channel_capacity));

        topic.replay.push_back(event.clone());
        self.trim_replay(&mut topic.replay);

        // `send` only errors when there are zero receivers; that's a
        // normal and expected case (no one has subscribed yet), not a
        // failure to surface.
        let _ = topic.sender.send(event);
    }

    /// Publishes to a workflow-wide topic. No replay buffer: this topic
    /// is for live dashboards, not catch-up.
    pub fn publish_workflow(&self, workflow_id: WorkflowId, event: ExecutionEvent) {
        let mut workflows = self.workflows.write().expect("fanout lock poisoned");
        let topic = workflows
            .entry(workflow_id)
            .or_insert_with(|| Topic::new(self.config.channel_capacity));
        let _ = topic.sender.send(event);
    }

    fn trim_replay(&self, replay: &mut VecDeque<ExecutionEvent>) {
        while replay.len() > self.config.replay_max {
            replay.pop_front();
        }
        let cutoff = Utc::now() - self.config.replay_window;
        while replay.front().is_some_and(|e| e.timestamp() < cutoff) {
            replay.pop_front();
        }
    }

    /// Subscribes to an execution's topic, returning the events currently
    /// in its replay buffer (oldest first) plus a receiver for events
    /// published from this point forward.
    pub fn subscribe_execution(
        &self,
        execution_id: WorkflowRunId,
    ) -> (Vec<ExecutionEvent>, broadcast::Receiver<ExecutionEvent>) {
        let mut executions = self.executions.write().expect("fanout lock poisoned");
        let topic = executions
            .entry(execution_id)
            .or_insert_with(|| Topic::new(self.config.channel_capacity));
        (topic.replay.iter().cloned().collect(), topic.sender.subscribe())
    }

    #[must_use]
    pub fn subscribe_workflow(&self, workflow_id: WorkflowId) -> broadcast::Receiver<ExecutionEvent> {
        let mut workflows = self.workflows.write().expect("fanout lock poisoned");
        let topic = workflows
            .entry(workflow_id)
            .or_insert_with(|| Topic::new(self.config.channel_capacity));
        topic.sender.subscribe()
    }

    /// Drops an execution's topic and replay buffer. Call once a run has
    /// reached a terminal status and every interested subscriber has had
    /// a chance to observe the terminal event; safe to skip (the entry
    /// just lives until the process restarts).
    pub fn close_execution(&self, execution_id: WorkflowRunId) {
        self.executions.write().expect("fanout lock poisoned").remove(&execution_id);
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new(FanoutConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(execution_id: WorkflowRunId) -> ExecutionEvent {
        ExecutionEvent::NodeStarted {
            execution_id,
            node_id: NodeId::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn subscriber_receives_published_event() {
        let fanout = Fanout::default();
        let execution_id = WorkflowRunId::new();
        let (_replayed, mut rx) = fanout.subscribe_execution(execution_id);
        fanout.publish_execution(started(execution_id));
        let event = rx.try_recv().expect("event delivered");
        assert_eq!(event.execution_id(), execution_id);
    }

    #[test]
    fn late_subscriber_receives_replay() {
        let fanout = Fanout::default();
        let execution_id = WorkflowRunId::new();
        fanout.publish_execution(started(execution_id));
        fanout.publish_execution(started(execution_id));

        let (replayed, _rx) = fanout.subscribe_execution(execution_id);
        assert_eq!(replayed.len(), 2);
    }

    #[test]
    fn replay_buffer_caps_at_configured_max() {
        let config = FanoutConfig {
            replay_max: 3,
            ..FanoutConfig::default()
        };
        let fanout = Fanout::new(config);
        let execution_id = WorkflowRunId::new();
        for _ in 0..10 {
            fanout.publish_execution(started(execution_id));
        }
        let (replayed, _rx) = fanout.subscribe_execution(execution_id);
        assert_eq!(replayed.len(), 3);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let fanout = Fanout::default();
        fanout.publish_execution(started(WorkflowRunId::new()));
    }

    #[test]
    fn workflow_topic_is_independent_of_execution_topic() {
        let fanout = Fanout::default();
        let workflow_id = WorkflowId::new();
        let mut rx = fanout.subscribe_workflow(workflow_id);
        fanout.publish_workflow(
            workflow_id,
            ExecutionEvent::Completed {
                execution_id: WorkflowRunId::new(),
                status: FlowStatus::Completed,
                timestamp: Utc::now(),
            },
        );
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn close_execution_drops_replay_buffer() {
        let fanout = Fanout::default();
        let execution_id = WorkflowRunId::new();
        fanout.publish_execution(started(execution_id));
        fanout.close_execution(execution_id);
        let (replayed, _rx) = fanout.subscribe_execution(execution_id);
        assert!(replayed.is_empty());
    }

    #[test]
    fn terminal_event_classification() {
        let execution_id = WorkflowRunId::new();
        assert!(ExecutionEvent::Completed {
            execution_id,
            status: FlowStatus::Completed,
            timestamp: Utc::now(),
        }
        .is_terminal());
        assert!(!started(execution_id).is_terminal());
    }
}
