//! The workflow execution core: graph/resolver, node/port/edge model,
//! node sandbox, scheduling loop, event fan-out, and history sink.
//!
//! - **Dependency Resolver** (`graph`, `readiness`): builds/validates the
//!   DAG and tracks per-run node readiness.
//! - **Node model** (`node`, `edge`, `port`, `bundle`, `catalog`): what a
//!   node is, how ports connect, and what a node type looks like.
//! - **Node Sandbox** (`sandbox`): resolves parameters, injects
//!   credentials, enforces resource caps, runs a node type's executor.
//! - **Flow Execution Engine** (`orchestrator`, `execution`, `snapshot`):
//!   the scheduling loop that drives one run from admission to a terminal
//!   result.
//! - **Event Fan-out** (`fanout`) and **History Sink** (`history`,
//!   `nats`): progress observation and durable persistence.
//! - **Triggers** (`trigger`): the trigger type vocabulary a run is
//!   admitted under.

pub mod bundle;
pub mod catalog;
pub mod definition;
pub mod edge;
pub mod error;
pub mod execution;
pub mod fanout;
pub mod graph;
pub mod history;
pub mod nats;
pub mod node;
pub mod orchestrator;
pub mod port;
pub mod readiness;
pub mod sandbox;
pub mod snapshot;
pub mod trigger;

pub use bundle::{Bundle, Item, MAIN};
pub use catalog::{InMemoryNodeTypeCatalog, NodeTypeCatalog, NodeTypeDescriptor, UnknownNodeType};
pub use definition::{Workflow, WorkflowMetadata};
pub use edge::{Connection, Edge};
pub use error::{ErrorKind, ExecutionError, GraphError, SandboxError, WorkflowError};
pub use execution::{ExecutionContext, ExecutionOptions, FlowResult, FlowStatus, NodeState, NodeStatus};
pub use fanout::{ExecutionEvent, Fanout, FanoutConfig, LogLevel};
pub use graph::WorkflowGraph;
pub use history::{ExecutionRecord, HistoryError, HistorySink, InMemoryHistorySink, NodeExecutionRecord, PersistedStatus};
pub use node::{Node, NodeId};
pub use orchestrator::{Engine, RunStatus};
pub use port::{InputPort, OutputPort, PortSchema};
pub use readiness::ReadinessTracker;
pub use sandbox::{CancellationSignal, NodeExecutor, ResolvedCredentials, ResourceCaps, Sandbox, VariableStore};
pub use snapshot::{RetryPolicy, WorkflowSettings, WorkflowSnapshot};
pub use trigger::{Trigger, TriggerConfig, TriggerType};
