//! NATS-backed durable History Sink.
//!
//! Execution and node-execution records live in JetStream Key-Value
//! buckets (one row per id, keyed the same way the in-memory sink keys
//! its maps); log lines are appended to a JetStream stream so the full
//! log for a run can be replayed independently of the bounded in-process
//! [`crate::fanout::Fanout`] buffer.

use crate::fanout::{ExecutionEvent, Fanout, LogLevel};
use crate::history::{ExecutionRecord, HistoryError, HistorySink, NodeExecutionRecord};
use crate::node::NodeId;
use async_nats::jetstream;
use async_nats::jetstream::kv;
use async_trait::async_trait;
use flowcore_core::{UserId, WorkflowRunId};
use std::sync::Arc;

const EXECUTIONS_BUCKET: &str = "flowcore-executions";
const NODE_EXECUTIONS_BUCKET: &str = "flowcore-node-executions";
const LOG_STREAM_NAME: &str = "FLOWCORE_LOGS";
const LOG_SUBJECT_PREFIX: &str = "flowcore.log";

/// Connection details for the durable history backend.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    pub executions_bucket: Option<String>,
    pub node_executions_bucket: Option<String>,
    pub log_stream_name: Option<String>,
}

impl NatsConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            executions_bucket: None,
            node_executions_bucket: None,
            log_stream_name: None,
        }
    }

    fn executions_bucket(&self) -> &str {
        self.executions_bucket.as_deref().unwrap_or(EXECUTIONS_BUCKET)
    }

    fn node_executions_bucket(&self) -> &str {
        self.node_executions_bucket
            .as_deref()
            .unwrap_or(NODE_EXECUTIONS_BUCKET)
    }

    fn log_stream_name(&self) -> &str {
        self.log_stream_name.as_deref().unwrap_or(LOG_STREAM_NAME)
    }
}

/// JetStream-backed [`HistorySink`].
pub struct NatsHistorySink {
    executions: kv::Store,
    node_executions: kv::Store,
    jetstream: jetstream::Context,
    config: NatsConfig,
}

impl NatsHistorySink {
    /// Connects to NATS and provisions the KV buckets and log stream if
    /// they don't already exist.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::WriteFailed`] if the connection or any of
    /// the bucket/stream setup calls fail.
    pub async fn connect(config: NatsConfig) -> Result<Self, HistoryError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| HistoryError::WriteFailed { reason: format!("connect: {e}") })?;
        let jetstream = jetstream::new(client);

        let executions = jetstream
            .create_key_value(kv::Config {
                bucket: config.executions_bucket().to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| HistoryError::WriteFailed { reason: format!("executions bucket: {e}") })?;

        let node_executions = jetstream
            .create_key_value(kv::Config {
                bucket: config.node_executions_bucket().to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| HistoryError::WriteFailed { reason: format!("node executions bucket: {e}") })?;

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.log_stream_name().to_string(),
                subjects: vec![format!("{LOG_SUBJECT_PREFIX}.>")],
                storage: jetstream::stream::StorageType::File,
                retention: jetstream::stream::RetentionPolicy::Limits,
                ..Default::default()
            })
            .await
            .map_err(|e| HistoryError::WriteFailed { reason: format!("log stream: {e}") })?;

        Ok(Self {
            executions,
            node_executions,
            jetstream,
            config,
        })
    }

    fn log_subject(execution_id: WorkflowRunId) -> String {
        format!("{LOG_SUBJECT_PREFIX}.{execution_id}")
    }

    #[must_use]
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

#[async_trait]
impl HistorySink for NatsHistorySink {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<(), HistoryError> {
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| HistoryError::WriteFailed { reason: e.to_string() })?;
        self.executions
            .put(record.id.to_string(), bytes.into())
            .await
            .map_err(|e| HistoryError::WriteFailed { reason: e.to_string() })?;
        Ok(())
    }

    async fn create_node_execution(&self, record: NodeExecutionRecord) -> Result<(), HistoryError> {
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| HistoryError::WriteFailed { reason: e.to_string() })?;
        self.node_executions
            .put(record.id.clone(), bytes.into())
            .await
            .map_err(|e| HistoryError::WriteFailed { reason: e.to_string() })?;
        Ok(())
    }

    async fn append_log(
        &self,
        execution_id: WorkflowRunId,
        level: LogLevel,
        message: &str,
        node_id: Option<NodeId>,
    ) -> Result<(), HistoryError> {
        let line = serde_json::json!({
            "level": level,
            "message": message,
            "nodeId": node_id,
            "timestamp": chrono::Utc::now(),
        });
        let bytes = serde_json::to_vec(&line)
            .map_err(|e| HistoryError::WriteFailed { reason: e.to_string() })?;

        self.jetstream
            .publish(Self::log_subject(execution_id), bytes.into())
            .await
            .map_err(|e| HistoryError::WriteFailed { reason: e.to_string() })?
            .await
            .map_err(|e| HistoryError::WriteFailed { reason: e.to_string() })?;

        Ok(())
    }

    async fn find_execution(
        &self,
        id: WorkflowRunId,
        user_id: UserId,
    ) -> Result<Option<ExecutionRecord>, HistoryError> {
        let entry = self
            .executions
            .get(id.to_string())
            .await
            .map_err(|e| HistoryError::ReadFailed { reason: e.to_string() })?;

        let Some(bytes) = entry else {
            return Ok(None);
        };

        let record: ExecutionRecord = serde_json::from_slice(&bytes)
            .map_err(|e| HistoryError::ReadFailed { reason: e.to_string() })?;

        Ok((record.user_id == user_id).then_some(record))
    }
}

/// Relays events already published through an in-process [`Fanout`] onto
/// a NATS subject, so external subscribers (a UI behind a gateway, an
/// audit consumer) observe the same stream as in-process ones. Purely
/// additive: the engine never reads events back through this relay, only
/// through `Fanout` directly.
pub struct NatsEventRelay {
    client: async_nats::Client,
    subject_prefix: String,
}

impl NatsEventRelay {
    #[must_use]
    pub fn new(client: async_nats::Client, subject_prefix: impl Into<String>) -> Self {
        Self {
            client,
            subject_prefix: subject_prefix.into(),
        }
    }

    /// Publishes one event to `<prefix>.<executionId>`. Best-effort: a
    /// publish failure is logged, never propagated, matching the
    /// Fan-out's "never block the Engine" guarantee.
    pub async fn relay(&self, event: &ExecutionEvent) {
        let subject = format!("{}.{}", self.subject_prefix, event.execution_id());
        let Ok(bytes) = serde_json::to_vec(event) else {
            tracing::warn!("failed to serialize event for NATS relay");
            return;
        };
        if let Err(e) = self.client.publish(subject, bytes.into()).await {
            tracing::warn!(error = %e, "failed to relay event to NATS");
        }
    }
}

/// Wires a [`Fanout`]'s execution topic to a [`NatsEventRelay`] for the
/// lifetime of one execution, forwarding every published event until a
/// terminal one arrives.
pub async fn relay_execution(fanout: Arc<Fanout>, relay: Arc<NatsEventRelay>, execution_id: WorkflowRunId) {
    let (replayed, mut rx) = fanout.subscribe_execution(execution_id);
    for event in replayed {
        relay.relay(&event).await;
    }
    while let Ok(event) = rx.recv().await {
        let terminal = event.is_terminal();
        relay.relay(&event).await;
        if terminal {
            break;
        }
    }
}
