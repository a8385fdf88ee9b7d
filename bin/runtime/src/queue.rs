//! Trigger work-queue consumer.
//!
//! §1 places the HTTP/webhook ingress and the cron scheduler outside this
//! binary; they hand a fired trigger to the runtime by publishing it to a
//! durable JetStream stream rather than calling `Runtime::execute_trigger`
//! in-process, so the runtime can run detached from whatever process
//! accepted the request. This module pulls that stream and feeds each
//! message into the `Runtime` exactly as an in-process caller would.

use crate::app::{Runtime, TriggerRequest};
use async_nats::jetstream;
use flowcore_concurrency::AdmissionStrategy;
use flowcore_core::{TriggerId, UserId};
use flowcore_engine::{NodeId, TriggerType, VariableStore, WorkflowSnapshot};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

const STREAM_NAME: &str = "FLOWCORE_TRIGGERS";
const SUBJECT: &str = "flowcore.triggers";
const DURABLE_CONSUMER_NAME: &str = "flowcore-runtime-triggers";

/// Wire shape for a fired trigger, published by the ingress/scheduler
/// layer onto [`SUBJECT`]. Mirrors `executeTrigger`'s parameters (spec
/// §6) plus the admission knobs §4.4 exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEnvelope {
    pub trigger_id: TriggerId,
    pub trigger_type: TriggerType,
    pub workflow_snapshot: WorkflowSnapshot,
    pub user_id: UserId,
    pub trigger_node_id: NodeId,
    #[serde(default)]
    pub trigger_data: JsonValue,
    #[serde(default)]
    pub workflow_vars: HashMap<String, JsonValue>,
    #[serde(default)]
    pub user_vars: HashMap<String, JsonValue>,
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub strategy: TriggerStrategyWire,
}

/// `AdmissionStrategy` doesn't derive serde (it's a pure in-process
/// admission knob everywhere else); this is the wire-safe mirror the
/// queue consumer converts to and from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStrategyWire {
    #[default]
    Queue,
    Reject,
    MergeLatest,
    Priority,
}

impl From<TriggerStrategyWire> for AdmissionStrategy {
    fn from(wire: TriggerStrategyWire) -> Self {
        match wire {
            TriggerStrategyWire::Queue => Self::Queue,
            TriggerStrategyWire::Reject => Self::Reject,
            TriggerStrategyWire::MergeLatest => Self::MergeLatest,
            TriggerStrategyWire::Priority => Self::Priority,
        }
    }
}

impl TriggerEnvelope {
    fn into_request(self) -> TriggerRequest {
        let mut vars = VariableStore::new();
        for (name, value) in self.workflow_vars {
            vars = vars.with_workflow_var(name, value);
        }
        for (name, value) in self.user_vars {
            vars = vars.with_user_var(name, value);
        }

        TriggerRequest::new(
            self.trigger_id.to_string(),
            self.trigger_type,
            self.workflow_snapshot,
            self.user_id,
            self.trigger_node_id,
            self.trigger_data,
        )
        .isolated(self.isolated)
        .with_priority(self.priority)
        .with_strategy(self.strategy.into())
        .with_vars(vars)
    }
}

/// Pulls fired triggers off the durable work queue and feeds each one to
/// `runtime.execute_trigger`, acking only once the trigger has been
/// admitted (started, queued, or rejected) so a crash mid-admission
/// redelivers rather than silently drops it. A message that fails to
/// deserialize is acked anyway and logged — redelivering a message that
/// will never parse just loops forever.
pub async fn run(jetstream: jetstream::Context, runtime: Arc<Runtime>) {
    let stream = match jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: STREAM_NAME.to_string(),
            subjects: vec![SUBJECT.to_string()],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        })
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "failed to provision trigger work-queue stream");
            return;
        }
    };

    let consumer = match stream
        .create_consumer(jetstream::consumer::pull::Config {
            durable_name: Some(DURABLE_CONSUMER_NAME.to_string()),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ..Default::default()
        })
        .await
    {
        Ok(consumer) => consumer,
        Err(e) => {
            tracing::error!(error = %e, "failed to create trigger work-queue consumer");
            return;
        }
    };

    let mut messages = match consumer.messages().await {
        Ok(messages) => messages,
        Err(e) => {
            tracing::error!(error = %e, "failed to subscribe to trigger work-queue consumer");
            return;
        }
    };

    tracing::info!(stream = STREAM_NAME, "trigger work-queue consumer ready");

    while let Some(message) = messages.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "trigger work-queue message error");
                continue;
            }
        };

        let envelope: Result<TriggerEnvelope, _> = serde_json::from_slice(&message.payload);
        match envelope {
            Ok(envelope) => {
                let trigger_id = envelope.trigger_id;
                let response = runtime.execute_trigger(envelope.into_request()).await;
                tracing::debug!(%trigger_id, status = ?response.status, "trigger admitted from work queue");
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable trigger work-queue message");
            }
        }

        if let Err(e) = message.ack().await {
            tracing::warn!(error = %e, "failed to ack trigger work-queue message");
        }
    }
}
