//! The runtime application: wires the execution core's collaborators
//! together behind the two external interfaces §6 names — trigger
//! ingress and event subscription.
//!
//! The ingress layer, the cron scheduler, and the workflow/credential
//! stores that resolve a `workflowId` into a [`WorkflowSnapshot`] are all
//! external collaborators (spec §1); a [`TriggerRequest`] arrives here
//! already carrying the snapshot it should run against.

use flowcore_concurrency::{
    AdmissionDecision, AdmissionRequest, AdmissionStrategy, ConcurrencyManager, PromotionOutcome, RejectReason,
};
use flowcore_core::{UserId, WorkflowId, WorkflowRunId};
use flowcore_engine::nats::NatsEventRelay;
use flowcore_engine::{
    Engine, ExecutionError, ExecutionEvent, ExecutionOptions, ExecutionRecord, Fanout, HistoryError, HistorySink,
    NodeId, TriggerType, VariableStore, WorkflowSnapshot,
};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// A trigger firing, already resolved to the workflow snapshot it should
/// run against and the node it should start from.
#[derive(Clone)]
pub struct TriggerRequest {
    pub trigger_id: String,
    pub trigger_type: TriggerType,
    pub snapshot: WorkflowSnapshot,
    pub user_id: UserId,
    pub trigger_node_id: NodeId,
    pub trigger_data: JsonValue,
    pub vars: VariableStore,
    /// Whether this run needs exclusive access to every node it can
    /// reach from `trigger_node_id`, per spec §4.4.
    pub isolated: bool,
    pub priority: i32,
    pub strategy: AdmissionStrategy,
}

impl TriggerRequest {
    #[must_use]
    pub fn new(
        trigger_id: impl Into<String>,
        trigger_type: TriggerType,
        snapshot: WorkflowSnapshot,
        user_id: UserId,
        trigger_node_id: NodeId,
        trigger_data: JsonValue,
    ) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            trigger_type,
            snapshot,
            user_id,
            trigger_node_id,
            trigger_data,
            vars: VariableStore::new(),
            isolated: false,
            priority: 0,
            strategy: AdmissionStrategy::Queue,
        }
    }

    #[must_use]
    pub fn isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: AdmissionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_vars(mut self, vars: VariableStore) -> Self {
        self.vars = vars;
        self
    }
}

/// `executeTrigger`'s outcome, per spec §6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerStatus {
    Started,
    Queued,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerResponse {
    pub status: TriggerStatus,
    pub execution_id: Option<WorkflowRunId>,
    pub reason: Option<String>,
}

impl TriggerResponse {
    fn started(execution_id: WorkflowRunId) -> Self {
        Self { status: TriggerStatus::Started, execution_id: Some(execution_id), reason: None }
    }

    fn queued() -> Self {
        Self { status: TriggerStatus::Queued, execution_id: None, reason: None }
    }

    fn rejected(reason: impl fmt::Display) -> Self {
        Self { status: TriggerStatus::Rejected, execution_id: None, reason: Some(reason.to_string()) }
    }
}

/// Wires the Flow Execution Engine, the Trigger Concurrency Manager, the
/// Event Fan-out, and the History Sink into the two interfaces §6 asks
/// the core to expose.
#[derive(Clone)]
pub struct Runtime {
    engine: Engine,
    concurrency: Arc<ConcurrencyManager>,
    fanout: Arc<Fanout>,
    history: Arc<dyn HistorySink>,
    relay: Option<Arc<NatsEventRelay>>,
    default_options: ExecutionOptions,
}

impl Runtime {
    #[must_use]
    pub fn new(
        engine: Engine,
        concurrency: Arc<ConcurrencyManager>,
        fanout: Arc<Fanout>,
        history: Arc<dyn HistorySink>,
        default_options: ExecutionOptions,
    ) -> Self {
        Self { engine, concurrency, fanout, history, relay: None, default_options }
    }

    #[must_use]
    pub fn with_relay(mut self, relay: Arc<NatsEventRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// The forward-reachable set a trigger's run will touch, including
    /// the start node itself. What [`AdmissionRequest`] scores isolation
    /// conflicts against.
    fn affected_set(snapshot: &WorkflowSnapshot, start: NodeId) -> HashSet<NodeId> {
        let mut set: HashSet<NodeId> = snapshot.graph.reachable_from(start).into_iter().collect();
        set.insert(start);
        set
    }

    /// `executeTrigger` (spec §6): admits the run through the
    /// concurrency manager, then — if it can start now or once promoted
    /// from queue — spawns it on the Flow Execution Engine.
    pub async fn execute_trigger(&self, request: TriggerRequest) -> TriggerResponse {
        let workflow_id: WorkflowId = request.snapshot.workflow_id;
        let affected_set = Self::affected_set(&request.snapshot, request.trigger_node_id);

        let mut admission = AdmissionRequest::new(workflow_id, request.user_id, affected_set)
            .isolated(request.isolated)
            .with_priority(request.priority)
            .with_strategy(request.strategy);
        if request.strategy == AdmissionStrategy::MergeLatest {
            admission = admission.with_dedup_key(request.trigger_id.clone());
        }

        match self.concurrency.admit(admission) {
            AdmissionDecision::Started { admission_id, .. } => match self.spawn_run(request).await {
                Ok(execution_id) => {
                    self.spawn_release_on_completion(admission_id, execution_id);
                    TriggerResponse::started(execution_id)
                }
                Err(e) => {
                    self.concurrency.release(admission_id);
                    TriggerResponse::rejected(e)
                }
            },
            AdmissionDecision::Queued(ticket) => {
                let runtime = self.clone();
                tokio::spawn(async move {
                    let admission_id = ticket.admission_id;
                    if ticket.promoted().await == PromotionOutcome::Admitted {
                        match runtime.spawn_run(request).await {
                            Ok(execution_id) => runtime.spawn_release_on_completion(admission_id, execution_id),
                            Err(e) => {
                                tracing::warn!(error = %e, "queued trigger failed admission-time validation");
                                runtime.concurrency.release(admission_id);
                            }
                        }
                    }
                });
                TriggerResponse::queued()
            }
            AdmissionDecision::Rejected(reason) => {
                tracing::debug!(%reason, %workflow_id, "trigger rejected");
                TriggerResponse::rejected(reason)
            }
        }
    }

    async fn spawn_run(&self, request: TriggerRequest) -> Result<WorkflowRunId, ExecutionError> {
        let execution_id = self
            .engine
            .execute_from_trigger(
                request.snapshot,
                request.trigger_node_id,
                request.trigger_type,
                request.trigger_data,
                request.user_id,
                request.vars,
                self.default_options.clone(),
            )
            .await?;

        if let Some(relay) = self.relay.clone() {
            let fanout = self.fanout.clone();
            tokio::spawn(flowcore_engine::nats::relay_execution(fanout, relay, execution_id));
        }

        Ok(execution_id)
    }

    fn spawn_release_on_completion(&self, admission_id: flowcore_concurrency::AdmissionId, execution_id: WorkflowRunId) {
        let engine = self.engine.clone();
        let concurrency = self.concurrency.clone();
        tokio::spawn(async move {
            engine.join(execution_id).await;
            concurrency.release(admission_id);
        });
    }

    /// `subscribeExecution` (spec §6): the replay buffer flushed to the
    /// new subscriber, plus a receiver for events published from this
    /// point on. Dropping the receiver is how a caller unsubscribes.
    #[must_use]
    pub fn subscribe_execution(&self, execution_id: WorkflowRunId) -> (Vec<ExecutionEvent>, broadcast::Receiver<ExecutionEvent>) {
        self.fanout.subscribe_execution(execution_id)
    }

    /// `subscribeWorkflow` (spec §6).
    #[must_use]
    pub fn subscribe_workflow(&self, workflow_id: WorkflowId) -> broadcast::Receiver<ExecutionEvent> {
        self.fanout.subscribe_workflow(workflow_id)
    }

    /// Status query backed by the history sink's `findExecution`.
    ///
    /// # Errors
    /// Returns [`HistoryError::ReadFailed`] on a storage-layer failure.
    pub async fn find_execution(&self, id: WorkflowRunId, user_id: UserId) -> Result<Option<ExecutionRecord>, HistoryError> {
        self.history.find_execution(id, user_id).await
    }

    /// Cancels, pauses, or resumes a running execution. Idempotent and a
    /// no-op for an unknown or already-finished id; see [`Engine`].
    pub fn cancel(&self, execution_id: WorkflowRunId) {
        self.engine.cancel(execution_id);
    }

    pub fn pause(&self, execution_id: WorkflowRunId) {
        self.engine.pause(execution_id);
    }

    pub fn resume(&self, execution_id: WorkflowRunId) {
        self.engine.resume(execution_id);
    }

    /// Spawns the periodic back-pressure cleanup §4.4 describes: queued
    /// requests older than the configured queue timeout are evicted.
    pub fn spawn_queue_eviction(&self, interval: Duration) {
        let concurrency = self.concurrency.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                concurrency.evict_expired_requests();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore_engine::{InMemoryHistorySink, InMemoryNodeTypeCatalog};
    use flowcore_integration::credential::InMemoryCredentialVault;
    use std::sync::Arc;

    struct EchoExecutor;

    #[async_trait::async_trait]
    impl flowcore_engine::NodeExecutor for EchoExecutor {
        async fn execute(
            &self,
            _node_type: &str,
            _parameters: &JsonValue,
            input_item: &JsonValue,
            _credentials: &flowcore_engine::ResolvedCredentials,
            _cancellation: &flowcore_engine::CancellationSignal,
        ) -> Result<JsonValue, flowcore_engine::SandboxError> {
            Ok(serde_json::json!({"main": [input_item.clone()]}))
        }
    }

    fn test_runtime() -> Runtime {
        let catalog = Arc::new(InMemoryNodeTypeCatalog::new(vec![]));
        let executor = Arc::new(EchoExecutor);
        let vault = Arc::new(InMemoryCredentialVault::new());
        let fanout = Arc::new(Fanout::default());
        let history = Arc::new(InMemoryHistorySink::new());
        let engine = Engine::new(catalog, executor, vault, fanout.clone(), history.clone());
        let concurrency = Arc::new(ConcurrencyManager::new(flowcore_concurrency::Limits::default()));
        Runtime::new(engine, concurrency, fanout, history, ExecutionOptions::default())
    }

    #[tokio::test]
    async fn unknown_start_node_is_reported_as_rejected() {
        use flowcore_engine::{Workflow, WorkflowSettings};

        let runtime = test_runtime();
        let workflow = Workflow::new("empty");
        let snapshot = WorkflowSnapshot::from_workflow(&workflow, WorkflowSettings::default());
        let request = TriggerRequest::new(
            "trigger-1",
            TriggerType::Manual,
            snapshot,
            UserId::new(),
            NodeId::new(),
            JsonValue::Null,
        );

        let response = runtime.execute_trigger(request).await;
        assert_eq!(response.status, TriggerStatus::Rejected);
        assert!(response.execution_id.is_none());
    }
}
