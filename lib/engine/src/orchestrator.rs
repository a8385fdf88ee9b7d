//! The Flow Execution Engine: drives a single run's scheduling loop from
//! admission through to a terminal [`FlowResult`].
//!
//! `executeFromNode`/`executeFromTrigger` admit a run — validating the
//! snapshot and constructing its [`ExecutionContext`] — and return as soon
//! as admission succeeds, *not* once the run finishes. The scheduling loop
//! itself runs on a spawned task; callers read the eventual outcome through
//! [`Engine::get_status`] or by awaiting [`Engine::join`], and observe
//! progress by subscribing through the [`Fanout`].
//!
//! Each admitted run pops ready nodes off a [`ReadinessTracker`], resolves
//! their input [`Bundle`] in edge order, and hands them to the
//! [`crate::sandbox::Sandbox`] with a per-node timeout and retry. A
//! node's dependents become ready once every one of their dependencies
//! has finished, regardless of outcome; whether a newly-ready node
//! actually runs or is marked Skipped is decided at that point by
//! checking whether every predecessor is terminal and none of them ever
//! fed it — whether because a branching node didn't select that channel
//! or because a failed one wasn't allowed to pass through via
//! `continueOnFail`.

use crate::bundle::Bundle;
use crate::catalog::{NodeTypeCatalog, NodeTypeDescriptor};
use crate::error::{ExecutionError, SandboxError};
use crate::execution::{ExecutionContext, ExecutionOptions, FlowResult, FlowStatus, NodeState, NodeStatus};
use crate::fanout::{ExecutionEvent, Fanout};
use crate::history::{ExecutionRecord, HistorySink, NodeExecutionRecord, PersistedStatus};
use crate::node::NodeId;
use crate::readiness::ReadinessTracker;
use crate::sandbox::{CancellationSignal, NodeExecutor, ResourceCaps, Sandbox, VariableStore};
use crate::snapshot::WorkflowSnapshot;
use crate::trigger::TriggerType;
use chrono::Utc;
use flowcore_core::{UserId, WorkflowRunId};
use flowcore_integration::credential::CredentialVault;
use flowcore_integration::masking::mask_sensitive;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// The live status of an admitted run, as observed through
/// [`Engine::get_status`]. Distinct from [`FlowStatus`], which only
/// describes a run that has already reached a terminal state.
#[derive(Debug, Clone)]
pub enum RunStatus {
    Running,
    Paused,
    Finished(FlowStatus),
}

struct RunControl {
    cancel: CancellationSignal,
    paused: AtomicBool,
    resume_notify: Notify,
    status: RwLock<RunStatus>,
}

impl RunControl {
    fn new() -> Self {
        Self {
            cancel: CancellationSignal::new(),
            paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            status: RwLock::new(RunStatus::Running),
        }
    }
}

/// The Flow Execution Engine: admits runs and drives their scheduling
/// loops against a fixed set of collaborators (catalog, executor, vault,
/// fan-out, history sink).
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    catalog: Arc<dyn NodeTypeCatalog>,
    executor: Arc<dyn NodeExecutor>,
    vault: Arc<dyn CredentialVault>,
    fanout: Arc<Fanout>,
    history: Arc<dyn HistorySink>,
    controls: RwLock<HashMap<WorkflowRunId, Arc<RunControl>>>,
    handles: Mutex<HashMap<WorkflowRunId, JoinHandle<FlowResult>>>,
}

fn bundle_to_json(bundle: &Bundle) -> JsonValue {
    let map: serde_json::Map<String, JsonValue> = bundle
        .channel_names()
        .map(|name| (name.to_string(), JsonValue::Array(bundle.channel(name).to_vec())))
        .collect();
    JsonValue::Object(map)
}

impl Engine {
    #[must_use]
    pub fn new(
        catalog: Arc<dyn NodeTypeCatalog>,
        executor: Arc<dyn NodeExecutor>,
        vault: Arc<dyn CredentialVault>,
        fanout: Arc<Fanout>,
        history: Arc<dyn HistorySink>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                catalog,
                executor,
                vault,
                fanout,
                history,
                controls: RwLock::new(HashMap::new()),
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Admits a run starting from an arbitrary node, seeded with an
    /// explicit input bundle rather than a trigger payload.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::AdmissionRejected`] if `start_id` isn't in
    /// `snapshot`'s graph, or if the graph contains a cycle. Neither case
    /// creates an execution record.
    pub async fn execute_from_node(
        &self,
        snapshot: WorkflowSnapshot,
        start_id: NodeId,
        input_bundle: Bundle,
        user_id: UserId,
        vars: VariableStore,
        options: ExecutionOptions,
    ) -> Result<WorkflowRunId, ExecutionError> {
        self.inner
            .admit_and_spawn(
                snapshot,
                start_id,
                input_bundle,
                user_id,
                TriggerType::Manual,
                JsonValue::Null,
                vars,
                options,
            )
            .await
    }

    /// Admits a run starting from a trigger node, seeding its input from
    /// the trigger's payload.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Engine::execute_from_node`].
    pub async fn execute_from_trigger(
        &self,
        snapshot: WorkflowSnapshot,
        trigger_node_id: NodeId,
        trigger_type: TriggerType,
        trigger_data: JsonValue,
        user_id: UserId,
        vars: VariableStore,
        options: ExecutionOptions,
    ) -> Result<WorkflowRunId, ExecutionError> {
        let input_bundle = Bundle::seed_main(trigger_data.clone());
        self.inner
            .admit_and_spawn(
                snapshot,
                trigger_node_id,
                input_bundle,
                user_id,
                trigger_type,
                trigger_data,
                vars,
                options,
            )
            .await
    }

    /// The live status of a run, or `None` if no run with this id was ever
    /// admitted by this engine instance.
    #[must_use]
    pub fn get_status(&self, execution_id: WorkflowRunId) -> Option<RunStatus> {
        self.inner
            .controls
            .read()
            .expect("lock poisoned")
            .get(&execution_id)
            .map(|control| control.status.read().expect("lock poisoned").clone())
    }

    /// Requests cancellation. Idempotent, and a no-op for an unknown or
    /// already-finished execution id.
    pub fn cancel(&self, execution_id: WorkflowRunId) {
        if let Some(control) = self.inner.controls.read().expect("lock poisoned").get(&execution_id) {
            control.cancel.cancel();
            control.resume_notify.notify_waiters();
        }
    }

    /// Requests a pause at the next suspension point. Idempotent, and a
    /// no-op for an unknown or already-finished execution id.
    pub fn pause(&self, execution_id: WorkflowRunId) {
        if let Some(control) = self.inner.controls.read().expect("lock poisoned").get(&execution_id) {
            control.paused.store(true, Ordering::SeqCst);
        }
    }

    /// Resumes a paused run. Idempotent, and a no-op for an unknown,
    /// not-paused, or already-finished execution id.
    pub fn resume(&self, execution_id: WorkflowRunId) {
        if let Some(control) = self.inner.controls.read().expect("lock poisoned").get(&execution_id) {
            control.paused.store(false, Ordering::SeqCst);
            control.resume_notify.notify_waiters();
        }
    }

    /// Awaits a previously admitted run's scheduling loop to completion,
    /// returning its [`FlowResult`]. Consumes the join handle: a second
    /// call for the same id returns `None`.
    ///
    /// Most callers should prefer [`Engine::get_status`] or subscribing
    /// through the [`Fanout`] over blocking here; this exists for tests and
    /// for a runtime that genuinely wants to wait out a run inline.
    pub async fn join(&self, execution_id: WorkflowRunId) -> Option<FlowResult> {
        let handle = self.inner.handles.lock().expect("lock poisoned").remove(&execution_id)?;
        handle.await.ok()
    }
}

impl EngineInner {
    #[allow(clippy::too_many_arguments)]
    async fn admit_and_spawn(
        self: &Arc<Self>,
        snapshot: WorkflowSnapshot,
        start_id: NodeId,
        input_bundle: Bundle,
        user_id: UserId,
        trigger_type: TriggerType,
        trigger_data: JsonValue,
        vars: VariableStore,
        options: ExecutionOptions,
    ) -> Result<WorkflowRunId, ExecutionError> {
        if snapshot.graph.get_node(start_id).is_none() {
            return Err(ExecutionError::AdmissionRejected {
                reason: format!("start node {start_id} not found in workflow graph"),
            });
        }
        if snapshot.graph.validate().is_err() {
            return Err(ExecutionError::AdmissionRejected {
                reason: "workflow graph contains a cycle".to_string(),
            });
        }

        let mut ctx = ExecutionContext::new(snapshot.workflow_id, user_id, trigger_type, trigger_data, options);
        for node in snapshot.graph.nodes() {
            let dependencies: HashSet<NodeId> = snapshot.graph.dependencies_of(node.id).into_iter().collect();
            let dependents: HashSet<NodeId> = snapshot.graph.dependents_of(node.id).into_iter().collect();
            ctx.node_states.insert(node.id, NodeState::new(dependencies, dependents));
        }
        let execution_id = ctx.execution_id;

        let initial_record = ExecutionRecord {
            id: execution_id,
            workflow_id: ctx.workflow_id,
            user_id: ctx.user_id,
            status: PersistedStatus::Running,
            started_at: ctx.started_at,
            finished_at: None,
            trigger_data: ctx.trigger_data.clone(),
            workflow_snapshot: snapshot.clone(),
            error: None,
        };
        if let Err(e) = self.history.create_execution(initial_record).await {
            tracing::warn!(error = %e, %execution_id, "failed to persist initial execution record");
        }

        let control = Arc::new(RunControl::new());
        self.controls
            .write()
            .expect("lock poisoned")
            .insert(execution_id, Arc::clone(&control));

        let mut pending_input = HashMap::new();
        pending_input.insert(start_id, input_bundle);

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.run_loop(ctx, snapshot, pending_input, vars, control).await });
        self.handles.lock().expect("lock poisoned").insert(execution_id, handle);

        Ok(execution_id)
    }

    async fn run_loop(
        self: Arc<Self>,
        mut ctx: ExecutionContext,
        snapshot: WorkflowSnapshot,
        mut pending_input: HashMap<NodeId, Bundle>,
        vars: VariableStore,
        control: Arc<RunControl>,
    ) -> FlowResult {
        let mut tracker = ReadinessTracker::from_graph(&snapshot.graph);

        loop {
            if ctx.is_cancelled() || control.cancel.is_cancelled() {
                ctx.cancel();
                self.fanout.publish_execution(ExecutionEvent::Cancelled {
                    execution_id: ctx.execution_id,
                    timestamp: Utc::now(),
                });
                break;
            }

            if control.paused.load(Ordering::SeqCst) {
                *control.status.write().expect("lock poisoned") = RunStatus::Paused;
                ctx.pause();
                self.fanout.publish_execution(ExecutionEvent::Paused {
                    execution_id: ctx.execution_id,
                    timestamp: Utc::now(),
                });
                control.resume_notify.notified().await;
                ctx.resume();
                *control.status.write().expect("lock poisoned") = RunStatus::Running;
                if !control.paused.load(Ordering::SeqCst) {
                    self.fanout.publish_execution(ExecutionEvent::Resumed {
                        execution_id: ctx.execution_id,
                        timestamp: Utc::now(),
                    });
                }
                continue;
            }

            let Some(node_id) = tracker.pop_ready() else {
                if !tracker.is_complete() {
                    for stalled in tracker.stalled() {
                        tracing::warn!(node_id = %stalled, "node can never become ready: dependency deadlock");
                    }
                }
                break;
            };

            if self.is_unreachable(&ctx, &snapshot, node_id) {
                if let Some(state) = ctx.node_states.get_mut(&node_id) {
                    state.skip();
                }
                pending_input.remove(&node_id);
                tracker.record_finished(node_id);
                if tracker.is_complete() {
                    break;
                }
                continue;
            }

            let Some(node) = snapshot.graph.get_node(node_id).cloned() else {
                tracing::error!(%node_id, "ready node missing from graph");
                continue;
            };

            let descriptor = match self.catalog.get(&node.node_type).await {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    let input_bundle = pending_input.remove(&node_id).unwrap_or_default();
                    if let Some(state) = ctx.node_states.get_mut(&node_id) {
                        state.queue();
                        state.start(input_bundle);
                    }
                    ctx.push_path(node_id);
                    self.record_failure(&mut ctx, &mut tracker, node_id, SandboxError::permanent(e.to_string()), false)
                        .await;
                    continue;
                }
            };

            let input_bundle = pending_input.remove(&node_id).unwrap_or_default();
            if let Some(state) = ctx.node_states.get_mut(&node_id) {
                state.queue();
                state.start(input_bundle.clone());
            }
            ctx.push_path(node_id);
            self.fanout.publish_execution(ExecutionEvent::NodeStarted {
                execution_id: ctx.execution_id,
                node_id,
                timestamp: Utc::now(),
            });

            let input_item = input_bundle.main().first().cloned().unwrap_or(JsonValue::Null);
            let timeout_ms = ctx
                .options
                .timeout_ms
                .or(snapshot.settings.default_timeout_ms)
                .unwrap_or(30_000);
            let caps = ResourceCaps {
                wall_clock: Duration::from_millis(timeout_ms),
                ..ResourceCaps::default()
            };
            let retry = ctx.options.retry.unwrap_or(snapshot.settings.retry);
            let sandbox = Sandbox {
                caps,
                catalog_entry: &descriptor,
                executor: self.executor.as_ref(),
                vault: self.vault.as_ref(),
            };

            let mut attempt = 0u32;
            let outcome = loop {
                let result = sandbox
                    .run(&node, &input_item, &vars, ctx.execution_id, ctx.user_id, &control.cancel)
                    .await;
                match result {
                    Ok(bundle) => break Ok(bundle),
                    Err(e) if !control.cancel.is_cancelled() && e.kind.is_retryable() && attempt < retry.max_attempts => {
                        attempt += 1;
                        tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                    }
                    Err(e) => break Err(e),
                }
            };

            match outcome {
                Ok(output_bundle) => {
                    if let Some(state) = ctx.node_states.get_mut(&node_id) {
                        state.complete(output_bundle.clone());
                    }
                    self.fanout.publish_execution(ExecutionEvent::NodeCompleted {
                        execution_id: ctx.execution_id,
                        node_id,
                        timestamp: Utc::now(),
                    });
                    self.write_node_record(&ctx, node_id).await;
                    self.apply_success(&mut tracker, &snapshot, node_id, &output_bundle, &mut pending_input);
                }
                Err(error) if control.cancel.is_cancelled() => {
                    if let Some(state) = ctx.node_states.get_mut(&node_id) {
                        state.cancel();
                    }
                    let _ = error;
                    self.write_node_record(&ctx, node_id).await;
                }
                Err(error) => {
                    self.record_failure(&mut ctx, &mut tracker, node_id, error, descriptor.continue_on_fail)
                        .await;
                }
            }

            if tracker.is_complete() {
                break;
            }
        }

        let result = ctx.to_result();
        self.finalize(&ctx, &snapshot, &result).await;
        *control.status.write().expect("lock poisoned") = RunStatus::Finished(result.status);
        self.fanout.close_execution(ctx.execution_id);
        result
    }

    /// Routes a completed node's output to its dependents in edge order —
    /// a branching node's unselected channels simply have no items, so
    /// they feed nothing — and records the node as finished with the
    /// readiness tracker. A dependent left with no live predecessor is
    /// skipped when it's popped off the tracker, not here: that's the
    /// only point every one of its predecessors is known to have settled.
    fn apply_success(
        &self,
        tracker: &mut ReadinessTracker,
        snapshot: &WorkflowSnapshot,
        node_id: NodeId,
        output_bundle: &Bundle,
        pending_input: &mut HashMap<NodeId, Bundle>,
    ) {
        for (dependent, edge) in snapshot.graph.successors(node_id) {
            let items = output_bundle.channel(&edge.source_port);
            if items.is_empty() {
                continue;
            }
            pending_input
                .entry(dependent.id)
                .or_default()
                .extend(edge.target_port.clone(), items.iter().cloned());
        }

        tracker.record_finished(node_id);
    }

    /// Fails a node and records it with the readiness tracker regardless
    /// of `continue_on_fail` — a failed node is terminal either way, and
    /// leaving it out of the tracker's finished set stalls the run. What
    /// `continue_on_fail` controls is whether [`Self::is_unreachable`]
    /// treats its dependents as fed once they're popped ready.
    async fn record_failure(
        &self,
        ctx: &mut ExecutionContext,
        tracker: &mut ReadinessTracker,
        node_id: NodeId,
        error: SandboxError,
        continue_on_fail: bool,
    ) {
        if let Some(state) = ctx.node_states.get_mut(&node_id) {
            state.fail(error.clone());
            state.continue_on_fail = continue_on_fail;
        }
        self.fanout.publish_execution(ExecutionEvent::NodeFailed {
            execution_id: ctx.execution_id,
            node_id,
            error,
            timestamp: Utc::now(),
        });
        self.write_node_record(ctx, node_id).await;

        tracker.record_finished(node_id);
    }

    /// True once every predecessor of `node_id` is terminal and none of
    /// them will ever deliver an item to it — a failed predecessor
    /// without `continueOnFail`, a skipped or cancelled one, or a
    /// completed one whose edge channel came up empty (the unselected
    /// side of a branch). A node with no declared predecessors (the
    /// run's start node, or an isolated entry point) is never unreachable.
    /// A node with at least one predecessor still running is never
    /// unreachable yet either — it's re-examined once that one settles.
    fn is_unreachable(&self, ctx: &ExecutionContext, snapshot: &WorkflowSnapshot, node_id: NodeId) -> bool {
        let predecessors = snapshot.graph.predecessors(node_id);
        if predecessors.is_empty() {
            return false;
        }

        predecessors.into_iter().all(|(predecessor, edge)| {
            let Some(state) = ctx.node_states.get(&predecessor.id) else {
                return true;
            };
            match state.status {
                NodeStatus::Completed => state.output_bundle.channel(&edge.source_port).is_empty(),
                NodeStatus::Failed => !state.continue_on_fail,
                NodeStatus::Skipped | NodeStatus::Cancelled => true,
                NodeStatus::Idle | NodeStatus::Queued | NodeStatus::Running => false,
            }
        })
    }

    async fn write_node_record(&self, ctx: &ExecutionContext, node_id: NodeId) {
        let Some(state) = ctx.node_states.get(&node_id) else {
            return;
        };
        let status = match state.status {
            NodeStatus::Completed => PersistedStatus::Success,
            NodeStatus::Failed => PersistedStatus::Error,
            NodeStatus::Cancelled => PersistedStatus::Cancelled,
            NodeStatus::Skipped | NodeStatus::Idle | NodeStatus::Queued | NodeStatus::Running => PersistedStatus::Running,
        };
        let record = NodeExecutionRecord {
            id: NodeExecutionRecord::composite_id(ctx.execution_id, node_id),
            execution_id: ctx.execution_id,
            node_id,
            status,
            started_at: state.started_at,
            finished_at: state.finished_at,
            input_data: mask_sensitive(&bundle_to_json(&state.input_bundle)),
            output_data: mask_sensitive(&bundle_to_json(&state.output_bundle)),
            error: state
                .error
                .as_ref()
                .and_then(|e| serde_json::to_value(e).ok())
                .map(|v| mask_sensitive(&v)),
        };
        if let Err(e) = self.history.create_node_execution(record).await {
            tracing::warn!(error = %e, %node_id, "failed to persist node execution record");
        }
    }

    async fn finalize(&self, ctx: &ExecutionContext, snapshot: &WorkflowSnapshot, result: &FlowResult) {
        if result.status != FlowStatus::Cancelled {
            self.fanout.publish_execution(ExecutionEvent::Completed {
                execution_id: ctx.execution_id,
                status: result.status,
                timestamp: Utc::now(),
            });
        }

        let record = ExecutionRecord {
            id: ctx.execution_id,
            workflow_id: ctx.workflow_id,
            user_id: ctx.user_id,
            status: PersistedStatus::from(result.status),
            started_at: ctx.started_at,
            finished_at: Some(Utc::now()),
            trigger_data: ctx.trigger_data.clone(),
            workflow_snapshot: snapshot.clone(),
            error: None,
        };
        if let Err(e) = self.history.create_execution(record).await {
            tracing::warn!(error = %e, execution_id = %ctx.execution_id, "failed to persist final execution record");
        }
    }
}
