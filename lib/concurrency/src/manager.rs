//! The Trigger Concurrency Manager (spec §4.4): admits, queues,
//! prioritizes, and isolates concurrent executions, and holds the
//! per-node resource lock table isolated runs serialize against.
//!
//! A caller (the trigger ingress, in the runtime binary) builds an
//! [`AdmissionRequest`] — workflow, user, the start node's affected set,
//! whether the run wants isolation, and a priority — and calls
//! [`ConcurrencyManager::admit`]. The manager never starts an execution
//! itself; it only decides whether the caller may proceed right now
//! ([`AdmissionDecision::Started`]), must wait
//! ([`AdmissionDecision::Queued`]), or may not run at all
//! ([`AdmissionDecision::Rejected`]). The caller is responsible for
//! calling [`ConcurrencyManager::release`] once the execution it started
//! reaches a terminal state, which both frees the slot/locks and attempts
//! to promote the next queued request.

use crate::error::RejectReason;
use chrono::{DateTime, Utc};
use flowcore_core::{UserId, WorkflowId};
use flowcore_engine::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use ulid::Ulid;

/// Unique handle for one admitted-or-queued request, scoped to a single
/// manager instance. Distinct from [`flowcore_core::WorkflowRunId`]: the
/// manager hands this out *before* a Flow Execution Engine run exists, so
/// the caller pairs it with the engine's own execution id once the run is
/// actually spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdmissionId(Ulid);

impl AdmissionId {
    fn new() -> Self {
        Self(Ulid::new())
    }
}

impl std::fmt::Display for AdmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "admit_{}", self.0)
    }
}

/// What happens to an admission request that can't start immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionStrategy {
    /// Wait in priority/FIFO order for a slot. The default.
    #[default]
    Queue,
    /// Reject instead of waiting.
    Reject,
    /// Collapse onto an already-queued request with the same dedup key
    /// rather than enqueueing a second copy; behaves like `Queue` when no
    /// match exists.
    MergeLatest,
    /// Explicit, named form of `Queue` for callers that want to document
    /// that ordering matters to them; behaves identically.
    Priority,
}

impl AdmissionStrategy {
    fn queues_on_backpressure(self) -> bool {
        !matches!(self, Self::Reject)
    }
}

/// A request to admit one execution, built by the caller from the
/// workflow snapshot and the trigger that fired.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub workflow_id: WorkflowId,
    pub user_id: UserId,
    /// The forward-reachable node set from the start node — see
    /// [`flowcore_engine::WorkflowGraph::reachable_from`]. Used for
    /// isolation scoring and, if `isolated`, lock acquisition.
    pub affected_set: HashSet<NodeId>,
    /// Whether this run requires exclusive locks on every node in
    /// `affected_set` for its duration.
    pub isolated: bool,
    /// Lower values are admitted first; ties broken FIFO by enqueue
    /// order.
    pub priority: i32,
    pub strategy: AdmissionStrategy,
    /// Identity used by [`AdmissionStrategy::MergeLatest`] to recognize a
    /// duplicate of an already-queued request (typically the trigger id
    /// plus start node). Ignored by other strategies.
    pub dedup_key: Option<String>,
}

impl AdmissionRequest {
    #[must_use]
    pub fn new(workflow_id: WorkflowId, user_id: UserId, affected_set: HashSet<NodeId>) -> Self {
        Self {
            workflow_id,
            user_id,
            affected_set,
            isolated: false,
            priority: 0,
            strategy: AdmissionStrategy::Queue,
            dedup_key: None,
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
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// A set of locks a caller must release (via
/// [`ConcurrencyManager::release`]) once its run finishes.
pub type LockSet = Vec<(WorkflowId, NodeId)>;

/// What a queued request resolves to once the manager can act on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// The request was admitted; the locks (if any) are already held on
    /// the caller's behalf.
    Admitted,
    /// The request sat in queue longer than the configured queue timeout
    /// and was evicted.
    Expired,
    /// The request was explicitly cancelled before promotion.
    Cancelled,
}

/// Handle returned for a [`AdmissionDecision::Queued`] request. Await
/// [`QueuedTicket::promoted`] to learn when (or whether) the request
/// eventually starts.
pub struct QueuedTicket {
    pub admission_id: AdmissionId,
    pub position: usize,
    receiver: oneshot::Receiver<PromotionOutcome>,
}

impl QueuedTicket {
    /// Resolves once the manager promotes, expires, or cancels this
    /// request. A dropped sender (manager torn down) resolves as
    /// `Cancelled`.
    pub async fn promoted(self) -> PromotionOutcome {
        self.receiver.await.unwrap_or(PromotionOutcome::Cancelled)
    }
}

/// The result of [`ConcurrencyManager::admit`].
pub enum AdmissionDecision {
    /// The run may start immediately. `locks` is empty for a
    /// non-isolated run.
    Started { admission_id: AdmissionId, locks: LockSet },
    /// The run must wait; see [`QueuedTicket`].
    Queued(QueuedTicket),
    /// The run may not proceed at all right now.
    Rejected(RejectReason),
}

/// Configurable caps and timeouts (spec §6 `CONCURRENCY`, `PER_WORKFLOW`,
/// `PER_USER`, plus queue length and timeout).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Limits {
    pub global: usize,
    pub per_workflow: usize,
    pub per_user: usize,
    pub max_queue_len: usize,
    #[serde(with = "duration_ms")]
    pub queue_timeout: Duration,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            global: 10,
            per_workflow: 3,
            per_user: 5,
            max_queue_len: 100,
            queue_timeout: Duration::from_secs(300),
        }
    }
}

struct RunningEntry {
    workflow_id: WorkflowId,
    user_id: UserId,
    affected_set: HashSet<NodeId>,
    isolated: bool,
    locks: LockSet,
}

struct QueuedEntry {
    request: AdmissionRequest,
    enqueued_at: DateTime<Utc>,
    seq: u64,
    sender: Option<oneshot::Sender<PromotionOutcome>>,
}

struct State {
    running: HashMap<AdmissionId, RunningEntry>,
    queue: Vec<QueuedEntry>,
    locks: HashMap<(WorkflowId, NodeId), AdmissionId>,
    next_seq: u64,
}

impl State {
    fn new() -> Self {
        Self {
            running: HashMap::new(),
            queue: Vec::new(),
            locks: HashMap::new(),
            next_seq: 0,
        }
    }

    fn workflow_count(&self, workflow_id: WorkflowId) -> usize {
        self.running.values().filter(|e| e.workflow_id == workflow_id).count()
    }

    fn user_count(&self, user_id: UserId) -> usize {
        self.running.values().filter(|e| e.user_id == user_id).count()
    }

    /// Whether `request` conflicts with something already running: same
    /// workflow, overlapping affected sets, and at least one side
    /// isolated (spec §4.4, testable property 7).
    fn conflicts_with_running(&self, request: &AdmissionRequest) -> bool {
        self.running.values().any(|entry| {
            entry.workflow_id == request.workflow_id
                && (entry.isolated || request.isolated)
                && !entry.affected_set.is_disjoint(&request.affected_set)
        })
    }

    fn locks_free(&self, request: &AdmissionRequest) -> bool {
        request
            .affected_set
            .iter()
            .all(|node_id| !self.locks.contains_key(&(request.workflow_id, *node_id)))
    }

    /// Caps-only gate; isolation and lock availability are checked
    /// separately since a cap failure and an isolation conflict are
    /// distinct [`RejectReason`]s.
    fn capacity_reject_reason(&self, request: &AdmissionRequest, limits: &Limits) -> Option<RejectReason> {
        if self.running.len() >= limits.global {
            return Some(RejectReason::GlobalCapacity);
        }
        if self.workflow_count(request.workflow_id) >= limits.per_workflow {
            return Some(RejectReason::WorkflowCapacity);
        }
        if self.user_count(request.user_id) >= limits.per_user {
            return Some(RejectReason::UserCapacity);
        }
        None
    }

    fn admit_now(&mut self, request: AdmissionRequest) -> (AdmissionId, LockSet) {
        let admission_id = AdmissionId::new();
        let locks: LockSet = if request.isolated {
            request.affected_set.iter().map(|node_id| (request.workflow_id, *node_id)).collect()
        } else {
            Vec::new()
        };
        for (workflow_id, node_id) in &locks {
            self.locks.insert((*workflow_id, *node_id), admission_id);
        }
        self.running.insert(
            admission_id,
            RunningEntry {
                workflow_id: request.workflow_id,
                user_id: request.user_id,
                affected_set: request.affected_set,
                isolated: request.isolated,
                locks: locks.clone(),
            },
        );
        (admission_id, locks)
    }

    /// Sorts the queue by priority (ascending) then FIFO (`seq`), the
    /// tie-break order §4.1 specifies for simultaneously-ready work.
    fn sort_queue(&mut self) {
        self.queue.sort_by(|a, b| a.request.priority.cmp(&b.request.priority).then(a.seq.cmp(&b.seq)));
    }
}

/// The Trigger Concurrency Manager.
pub struct ConcurrencyManager {
    limits: Limits,
    state: Mutex<State>,
}

impl ConcurrencyManager {
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            state: Mutex::new(State::new()),
        }
    }

    #[must_use]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Decides whether `request` may start now, must queue, or is
    /// rejected outright, per its [`AdmissionStrategy`].
    pub fn admit(&self, request: AdmissionRequest) -> AdmissionDecision {
        let mut state = self.state.lock().expect("lock poisoned");

        if let Some(reason) = state.capacity_reject_reason(&request, &self.limits) {
            return self.queue_or_reject(&mut state, request, reason);
        }
        if state.conflicts_with_running(&request) {
            return self.queue_or_reject(&mut state, request, RejectReason::IsolationConflict);
        }
        if request.isolated && !state.locks_free(&request) {
            return self.queue_or_reject(&mut state, request, RejectReason::IsolationConflict);
        }

        let workflow_id = request.workflow_id;
        let (admission_id, locks) = state.admit_now(request);
        tracing::debug!(%admission_id, %workflow_id, "admitted execution");
        AdmissionDecision::Started { admission_id, locks }
    }

    fn queue_or_reject(&self, state: &mut State, request: AdmissionRequest, reason: RejectReason) -> AdmissionDecision {
        if !request.strategy.queues_on_backpressure() {
            tracing::debug!(%reason, workflow_id = %request.workflow_id, "admission rejected");
            return AdmissionDecision::Rejected(reason);
        }

        if request.strategy == AdmissionStrategy::MergeLatest {
            if let Some(key) = request.dedup_key.clone() {
                let existing_index = state.queue.iter().position(|entry| entry.request.dedup_key.as_deref() == Some(key.as_str()));
                if let Some(index) = existing_index {
                    let (sender, receiver) = oneshot::channel();
                    let entry = &mut state.queue[index];
                    entry.request = request;
                    if let Some(old_sender) = entry.sender.replace(sender) {
                        let _ = old_sender.send(PromotionOutcome::Cancelled);
                    }
                    return AdmissionDecision::Queued(QueuedTicket {
                        admission_id: AdmissionId::new(),
                        position: index,
                        receiver,
                    });
                }
            }
        }

        if state.queue.len() >= self.limits.max_queue_len {
            return AdmissionDecision::Rejected(RejectReason::QueueFull);
        }

        let admission_id = AdmissionId::new();
        let seq = state.next_seq;
        state.next_seq += 1;
        let (sender, receiver) = oneshot::channel();
        state.queue.push(QueuedEntry {
            request,
            enqueued_at: Utc::now(),
            seq,
            sender: Some(sender),
        });
        state.sort_queue();
        let position = state.queue.iter().position(|e| e.seq == seq).unwrap_or(state.queue.len() - 1);
        tracing::debug!(%admission_id, %reason, position, "admission queued");
        AdmissionDecision::Queued(QueuedTicket { admission_id, position, receiver })
    }

    /// Releases an admitted execution's slot and locks, then attempts to
    /// promote the next eligible queued request. Idempotent: releasing an
    /// id that isn't (or is no longer) running is a no-op.
    pub fn release(&self, admission_id: AdmissionId) {
        let mut state = self.state.lock().expect("lock poisoned");
        let Some(entry) = state.running.remove(&admission_id) else {
            return;
        };
        for (workflow_id, node_id) in &entry.locks {
            state.locks.remove(&(*workflow_id, *node_id));
        }
        tracing::debug!(%admission_id, "released execution slot");
        self.promote(&mut state);
    }

    /// Scans the queue for entries that exceeded `queue_timeout` and
    /// evicts them, notifying their tickets. Intended to run periodically
    /// from the runtime's back-pressure cleanup task.
    pub fn evict_expired_requests(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        self.evict_expired(&mut state);
    }

    fn evict_expired(&self, state: &mut State) {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.limits.queue_timeout).unwrap_or(chrono::Duration::zero());
        let mut i = 0;
        while i < state.queue.len() {
            if now - state.queue[i].enqueued_at >= timeout {
                let mut entry = state.queue.remove(i);
                if let Some(sender) = entry.sender.take() {
                    let _ = sender.send(PromotionOutcome::Expired);
                }
            } else {
                i += 1;
            }
        }
    }

    /// Walks the queue in priority/FIFO order, admitting every entry that
    /// can now proceed. Called after every `release` so a freed slot
    /// (spec S6) and any newly-unlocked isolated run are both retried
    /// without operator action.
    fn promote(&self, state: &mut State) {
        let mut i = 0;
        while i < state.queue.len() {
            let request = state.queue[i].request.clone();
            let blocked = state.capacity_reject_reason(&request, &self.limits).is_some()
                || state.conflicts_with_running(&request)
                || (request.isolated && !state.locks_free(&request));

            if blocked {
                i += 1;
                continue;
            }

            let mut entry = state.queue.remove(i);
            let (admission_id, _locks) = state.admit_now(request);
            tracing::info!(%admission_id, "promoted queued execution");
            if let Some(sender) = entry.sender.take() {
                let _ = sender.send(PromotionOutcome::Admitted);
            }
            // Don't advance `i`: the removal shifted everything after it
            // down by one, and capacity may have just changed again.
        }
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").running.len()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.state.lock().expect("lock poisoned").queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_set(n: usize) -> HashSet<NodeId> {
        (0..n).map(|_| NodeId::new()).collect()
    }

    fn tight_limits() -> Limits {
        Limits {
            global: 10,
            per_workflow: 10,
            per_user: 10,
            max_queue_len: 10,
            queue_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn admits_under_cap() {
        let manager = ConcurrencyManager::new(tight_limits());
        let req = AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(3));
        assert!(matches!(manager.admit(req), AdmissionDecision::Started { .. }));
        assert_eq!(manager.running_count(), 1);
    }

    #[test]
    fn global_cap_queues_by_default() {
        let limits = Limits { global: 1, ..tight_limits() };
        let manager = ConcurrencyManager::new(limits);
        let first = AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(1));
        assert!(matches!(manager.admit(first), AdmissionDecision::Started { .. }));

        let second = AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(1));
        match manager.admit(second) {
            AdmissionDecision::Queued(ticket) => assert_eq!(ticket.position, 0),
            _ => panic!("expected Queued"),
        }
        assert_eq!(manager.queue_len(), 1);
    }

    #[test]
    fn reject_strategy_never_queues() {
        let limits = Limits { global: 1, ..tight_limits() };
        let manager = ConcurrencyManager::new(limits);
        let first = AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(1));
        manager.admit(first);

        let second = AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(1))
            .with_strategy(AdmissionStrategy::Reject);
        assert!(matches!(manager.admit(second), AdmissionDecision::Rejected(RejectReason::GlobalCapacity)));
        assert_eq!(manager.queue_len(), 0);
    }

    #[tokio::test]
    async fn release_promotes_queued_request() {
        let limits = Limits { global: 1, ..tight_limits() };
        let manager = ConcurrencyManager::new(limits);
        let first = AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(1));
        let AdmissionDecision::Started { admission_id, .. } = manager.admit(first) else {
            panic!("expected Started");
        };

        let second = AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(1));
        let AdmissionDecision::Queued(ticket) = manager.admit(second) else {
            panic!("expected Queued");
        };

        manager.release(admission_id);
        assert_eq!(ticket.promoted().await, PromotionOutcome::Admitted);
        assert_eq!(manager.running_count(), 1);
    }

    #[test]
    fn isolated_runs_with_overlapping_nodes_never_run_concurrently() {
        let manager = ConcurrencyManager::new(tight_limits());
        let workflow_id = WorkflowId::new();
        let shared_node = NodeId::new();
        let mut set_a = node_set(2);
        set_a.insert(shared_node);
        let mut set_b = node_set(2);
        set_b.insert(shared_node);

        let first = AdmissionRequest::new(workflow_id, UserId::new(), set_a).isolated(true);
        assert!(matches!(manager.admit(first), AdmissionDecision::Started { .. }));

        let second = AdmissionRequest::new(workflow_id, UserId::new(), set_b).isolated(true);
        assert!(matches!(manager.admit(second), AdmissionDecision::Queued(_)));
    }

    #[test]
    fn non_isolated_runs_may_run_concurrently() {
        let manager = ConcurrencyManager::new(tight_limits());
        let workflow_id = WorkflowId::new();
        let shared = node_set(2);

        let first = AdmissionRequest::new(workflow_id, UserId::new(), shared.clone());
        assert!(matches!(manager.admit(first), AdmissionDecision::Started { .. }));
        let second = AdmissionRequest::new(workflow_id, UserId::new(), shared);
        assert!(matches!(manager.admit(second), AdmissionDecision::Started { .. }));
        assert_eq!(manager.running_count(), 2);
    }

    #[test]
    fn locks_are_acquired_for_isolated_runs_only() {
        let manager = ConcurrencyManager::new(tight_limits());
        let req = AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(2)).isolated(true);
        let AdmissionDecision::Started { locks, .. } = manager.admit(req) else {
            panic!("expected Started");
        };
        assert_eq!(locks.len(), 2);

        let req2 = AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(2));
        let AdmissionDecision::Started { locks: locks2, .. } = manager.admit(req2) else {
            panic!("expected Started");
        };
        assert!(locks2.is_empty());
    }

    #[test]
    fn merge_latest_collapses_duplicate_queued_requests() {
        let limits = Limits { global: 1, ..tight_limits() };
        let manager = ConcurrencyManager::new(limits);
        let workflow_id = WorkflowId::new();
        manager.admit(AdmissionRequest::new(workflow_id, UserId::new(), node_set(1)));

        let dup1 = AdmissionRequest::new(workflow_id, UserId::new(), node_set(1))
            .with_strategy(AdmissionStrategy::MergeLatest)
            .with_dedup_key("trigger-1");
        manager.admit(dup1);
        assert_eq!(manager.queue_len(), 1);

        let dup2 = AdmissionRequest::new(workflow_id, UserId::new(), node_set(1))
            .with_strategy(AdmissionStrategy::MergeLatest)
            .with_dedup_key("trigger-1");
        manager.admit(dup2);
        assert_eq!(manager.queue_len(), 1, "second duplicate collapses onto the first");
    }

    #[test]
    fn queue_full_rejects_further_admissions() {
        let limits = Limits { global: 1, max_queue_len: 1, ..tight_limits() };
        let manager = ConcurrencyManager::new(limits);
        manager.admit(AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(1)));
        manager.admit(AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(1)));

        let overflow = AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(1));
        assert!(matches!(manager.admit(overflow), AdmissionDecision::Rejected(RejectReason::QueueFull)));
    }

    #[tokio::test]
    async fn expired_queue_entries_are_evicted() {
        let limits = Limits {
            global: 1,
            queue_timeout: Duration::from_millis(10),
            ..tight_limits()
        };
        let manager = ConcurrencyManager::new(limits);
        manager.admit(AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(1)));

        let queued = AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(1));
        let AdmissionDecision::Queued(ticket) = manager.admit(queued) else {
            panic!("expected Queued");
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.evict_expired_requests();
        assert_eq!(ticket.promoted().await, PromotionOutcome::Expired);
        assert_eq!(manager.queue_len(), 0);
    }

    #[test]
    fn per_workflow_cap_is_independent_of_global_cap() {
        let limits = Limits { per_workflow: 1, ..tight_limits() };
        let manager = ConcurrencyManager::new(limits);
        let workflow_id = WorkflowId::new();
        manager.admit(AdmissionRequest::new(workflow_id, UserId::new(), node_set(1)));

        let second = AdmissionRequest::new(workflow_id, UserId::new(), node_set(1));
        assert!(matches!(manager.admit(second), AdmissionDecision::Queued(_)));

        let other_workflow = AdmissionRequest::new(WorkflowId::new(), UserId::new(), node_set(1));
        assert!(matches!(manager.admit(other_workflow), AdmissionDecision::Started { .. }));
    }

    #[test]
    fn per_user_cap_is_independent_of_workflow() {
        let limits = Limits { per_user: 1, ..tight_limits() };
        let manager = ConcurrencyManager::new(limits);
        let user_id = UserId::new();
        manager.admit(AdmissionRequest::new(WorkflowId::new(), user_id, node_set(1)));

        let second = AdmissionRequest::new(WorkflowId::new(), user_id, node_set(1));
        assert!(matches!(manager.admit(second), AdmissionDecision::Queued(_)));
    }
}
