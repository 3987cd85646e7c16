//! In-memory implementation of ExecutionStore for testing
//!
//! Mirrors the PostgreSQL semantics (claim ordering, idempotent child
//! creation, signal rendezvous, recovery) so the engine and worker can be
//! exercised deterministically without a database.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::store::*;
use crate::error::ExecutionError;
use crate::model::{
    generate_id, Execution, ExecutionKind, ExecutionStatus, HistoryEvent, NewExecution, Signal,
    WorkerHeartbeat, WorkerStatus, WorkflowContext,
};
use crate::retry::RetryPolicy;

struct MemoryState {
    executions: HashMap<String, Execution>,
    contexts: HashMap<String, WorkflowContext>,
    signals: Vec<Signal>,
    heartbeats: HashMap<String, WorkerHeartbeat>,
}

/// In-memory implementation of ExecutionStore
///
/// # Example
///
/// ```
/// use metronome_core::store::InMemoryExecutionStore;
///
/// let store = InMemoryExecutionStore::new();
/// ```
pub struct InMemoryExecutionStore {
    state: Mutex<MemoryState>,
    retry_policy: RetryPolicy,
    wakeups: broadcast::Sender<String>,
}

impl InMemoryExecutionStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        let (wakeups, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MemoryState {
                executions: HashMap::new(),
                contexts: HashMap::new(),
                signals: Vec::new(),
                heartbeats: HashMap::new(),
            }),
            retry_policy: RetryPolicy::new(Duration::ZERO, Duration::ZERO),
            wakeups,
        }
    }

    /// Override the retry backoff policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Number of executions currently pending
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .count()
    }

    /// All children of a workflow, in creation order
    pub fn children_of(&self, workflow_id: &str) -> Vec<Execution> {
        let state = self.state.lock();
        let mut children: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| e.parent_workflow_id.as_deref() == Some(workflow_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        children
    }

    /// Unconsumed signal count for a workflow (for assertions)
    pub fn pending_signal_count(&self, workflow_id: &str) -> usize {
        self.state
            .lock()
            .signals
            .iter()
            .filter(|s| s.workflow_id == workflow_id && !s.consumed)
            .count()
    }

    /// Age a worker's heartbeat so recovery tests can declare it dead
    pub fn backdate_heartbeat(&self, worker_id: &str, age: Duration) {
        let mut state = self.state.lock();
        if let Some(hb) = state.heartbeats.get_mut(worker_id) {
            hb.last_heartbeat = Utc::now() - chrono::Duration::from_std(age).unwrap_or_default();
        }
    }

    fn notify(&self, queue: &str) {
        let _ = self.wakeups.send(queue.to_string());
    }

    fn new_to_execution(new: &NewExecution, now: DateTime<Utc>) -> Execution {
        Execution {
            id: new.id.clone(),
            kind: new.kind,
            function_name: new.function_name.clone(),
            queue: new.queue.clone(),
            status: ExecutionStatus::Pending,
            priority: new.priority,
            inputs: new.inputs.clone(),
            output: None,
            error: None,
            attempt: 0,
            max_retries: new.max_retries,
            timeout_seconds: new.timeout_seconds,
            parent_workflow_id: new.parent_workflow_id.clone(),
            idempotency_key: new.idempotency_key.clone(),
            claimed_by: None,
            visible_at: now,
            created_at: now,
            claimed_at: None,
            completed_at: None,
        }
    }

    /// Deliver a terminal child's result to its parent. Mirrors the
    /// PostgreSQL hand-off: append once, clear the await, resume if
    /// suspended. Returns the parent's queue when it was resumed.
    fn hand_off_to_parent(
        state: &mut MemoryState,
        parent_id: &str,
        child_id: &str,
        function_name: &str,
        value: Value,
    ) -> Option<String> {
        let Some(ctx) = state.contexts.get_mut(parent_id) else {
            warn!(%parent_id, %child_id, "parent context missing, skipping hand-off");
            return None;
        };

        let already_recorded = ctx.history.iter().any(|event| {
            matches!(event, HistoryEvent::TaskResult { child_id: c, .. } if c == child_id)
        });
        if already_recorded {
            return None;
        }

        ctx.history.push(HistoryEvent::TaskResult {
            name: function_name.to_string(),
            child_id: child_id.to_string(),
            value,
            statement_index: ctx.statement_index,
        });
        ctx.awaiting_child_id = None;

        let parent = state.executions.get_mut(parent_id)?;
        if parent.status == ExecutionStatus::Suspended {
            parent.status = ExecutionStatus::Pending;
            return Some(parent.queue.clone());
        }
        None
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert_execution(&self, new: NewExecution) -> Result<String, StoreError> {
        let queue = new.queue.clone();
        {
            let mut state = self.state.lock();
            if state.executions.contains_key(&new.id) {
                return Err(StoreError::Conflict(new.id));
            }
            let execution = Self::new_to_execution(&new, Utc::now());
            state.executions.insert(new.id.clone(), execution);
        }
        self.notify(&queue);
        Ok(new.id)
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self.state.lock().executions.get(id).cloned())
    }

    async fn claim_batch(
        &self,
        queues: &[String],
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        if queues.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let now = Utc::now();
        let mut state = self.state.lock();

        let mut candidates: Vec<(i32, DateTime<Utc>, String)> = state
            .executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Pending
                    && queues.contains(&e.queue)
                    && e.visible_at <= now
            })
            .map(|e| (e.priority, e.created_at, e.id.clone()))
            .collect();

        // Dispatch order: priority descending, then age, then id.
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            let execution = state.executions.get_mut(&id).expect("candidate exists");
            execution.status = ExecutionStatus::Running;
            execution.claimed_by = Some(worker_id.to_string());
            execution.claimed_at = Some(now);
            claimed.push(execution.clone());
        }

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed executions");
        }
        Ok(claimed)
    }

    async fn complete_batch(&self, outcomes: &[(String, Value)]) -> Result<(), StoreError> {
        let mut resumed_queues = Vec::new();
        {
            let mut state = self.state.lock();

            for (id, output) in outcomes {
                let execution = state
                    .executions
                    .get(id)
                    .ok_or_else(|| StoreError::NotFound(id.clone()))?;

                match execution.status {
                    ExecutionStatus::Completed => {
                        if execution.output.as_ref() != Some(output) {
                            warn!(%id, "re-completion with different output ignored");
                        }
                        continue;
                    }
                    ExecutionStatus::Failed | ExecutionStatus::Suspended => {
                        return Err(StoreError::IllegalTransition {
                            id: id.clone(),
                            from: execution.status,
                            to: ExecutionStatus::Completed,
                        });
                    }
                    ExecutionStatus::Running | ExecutionStatus::Pending => {}
                }

                let execution = state.executions.get_mut(id).expect("checked above");
                execution.status = ExecutionStatus::Completed;
                execution.output = Some(output.clone());
                execution.error = None;
                execution.claimed_by = None;
                execution.completed_at = Some(Utc::now());

                let parent_id = execution.parent_workflow_id.clone();
                let function_name = execution.function_name.clone();

                if let Some(parent_id) = parent_id {
                    if let Some(queue) = Self::hand_off_to_parent(
                        &mut state,
                        &parent_id,
                        id,
                        &function_name,
                        output.clone(),
                    ) {
                        resumed_queues.push(queue);
                    }
                }
            }
        }

        for queue in resumed_queues {
            self.notify(&queue);
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: &str,
        error: &ExecutionError,
        retry: bool,
    ) -> Result<FailOutcome, StoreError> {
        let mut resumed_queue = None;
        let outcome;
        {
            let mut state = self.state.lock();

            let execution = state
                .executions
                .get(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            if execution.status.is_terminal() {
                return Err(StoreError::IllegalTransition {
                    id: id.to_string(),
                    from: execution.status,
                    to: ExecutionStatus::Failed,
                });
            }

            let next_attempt = execution.attempt + 1;
            let max_retries = execution.max_retries;

            let execution = state.executions.get_mut(id).expect("checked above");
            execution.attempt = next_attempt;
            execution.error = Some(error.clone());
            execution.claimed_by = None;

            if retry && next_attempt < max_retries {
                let delay = self.retry_policy.delay_for_attempt(next_attempt);
                execution.status = ExecutionStatus::Pending;
                execution.visible_at =
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                outcome = FailOutcome::WillRetry {
                    next_attempt,
                    delay,
                };
            } else {
                execution.status = ExecutionStatus::Failed;
                // attempt never exceeds max_retries, even for no-retry rows.
                execution.attempt = next_attempt.min(max_retries);
                execution.completed_at = Some(Utc::now());

                let parent_id = execution.parent_workflow_id.clone();
                let function_name = execution.function_name.clone();

                if let Some(parent_id) = parent_id {
                    resumed_queue = Self::hand_off_to_parent(
                        &mut state,
                        &parent_id,
                        id,
                        &function_name,
                        failure_envelope(error),
                    );
                }
                outcome = FailOutcome::Failed;
            }
        }

        if let Some(queue) = resumed_queue {
            self.notify(&queue);
        }
        Ok(outcome)
    }

    async fn load_context(&self, execution_id: &str) -> Result<WorkflowContext, StoreError> {
        Ok(self
            .state
            .lock()
            .contexts
            .get(execution_id)
            .cloned()
            .unwrap_or_else(|| WorkflowContext::new(execution_id)))
    }

    async fn save_context(&self, context: &WorkflowContext) -> Result<(), StoreError> {
        self.state
            .lock()
            .contexts
            .insert(context.execution_id.clone(), context.clone());
        Ok(())
    }

    async fn suspend_workflow(
        &self,
        id: &str,
        context: &WorkflowContext,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();

        let execution = state
            .executions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if execution.kind != ExecutionKind::Workflow
            || execution.status != ExecutionStatus::Running
        {
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from: execution.status,
                to: ExecutionStatus::Suspended,
            });
        }

        execution.status = ExecutionStatus::Suspended;
        execution.claimed_by = None;
        state.contexts.insert(id.to_string(), context.clone());
        Ok(())
    }

    async fn resume_workflow(&self, id: &str) -> Result<(), StoreError> {
        let queue;
        {
            let mut state = self.state.lock();
            let execution = state
                .executions
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            if execution.status != ExecutionStatus::Suspended {
                return Err(StoreError::IllegalTransition {
                    id: id.to_string(),
                    from: execution.status,
                    to: ExecutionStatus::Pending,
                });
            }

            execution.status = ExecutionStatus::Pending;
            queue = execution.queue.clone();
        }
        self.notify(&queue);
        Ok(())
    }

    async fn create_child_and_suspend(
        &self,
        parent_id: &str,
        child: NewExecution,
        context: &WorkflowContext,
    ) -> Result<String, StoreError> {
        let child_queue = child.queue.clone();
        let (child_id, newly_created) = {
            let mut state = self.state.lock();

            // No rollback here, so validate the parent before mutating.
            {
                let parent = state
                    .executions
                    .get(parent_id)
                    .ok_or_else(|| StoreError::NotFound(parent_id.to_string()))?;
                if parent.kind != ExecutionKind::Workflow
                    || parent.status != ExecutionStatus::Running
                {
                    return Err(StoreError::IllegalTransition {
                        id: parent_id.to_string(),
                        from: parent.status,
                        to: ExecutionStatus::Suspended,
                    });
                }
            }

            let existing = state
                .executions
                .values()
                .find(|e| {
                    e.parent_workflow_id == child.parent_workflow_id
                        && e.idempotency_key.is_some()
                        && e.idempotency_key == child.idempotency_key
                })
                .map(|e| e.id.clone());

            let (child_id, newly_created) = match existing {
                Some(id) => (id, false),
                None => {
                    let execution = Self::new_to_execution(&child, Utc::now());
                    state.executions.insert(child.id.clone(), execution);
                    (child.id.clone(), true)
                }
            };

            let mut suspended_ctx = context.clone();
            suspended_ctx.awaiting_child_id = Some(child_id.clone());
            state
                .contexts
                .insert(parent_id.to_string(), suspended_ctx);

            let parent = state
                .executions
                .get_mut(parent_id)
                .expect("parent checked above");
            parent.status = ExecutionStatus::Suspended;
            parent.claimed_by = None;

            (child_id, newly_created)
        };

        if newly_created {
            self.notify(&child_queue);
        }
        debug!(%parent_id, %child_id, "child created, parent suspended");
        Ok(child_id)
    }

    async fn append_signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<String, StoreError> {
        let signal_id = generate_id("sig");
        let mut resumed_queue = None;
        {
            let mut state = self.state.lock();

            let workflow = state
                .executions
                .get(workflow_id)
                .filter(|e| e.kind == ExecutionKind::Workflow)
                .ok_or_else(|| StoreError::NotFound(workflow_id.to_string()))?;
            let workflow_status = workflow.status;
            let workflow_queue = workflow.queue.clone();

            let mut signal = Signal {
                id: signal_id.clone(),
                workflow_id: workflow_id.to_string(),
                name: name.to_string(),
                payload: payload.clone(),
                consumed: false,
                created_at: Utc::now(),
            };

            if workflow_status == ExecutionStatus::Suspended {
                if let Some(ctx) = state.contexts.get_mut(workflow_id) {
                    if ctx.awaiting_signal.as_deref() == Some(name) {
                        signal.consumed = true;
                        ctx.history.push(HistoryEvent::Signal {
                            name: name.to_string(),
                            payload: payload.clone(),
                            statement_index: ctx.statement_index,
                        });
                        ctx.awaiting_signal = None;

                        let workflow = state
                            .executions
                            .get_mut(workflow_id)
                            .expect("checked above");
                        workflow.status = ExecutionStatus::Pending;
                        resumed_queue = Some(workflow_queue);
                    }
                }
            }

            state.signals.push(signal);
        }

        if let Some(queue) = resumed_queue {
            self.notify(&queue);
        }
        Ok(signal_id)
    }

    async fn take_signal(
        &self,
        workflow_id: &str,
        name: &str,
        context: &WorkflowContext,
    ) -> Result<Option<Value>, StoreError> {
        let mut state = self.state.lock();

        let signal = state
            .signals
            .iter_mut()
            .filter(|s| s.workflow_id == workflow_id && s.name == name && !s.consumed)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let Some(signal) = signal else {
            return Ok(None);
        };

        signal.consumed = true;
        let payload = signal.payload.clone();

        let mut consumed_ctx = context.clone();
        consumed_ctx.history.push(HistoryEvent::Signal {
            name: name.to_string(),
            payload: payload.clone(),
            statement_index: context.statement_index,
        });
        state
            .contexts
            .insert(workflow_id.to_string(), consumed_ctx);

        Ok(Some(payload))
    }

    async fn upsert_heartbeat(
        &self,
        worker_id: &str,
        queues: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.heartbeats.insert(
            worker_id.to_string(),
            WorkerHeartbeat {
                worker_id: worker_id.to_string(),
                last_heartbeat: Utc::now(),
                queues: queues.to_vec(),
                status: WorkerStatus::Running,
            },
        );
        Ok(())
    }

    async fn stop_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(hb) = state.heartbeats.get_mut(worker_id) {
            hb.status = WorkerStatus::Stopped;
        }
        Ok(())
    }

    async fn recover_dead(&self, timeout: Duration) -> Result<RecoveredWork, StoreError> {
        let threshold = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();
        let mut recovered = RecoveredWork::default();
        let mut queues = Vec::new();
        {
            let mut state = self.state.lock();

            for hb in state.heartbeats.values_mut() {
                if hb.status == WorkerStatus::Running && hb.last_heartbeat < threshold {
                    hb.status = WorkerStatus::Stopped;
                    recovered.workers_stopped.push(hb.worker_id.clone());
                }
            }

            if !recovered.workers_stopped.is_empty() {
                let now = Utc::now();
                for execution in state.executions.values_mut() {
                    let claimed_by_dead = execution
                        .claimed_by
                        .as_ref()
                        .is_some_and(|w| recovered.workers_stopped.contains(w));
                    if execution.status == ExecutionStatus::Running && claimed_by_dead {
                        execution.status = ExecutionStatus::Pending;
                        execution.claimed_by = None;
                        execution.claimed_at = None;
                        execution.visible_at = now;
                        recovered.executions_recovered.push(execution.id.clone());
                        if !queues.contains(&execution.queue) {
                            queues.push(execution.queue.clone());
                        }
                    }
                }
            }
        }

        for queue in queues {
            self.notify(&queue);
        }

        if !recovered.executions_recovered.is_empty() {
            warn!(
                workers = recovered.workers_stopped.len(),
                executions = recovered.executions_recovered.len(),
                "recovered work from dead workers"
            );
        }
        Ok(recovered)
    }

    async fn subscribe(&self, queues: &[String]) -> Result<Box<dyn QueueWakeup>, StoreError> {
        Ok(Box::new(MemoryQueueWakeup {
            queues: queues.to_vec(),
            rx: self.wakeups.subscribe(),
        }))
    }
}

struct MemoryQueueWakeup {
    queues: Vec<String>,
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl QueueWakeup for MemoryQueueWakeup {
    async fn wait(&mut self) -> Result<(), StoreError> {
        loop {
            match self.rx.recv().await {
                Ok(queue) if self.queues.contains(&queue) => return Ok(()),
                Ok(_) => continue,
                // Lagged receivers treat the missed burst as a wake-up.
                Err(broadcast::error::RecvError::Lagged(_)) => return Ok(()),
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(StoreError::Database("wakeup channel closed".into()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn store() -> InMemoryExecutionStore {
        InMemoryExecutionStore::new()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = store();
        let id = store
            .insert_execution(NewExecution::task("send_email", "default", json!({"to": "a"})))
            .await
            .unwrap();

        let execution = store.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.function_name, "send_email");
        assert_eq!(execution.attempt, 0);
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let store = store();
        let new = NewExecution::task("t", "default", json!({}));
        let dup = new.clone();

        store.insert_execution(new).await.unwrap();
        let err = store.insert_execution(dup).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_claim_order_and_exclusivity() {
        let store = store();
        let queues = vec!["default".to_string()];

        let low = store
            .insert_execution(NewExecution::task("t", "default", json!({})).with_priority(0))
            .await
            .unwrap();
        let high = store
            .insert_execution(NewExecution::task("t", "default", json!({})).with_priority(9))
            .await
            .unwrap();

        let batch = store.claim_batch(&queues, "worker_a", 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, high);
        assert_eq!(batch[0].status, ExecutionStatus::Running);
        assert_eq!(batch[0].claimed_by.as_deref(), Some("worker_a"));

        // A second claimer never sees the claimed row.
        let batch = store.claim_batch(&queues, "worker_b", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, low);

        assert!(store.claim_batch(&queues, "worker_c", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_ignores_other_queues() {
        let store = store();
        store
            .insert_execution(NewExecution::task("t", "emails", json!({})))
            .await
            .unwrap();

        let batch = store
            .claim_batch(&["default".to_string()], "w", 10)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let store = store();
        let id = store
            .insert_execution(NewExecution::task("t", "default", json!({})))
            .await
            .unwrap();
        store
            .claim_batch(&["default".to_string()], "w", 1)
            .await
            .unwrap();

        let outcome = vec![(id.clone(), json!({"ok": true}))];
        store.complete_batch(&outcome).await.unwrap();
        // Same output again: no-op.
        store.complete_batch(&outcome).await.unwrap();

        let execution = store.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output, Some(json!({"ok": true})));
        assert!(execution.claimed_by.is_none());
        assert!(execution.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_complete_failed_row_is_illegal() {
        let store = store();
        let id = store
            .insert_execution(NewExecution::task("t", "default", json!({})).with_max_retries(1))
            .await
            .unwrap();
        store
            .claim_batch(&["default".to_string()], "w", 1)
            .await
            .unwrap();
        store
            .fail(&id, &ExecutionError::transient("boom"), true)
            .await
            .unwrap();

        let err = store
            .complete_batch(&[(id, json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_fail_retries_until_exhausted() {
        let store = store();
        let id = store
            .insert_execution(NewExecution::task("t", "default", json!({})).with_max_retries(3))
            .await
            .unwrap();
        let queues = vec!["default".to_string()];
        let error = ExecutionError::transient("flaky");

        // Attempt 0 -> retry.
        store.claim_batch(&queues, "w", 1).await.unwrap();
        let outcome = store.fail(&id, &error, true).await.unwrap();
        assert!(matches!(outcome, FailOutcome::WillRetry { next_attempt: 1, .. }));

        // Attempt 1 -> retry.
        store.claim_batch(&queues, "w", 1).await.unwrap();
        let outcome = store.fail(&id, &error, true).await.unwrap();
        assert!(matches!(outcome, FailOutcome::WillRetry { next_attempt: 2, .. }));

        // Attempt 2 -> exhausted.
        store.claim_batch(&queues, "w", 1).await.unwrap();
        let outcome = store.fail(&id, &error, true).await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let execution = store.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.attempt, 3);
        assert_eq!(execution.error.as_ref().unwrap().kind, ErrorKind::Transient);
        assert!(execution.output.is_none());
        assert!(execution.attempt <= execution.max_retries);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let store = store();
        let id = store
            .insert_execution(NewExecution::task("t", "default", json!({})).with_max_retries(5))
            .await
            .unwrap();
        store
            .claim_batch(&["default".to_string()], "w", 1)
            .await
            .unwrap();

        let error = ExecutionError::new(ErrorKind::UnknownFunction, "no such function");
        let outcome = store.fail(&id, &error, false).await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let execution = store.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.attempt, 1);
    }

    #[tokio::test]
    async fn test_retry_delay_defers_dispatch() {
        let store = InMemoryExecutionStore::new().with_retry_policy(RetryPolicy::new(
            Duration::from_secs(30),
            Duration::from_secs(60),
        ));
        let queues = vec!["default".to_string()];
        let id = store
            .insert_execution(NewExecution::task("t", "default", json!({})).with_max_retries(3))
            .await
            .unwrap();

        store.claim_batch(&queues, "w", 1).await.unwrap();
        store
            .fail(&id, &ExecutionError::transient("later"), true)
            .await
            .unwrap();

        // Pending but not yet visible.
        let execution = store.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert!(store.claim_batch(&queues, "w", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_child_hand_off_resumes_parent() {
        let store = store();
        let queues = vec!["default".to_string()];

        let parent_id = store
            .insert_execution(NewExecution::workflow("flow", "default", json!({})))
            .await
            .unwrap();
        let parent = store.claim_batch(&queues, "w", 1).await.unwrap().remove(0);

        let ctx = WorkflowContext::new(&parent_id);
        let child = NewExecution::child_task(&parent, "step", json!({}), "0:0".into());
        let child_id = store
            .create_child_and_suspend(&parent_id, child, &ctx)
            .await
            .unwrap();

        let parent = store.get_execution(&parent_id).await.unwrap().unwrap();
        assert_eq!(parent.status, ExecutionStatus::Suspended);
        assert!(parent.claimed_by.is_none());

        // Child runs and completes; parent context gets the event and the
        // parent goes back to pending.
        let claimed = store.claim_batch(&queues, "w", 1).await.unwrap();
        assert_eq!(claimed[0].id, child_id);
        store
            .complete_batch(&[(child_id.clone(), json!({"result": 1}))])
            .await
            .unwrap();

        let parent = store.get_execution(&parent_id).await.unwrap().unwrap();
        assert_eq!(parent.status, ExecutionStatus::Pending);

        let ctx = store.load_context(&parent_id).await.unwrap();
        assert!(ctx.awaiting_child_id.is_none());
        assert_eq!(ctx.history.len(), 1);
        assert!(matches!(
            &ctx.history[0],
            HistoryEvent::TaskResult { child_id: c, value, .. }
                if c == &child_id && value == &json!({"result": 1})
        ));
    }

    #[tokio::test]
    async fn test_child_creation_is_idempotent() {
        let store = store();
        let queues = vec!["default".to_string()];

        let parent_id = store
            .insert_execution(NewExecution::workflow("flow", "default", json!({})))
            .await
            .unwrap();
        let parent = store.claim_batch(&queues, "w", 1).await.unwrap().remove(0);
        let ctx = WorkflowContext::new(&parent_id);

        let first = store
            .create_child_and_suspend(
                &parent_id,
                NewExecution::child_task(&parent, "step", json!({}), "0:0".into()),
                &ctx,
            )
            .await
            .unwrap();

        // Simulate a crashed step retrying the same statement occurrence.
        store.resume_workflow(&parent_id).await.unwrap();
        let parent = store
            .claim_batch(&queues, "w", 2)
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.id == parent_id)
            .expect("parent should be claimable");

        let second = store
            .create_child_and_suspend(
                &parent_id,
                NewExecution::child_task(&parent, "step", json!({}), "0:0".into()),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.children_of(&parent_id).len(), 1);
    }

    #[tokio::test]
    async fn test_signal_rendezvous_with_suspended_workflow() {
        let store = store();
        let queues = vec!["default".to_string()];

        let wf_id = store
            .insert_execution(NewExecution::workflow("flow", "default", json!({})))
            .await
            .unwrap();
        store.claim_batch(&queues, "w", 1).await.unwrap();

        let mut ctx = WorkflowContext::new(&wf_id);
        ctx.awaiting_signal = Some("approval".to_string());
        store.suspend_workflow(&wf_id, &ctx).await.unwrap();

        store
            .append_signal(&wf_id, "approval", json!({"approved": true}))
            .await
            .unwrap();

        let workflow = store.get_execution(&wf_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, ExecutionStatus::Pending);

        let ctx = store.load_context(&wf_id).await.unwrap();
        assert!(ctx.awaiting_signal.is_none());
        assert!(matches!(
            &ctx.history[0],
            HistoryEvent::Signal { name, payload, .. }
                if name == "approval" && payload == &json!({"approved": true})
        ));
        assert_eq!(store.pending_signal_count(&wf_id), 0);
    }

    #[tokio::test]
    async fn test_early_signal_is_drained_not_lost() {
        let store = store();
        let wf_id = store
            .insert_execution(NewExecution::workflow("flow", "default", json!({})))
            .await
            .unwrap();

        // Signal arrives before the workflow reaches its wait.
        store
            .append_signal(&wf_id, "approval", json!({"approved": false}))
            .await
            .unwrap();
        assert_eq!(store.pending_signal_count(&wf_id), 1);

        let ctx = WorkflowContext::new(&wf_id);
        let payload = store
            .take_signal(&wf_id, "approval", &ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, json!({"approved": false}));

        // Consumed exactly once.
        assert_eq!(store.pending_signal_count(&wf_id), 0);
        assert!(store
            .take_signal(&wf_id, "approval", &ctx)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_recover_dead_workers() {
        let store = store();
        let queues = vec!["default".to_string()];

        let id = store
            .insert_execution(NewExecution::task("t", "default", json!({})))
            .await
            .unwrap();
        store.upsert_heartbeat("worker_dead", &queues).await.unwrap();
        store.claim_batch(&queues, "worker_dead", 1).await.unwrap();

        store.backdate_heartbeat("worker_dead", Duration::from_secs(120));

        let recovered = store.recover_dead(Duration::from_secs(30)).await.unwrap();
        assert_eq!(recovered.workers_stopped, vec!["worker_dead".to_string()]);
        assert_eq!(recovered.executions_recovered, vec![id.clone()]);

        let execution = store.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert!(execution.claimed_by.is_none());

        // Idempotent: a second pass finds nothing.
        let again = store.recover_dead(Duration::from_secs(30)).await.unwrap();
        assert!(again.workers_stopped.is_empty());
        assert!(again.executions_recovered.is_empty());
    }

    #[tokio::test]
    async fn test_recover_ignores_live_workers() {
        let store = store();
        let queues = vec!["default".to_string()];

        store
            .insert_execution(NewExecution::task("t", "default", json!({})))
            .await
            .unwrap();
        store.upsert_heartbeat("worker_live", &queues).await.unwrap();
        store.claim_batch(&queues, "worker_live", 1).await.unwrap();

        let recovered = store.recover_dead(Duration::from_secs(30)).await.unwrap();
        assert!(recovered.workers_stopped.is_empty());
        assert!(recovered.executions_recovered.is_empty());
    }

    #[tokio::test]
    async fn test_wakeup_on_insert() {
        let store = store();
        let mut wakeup = store.subscribe(&["default".to_string()]).await.unwrap();

        store
            .insert_execution(NewExecution::task("t", "default", json!({})))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), wakeup.wait())
            .await
            .expect("wakeup should arrive")
            .unwrap();
    }
}
