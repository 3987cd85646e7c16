//! Dispatcher: the thin façade workers use to talk to the store
//!
//! Owns no in-memory queue; persistence is the queue. Also carries the
//! enqueue entry points so clients and bindings share the same defaults.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::instrument;

use crate::config::Settings;
use crate::error::ExecutionError;
use crate::model::{Execution, NewExecution};
use crate::store::{ExecutionStore, FailOutcome, QueueWakeup, RecoveredWork, StoreError};

/// Default queue when the caller does not name one
pub const DEFAULT_QUEUE: &str = "default";

/// Thin façade over the store
pub struct Dispatcher {
    store: Arc<dyn ExecutionStore>,
    default_retries: i32,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn ExecutionStore>, settings: &Settings) -> Self {
        Self::with_defaults(store, settings.default_retries)
    }

    pub fn with_defaults(store: Arc<dyn ExecutionStore>, default_retries: i32) -> Self {
        Self {
            store,
            default_retries,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Enqueue a one-shot task
    #[instrument(skip(self, inputs))]
    pub async fn enqueue_task(
        &self,
        function_name: &str,
        inputs: Value,
        queue: Option<&str>,
    ) -> Result<String, StoreError> {
        let new = NewExecution::task(
            function_name,
            queue.unwrap_or(DEFAULT_QUEUE),
            inputs,
        )
        .with_max_retries(self.default_retries);
        self.store.insert_execution(new).await
    }

    /// Enqueue a workflow execution
    #[instrument(skip(self, inputs))]
    pub async fn enqueue_workflow(
        &self,
        workflow_name: &str,
        inputs: Value,
        queue: Option<&str>,
    ) -> Result<String, StoreError> {
        let new = NewExecution::workflow(
            workflow_name,
            queue.unwrap_or(DEFAULT_QUEUE),
            inputs,
        )
        .with_max_retries(self.default_retries);
        self.store.insert_execution(new).await
    }

    /// Create a child execution of a workflow outside an engine step.
    ///
    /// The engine's own child creation goes through the atomic
    /// suspend-with-child store operation; this wrapper is for external
    /// collaborators that enqueue children directly. Inherits the parent's
    /// queue unless the caller overrides it.
    #[instrument(skip(self, parent, inputs), fields(parent_id = %parent.id))]
    pub async fn create_child_execution(
        &self,
        parent: &Execution,
        function_name: &str,
        inputs: Value,
        idempotency_key: String,
        queue: Option<&str>,
    ) -> Result<String, StoreError> {
        let mut new = NewExecution::child_task(parent, function_name, inputs, idempotency_key)
            .with_max_retries(self.default_retries);
        if let Some(queue) = queue {
            new = new.with_queue(queue);
        }
        self.store.insert_execution(new).await
    }

    /// Claim up to `limit` pending executions; never blocks.
    pub async fn claim_batch(
        &self,
        queues: &[String],
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        self.store.claim_batch(queues, worker_id, limit).await
    }

    /// Report a batch of successful outcomes.
    pub async fn complete_batch(&self, outcomes: &[(String, Value)]) -> Result<(), StoreError> {
        self.store.complete_batch(outcomes).await
    }

    /// Report a failure.
    pub async fn fail(
        &self,
        id: &str,
        error: &ExecutionError,
        retry: bool,
    ) -> Result<FailOutcome, StoreError> {
        self.store.fail(id, error, retry).await
    }

    /// Return work claimed by dead workers to their queues.
    pub async fn recover_dead(&self, timeout: Duration) -> Result<RecoveredWork, StoreError> {
        self.store.recover_dead(timeout).await
    }

    /// Fetch an execution.
    pub async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        self.store.get_execution(id).await
    }

    /// Record a worker heartbeat.
    pub async fn heartbeat(&self, worker_id: &str, queues: &[String]) -> Result<(), StoreError> {
        self.store.upsert_heartbeat(worker_id, queues).await
    }

    /// Mark a worker stopped.
    pub async fn stop_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        self.store.stop_worker(worker_id).await
    }

    /// Subscribe to queue wake-ups.
    pub async fn subscribe(&self, queues: &[String]) -> Result<Box<dyn QueueWakeup>, StoreError> {
        self.store.subscribe(queues).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionKind, ExecutionStatus};
    use crate::store::InMemoryExecutionStore;
    use serde_json::json;

    fn dispatcher() -> (Arc<InMemoryExecutionStore>, Dispatcher) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&store) as Arc<dyn ExecutionStore>,
            &Settings::default(),
        );
        (store, dispatcher)
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let (store, dispatcher) = dispatcher();

        let task_id = dispatcher
            .enqueue_task("send_email", json!({"to": "a"}), None)
            .await
            .unwrap();
        let wf_id = dispatcher
            .enqueue_workflow("order_flow", json!({}), Some("orders"))
            .await
            .unwrap();

        let task = store.get_execution(&task_id).await.unwrap().unwrap();
        assert_eq!(task.kind, ExecutionKind::Task);
        assert_eq!(task.queue, DEFAULT_QUEUE);
        assert_eq!(task.max_retries, 3);

        let workflow = store.get_execution(&wf_id).await.unwrap().unwrap();
        assert_eq!(workflow.kind, ExecutionKind::Workflow);
        assert_eq!(workflow.queue, "orders");
    }

    #[tokio::test]
    async fn test_child_inherits_parent_queue() {
        let (store, dispatcher) = dispatcher();

        let wf_id = dispatcher
            .enqueue_workflow("flow", json!({}), Some("orders"))
            .await
            .unwrap();
        let parent = store.get_execution(&wf_id).await.unwrap().unwrap();

        let child_id = dispatcher
            .create_child_execution(&parent, "step", json!({}), "0:0".into(), None)
            .await
            .unwrap();
        let child = store.get_execution(&child_id).await.unwrap().unwrap();
        assert_eq!(child.queue, "orders");
        assert_eq!(child.parent_workflow_id.as_deref(), Some(wf_id.as_str()));

        let overridden = dispatcher
            .create_child_execution(&parent, "step", json!({}), "1:1".into(), Some("payments"))
            .await
            .unwrap();
        let child = store.get_execution(&overridden).await.unwrap().unwrap();
        assert_eq!(child.queue, "payments");
    }

    #[tokio::test]
    async fn test_claim_batch_empty_rather_than_blocking() {
        let (_store, dispatcher) = dispatcher();
        let claimed = dispatcher
            .claim_batch(&["default".to_string()], "w", 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_through_facade() {
        let (_store, dispatcher) = dispatcher();

        let id = dispatcher
            .enqueue_task("t", json!({}), None)
            .await
            .unwrap();
        let claimed = dispatcher
            .claim_batch(&["default".to_string()], "w", 1)
            .await
            .unwrap();
        assert_eq!(claimed[0].id, id);

        dispatcher
            .complete_batch(&[(id.clone(), json!({"ok": true}))])
            .await
            .unwrap();
        let execution = dispatcher.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }
}
