//! ExecutionStore trait definition
//!
//! The store is the only shared state in the system. Every transition is
//! transactional; higher layers never touch the tables directly.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ExecutionError;
use crate::model::{Execution, ExecutionStatus, NewExecution, WorkflowContext};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found
    #[error("execution not found: {0}")]
    NotFound(String),

    /// Duplicate execution id on insert
    #[error("duplicate execution id: {0}")]
    Conflict(String),

    /// A transition was requested from an incompatible state.
    /// Indicates store misuse; the calling operation halts.
    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Outcome of `fail`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-dispatched after a backoff delay
    WillRetry { next_attempt: i32, delay: Duration },

    /// Retries exhausted (or failure was permanent); the row is terminal
    Failed,
}

/// Result of `recover_dead`
#[derive(Debug, Clone, Default)]
pub struct RecoveredWork {
    /// Workers marked stopped
    pub workers_stopped: Vec<String>,

    /// Executions returned to pending
    pub executions_recovered: Vec<String>,
}

/// Queue-scoped wake-up stream
///
/// Implementations resolve `wait` whenever one of the subscribed queues
/// receives a transition into `pending`. Spurious wake-ups are allowed;
/// callers pair this with a polling fallback.
#[async_trait]
pub trait QueueWakeup: Send {
    async fn wait(&mut self) -> Result<(), StoreError>;
}

/// Store for executions, workflow contexts, signals, and worker heartbeats
///
/// Implementations must be thread-safe and preserve the transition
/// invariants: `completed` implies output set, `failed` implies error set,
/// `running` implies a claimer, everything else implies no claimer.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    // =========================================================================
    // Execution lifecycle
    // =========================================================================

    /// Insert a new execution in `pending`; `Conflict` on duplicate id.
    async fn insert_execution(&self, new: NewExecution) -> Result<String, StoreError>;

    /// Fetch an execution by id.
    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError>;

    /// Atomically claim up to `limit` pending executions from the given
    /// queues, ordered by `(priority DESC, created_at ASC)`. Rows locked by
    /// concurrent claimers are skipped, never waited on. Returns an empty
    /// batch rather than blocking.
    async fn claim_batch(
        &self,
        queues: &[String],
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Transition each `(id, output)` from `running` to `completed`.
    ///
    /// Idempotent against rows that are already `completed`; a `failed` or
    /// `suspended` row raises `IllegalTransition`. For children of a
    /// workflow, the same transaction appends the `task_result` history
    /// event to the parent context, clears its await, and resumes it.
    async fn complete_batch(&self, outcomes: &[(String, Value)]) -> Result<(), StoreError>;

    /// Record a failure. With `retry` and attempts remaining the row goes
    /// back to `pending` after the backoff delay; otherwise it is terminal
    /// (and, for workflow children, the parent observes the failure).
    async fn fail(
        &self,
        id: &str,
        error: &ExecutionError,
        retry: bool,
    ) -> Result<FailOutcome, StoreError>;

    // =========================================================================
    // Workflow continuation state
    // =========================================================================

    /// Load the context for a workflow, default-initialized if none exists.
    async fn load_context(&self, execution_id: &str) -> Result<WorkflowContext, StoreError>;

    /// Persist a checkpoint without changing execution status.
    async fn save_context(&self, context: &WorkflowContext) -> Result<(), StoreError>;

    /// `running -> suspended` with the context persisted atomically.
    async fn suspend_workflow(
        &self,
        id: &str,
        context: &WorkflowContext,
    ) -> Result<(), StoreError>;

    /// `suspended -> pending` (after a child completed or a signal arrived).
    async fn resume_workflow(&self, id: &str) -> Result<(), StoreError>;

    /// Create a child task and suspend its parent in one transaction.
    ///
    /// The insert is idempotent over `(parent_workflow_id, idempotency_key)`;
    /// if a prior attempt already created the child, that row survives and
    /// its id is returned. The context is persisted with `awaiting_child_id`
    /// pointing at the surviving child.
    async fn create_child_and_suspend(
        &self,
        parent_id: &str,
        child: NewExecution,
        context: &WorkflowContext,
    ) -> Result<String, StoreError>;

    // =========================================================================
    // Signals
    // =========================================================================

    /// Insert a signal. If the workflow is currently suspended on a matching
    /// `wait_signal`, the same transaction consumes the signal, appends its
    /// history event, and resumes the workflow.
    async fn append_signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<String, StoreError>;

    /// Consume the oldest pending signal with the given name. The same
    /// transaction persists `context` with the signal's history event
    /// appended, so the consumption is never observable without its record.
    /// Returns the payload, or `None` when no matching signal is pending.
    /// Used by the engine to drain signals delivered before the workflow
    /// reached its `wait_signal`.
    async fn take_signal(
        &self,
        workflow_id: &str,
        name: &str,
        context: &WorkflowContext,
    ) -> Result<Option<Value>, StoreError>;

    // =========================================================================
    // Worker liveness
    // =========================================================================

    /// Upsert the worker's heartbeat and queue subscription.
    async fn upsert_heartbeat(
        &self,
        worker_id: &str,
        queues: &[String],
    ) -> Result<(), StoreError>;

    /// Mark a worker stopped.
    async fn stop_worker(&self, worker_id: &str) -> Result<(), StoreError>;

    /// Mark workers with heartbeats older than `timeout` as stopped and
    /// return their `running` executions to `pending`. Idempotent; every
    /// worker runs this periodically.
    async fn recover_dead(&self, timeout: Duration) -> Result<RecoveredWork, StoreError>;

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Subscribe to wake-ups for the given queues. Implementations that
    /// cannot provide notifications may return an error; callers fall back
    /// to polling.
    async fn subscribe(&self, queues: &[String]) -> Result<Box<dyn QueueWakeup>, StoreError>;
}

/// Value bound into a parent workflow when a child task fails permanently.
///
/// Success binds the raw task output; failure binds this envelope so the
/// workflow can branch on the presence of `error` instead of unwinding.
pub(crate) fn failure_envelope(error: &ExecutionError) -> Value {
    serde_json::json!({ "error": error })
}
