//! Core data model: executions, workflow contexts, signals, heartbeats

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ExecutionError;

/// Generate a prefixed, time-ordered identifier (`task_…`, `wf_…`, `worker_…`).
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7())
}

/// Kind of a unit of execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// One-shot function
    Task,

    /// Multi-step orchestration driven by the workflow engine
    Workflow,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Workflow => "workflow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" => Some(Self::Task),
            "workflow" => Some(Self::Workflow),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting in its queue to be claimed
    Pending,

    /// Claimed by a worker
    Running,

    /// Workflow parked on a child result or signal
    Suspended,

    /// Finished successfully; `output` is set
    Completed,

    /// Finished unsuccessfully; `error` is set
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "suspended" => Some(Self::Suspended),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A task or workflow execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub kind: ExecutionKind,
    pub function_name: String,
    pub queue: String,
    pub status: ExecutionStatus,
    pub priority: i32,
    pub inputs: Value,
    pub output: Option<Value>,
    pub error: Option<ExecutionError>,
    pub attempt: i32,
    pub max_retries: i32,
    pub timeout_seconds: Option<i64>,
    pub parent_workflow_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub claimed_by: Option<String>,
    pub visible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Specification of an execution to insert
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub id: String,
    pub kind: ExecutionKind,
    pub function_name: String,
    pub queue: String,
    pub priority: i32,
    pub inputs: Value,
    pub max_retries: i32,
    pub timeout_seconds: Option<i64>,
    pub parent_workflow_id: Option<String>,
    pub idempotency_key: Option<String>,
}

impl NewExecution {
    /// A top-level task
    pub fn task(function_name: impl Into<String>, queue: impl Into<String>, inputs: Value) -> Self {
        Self {
            id: generate_id("task"),
            kind: ExecutionKind::Task,
            function_name: function_name.into(),
            queue: queue.into(),
            priority: 0,
            inputs,
            max_retries: 3,
            timeout_seconds: None,
            parent_workflow_id: None,
            idempotency_key: None,
        }
    }

    /// A top-level workflow
    pub fn workflow(
        function_name: impl Into<String>,
        queue: impl Into<String>,
        inputs: Value,
    ) -> Self {
        Self {
            id: generate_id("wf"),
            kind: ExecutionKind::Workflow,
            function_name: function_name.into(),
            queue: queue.into(),
            priority: 0,
            inputs,
            max_retries: 3,
            timeout_seconds: None,
            parent_workflow_id: None,
            idempotency_key: None,
        }
    }

    /// A child task of a workflow
    ///
    /// Inherits the parent's queue unless overridden later, stamps the parent
    /// link, and carries the idempotency key that makes child creation safe
    /// against replays.
    pub fn child_task(
        parent: &Execution,
        function_name: impl Into<String>,
        inputs: Value,
        idempotency_key: String,
    ) -> Self {
        Self {
            id: generate_id("task"),
            kind: ExecutionKind::Task,
            function_name: function_name.into(),
            queue: parent.queue.clone(),
            priority: parent.priority,
            inputs,
            max_retries: 3,
            timeout_seconds: None,
            parent_workflow_id: Some(parent.id.clone()),
            idempotency_key: Some(idempotency_key),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout: i64) -> Self {
        self.timeout_seconds = Some(timeout);
        self
    }
}

/// A recorded side effect in a workflow's history
///
/// History events are immutable once written; replay matches them strictly
/// against the statement that produced them (kind, name, statement index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// A child task reached a terminal state; `value` is the task output on
    /// success, or an `{"error": …}` envelope on permanent failure.
    TaskResult {
        name: String,
        child_id: String,
        value: Value,
        statement_index: usize,
    },

    /// A signal was consumed by a `wait_signal`
    Signal {
        name: String,
        payload: Value,
        statement_index: usize,
    },

    /// A version probe was resolved
    Version {
        change_id: String,
        value: i64,
        statement_index: usize,
    },
}

impl HistoryEvent {
    /// The statement index this event resolved
    pub fn statement_index(&self) -> usize {
        match self {
            Self::TaskResult {
                statement_index, ..
            }
            | Self::Signal {
                statement_index, ..
            }
            | Self::Version {
                statement_index, ..
            } => *statement_index,
        }
    }
}

/// Durable continuation state of a workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// 1:1 with a workflow execution
    pub execution_id: String,

    /// Cursor into the flattened instruction stream
    pub statement_index: usize,

    /// Workflow-local variables
    pub locals: serde_json::Map<String, Value>,

    /// Append-only record of resolved side effects
    pub history: Vec<HistoryEvent>,

    /// How many history events replay has consumed
    pub history_cursor: usize,

    /// Set while suspended on a child task
    pub awaiting_child_id: Option<String>,

    /// Set while suspended on a named signal
    pub awaiting_signal: Option<String>,
}

impl WorkflowContext {
    /// Fresh context for a workflow that has not executed yet
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            statement_index: 0,
            locals: serde_json::Map::new(),
            history: Vec::new(),
            history_cursor: 0,
            awaiting_child_id: None,
            awaiting_signal: None,
        }
    }

    /// The next unconsumed history event, if replaying
    pub fn replay_event(&self) -> Option<&HistoryEvent> {
        self.history.get(self.history_cursor)
    }
}

/// A named message addressed to a workflow, consumed at most once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub workflow_id: String,
    pub name: String,
    pub payload: Value,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
}

/// Worker liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Worker liveness record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub queues: Vec<String>,
    pub status: WorkerStatus,
}
