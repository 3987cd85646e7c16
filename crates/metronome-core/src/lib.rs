//! # Metronome
//!
//! A PostgreSQL-backed durable execution engine for tasks and workflows,
//! with at-least-once delivery, crash-safe progress, and deterministic
//! replay after restart.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Worker                               │
//! │  (claims batches, bounds concurrency, reports outcomes,      │
//! │   heartbeats, recovers dead workers' claims)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │       Dispatcher          │   │       WorkflowEngine         │
//! │  (claim / complete / fail │   │  (instruction-stream replay: │
//! │   over the store)         │   │   Continue/Suspended/Done)   │
//! └──────────────────────────┘   └──────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionStore                          │
//! │  (PostgreSQL: executions, workflow_contexts, signals,        │
//! │   worker_heartbeats; all transitions ACID)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Persistence *is* the queue: a pending execution is a row, claiming is a
//! SKIP LOCKED update, and a suspended workflow is a row plus its durable
//! continuation (cursor, locals, history). Workers are stateless and
//! interchangeable; any worker can resume any workflow from its checkpoint.
//!
//! ## Example
//!
//! ```ignore
//! use metronome_core::prelude::*;
//! use serde_json::json;
//!
//! let client = Client::connect(Settings::from_env(), true).await?;
//!
//! client.register_function("increment", |inputs| async move {
//!     let value = inputs["value"].as_i64().unwrap_or(0);
//!     Ok(json!({"result": value + 1}))
//! });
//!
//! let worker = client.worker(vec!["default".into()]);
//! worker.start().await?;
//!
//! let id = client.queue_task("increment", json!({"value": 41}), None).await?;
//! let done = client.wait_for_execution(&id, std::time::Duration::from_secs(10)).await?;
//! assert_eq!(done.output, Some(json!({"result": 42})));
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod model;
pub mod registry;
pub mod retry;
pub mod store;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::client::{Client, ClientError};
    pub use crate::config::Settings;
    pub use crate::dispatcher::Dispatcher;
    pub use crate::engine::{
        EngineConfig, EngineError, ProgramRegistry, Statement, StepOutcome, WorkflowEngine,
        WorkflowProgram,
    };
    pub use crate::error::{ErrorKind, ExecutionError, TaskError};
    pub use crate::model::{
        Execution, ExecutionKind, ExecutionStatus, HistoryEvent, NewExecution, WorkflowContext,
    };
    pub use crate::registry::FunctionRegistry;
    pub use crate::retry::RetryPolicy;
    pub use crate::store::{
        ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore, StoreError,
    };
    pub use crate::worker::{Worker, WorkerConfig, WorkerError};
}

// Re-export key types at crate root
pub use client::{Client, ClientError};
pub use config::Settings;
pub use dispatcher::Dispatcher;
pub use engine::{ProgramRegistry, StepOutcome, WorkflowEngine, WorkflowProgram};
pub use error::{ErrorKind, ExecutionError, TaskError};
pub use model::{Execution, ExecutionKind, ExecutionStatus, HistoryEvent, WorkflowContext};
pub use registry::FunctionRegistry;
pub use retry::RetryPolicy;
pub use store::{ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore, StoreError};
pub use worker::{Worker, WorkerConfig, WorkerError};
