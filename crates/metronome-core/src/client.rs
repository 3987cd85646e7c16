//! Programmatic surface consumed by bindings and applications

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, instrument};

use crate::config::Settings;
use crate::dispatcher::Dispatcher;
use crate::engine::{ProgramRegistry, WorkflowProgram};
use crate::error::TaskError;
use crate::model::Execution;
use crate::registry::FunctionRegistry;
use crate::store::{ExecutionStore, PostgresExecutionStore, StoreError};
use crate::worker::{Worker, WorkerConfig};

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Could not open the database pool
    #[error("database connection failed: {0}")]
    Connect(String),

    /// Invalid workflow program source
    #[error("invalid workflow program: {0}")]
    Program(#[from] serde_json::Error),

    /// `wait_for_execution` exceeded its timeout
    #[error("timed out waiting for execution {0}")]
    WaitTimeout(String),
}

/// Entry point for embedding the engine
///
/// Owns the store handle, the function registry, and the workflow program
/// registry; hands out workers wired to all three.
///
/// # Example
///
/// ```ignore
/// let client = Client::connect(Settings::from_env(), true).await?;
/// client.register_function("send_email", |inputs| async move { /* … */ Ok(inputs) });
/// client.register_program_source(&std::fs::read_to_string("order_flow.json")?)?;
///
/// let id = client.start_workflow("order_flow", json!({"order_id": "o-1"})).await?;
/// let done = client.wait_for_execution(&id, Duration::from_secs(60)).await?;
/// ```
pub struct Client {
    store: Arc<dyn ExecutionStore>,
    dispatcher: Arc<Dispatcher>,
    functions: Arc<FunctionRegistry>,
    programs: Arc<ProgramRegistry>,
    settings: Settings,
}

impl Client {
    /// Open a PostgreSQL-backed client, optionally applying migrations.
    pub async fn connect(settings: Settings, auto_migrate: bool) -> Result<Self, ClientError> {
        let pool = PgPool::connect(&settings.database_url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let store =
            PostgresExecutionStore::new(pool).with_retry_policy(settings.retry_policy());
        if auto_migrate {
            store.migrate().await?;
            info!("migrations applied");
        }

        Ok(Self::with_store(Arc::new(store), settings))
    }

    /// Build a client over any store (the in-memory store in tests).
    pub fn with_store(store: Arc<dyn ExecutionStore>, settings: Settings) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store), &settings));
        Self {
            store,
            dispatcher,
            functions: Arc::new(FunctionRegistry::new()),
            programs: Arc::new(ProgramRegistry::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    pub fn programs(&self) -> &Arc<ProgramRegistry> {
        &self.programs
    }

    /// Register a task function (before starting workers).
    pub fn register_function<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.functions.register(name, handler);
    }

    /// Register a workflow program.
    pub fn register_program(&self, program: WorkflowProgram) {
        self.programs.register(program);
    }

    /// Register a workflow program from its JSON form, returning its name.
    pub fn register_program_source(&self, source: &str) -> Result<String, ClientError> {
        Ok(self.programs.register_json(source)?)
    }

    /// Enqueue a workflow execution.
    #[instrument(skip(self, inputs))]
    pub async fn start_workflow(&self, name: &str, inputs: Value) -> Result<String, ClientError> {
        Ok(self.dispatcher.enqueue_workflow(name, inputs, None).await?)
    }

    /// Enqueue a one-shot task.
    #[instrument(skip(self, inputs))]
    pub async fn queue_task(
        &self,
        name: &str,
        inputs: Value,
        queue: Option<&str>,
    ) -> Result<String, ClientError> {
        Ok(self.dispatcher.enqueue_task(name, inputs, queue).await?)
    }

    /// Fetch an execution.
    pub async fn get_execution(&self, id: &str) -> Result<Option<Execution>, ClientError> {
        Ok(self.store.get_execution(id).await?)
    }

    /// Poll until the execution reaches a terminal state or the timeout
    /// elapses.
    pub async fn wait_for_execution(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<Execution, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let execution = self
                .store
                .get_execution(id)
                .await?
                .ok_or_else(|| ClientError::Store(StoreError::NotFound(id.to_string())))?;

            if execution.is_terminal() {
                return Ok(execution);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::WaitTimeout(id.to_string()));
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Send a signal to a workflow.
    #[instrument(skip(self, payload))]
    pub async fn send_signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<String, ClientError> {
        Ok(self.store.append_signal(workflow_id, name, payload).await?)
    }

    /// Build a worker for the given queues, sharing this client's
    /// registries and store.
    pub fn worker(&self, queues: Vec<String>) -> Worker {
        self.worker_with_config(WorkerConfig::from_settings(&self.settings, queues))
    }

    /// Build a worker with an explicit configuration.
    pub fn worker_with_config(&self, config: WorkerConfig) -> Worker {
        Worker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.functions),
            Arc::clone(&self.programs),
            config,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutionStatus;
    use crate::store::InMemoryExecutionStore;
    use serde_json::json;

    fn client() -> Client {
        Client::with_store(
            Arc::new(InMemoryExecutionStore::new()),
            Settings::default(),
        )
    }

    #[tokio::test]
    async fn test_queue_task_and_introspect() {
        let client = client();
        let id = client
            .queue_task("send_email", json!({"to": "a"}), None)
            .await
            .unwrap();

        let execution = client.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.function_name, "send_email");
    }

    #[tokio::test]
    async fn test_wait_for_execution_times_out() {
        let client = client();
        let id = client.queue_task("t", json!({}), None).await.unwrap();

        let err = client
            .wait_for_execution(&id, Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::WaitTimeout(_)));
    }

    #[tokio::test]
    async fn test_wait_for_unknown_execution() {
        let client = client();
        let err = client
            .wait_for_execution("task_missing", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_register_program_source() {
        let client = client();
        let name = client
            .register_program_source(r#"{"name": "noop", "statements": []}"#)
            .unwrap();
        assert_eq!(name, "noop");
        assert!(client.programs().contains("noop"));

        assert!(client.register_program_source("{").is_err());
    }
}
