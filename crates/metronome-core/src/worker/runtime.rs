//! The worker: a long-lived process that pulls batches from the dispatcher,
//! bounds concurrency with a semaphore, reports outcomes through the
//! completer, heartbeats, and periodically recovers dead workers' claims.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::completer::Completer;
use crate::config::Settings;
use crate::dispatcher::Dispatcher;
use crate::engine::{EngineConfig, ProgramRegistry, StepOutcome, WorkflowEngine};
use crate::error::{ErrorKind, ExecutionError};
use crate::model::{generate_id, Execution, ExecutionKind};
use crate::registry::FunctionRegistry;
use crate::store::{ExecutionStore, QueueWakeup, StoreError};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker id (generated if not provided)
    pub worker_id: String,

    /// Queues this worker subscribes to
    pub queues: Vec<String>,

    /// Concurrency ceiling `C`
    pub max_concurrent: usize,

    /// Interval between heartbeats (keep at or under half the timeout)
    pub heartbeat_interval: Duration,

    /// Silence after which a worker counts as dead
    pub heartbeat_timeout: Duration,

    /// Polling fallback when no wake-ups arrive
    pub poll_interval: Duration,

    /// Bounded wait for in-flight executions on shutdown
    pub shutdown_grace: Duration,

    /// Completer flush cadence
    pub flush_interval: Duration,

    /// Completer flush threshold
    pub flush_threshold: usize,

    /// Default per-task timeout
    pub task_timeout: Duration,

    /// Default per-workflow lifetime timeout
    pub workflow_timeout: Duration,

    /// Default retry ceiling for child tasks
    pub default_retries: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), vec!["default".to_string()])
    }
}

impl WorkerConfig {
    /// Derive a worker configuration from engine settings
    pub fn from_settings(settings: &Settings, queues: Vec<String>) -> Self {
        Self {
            worker_id: generate_id("worker"),
            queues,
            max_concurrent: settings.worker_max_concurrent.max(1),
            heartbeat_interval: settings.heartbeat_interval(),
            heartbeat_timeout: settings.heartbeat_timeout(),
            poll_interval: settings.poll_interval(),
            shutdown_grace: Duration::from_secs(30),
            flush_interval: Duration::from_millis(1),
            flush_threshold: 64,
            task_timeout: settings.task_timeout(),
            workflow_timeout: settings.workflow_timeout(),
            default_retries: settings.default_retries,
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker already running
    #[error("worker is already running")]
    AlreadyRunning,

    /// No queues configured
    #[error("worker requires at least one queue")]
    NoQueues,
}

enum ExecOutcome {
    Completed(Value),
    Suspended,
    Failed(ExecutionError, bool),
}

struct WorkerInner {
    config: WorkerConfig,
    dispatcher: Arc<Dispatcher>,
    functions: Arc<FunctionRegistry>,
    engine: WorkflowEngine,
    completer: Completer,
    permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// A worker process
///
/// # Example
///
/// ```ignore
/// let worker = Worker::new(store, functions, programs, config);
/// worker.start().await?;
/// tokio::signal::ctrl_c().await?;
/// worker.shutdown().await?;
/// ```
pub struct Worker {
    inner: Arc<WorkerInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        functions: Arc<FunctionRegistry>,
        programs: Arc<ProgramRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::with_defaults(
            Arc::clone(&store),
            config.default_retries,
        ));
        let engine = WorkflowEngine::new(Arc::clone(&store), programs).with_config(EngineConfig {
            default_workflow_timeout: config.workflow_timeout,
            default_retries: config.default_retries,
            ..EngineConfig::default()
        });
        let completer = Completer::new(Arc::clone(&dispatcher), config.flush_threshold);
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            inner: Arc::new(WorkerInner {
                config,
                dispatcher,
                functions,
                engine,
                completer,
                permits,
                shutdown_tx,
                shutdown_rx,
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }

    /// Executions currently in flight
    pub fn current_load(&self) -> usize {
        self.inner.config.max_concurrent - self.inner.permits.available_permits()
    }

    /// Start the worker's sub-loops
    pub async fn start(&self) -> Result<(), WorkerError> {
        if self.inner.config.queues.is_empty() {
            return Err(WorkerError::NoQueues);
        }
        {
            let handles = self.handles.lock();
            if !handles.is_empty() {
                return Err(WorkerError::AlreadyRunning);
            }
        }

        info!(
            worker_id = %self.inner.config.worker_id,
            queues = ?self.inner.config.queues,
            max_concurrent = self.inner.config.max_concurrent,
            "starting worker"
        );

        // Register before claiming anything so recovery can see us.
        self.inner
            .dispatcher
            .heartbeat(&self.inner.config.worker_id, &self.inner.config.queues)
            .await?;

        let capacity = (self.inner.config.max_concurrent * 2).max(1);
        let (tx, rx) = mpsc::channel::<Execution>(capacity);

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(claim_loop(Arc::clone(&self.inner), tx)));
        handles.push(tokio::spawn(execute_loop(Arc::clone(&self.inner), rx)));
        handles.push(tokio::spawn(flush_loop(Arc::clone(&self.inner))));
        handles.push(tokio::spawn(heartbeat_loop(Arc::clone(&self.inner))));
        handles.push(tokio::spawn(recovery_loop(Arc::clone(&self.inner))));

        Ok(())
    }

    /// Graceful shutdown: stop claiming, wait for in-flight executions up
    /// to the grace period, drain the completer, mark the worker stopped.
    /// Work that outlives the grace period stays `running` until another
    /// worker's recoverer returns it to its queue.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        info!(worker_id = %self.inner.config.worker_id, "initiating graceful shutdown");
        let _ = self.inner.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_grace;
        loop {
            if self.inner.permits.available_permits() == self.inner.config.max_concurrent {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.current_load(),
                    "shutdown grace period elapsed with executions in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.inner.completer.flush().await;
        self.inner
            .dispatcher
            .stop_worker(&self.inner.config.worker_id)
            .await?;

        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }

        info!(worker_id = %self.inner.config.worker_id, "worker stopped");
        Ok(())
    }
}

/// Claimer: fill the local queue, prefetching up to twice the concurrency
/// ceiling; when the queue drains, wait for a wake-up (or the poll fallback).
async fn claim_loop(inner: Arc<WorkerInner>, tx: mpsc::Sender<Execution>) {
    let mut wakeup = match inner.dispatcher.subscribe(&inner.config.queues).await {
        Ok(wakeup) => Some(wakeup),
        Err(e) => {
            warn!("queue notifications unavailable, falling back to polling: {e}");
            None
        }
    };
    let mut shutdown_rx = inner.shutdown_rx.clone();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let space = tx.capacity();
        if space == 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = shutdown_rx.changed() => break,
            }
            continue;
        }

        match inner
            .dispatcher
            .claim_batch(&inner.config.queues, &inner.config.worker_id, space)
            .await
        {
            Ok(batch) => {
                let drained = batch.len() < space;
                for execution in batch {
                    if tx.send(execution).await.is_err() {
                        return;
                    }
                }
                if drained
                    && wait_for_work(&mut wakeup, &mut shutdown_rx, inner.config.poll_interval)
                        .await
                {
                    break;
                }
            }
            Err(e) => {
                error!("claim failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(inner.config.poll_interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    }

    debug!("claim loop exited");
}

/// Wait for a queue wake-up, the poll fallback, or shutdown.
/// Returns true when shutdown was requested.
async fn wait_for_work(
    wakeup: &mut Option<Box<dyn QueueWakeup>>,
    shutdown_rx: &mut watch::Receiver<bool>,
    poll_interval: Duration,
) -> bool {
    let mut wakeup_broken = false;
    let shutdown = match wakeup {
        Some(listener) => {
            tokio::select! {
                result = listener.wait() => {
                    if let Err(e) = result {
                        warn!("queue wake-up stream failed, polling only: {e}");
                        wakeup_broken = true;
                    }
                    false
                }
                _ = tokio::time::sleep(poll_interval) => false,
                _ = shutdown_rx.changed() => true,
            }
        }
        None => {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => false,
                _ = shutdown_rx.changed() => true,
            }
        }
    };

    if wakeup_broken {
        *wakeup = None;
    }
    shutdown
}

/// Executor: pull from the local queue, bound concurrency with permits,
/// run each execution on its own task.
async fn execute_loop(inner: Arc<WorkerInner>, mut rx: mpsc::Receiver<Execution>) {
    let mut shutdown_rx = inner.shutdown_rx.clone();

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(execution) = maybe else { break };
                let permit = match Arc::clone(&inner.permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    inner.execute(execution).await;
                    drop(permit);
                });
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("execute loop exited");
}

/// Completer ticker: flush on a short cadence, and once more on shutdown.
async fn flush_loop(inner: Arc<WorkerInner>) {
    let mut shutdown_rx = inner.shutdown_rx.clone();
    let mut ticker = tokio::time::interval(inner.config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.completer.flush().await;
            }
            _ = shutdown_rx.changed() => {
                inner.completer.flush().await;
                break;
            }
        }
    }

    debug!("flush loop exited");
}

async fn heartbeat_loop(inner: Arc<WorkerInner>) {
    let mut shutdown_rx = inner.shutdown_rx.clone();
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = inner
                    .dispatcher
                    .heartbeat(&inner.config.worker_id, &inner.config.queues)
                    .await
                {
                    error!("heartbeat failed: {e}");
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("heartbeat loop exited");
}

/// Recoverer: every worker runs it; `recover_dead` is idempotent so the
/// overlap across a deployment is harmless.
async fn recovery_loop(inner: Arc<WorkerInner>) {
    let mut shutdown_rx = inner.shutdown_rx.clone();
    let mut ticker = tokio::time::interval(inner.config.heartbeat_timeout);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match inner.dispatcher.recover_dead(inner.config.heartbeat_timeout).await {
                    Ok(recovered) if !recovered.executions_recovered.is_empty() => {
                        info!(
                            count = recovered.executions_recovered.len(),
                            "recovered executions from dead workers"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("recovery failed: {e}"),
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("recovery loop exited");
}

impl WorkerInner {
    /// The execute protocol: resolve, apply the timeout, dispatch by kind,
    /// route the outcome.
    async fn execute(&self, execution: Execution) {
        debug!(
            id = %execution.id,
            kind = %execution.kind,
            function = %execution.function_name,
            attempt = execution.attempt,
            "executing"
        );

        let default = match execution.kind {
            ExecutionKind::Task => self.config.task_timeout,
            ExecutionKind::Workflow => self.config.workflow_timeout,
        };
        let timeout = execution
            .timeout_seconds
            .and_then(|s| u64::try_from(s).ok())
            .map(Duration::from_secs)
            .unwrap_or(default);

        let outcome = match tokio::time::timeout(timeout, self.run(&execution)).await {
            Ok(outcome) => outcome,
            Err(_) => ExecOutcome::Failed(
                ExecutionError::timeout(format!(
                    "execution timed out after {}s",
                    timeout.as_secs()
                )),
                true,
            ),
        };

        match outcome {
            ExecOutcome::Completed(output) => {
                self.completer.push(execution.id.clone(), output).await;
            }
            ExecOutcome::Suspended => {
                // The engine already parked the workflow; nothing to report.
            }
            ExecOutcome::Failed(error, retry) => {
                warn!(id = %execution.id, kind = %error.kind, retry, "execution failed: {}", error.message);
                if let Err(e) = self.dispatcher.fail(&execution.id, &error, retry).await {
                    error!(id = %execution.id, "failed to report failure: {e}");
                }
            }
        }
    }

    async fn run(&self, execution: &Execution) -> ExecOutcome {
        match execution.kind {
            ExecutionKind::Task => {
                let Some(handler) = self.functions.get(&execution.function_name) else {
                    return ExecOutcome::Failed(
                        ExecutionError::new(
                            ErrorKind::UnknownFunction,
                            format!(
                                "no function registered under {:?}",
                                execution.function_name
                            ),
                        ),
                        false,
                    );
                };

                match handler(execution.inputs.clone()).await {
                    Ok(output) => ExecOutcome::Completed(output),
                    Err(task_err) => {
                        let retry = !task_err.kind.is_permanent();
                        ExecOutcome::Failed(task_err.into(), retry)
                    }
                }
            }

            // Workflows hot-loop on Continue within the timeout budget.
            ExecutionKind::Workflow => loop {
                match self.engine.step(execution).await {
                    Ok(StepOutcome::Continue) => continue,
                    Ok(StepOutcome::Suspended) => return ExecOutcome::Suspended,
                    Ok(StepOutcome::Completed(output)) => {
                        return ExecOutcome::Completed(output)
                    }
                    Err(e) => {
                        let (error, retry) = e.classify();
                        return ExecOutcome::Failed(error, retry);
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("worker_"));
        assert_eq!(config.queues, vec!["default".to_string()]);
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert!(config.heartbeat_interval <= config.heartbeat_timeout / 2);
    }

    #[test]
    fn test_config_builders() {
        let config = WorkerConfig::from_settings(
            &Settings::default(),
            vec!["emails".to_string(), "orders".to_string()],
        )
        .with_worker_id("worker_test")
        .with_max_concurrent(4)
        .with_poll_interval(Duration::from_millis(20));

        assert_eq!(config.worker_id, "worker_test");
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.queues.len(), 2);
    }

    #[test]
    fn test_concurrency_floor() {
        let config = WorkerConfig::default().with_max_concurrent(0);
        assert_eq!(config.max_concurrent, 1);
    }
}
