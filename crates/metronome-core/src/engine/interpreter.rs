//! The workflow interpreter
//!
//! Each call to [`WorkflowEngine::step`] advances a claimed workflow
//! execution through its instruction stream until it suspends on a side
//! effect, completes, or exhausts the per-step instruction budget. Progress
//! is checkpointed through the store, so a crash at any point resumes from
//! the durable cursor.
//!
//! Replay discipline: while the context's history cursor trails its history,
//! every side-effecting instruction must match the recorded event on kind,
//! name, and statement index. A mismatch means the program diverged from
//! what previously executed and fails the workflow permanently.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::eval::eval_expr;
use super::program::{Instr, ProgramRegistry};
use crate::error::{ErrorKind, ExecutionError};
use crate::model::{Execution, ExecutionKind, HistoryEvent, NewExecution, WorkflowContext};
use crate::store::{ExecutionStore, StoreError};

/// Configuration for the workflow engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deterministic instructions executed per step before checkpointing
    pub max_instructions_per_step: usize,

    /// Lifetime bound for workflows without a per-execution override
    pub default_workflow_timeout: Duration,

    /// Retry ceiling for child tasks without an explicit option
    pub default_retries: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_instructions_per_step: 256,
            default_workflow_timeout: Duration::from_secs(3600),
            default_retries: 3,
        }
    }
}

/// Errors from engine steps
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No program registered under the workflow's function name
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// Replay diverged from recorded history, or pure evaluation failed
    #[error("non-determinism detected: {0}")]
    NonDeterminism(String),

    /// The workflow exceeded its lifetime timeout
    #[error("workflow timed out after {elapsed_seconds}s (limit {timeout_seconds}s)")]
    WorkflowTimeout {
        elapsed_seconds: i64,
        timeout_seconds: i64,
    },

    /// The execution handed to the engine is not a workflow
    #[error("execution {0} is not a workflow")]
    NotWorkflow(String),
}

impl EngineError {
    /// Map to the structured error record and whether retry applies.
    ///
    /// A timed-out workflow is permanently failed: resumed attempts of an
    /// expired workflow must terminate immediately rather than re-run.
    pub fn classify(&self) -> (ExecutionError, bool) {
        match self {
            Self::Store(e) => (ExecutionError::transient(e.to_string()), true),
            Self::UnknownWorkflow(name) => (
                ExecutionError::new(ErrorKind::UnknownFunction, format!("unknown workflow: {name}")),
                false,
            ),
            Self::NonDeterminism(msg) => (
                ExecutionError::new(ErrorKind::NonDeterminism, msg.clone()),
                false,
            ),
            Self::WorkflowTimeout { .. } => {
                (ExecutionError::timeout(self.to_string()), false)
            }
            Self::NotWorkflow(id) => (
                ExecutionError::new(
                    ErrorKind::InputValidation,
                    format!("execution {id} dispatched to the workflow engine is not a workflow"),
                ),
                false,
            ),
        }
    }
}

/// Result of one engine step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Deterministic progress was made and checkpointed; invoke again.
    Continue,

    /// The workflow is parked on a child task or signal; the store has
    /// already transitioned it to `suspended`.
    Suspended,

    /// A `return` fired (or the program ran out); the caller finalizes.
    Completed(Value),
}

/// The workflow engine
///
/// Stateless between steps: everything durable lives in the store, so any
/// worker can pick up any workflow at any point.
pub struct WorkflowEngine {
    store: Arc<dyn ExecutionStore>,
    programs: Arc<ProgramRegistry>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn ExecutionStore>, programs: Arc<ProgramRegistry>) -> Self {
        Self {
            store,
            programs,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn programs(&self) -> &ProgramRegistry {
        &self.programs
    }

    /// Advance a claimed workflow execution by one step.
    #[instrument(skip(self, execution), fields(id = %execution.id, workflow = %execution.function_name))]
    pub async fn step(&self, execution: &Execution) -> Result<StepOutcome, EngineError> {
        if execution.kind != ExecutionKind::Workflow {
            return Err(EngineError::NotWorkflow(execution.id.clone()));
        }

        let timeout_seconds = execution
            .timeout_seconds
            .unwrap_or(self.config.default_workflow_timeout.as_secs() as i64);
        let elapsed_seconds = (Utc::now() - execution.created_at).num_seconds();
        if elapsed_seconds > timeout_seconds {
            warn!(elapsed_seconds, timeout_seconds, "workflow lifetime exceeded");
            return Err(EngineError::WorkflowTimeout {
                elapsed_seconds,
                timeout_seconds,
            });
        }

        let program = self
            .programs
            .get(&execution.function_name)
            .ok_or_else(|| EngineError::UnknownWorkflow(execution.function_name.clone()))?;

        let mut ctx = self.store.load_context(&execution.id).await?;
        let mut executed = 0usize;

        loop {
            let Some(instr) = program.instrs.get(ctx.statement_index) else {
                // Program ran off the end without an explicit return.
                return Ok(StepOutcome::Completed(Value::Null));
            };

            if executed >= self.config.max_instructions_per_step {
                self.store.save_context(&ctx).await?;
                debug!(statement_index = ctx.statement_index, "step budget reached");
                return Ok(StepOutcome::Continue);
            }
            executed += 1;

            match instr {
                Instr::Assign { var, expr } => {
                    let value = self.eval(expr, execution, &ctx)?;
                    ctx.locals.insert(var.clone(), value);
                    ctx.statement_index += 1;
                }

                Instr::Jump { target } => {
                    ctx.statement_index = *target;
                }

                Instr::JumpIfNot { cond, target } => {
                    let value = self.eval(cond, execution, &ctx)?;
                    let truthy = value.as_bool().ok_or_else(|| {
                        EngineError::NonDeterminism(format!(
                            "condition at statement {} is not a boolean",
                            ctx.statement_index
                        ))
                    })?;
                    ctx.statement_index = if truthy {
                        ctx.statement_index + 1
                    } else {
                        *target
                    };
                }

                Instr::Return { expr } => {
                    let value = self.eval(expr, execution, &ctx)?;
                    debug!("workflow returned");
                    return Ok(StepOutcome::Completed(value));
                }

                Instr::Version {
                    result_var,
                    change_id,
                    min: _,
                    max,
                } => {
                    let replayed = match ctx.replay_event() {
                        Some(HistoryEvent::Version {
                            change_id: recorded,
                            value,
                            statement_index,
                        }) if recorded == change_id
                            && *statement_index == ctx.statement_index =>
                        {
                            Some(*value)
                        }
                        Some(other) => {
                            return Err(self.mismatch("version", change_id, &ctx, other))
                        }
                        None => None,
                    };

                    let value = match replayed {
                        Some(value) => value,
                        None => {
                            // First execution records the current version;
                            // replays return whatever was recorded.
                            ctx.history.push(HistoryEvent::Version {
                                change_id: change_id.clone(),
                                value: *max,
                                statement_index: ctx.statement_index,
                            });
                            *max
                        }
                    };

                    ctx.locals.insert(result_var.clone(), Value::from(value));
                    ctx.history_cursor += 1;
                    ctx.statement_index += 1;
                }

                Instr::CallTask {
                    result_var,
                    task,
                    args,
                    options,
                } => {
                    let replayed = match ctx.replay_event() {
                        Some(HistoryEvent::TaskResult {
                            name,
                            value,
                            statement_index,
                            ..
                        }) if name == task && *statement_index == ctx.statement_index => {
                            Some(value.clone())
                        }
                        Some(other) => return Err(self.mismatch("call_task", task, &ctx, other)),
                        None => None,
                    };

                    match replayed {
                        Some(value) => {
                            ctx.locals.insert(result_var.clone(), value);
                            ctx.history_cursor += 1;
                            ctx.statement_index += 1;
                        }
                        None => {
                            let args_value = self.eval(args, execution, &ctx)?;

                            // Key is stable across replays: same statement,
                            // same side-effect ordinal.
                            let idempotency_key =
                                format!("{}:{}", ctx.statement_index, ctx.history.len());

                            let mut child = NewExecution::child_task(
                                execution,
                                task.clone(),
                                args_value,
                                idempotency_key,
                            )
                            .with_max_retries(
                                options.max_retries.unwrap_or(self.config.default_retries),
                            );
                            if let Some(queue) = &options.queue {
                                child = child.with_queue(queue.clone());
                            }
                            if let Some(priority) = options.priority {
                                child = child.with_priority(priority);
                            }
                            if let Some(timeout) = options.timeout_seconds {
                                child = child.with_timeout_seconds(timeout);
                            }

                            let child_id = self
                                .store
                                .create_child_and_suspend(&execution.id, child, &ctx)
                                .await?;

                            debug!(%child_id, task, "suspended on child task");
                            return Ok(StepOutcome::Suspended);
                        }
                    }
                }

                Instr::WaitSignal {
                    result_var,
                    signal,
                    timeout_seconds: _,
                } => {
                    let replayed = match ctx.replay_event() {
                        Some(HistoryEvent::Signal {
                            name,
                            payload,
                            statement_index,
                        }) if name == signal && *statement_index == ctx.statement_index => {
                            Some(payload.clone())
                        }
                        Some(other) => {
                            return Err(self.mismatch("wait_signal", signal, &ctx, other))
                        }
                        None => None,
                    };

                    match replayed {
                        Some(payload) => {
                            ctx.locals.insert(result_var.clone(), payload);
                            ctx.history_cursor += 1;
                            ctx.statement_index += 1;
                        }
                        None => {
                            // Signals delivered before the wait are drained
                            // here instead of being lost.
                            match self.store.take_signal(&execution.id, signal, &ctx).await? {
                                Some(payload) => {
                                    ctx.history.push(HistoryEvent::Signal {
                                        name: signal.clone(),
                                        payload: payload.clone(),
                                        statement_index: ctx.statement_index,
                                    });
                                    ctx.history_cursor += 1;
                                    ctx.locals.insert(result_var.clone(), payload);
                                    ctx.statement_index += 1;
                                }
                                None => {
                                    ctx.awaiting_signal = Some(signal.clone());
                                    self.store
                                        .suspend_workflow(&execution.id, &ctx)
                                        .await?;
                                    debug!(signal, "suspended awaiting signal");
                                    return Ok(StepOutcome::Suspended);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn eval(
        &self,
        expr: &super::program::Expr,
        execution: &Execution,
        ctx: &WorkflowContext,
    ) -> Result<Value, EngineError> {
        eval_expr(expr, &execution.inputs, &ctx.locals)
            .map_err(|e| EngineError::NonDeterminism(e.to_string()))
    }

    fn mismatch(
        &self,
        statement_kind: &str,
        name: &str,
        ctx: &WorkflowContext,
        recorded: &HistoryEvent,
    ) -> EngineError {
        EngineError::NonDeterminism(format!(
            "statement {} ({statement_kind} {name:?}) does not match recorded event {recorded:?}",
            ctx.statement_index
        ))
    }
}
