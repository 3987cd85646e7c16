//! PostgreSQL implementation of ExecutionStore
//!
//! Production persistence using PostgreSQL with:
//! - SKIP LOCKED batch claiming (concurrent workers never see the same row)
//! - NOTIFY/LISTEN queue wake-ups with per-queue channels
//! - Atomic child creation + parent suspension for crash-safe replay

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument, warn};

use super::store::*;
use crate::error::ExecutionError;
use crate::model::{
    generate_id, Execution, ExecutionKind, ExecutionStatus, HistoryEvent, NewExecution,
    WorkflowContext,
};
use crate::retry::RetryPolicy;

/// Embedded schema migrations
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// PostgreSQL implementation of ExecutionStore
///
/// # Example
///
/// ```ignore
/// use metronome_core::store::PostgresExecutionStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/metronome").await?;
/// let store = PostgresExecutionStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
    retry_policy: RetryPolicy,
}

impl PostgresExecutionStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Override the retry backoff policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

/// NOTIFY channel for a queue
fn queue_channel(queue: &str) -> String {
    format!("metronome_queue_{queue}")
}

async fn notify_queue(tx: &mut Transaction<'_, Postgres>, queue: &str) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_notify($1, '')")
        .bind(queue_channel(queue))
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn row_to_execution(row: &PgRow) -> Result<Execution, StoreError> {
    let kind_str: String = row.get("kind");
    let status_str: String = row.get("status");
    let error_json: Option<Value> = row.get("error");

    Ok(Execution {
        id: row.get("id"),
        kind: ExecutionKind::parse(&kind_str)
            .ok_or_else(|| StoreError::Database(format!("unknown execution kind: {kind_str}")))?,
        function_name: row.get("function_name"),
        queue: row.get("queue"),
        status: ExecutionStatus::parse(&status_str)
            .ok_or_else(|| StoreError::Database(format!("unknown status: {status_str}")))?,
        priority: row.get("priority"),
        inputs: row.get("inputs"),
        output: row.get("output"),
        error: error_json
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        attempt: row.get("attempt"),
        max_retries: row.get("max_retries"),
        timeout_seconds: row.get("timeout_seconds"),
        parent_workflow_id: row.get("parent_workflow_id"),
        idempotency_key: row.get("idempotency_key"),
        claimed_by: row.get("claimed_by"),
        visible_at: row.get("visible_at"),
        created_at: row.get("created_at"),
        claimed_at: row.get("claimed_at"),
        completed_at: row.get("completed_at"),
    })
}

fn history_from_json(value: Value) -> Result<Vec<HistoryEvent>, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn history_to_json(history: &[HistoryEvent]) -> Result<Value, StoreError> {
    serde_json::to_value(history).map_err(|e| StoreError::Serialization(e.to_string()))
}

const SELECT_EXECUTION: &str = r#"
    SELECT id, kind, function_name, queue, status, priority, inputs, output, error,
           attempt, max_retries, timeout_seconds, parent_workflow_id, idempotency_key,
           claimed_by, visible_at, created_at, claimed_at, completed_at
    FROM executions
"#;

impl PostgresExecutionStore {
    async fn upsert_context_tx(
        tx: &mut Transaction<'_, Postgres>,
        context: &WorkflowContext,
    ) -> Result<(), StoreError> {
        let history = history_to_json(&context.history)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_contexts (
                execution_id, statement_index, locals, history, history_cursor,
                awaiting_child_id, awaiting_signal, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (execution_id) DO UPDATE SET
                statement_index = EXCLUDED.statement_index,
                locals = EXCLUDED.locals,
                history = EXCLUDED.history,
                history_cursor = EXCLUDED.history_cursor,
                awaiting_child_id = EXCLUDED.awaiting_child_id,
                awaiting_signal = EXCLUDED.awaiting_signal,
                updated_at = NOW()
            "#,
        )
        .bind(&context.execution_id)
        .bind(context.statement_index as i32)
        .bind(Value::Object(context.locals.clone()))
        .bind(&history)
        .bind(context.history_cursor as i32)
        .bind(&context.awaiting_child_id)
        .bind(&context.awaiting_signal)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn current_status(
        tx: &mut Transaction<'_, Postgres>,
        id: &str,
    ) -> Result<ExecutionStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let status: String = row.get("status");
        ExecutionStatus::parse(&status)
            .ok_or_else(|| StoreError::Database(format!("unknown status: {status}")))
    }

    /// Deliver a terminal child's result to its suspended parent.
    ///
    /// Appends the `task_result` event at the parent's persisted cursor,
    /// clears the await, and flips a suspended parent back to pending. Must
    /// run inside the transaction that made the child terminal.
    async fn hand_off_to_parent(
        tx: &mut Transaction<'_, Postgres>,
        parent_id: &str,
        child_id: &str,
        function_name: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let ctx_row = sqlx::query(
            r#"
            SELECT statement_index, history
            FROM workflow_contexts
            WHERE execution_id = $1
            FOR UPDATE
            "#,
        )
        .bind(parent_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;

        let Some(ctx_row) = ctx_row else {
            warn!(%parent_id, %child_id, "parent context missing, skipping hand-off");
            return Ok(());
        };

        let statement_index: i32 = ctx_row.get("statement_index");
        let mut history = history_from_json(ctx_row.get("history"))?;

        // Re-delivery of the same child result must not duplicate the event.
        let already_recorded = history.iter().any(|event| {
            matches!(event, HistoryEvent::TaskResult { child_id: c, .. } if c == child_id)
        });
        if already_recorded {
            return Ok(());
        }

        history.push(HistoryEvent::TaskResult {
            name: function_name.to_string(),
            child_id: child_id.to_string(),
            value,
            statement_index: statement_index as usize,
        });

        sqlx::query(
            r#"
            UPDATE workflow_contexts
            SET history = $2, awaiting_child_id = NULL, updated_at = NOW()
            WHERE execution_id = $1
            "#,
        )
        .bind(parent_id)
        .bind(history_to_json(&history)?)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        let resumed = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'pending'
            WHERE id = $1 AND status = 'suspended'
            RETURNING queue
            "#,
        )
        .bind(parent_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;

        if let Some(row) = resumed {
            let queue: String = row.get("queue");
            notify_queue(tx, &queue).await?;
            debug!(%parent_id, %child_id, "parent workflow resumed");
        }

        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, new), fields(id = %new.id, function = %new.function_name))]
    async fn insert_execution(&self, new: NewExecution) -> Result<String, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO executions (
                id, kind, function_name, queue, status, priority, inputs,
                max_retries, timeout_seconds, parent_workflow_id, idempotency_key
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&new.id)
        .bind(new.kind.as_str())
        .bind(&new.function_name)
        .bind(&new.queue)
        .bind(new.priority)
        .bind(&new.inputs)
        .bind(new.max_retries)
        .bind(new.timeout_seconds)
        .bind(&new.parent_workflow_id)
        .bind(&new.idempotency_key)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db))
                if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
            {
                return Err(StoreError::Conflict(new.id));
            }
            Err(e) => return Err(db_err(e)),
        }

        notify_queue(&mut tx, &new.queue).await?;
        tx.commit().await.map_err(db_err)?;

        debug!("inserted execution");
        Ok(new.id)
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        let sql = format!("{SELECT_EXECUTION} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_execution).transpose()
    }

    #[instrument(skip(self, queues))]
    async fn claim_batch(
        &self,
        queues: &[String],
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        if queues.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM executions
                WHERE status = 'pending'
                  AND queue = ANY($1)
                  AND visible_at <= NOW()
                ORDER BY priority DESC, created_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE executions e
            SET status = 'running',
                claimed_by = $3,
                claimed_at = NOW()
            FROM claimable c
            WHERE e.id = c.id
            RETURNING e.id, e.kind, e.function_name, e.queue, e.status, e.priority,
                      e.inputs, e.output, e.error, e.attempt, e.max_retries,
                      e.timeout_seconds, e.parent_workflow_id, e.idempotency_key,
                      e.claimed_by, e.visible_at, e.created_at, e.claimed_at, e.completed_at
            "#,
        )
        .bind(queues)
        .bind(limit as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let claimed = rows
            .iter()
            .map(row_to_execution)
            .collect::<Result<Vec<_>, _>>()?;

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed executions");
        }

        Ok(claimed)
    }

    #[instrument(skip(self, outcomes), fields(count = outcomes.len()))]
    async fn complete_batch(&self, outcomes: &[(String, Value)]) -> Result<(), StoreError> {
        if outcomes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for (id, output) in outcomes {
            let row = sqlx::query(
                r#"
                SELECT status, output, function_name, parent_workflow_id
                FROM executions
                WHERE id = $1
                FOR UPDATE
                "#,
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

            let status_str: String = row.get("status");
            let status = ExecutionStatus::parse(&status_str)
                .ok_or_else(|| StoreError::Database(format!("unknown status: {status_str}")))?;

            match status {
                ExecutionStatus::Completed => {
                    let existing: Option<Value> = row.get("output");
                    if existing.as_ref() != Some(output) {
                        warn!(%id, "re-completion with different output ignored");
                    }
                    continue;
                }
                ExecutionStatus::Failed | ExecutionStatus::Suspended => {
                    return Err(StoreError::IllegalTransition {
                        id: id.clone(),
                        from: status,
                        to: ExecutionStatus::Completed,
                    });
                }
                // Pending is reachable when a recovered claimer reports a
                // late completion; at-least-once semantics accept it.
                ExecutionStatus::Running | ExecutionStatus::Pending => {}
            }

            sqlx::query(
                r#"
                UPDATE executions
                SET status = 'completed',
                    output = $2,
                    error = NULL,
                    claimed_by = NULL,
                    completed_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(output)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            let parent_id: Option<String> = row.get("parent_workflow_id");
            if let Some(parent_id) = parent_id {
                let function_name: String = row.get("function_name");
                Self::hand_off_to_parent(&mut tx, &parent_id, id, &function_name, output.clone())
                    .await?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        debug!("completed batch");
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail(
        &self,
        id: &str,
        error: &ExecutionError,
        retry: bool,
    ) -> Result<FailOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT status, attempt, max_retries, function_name, parent_workflow_id
            FROM executions
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let status_str: String = row.get("status");
        let status = ExecutionStatus::parse(&status_str)
            .ok_or_else(|| StoreError::Database(format!("unknown status: {status_str}")))?;

        if status.is_terminal() {
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from: status,
                to: ExecutionStatus::Failed,
            });
        }

        let attempt: i32 = row.get("attempt");
        let max_retries: i32 = row.get("max_retries");
        let next_attempt = attempt + 1;

        let error_json =
            serde_json::to_value(error).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let outcome = if retry && next_attempt < max_retries {
            let delay = self.retry_policy.delay_for_attempt(next_attempt);
            let visible_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

            sqlx::query(
                r#"
                UPDATE executions
                SET status = 'pending',
                    attempt = $2,
                    error = $3,
                    claimed_by = NULL,
                    visible_at = $4
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(next_attempt)
            .bind(&error_json)
            .bind(visible_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            debug!(%id, next_attempt, delay_ms = delay.as_millis() as u64, "execution will retry");
            FailOutcome::WillRetry {
                next_attempt,
                delay,
            }
        } else {
            sqlx::query(
                r#"
                UPDATE executions
                SET status = 'failed',
                    attempt = $2,
                    error = $3,
                    claimed_by = NULL,
                    completed_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            // attempt never exceeds max_retries, even for no-retry rows.
            .bind(next_attempt.min(max_retries))
            .bind(&error_json)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            let parent_id: Option<String> = row.get("parent_workflow_id");
            if let Some(parent_id) = parent_id {
                let function_name: String = row.get("function_name");
                Self::hand_off_to_parent(
                    &mut tx,
                    &parent_id,
                    id,
                    &function_name,
                    failure_envelope(error),
                )
                .await?;
            }

            error!(%id, kind = %error.kind, "execution failed permanently");
            FailOutcome::Failed
        };

        tx.commit().await.map_err(db_err)?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn load_context(&self, execution_id: &str) -> Result<WorkflowContext, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT statement_index, locals, history, history_cursor,
                   awaiting_child_id, awaiting_signal
            FROM workflow_contexts
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(WorkflowContext::new(execution_id));
        };

        let locals: Value = row.get("locals");

        Ok(WorkflowContext {
            execution_id: execution_id.to_string(),
            statement_index: row.get::<i32, _>("statement_index") as usize,
            locals: locals.as_object().cloned().unwrap_or_default(),
            history: history_from_json(row.get("history"))?,
            history_cursor: row.get::<i32, _>("history_cursor") as usize,
            awaiting_child_id: row.get("awaiting_child_id"),
            awaiting_signal: row.get("awaiting_signal"),
        })
    }

    #[instrument(skip(self, context), fields(execution_id = %context.execution_id))]
    async fn save_context(&self, context: &WorkflowContext) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::upsert_context_tx(&mut tx, context).await?;
        tx.commit().await.map_err(db_err)
    }

    #[instrument(skip(self, context))]
    async fn suspend_workflow(
        &self,
        id: &str,
        context: &WorkflowContext,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let updated = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'suspended', claimed_by = NULL
            WHERE id = $1 AND status = 'running' AND kind = 'workflow'
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            let from = Self::current_status(&mut tx, id).await?;
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from,
                to: ExecutionStatus::Suspended,
            });
        }

        Self::upsert_context_tx(&mut tx, context).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(%id, "workflow suspended");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resume_workflow(&self, id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let resumed = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'pending'
            WHERE id = $1 AND status = 'suspended'
            RETURNING queue
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = resumed else {
            let from = Self::current_status(&mut tx, id).await?;
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from,
                to: ExecutionStatus::Pending,
            });
        };

        let queue: String = row.get("queue");
        notify_queue(&mut tx, &queue).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(%id, "workflow resumed");
        Ok(())
    }

    #[instrument(skip(self, child, context), fields(child_id = %child.id))]
    async fn create_child_and_suspend(
        &self,
        parent_id: &str,
        child: NewExecution,
        context: &WorkflowContext,
    ) -> Result<String, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO executions (
                id, kind, function_name, queue, status, priority, inputs,
                max_retries, timeout_seconds, parent_workflow_id, idempotency_key
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10)
            ON CONFLICT (parent_workflow_id, idempotency_key)
                WHERE idempotency_key IS NOT NULL
                DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&child.id)
        .bind(child.kind.as_str())
        .bind(&child.function_name)
        .bind(&child.queue)
        .bind(child.priority)
        .bind(&child.inputs)
        .bind(child.max_retries)
        .bind(child.timeout_seconds)
        .bind(&child.parent_workflow_id)
        .bind(&child.idempotency_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let child_id = match inserted {
            Some(row) => {
                let id: String = row.get("id");
                notify_queue(&mut tx, &child.queue).await?;
                id
            }
            None => {
                // A prior attempt already created this child.
                let row = sqlx::query(
                    r#"
                    SELECT id FROM executions
                    WHERE parent_workflow_id = $1 AND idempotency_key = $2
                    "#,
                )
                .bind(parent_id)
                .bind(&child.idempotency_key)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
                row.get("id")
            }
        };

        let mut suspended_ctx = context.clone();
        suspended_ctx.awaiting_child_id = Some(child_id.clone());
        Self::upsert_context_tx(&mut tx, &suspended_ctx).await?;

        let updated = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'suspended', claimed_by = NULL
            WHERE id = $1 AND status = 'running' AND kind = 'workflow'
            "#,
        )
        .bind(parent_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            let from = Self::current_status(&mut tx, parent_id).await?;
            return Err(StoreError::IllegalTransition {
                id: parent_id.to_string(),
                from,
                to: ExecutionStatus::Suspended,
            });
        }

        tx.commit().await.map_err(db_err)?;

        debug!(%parent_id, %child_id, "child created, parent suspended");
        Ok(child_id)
    }

    #[instrument(skip(self, payload))]
    async fn append_signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<String, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let wf_row = sqlx::query(
            r#"
            SELECT status, queue FROM executions
            WHERE id = $1 AND kind = 'workflow'
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(workflow_id.to_string()))?;

        let signal_id = generate_id("sig");
        sqlx::query(
            r#"
            INSERT INTO signals (id, workflow_id, name, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&signal_id)
        .bind(workflow_id)
        .bind(name)
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Rendezvous: a workflow already parked on this signal consumes it
        // in the same transaction and goes back to its queue.
        let status_str: String = wf_row.get("status");
        if status_str == "suspended" {
            let ctx_row = sqlx::query(
                r#"
                SELECT statement_index, history, awaiting_signal
                FROM workflow_contexts
                WHERE execution_id = $1
                FOR UPDATE
                "#,
            )
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            if let Some(ctx_row) = ctx_row {
                let awaiting: Option<String> = ctx_row.get("awaiting_signal");
                if awaiting.as_deref() == Some(name) {
                    sqlx::query("UPDATE signals SET consumed = TRUE WHERE id = $1")
                        .bind(&signal_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;

                    let statement_index: i32 = ctx_row.get("statement_index");
                    let mut history = history_from_json(ctx_row.get("history"))?;
                    history.push(HistoryEvent::Signal {
                        name: name.to_string(),
                        payload: payload.clone(),
                        statement_index: statement_index as usize,
                    });

                    sqlx::query(
                        r#"
                        UPDATE workflow_contexts
                        SET history = $2, awaiting_signal = NULL, updated_at = NOW()
                        WHERE execution_id = $1
                        "#,
                    )
                    .bind(workflow_id)
                    .bind(history_to_json(&history)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;

                    sqlx::query("UPDATE executions SET status = 'pending' WHERE id = $1")
                        .bind(workflow_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;

                    let queue: String = wf_row.get("queue");
                    notify_queue(&mut tx, &queue).await?;
                    debug!(%workflow_id, name, "signal consumed by waiting workflow");
                }
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(signal_id)
    }

    #[instrument(skip(self, context))]
    async fn take_signal(
        &self,
        workflow_id: &str,
        name: &str,
        context: &WorkflowContext,
    ) -> Result<Option<Value>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let signal_row = sqlx::query(
            r#"
            SELECT id, payload FROM signals
            WHERE workflow_id = $1 AND name = $2 AND NOT consumed
            ORDER BY created_at, id
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(signal_row) = signal_row else {
            return Ok(None);
        };

        let signal_id: String = signal_row.get("id");
        let payload: Value = signal_row.get("payload");

        sqlx::query("UPDATE signals SET consumed = TRUE WHERE id = $1")
            .bind(&signal_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        // Persist the caller's context with the event appended so the
        // consumption is never durable without its history record.
        let mut consumed_ctx = context.clone();
        consumed_ctx.history.push(HistoryEvent::Signal {
            name: name.to_string(),
            payload: payload.clone(),
            statement_index: context.statement_index,
        });
        Self::upsert_context_tx(&mut tx, &consumed_ctx).await?;

        tx.commit().await.map_err(db_err)?;

        debug!(%workflow_id, name, "drained pending signal");
        Ok(Some(payload))
    }

    #[instrument(skip(self, queues))]
    async fn upsert_heartbeat(
        &self,
        worker_id: &str,
        queues: &[String],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (worker_id, last_heartbeat, queues, status)
            VALUES ($1, NOW(), $2, 'running')
            ON CONFLICT (worker_id) DO UPDATE SET
                last_heartbeat = NOW(),
                queues = EXCLUDED.queues,
                status = 'running'
            "#,
        )
        .bind(worker_id)
        .bind(queues)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE worker_heartbeats SET status = 'stopped' WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        debug!(worker_id, "worker stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recover_dead(&self, timeout: Duration) -> Result<RecoveredWork, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let dead = sqlx::query(
            r#"
            UPDATE worker_heartbeats
            SET status = 'stopped'
            WHERE status = 'running'
              AND last_heartbeat < NOW() - make_interval(secs => $1)
            RETURNING worker_id
            "#,
        )
        .bind(timeout.as_secs_f64())
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let workers_stopped: Vec<String> = dead.iter().map(|r| r.get("worker_id")).collect();

        let mut executions_recovered = Vec::new();
        if !workers_stopped.is_empty() {
            let rows = sqlx::query(
                r#"
                UPDATE executions
                SET status = 'pending',
                    claimed_by = NULL,
                    claimed_at = NULL,
                    visible_at = NOW()
                WHERE status = 'running' AND claimed_by = ANY($1)
                RETURNING id, queue
                "#,
            )
            .bind(&workers_stopped)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;

            let mut queues: Vec<String> = Vec::new();
            for row in rows {
                executions_recovered.push(row.get("id"));
                let queue: String = row.get("queue");
                if !queues.contains(&queue) {
                    queues.push(queue);
                }
            }
            for queue in &queues {
                notify_queue(&mut tx, queue).await?;
            }
        }

        tx.commit().await.map_err(db_err)?;

        if !executions_recovered.is_empty() {
            warn!(
                workers = workers_stopped.len(),
                executions = executions_recovered.len(),
                "recovered work from dead workers"
            );
        }

        Ok(RecoveredWork {
            workers_stopped,
            executions_recovered,
        })
    }

    async fn subscribe(&self, queues: &[String]) -> Result<Box<dyn QueueWakeup>, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(db_err)?;

        let channels: Vec<String> = queues.iter().map(|q| queue_channel(q)).collect();
        listener
            .listen_all(channels.iter().map(|c| c.as_str()))
            .await
            .map_err(db_err)?;

        Ok(Box::new(PgQueueWakeup { listener }))
    }
}

struct PgQueueWakeup {
    listener: PgListener,
}

#[async_trait]
impl QueueWakeup for PgQueueWakeup {
    async fn wait(&mut self) -> Result<(), StoreError> {
        self.listener.recv().await.map(|_| ()).map_err(db_err)
    }
}
