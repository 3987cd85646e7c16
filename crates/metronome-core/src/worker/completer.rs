//! Completion batching
//!
//! Successful outcomes are buffered and flushed as a batch on a short timer
//! (or when the buffer crosses a threshold); failures never pass through
//! here, they are reported immediately by the executor.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::dispatcher::Dispatcher;
use crate::store::StoreError;

/// Buffered batch reporter for successful outcomes
pub struct Completer {
    dispatcher: Arc<Dispatcher>,
    buffer: Mutex<Vec<(String, Value)>>,
    flush_threshold: usize,
}

impl Completer {
    pub fn new(dispatcher: Arc<Dispatcher>, flush_threshold: usize) -> Self {
        Self {
            dispatcher,
            buffer: Mutex::new(Vec::new()),
            flush_threshold: flush_threshold.max(1),
        }
    }

    /// Buffer a successful outcome, flushing when the threshold is crossed.
    pub async fn push(&self, id: String, output: Value) {
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push((id, output));
            buffer.len() >= self.flush_threshold
        };

        if should_flush {
            self.flush().await;
        }
    }

    /// Number of buffered outcomes
    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Flush the buffer as one batch.
    ///
    /// A failed batch falls back to per-item completion so one poison row
    /// (an illegal transition from store misuse) cannot wedge the rest;
    /// transiently-failed items go back into the buffer for the next tick.
    pub async fn flush(&self) -> usize {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return 0;
            }
            std::mem::take(&mut *buffer)
        };

        let count = batch.len();
        match self.dispatcher.complete_batch(&batch).await {
            Ok(()) => {
                debug!(count, "flushed completions");
                count
            }
            Err(batch_err) => {
                warn!("batch completion failed, retrying items individually: {batch_err}");
                let mut flushed = 0;
                let mut requeue = Vec::new();

                for (id, output) in batch {
                    match self
                        .dispatcher
                        .complete_batch(&[(id.clone(), output.clone())])
                        .await
                    {
                        Ok(()) => flushed += 1,
                        Err(e @ StoreError::IllegalTransition { .. })
                        | Err(e @ StoreError::NotFound(_)) => {
                            error!(%id, "dropping unreportable completion: {e}");
                        }
                        Err(e) => {
                            warn!(%id, "completion deferred: {e}");
                            requeue.push((id, output));
                        }
                    }
                }

                if !requeue.is_empty() {
                    let mut buffer = self.buffer.lock().await;
                    // Preserve original order ahead of newer outcomes.
                    requeue.append(&mut buffer);
                    *buffer = requeue;
                }
                flushed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::model::{ExecutionStatus, NewExecution};
    use crate::store::{ExecutionStore, InMemoryExecutionStore};
    use serde_json::json;

    async fn setup() -> (Arc<InMemoryExecutionStore>, Completer) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store) as Arc<dyn ExecutionStore>,
            &Settings::default(),
        ));
        (store, Completer::new(dispatcher, 64))
    }

    async fn claimed_task(store: &Arc<InMemoryExecutionStore>) -> String {
        let id = store
            .insert_execution(NewExecution::task("t", "default", json!({})))
            .await
            .unwrap();
        store
            .claim_batch(&["default".to_string()], "w", 100)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_buffered_until_flush() {
        let (store, completer) = setup().await;
        let id = claimed_task(&store).await;

        completer.push(id.clone(), json!({"ok": true})).await;
        assert_eq!(completer.pending().await, 1);

        let execution = store.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);

        assert_eq!(completer.flush().await, 1);
        assert_eq!(completer.pending().await, 0);

        let execution = store.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_threshold_triggers_flush() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store) as Arc<dyn ExecutionStore>,
            &Settings::default(),
        ));
        let completer = Completer::new(dispatcher, 2);

        let a = claimed_task(&store).await;
        let b = claimed_task(&store).await;

        completer.push(a.clone(), json!(1)).await;
        completer.push(b.clone(), json!(2)).await;

        assert_eq!(completer.pending().await, 0);
        let execution = store.get_execution(&b).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_poison_item_does_not_wedge_batch() {
        let (store, completer) = setup().await;

        let good = claimed_task(&store).await;
        let poison = claimed_task(&store).await;
        // Make the second row terminal-failed so completing it is illegal.
        store
            .fail(
                &poison,
                &crate::error::ExecutionError::transient("boom"),
                false,
            )
            .await
            .unwrap();

        completer.push(good.clone(), json!({"ok": true})).await;
        completer.push(poison.clone(), json!({"ok": true})).await;

        let flushed = completer.flush().await;
        assert_eq!(flushed, 1);
        assert_eq!(completer.pending().await, 0);

        let execution = store.get_execution(&good).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let execution = store.get_execution(&poison).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }
}
