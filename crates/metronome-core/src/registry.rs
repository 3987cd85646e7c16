//! Function registry: name -> executable binding
//!
//! Populated by the embedding application before workers start. Lookup
//! failure is a permanent `UnknownFunction` failure, never a retry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::TaskError;

/// Future returned by a task handler
pub type TaskFuture = BoxFuture<'static, Result<Value, TaskError>>;

/// A registered task handler: JSON inputs in, JSON output or TaskError out
pub type TaskHandler = Arc<dyn Fn(Value) -> TaskFuture + Send + Sync>;

/// Process-wide map from function name to handler
///
/// # Example
///
/// ```
/// use metronome_core::registry::FunctionRegistry;
/// use serde_json::json;
///
/// let registry = FunctionRegistry::new();
/// registry.register("increment", |inputs| async move {
///     let value = inputs["value"].as_i64().unwrap_or(0);
///     Ok(json!({"result": value + 1}))
/// });
///
/// assert!(registry.contains("increment"));
/// ```
pub struct FunctionRegistry {
    handlers: RwLock<HashMap<String, TaskHandler>>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under a function name (replaces any previous one)
    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |inputs| Box::pin(handler(inputs)));
        self.handlers.write().insert(name.to_string(), handler);
    }

    /// Look up a handler
    pub fn get(&self, name: &str) -> Option<TaskHandler> {
        self.handlers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = FunctionRegistry::new();
        registry.register("double", |inputs| async move {
            let n = inputs["n"].as_i64().unwrap_or(0);
            Ok(json!({"n": n * 2}))
        });

        let handler = registry.get("double").expect("registered");
        let output = handler(json!({"n": 21})).await.unwrap();
        assert_eq!(output, json!({"n": 42}));
    }

    #[tokio::test]
    async fn test_handler_errors_propagate() {
        let registry = FunctionRegistry::new();
        registry.register("always_fails", |_| async move {
            Err(TaskError::transient("downstream unavailable"))
        });

        let handler = registry.get("always_fails").unwrap();
        let err = handler(json!({})).await.unwrap_err();
        assert_eq!(err.message, "downstream unavailable");
    }

    #[test]
    fn test_lookup_miss() {
        let registry = FunctionRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = FunctionRegistry::new();
        registry.register("f", |_| async move { Ok(json!(1)) });
        registry.register("f", |_| async move { Ok(json!(2)) });
        assert_eq!(registry.len(), 1);
    }
}
