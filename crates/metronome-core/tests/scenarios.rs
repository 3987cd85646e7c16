//! End-to-end scenarios over the in-memory store
//!
//! These drive the full stack (client -> worker -> dispatcher -> engine ->
//! store) with real worker loops; the in-memory store's wake-up channel
//! keeps them event-driven rather than timing-sensitive.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use metronome_core::prelude::*;

const WAIT: Duration = Duration::from_secs(10);

fn fast_settings() -> Settings {
    Settings {
        worker_poll_interval: 0.02,
        ..Settings::default()
    }
}

fn make_client() -> (Arc<InMemoryExecutionStore>, Client) {
    let store = Arc::new(InMemoryExecutionStore::new());
    let client = Client::with_store(
        Arc::clone(&store) as Arc<dyn ExecutionStore>,
        fast_settings(),
    );
    (store, client)
}

fn register_increment(client: &Client) {
    client.register_function("increment", |inputs| async move {
        let value = inputs["value"]
            .as_i64()
            .ok_or_else(|| TaskError::invalid_input("value must be an integer"))?;
        Ok(json!({"result": value + 1}))
    });
}

fn program(source: Value) -> WorkflowProgram {
    serde_json::from_value(source).expect("valid program")
}

async fn wait_for_status(client: &Client, id: &str, status: ExecutionStatus) -> Execution {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let execution = client
            .get_execution(id)
            .await
            .unwrap()
            .expect("execution exists");
        if execution.status == status {
            return execution;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {id} to reach {status}, currently {}",
            execution.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn sequential_tasks_chain_results_through_children() {
    let (store, client) = make_client();
    register_increment(&client);
    client.register_program(program(json!({
        "name": "sequential_tasks",
        "statements": [
            {"type": "call_task", "result_var": "first", "task": "increment",
             "args": {"type": "object", "fields": [
                 ["value", {"type": "get", "object": {"type": "input"}, "key": "start"}]]}},
            {"type": "call_task", "result_var": "second", "task": "increment",
             "args": {"type": "object", "fields": [
                 ["value", {"type": "get", "object": {"type": "local", "name": "first"}, "key": "result"}]]}},
            {"type": "call_task", "result_var": "third", "task": "increment",
             "args": {"type": "object", "fields": [
                 ["value", {"type": "get", "object": {"type": "local", "name": "second"}, "key": "result"}]]}},
            {"type": "return", "expr": {"type": "object", "fields": [
                ["result", {"type": "get", "object": {"type": "local", "name": "third"}, "key": "result"}]]}}
        ]
    })));

    let worker = client.worker(vec!["default".to_string()]);
    worker.start().await.unwrap();

    let id = client
        .start_workflow("sequential_tasks", json!({"start": 0}))
        .await
        .unwrap();
    let done = client.wait_for_execution(&id, WAIT).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.output, Some(json!({"result": 3})));

    let children = store.children_of(&id);
    assert_eq!(children.len(), 3);
    for child in &children {
        assert_eq!(child.parent_workflow_id.as_deref(), Some(id.as_str()));
        assert_eq!(child.status, ExecutionStatus::Completed);
    }
    assert_eq!(children[0].inputs, json!({"value": 0}));
    assert_eq!(children[1].inputs, json!({"value": 1}));
    assert_eq!(children[2].inputs, json!({"value": 2}));

    // Exactly one recorded result per child at termination.
    let ctx = store.load_context(&id).await.unwrap();
    let task_results = ctx
        .history
        .iter()
        .filter(|e| matches!(e, HistoryEvent::TaskResult { .. }))
        .count();
    assert_eq!(task_results, 3);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn property_access_through_task_results() {
    let (_store, client) = make_client();

    client.register_function("create_user", |inputs| async move {
        Ok(json!({"name": inputs["name"], "age": inputs["age"]}))
    });
    client.register_function("greet_user", |inputs| async move {
        let name = inputs["name"].as_str().unwrap_or("?").to_string();
        let age = inputs["age"].as_i64().unwrap_or(0);
        Ok(json!({"message": format!("Hello {name}, age {age}!")}))
    });

    client.register_program(program(json!({
        "name": "property_access",
        "statements": [
            {"type": "call_task", "result_var": "user", "task": "create_user",
             "args": {"type": "input"}},
            {"type": "call_task", "result_var": "greeting", "task": "greet_user",
             "args": {"type": "object", "fields": [
                 ["name", {"type": "get", "object": {"type": "local", "name": "user"}, "key": "name"}],
                 ["age", {"type": "get", "object": {"type": "local", "name": "user"}, "key": "age"}]]}},
            {"type": "return", "expr": {"type": "object", "fields": [
                ["greeting", {"type": "get", "object": {"type": "local", "name": "greeting"}, "key": "message"}]]}}
        ]
    })));

    let worker = client.worker(vec!["default".to_string()]);
    worker.start().await.unwrap();

    let id = client
        .start_workflow("property_access", json!({"name": "Alice", "age": 30}))
        .await
        .unwrap();
    let done = client.wait_for_execution(&id, WAIT).await.unwrap();

    assert_eq!(done.output, Some(json!({"greeting": "Hello Alice, age 30!"})));

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn no_tasks_workflow_returns_without_children() {
    let (store, client) = make_client();
    client.register_program(program(json!({
        "name": "no_tasks",
        "statements": [
            {"type": "return", "expr": {"type": "object", "fields": [
                ["message", {"type": "literal", "value": "No tasks executed"}],
                ["input", {"type": "get", "object": {"type": "input"}, "key": "value"}]]}}
        ]
    })));

    let worker = client.worker(vec!["default".to_string()]);
    worker.start().await.unwrap();

    let id = client
        .start_workflow("no_tasks", json!({"value": 42}))
        .await
        .unwrap();
    let done = client.wait_for_execution(&id, WAIT).await.unwrap();

    assert_eq!(
        done.output,
        Some(json!({"message": "No tasks executed", "input": 42}))
    );
    assert!(store.children_of(&id).is_empty());

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn crash_recovery_reexecutes_on_another_worker() {
    let (store, client) = make_client();
    register_increment(&client);

    // Worker A claims the task and dies before reporting anything.
    store.upsert_heartbeat("worker_dead", &["default".to_string()]).await.unwrap();
    let id = client
        .queue_task("increment", json!({"value": 1}), None)
        .await
        .unwrap();
    let claimed = store
        .claim_batch(&["default".to_string()], "worker_dead", 1)
        .await
        .unwrap();
    assert_eq!(claimed[0].id, id);
    store.backdate_heartbeat("worker_dead", Duration::from_secs(600));

    // A live worker with a short heartbeat timeout recovers and re-executes.
    let mut config = WorkerConfig::from_settings(&fast_settings(), vec!["default".to_string()]);
    config.heartbeat_timeout = Duration::from_millis(300);
    config.heartbeat_interval = Duration::from_millis(100);
    let worker = client.worker_with_config(config);
    worker.start().await.unwrap();

    let done = client.wait_for_execution(&id, WAIT).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.output, Some(json!({"result": 2})));

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn signal_rendezvous_resumes_suspended_workflow() {
    let (_store, client) = make_client();
    client.register_program(program(json!({
        "name": "approval_flow",
        "statements": [
            {"type": "wait_signal", "result_var": "approval", "signal": "approval"},
            {"type": "branch",
             "cond": {"type": "binary", "op": "eq",
                      "left": {"type": "get", "object": {"type": "local", "name": "approval"}, "key": "approved"},
                      "right": {"type": "literal", "value": true}},
             "then_block": [
                 {"type": "return", "expr": {"type": "literal", "value": {"status": "approved"}}}],
             "else_block": [
                 {"type": "return", "expr": {"type": "literal", "value": {"status": "rejected"}}}]}
        ]
    })));

    let worker = client.worker(vec!["default".to_string()]);
    worker.start().await.unwrap();

    let id = client
        .start_workflow("approval_flow", json!({}))
        .await
        .unwrap();

    // The worker picks it up and parks it on the signal.
    wait_for_status(&client, &id, ExecutionStatus::Suspended).await;

    client
        .send_signal(&id, "approval", json!({"approved": true}))
        .await
        .unwrap();

    let done = client.wait_for_execution(&id, WAIT).await.unwrap();
    assert_eq!(done.output, Some(json!({"status": "approved"})));

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn retry_exhaustion_leaves_failure_visible() {
    let (_store, client) = make_client();
    client.register_function("always_fails", |_| async move {
        Err(TaskError::transient("downstream unavailable"))
    });

    let worker = client.worker(vec!["default".to_string()]);
    worker.start().await.unwrap();

    // default_retries = 3: three attempts, then terminal failure.
    let id = client
        .queue_task("always_fails", json!({}), None)
        .await
        .unwrap();
    let done = client.wait_for_execution(&id, WAIT).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(done.attempt, 3);
    assert!(done.output.is_none());
    let error = done.error.expect("error retained");
    assert_eq!(error.kind, ErrorKind::Transient);
    assert_eq!(error.message, "downstream unavailable");

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_function_fails_without_retry() {
    let (_store, client) = make_client();
    let worker = client.worker(vec!["default".to_string()]);
    worker.start().await.unwrap();

    let id = client
        .queue_task("never_registered", json!({}), None)
        .await
        .unwrap();
    let done = client.wait_for_execution(&id, WAIT).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(done.attempt, 1);
    assert_eq!(done.error.unwrap().kind, ErrorKind::UnknownFunction);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn child_failure_is_observed_not_propagated() {
    let (store, client) = make_client();
    client.register_function("flaky_charge", |_| async move {
        Err(TaskError::transient("card processor down"))
    });

    // The workflow watches the child's typed result and falls back instead
    // of failing outright.
    client.register_program(program(json!({
        "name": "charge_with_fallback",
        "statements": [
            {"type": "call_task", "result_var": "charge", "task": "flaky_charge",
             "args": {"type": "literal", "value": {}},
             "options": {"max_retries": 2}},
            {"type": "branch",
             "cond": {"type": "binary", "op": "ne",
                      "left": {"type": "get", "object": {"type": "local", "name": "charge"}, "key": "error"},
                      "right": {"type": "literal", "value": null}},
             "then_block": [
                 {"type": "return", "expr": {"type": "literal", "value": {"status": "fallback"}}}],
             "else_block": [
                 {"type": "return", "expr": {"type": "literal", "value": {"status": "charged"}}}]}
        ]
    })));

    let worker = client.worker(vec!["default".to_string()]);
    worker.start().await.unwrap();

    let id = client
        .start_workflow("charge_with_fallback", json!({}))
        .await
        .unwrap();
    let done = client.wait_for_execution(&id, WAIT).await.unwrap();

    // The parent completed even though its child failed permanently.
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.output, Some(json!({"status": "fallback"})));

    let children = store.children_of(&id);
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, ExecutionStatus::Failed);

    let ctx = store.load_context(&id).await.unwrap();
    assert!(matches!(
        &ctx.history[0],
        HistoryEvent::TaskResult { value, .. } if value["error"]["kind"] == json!("transient")
    ));

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn priority_orders_dispatch_within_a_queue() {
    let (store, client) = make_client();

    // Claim directly so dispatch order is observable.
    let low = store
        .insert_execution(
            NewExecution::task("t", "default", json!({"which": "low"})).with_priority(1),
        )
        .await
        .unwrap();
    let high = store
        .insert_execution(
            NewExecution::task("t", "default", json!({"which": "high"})).with_priority(10),
        )
        .await
        .unwrap();

    let batch = store
        .claim_batch(&["default".to_string()], "w", 2)
        .await
        .unwrap();
    assert_eq!(batch[0].id, high);
    assert_eq!(batch[1].id, low);

    drop(client);
}
