//! End-to-end dispatch tests against a real libsql store.
//!
//! Tasks go in through the `Orchestrator` and are driven either by single
//! `run_once` steps or by the full worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::timeout;
use uuid::Uuid;

use mcp_orchestrator::Orchestrator;
use mcp_orchestrator::agents::{AgentDescriptor, AgentExecutor, AgentRegistry, EchoExecutor};
use mcp_orchestrator::config::{DispatcherConfig, MaintenanceConfig};
use mcp_orchestrator::dispatch::{Dispatcher, DurableQueue, ResultStore, TaskOutcome};
use mcp_orchestrator::error::AgentError;
use mcp_orchestrator::store::{Database, LibSqlBackend};
use mcp_orchestrator::task::{
    ResultStatus, RetryPolicy, Task, TaskRequest, TaskState, TaskStatus, TaskType,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fails the first `failures` calls, then echoes the payload back.
struct ScriptedExecutor {
    failures: u32,
    calls: AtomicU32,
}

impl ScriptedExecutor {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task) -> Result<Value, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(AgentError::ExecutionFailed {
                agent: "scripted".into(),
                reason: format!("scripted failure {call}"),
            });
        }
        Ok(json!({"call": call, "payload": task.payload}))
    }
}

struct Harness {
    orchestrator: Orchestrator,
    dispatcher: Arc<Dispatcher>,
}

async fn harness(registry: AgentRegistry, db: Arc<dyn Database>) -> Harness {
    let registry = Arc::new(registry);
    let queue = DurableQueue::new(Arc::clone(&db));
    let results = ResultStore::new(Arc::clone(&db), Duration::from_secs(3600));
    let config = DispatcherConfig {
        workers: 2,
        retry: RetryPolicy::new(3, Duration::from_millis(10)),
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(50),
    };
    let dispatcher = Dispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&registry),
        Arc::clone(&results),
        config,
    );
    Harness {
        orchestrator: Orchestrator::new(queue, registry, results),
        dispatcher,
    }
}

async fn memory_db() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

async fn wait_for_terminal(orchestrator: &Orchestrator, id: Uuid) -> TaskStatus {
    timeout(TEST_TIMEOUT, async {
        loop {
            let status = orchestrator.status(id).await.unwrap();
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task did not reach a terminal state")
}

#[tokio::test]
async fn higher_priority_task_dispatches_first() {
    let registry = AgentRegistry::new();
    registry
        .register(
            AgentDescriptor::new("codex", ["generate-code"]).max_concurrent(4),
            Arc::new(EchoExecutor),
        )
        .await;
    let h = harness(registry, memory_db().await).await;

    for _ in 0..3 {
        h.orchestrator
            .submit(TaskRequest::new(TaskType::GenerateCode, json!({"prompt": "low"})))
            .await
            .unwrap();
    }
    let urgent = h
        .orchestrator
        .submit(TaskRequest::new(TaskType::GenerateCode, json!({"prompt": "urgent"})).with_priority(5))
        .await
        .unwrap();
    assert_eq!(urgent.agent.as_deref(), Some("codex"));

    assert_eq!(h.dispatcher.run_once().await.unwrap(), Some(TaskOutcome::Completed));
    let status = h.orchestrator.status(urgent.task_id).await.unwrap();
    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(h.orchestrator.system_status().await.unwrap().tasks.waiting, 3);
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let registry = AgentRegistry::new();
    let executor = ScriptedExecutor::new(2);
    registry
        .register(AgentDescriptor::new("codex", ["generate-code"]), executor.clone())
        .await;
    let h = harness(registry, memory_db().await).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = tokio::spawn(Arc::clone(&h.dispatcher).run(shutdown_rx));

    let submission = h
        .orchestrator
        .submit(TaskRequest::new(TaskType::GenerateCode, json!({"prompt": "retry me"})))
        .await
        .unwrap();
    let status = wait_for_terminal(&h.orchestrator, submission.task_id).await;

    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.attempts, 3);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

    let result = h.orchestrator.result(submission.task_id).await.unwrap().unwrap();
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.agent, "codex");
    assert_eq!(result.output.unwrap()["call"], 3);

    shutdown_tx.send(true).unwrap();
    timeout(TEST_TIMEOUT, pool).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn exhausted_retries_store_failure_result() {
    let registry = AgentRegistry::new();
    registry
        .register(AgentDescriptor::new("codex", ["generate-code"]), ScriptedExecutor::new(10))
        .await;
    let h = harness(registry, memory_db().await).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = tokio::spawn(Arc::clone(&h.dispatcher).run(shutdown_rx));

    let submission = h
        .orchestrator
        .submit(TaskRequest::new(TaskType::GenerateCode, json!({})))
        .await
        .unwrap();
    let status = wait_for_terminal(&h.orchestrator, submission.task_id).await;

    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.attempts, 3);
    let result = h.orchestrator.result(submission.task_id).await.unwrap().unwrap();
    assert_eq!(result.status, ResultStatus::Failure);
    assert!(result.error.unwrap().contains("scripted failure 3"));

    shutdown_tx.send(true).unwrap();
    timeout(TEST_TIMEOUT, pool).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn unservable_task_fails_at_submission() {
    let registry = AgentRegistry::new();
    registry
        .register(AgentDescriptor::new("codex", ["generate-code"]), Arc::new(EchoExecutor))
        .await;
    registry
        .register(
            AgentDescriptor::new("gemini", ["analyze"]).enabled(false),
            Arc::new(EchoExecutor),
        )
        .await;
    let h = harness(registry, memory_db().await).await;

    let submission = h
        .orchestrator
        .submit(TaskRequest::new(TaskType::Analyze, json!({"target": "src/"})))
        .await
        .unwrap();
    assert_eq!(submission.state, TaskState::Failed);
    assert!(submission.agent.is_none());
    assert!(submission.reason.is_some());

    assert_eq!(h.dispatcher.run_once().await.unwrap(), None);
    let status = h.orchestrator.status(submission.task_id).await.unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.attempts, 0);
}

#[tokio::test]
async fn cancelled_waiting_task_is_never_dispatched() {
    let registry = AgentRegistry::new();
    let executor = ScriptedExecutor::new(0);
    registry
        .register(AgentDescriptor::new("codex", ["generate-code"]), executor.clone())
        .await;
    let h = harness(registry, memory_db().await).await;

    let submission = h
        .orchestrator
        .submit(TaskRequest::new(TaskType::GenerateCode, json!({})))
        .await
        .unwrap();
    let status = h.orchestrator.cancel(submission.task_id).await.unwrap();
    assert_eq!(status.state, TaskState::Cancelled);

    assert_eq!(h.dispatcher.run_once().await.unwrap(), None);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    assert!(h.orchestrator.result(submission.task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn lifecycle_events_reach_subscribers() {
    let registry = AgentRegistry::new();
    registry
        .register(AgentDescriptor::new("codex", ["generate-code"]), Arc::new(EchoExecutor))
        .await;
    let h = harness(registry, memory_db().await).await;
    let mut events = h.orchestrator.subscribe();

    let submission = h
        .orchestrator
        .submit(TaskRequest::new(TaskType::GenerateCode, json!({})))
        .await
        .unwrap();
    h.dispatcher.run_once().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        let value = serde_json::to_value(&event).unwrap();
        if value["type"] == "task_update" && value["task"]["task_id"] == submission.task_id.to_string() {
            seen.push(value["task"]["state"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(seen, ["waiting", "active", "completed"]);
}

#[tokio::test]
async fn result_is_readable_when_completion_is_announced() {
    let registry = AgentRegistry::new();
    registry
        .register(
            AgentDescriptor::new("codex", ["generate-code"]).max_concurrent(4),
            Arc::new(EchoExecutor),
        )
        .await;
    let h = harness(registry, memory_db().await).await;
    let mut events = h.orchestrator.subscribe();

    let mut pending = std::collections::HashSet::new();
    for n in 0..20 {
        let submission = h
            .orchestrator
            .submit(TaskRequest::new(TaskType::GenerateCode, json!({"n": n})))
            .await
            .unwrap();
        pending.insert(submission.task_id.to_string());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = tokio::spawn(Arc::clone(&h.dispatcher).run(shutdown_rx));

    timeout(TEST_TIMEOUT, async {
        while !pending.is_empty() {
            let value = serde_json::to_value(events.recv().await.unwrap()).unwrap();
            if value["type"] != "task_update" || value["task"]["state"] != "completed" {
                continue;
            }
            let id = value["task"]["task_id"].as_str().unwrap().to_string();
            let result = h.orchestrator.result(id.parse().unwrap()).await.unwrap();
            assert!(result.is_some(), "task {id} announced completed without a result");
            pending.remove(&id);
        }
    })
    .await
    .expect("not every task completed");

    shutdown_tx.send(true).unwrap();
    timeout(TEST_TIMEOUT, pool).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn tasks_survive_restart_and_interrupted_work_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orchestrator.db");

    let interrupted_id = {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let registry = AgentRegistry::new();
        registry
            .register(AgentDescriptor::new("codex", ["generate-code"]), Arc::new(EchoExecutor))
            .await;
        let h = harness(registry, db).await;

        let interrupted = h
            .orchestrator
            .submit(TaskRequest::new(TaskType::GenerateCode, json!({"n": 1})))
            .await
            .unwrap();
        h.orchestrator
            .submit(TaskRequest::new(TaskType::GenerateCode, json!({"n": 2})))
            .await
            .unwrap();

        // Claim one task and abandon it, as if the process died mid-execution.
        let claimed = h.orchestrator.queue().dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.id, interrupted.task_id);
        interrupted.task_id
    };

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let registry = AgentRegistry::new();
    registry
        .register(
            AgentDescriptor::new("codex", ["generate-code"]).max_concurrent(2),
            Arc::new(EchoExecutor),
        )
        .await;
    let h = harness(registry, db).await;

    let counts = h.orchestrator.system_status().await.unwrap().tasks;
    assert_eq!(counts.active, 1);
    assert_eq!(counts.waiting, 1);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = h
        .dispatcher
        .sweep(&MaintenanceConfig {
            interval: Duration::from_secs(60),
            liveness_timeout: Duration::ZERO,
            task_retention: Duration::from_secs(3600),
        })
        .await
        .unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.interrupted, 0);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = tokio::spawn(Arc::clone(&h.dispatcher).run(shutdown_rx));

    let status = wait_for_terminal(&h.orchestrator, interrupted_id).await;
    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.attempts, 2);

    shutdown_tx.send(true).unwrap();
    timeout(TEST_TIMEOUT, pool).await.unwrap().unwrap().unwrap();
}
