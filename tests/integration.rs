// ABOUTME: Integration tests verifying modules work together.
// ABOUTME: Several instances share one MemoryStore to exercise cross-instance behavior.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use toolgate::prelude::*;
use toolgate::store::keys;

/// Records every payload id it runs; optionally waits on a gate.
struct RecordingExecutor {
    calls: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl RecordingExecutor {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            gate: Some(gate),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl Executor for RecordingExecutor {
    async fn dispatch(
        &self,
        payload: &serde_json::Value,
    ) -> Result<ExecutionResult, anyhow::Error> {
        let id = payload["id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("payload missing id"))?
            .to_string();
        self.calls.lock().push(id.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        Ok(ExecutionResult::success(format!("handled {}", id)))
    }
}

struct Instance {
    dispatcher: Arc<Dispatcher>,
    outcomes: mpsc::UnboundedReceiver<DispatchOutcome>,
}

fn instance(
    id: &str,
    store: &Arc<MemoryStore>,
    clock: &Arc<ManualClock>,
    executor: Arc<RecordingExecutor>,
) -> Instance {
    let queue = Arc::new(PriorityQueueManager::new(clock.clone()));
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), clock.clone()).unwrap());
    let coordinator = Arc::new(InstanceCoordinator::new(
        store.clone(),
        id,
        CoordinationConfig::default(),
        clock.clone(),
        Arc::new(FixedRandom::new(0.0)),
    ));
    let (tx, outcomes) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(
        queue,
        limiter,
        coordinator,
        executor,
        &DispatcherConfig::default(),
    )
    .unwrap()
    .with_outcomes(tx);
    Instance {
        dispatcher: Arc::new(dispatcher),
        outcomes,
    }
}

fn enqueue(id: &str) -> EnqueueRequest {
    EnqueueRequest {
        request_id: id.to_string(),
        priority: "normal".to_string(),
        payload: serde_json::json!({ "id": id }),
        scheduled_at: None,
        source_agent: "triage-agent".to_string(),
    }
}

async fn recv(outcomes: &mut mpsc::UnboundedReceiver<DispatchOutcome>) -> DispatchOutcome {
    tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
        .await
        .expect("outcome should arrive")
        .expect("channel open")
}

#[tokio::test]
async fn test_same_request_runs_on_one_instance() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let gate = Arc::new(Semaphore::new(0));
    let executor = Arc::new(RecordingExecutor::gated(gate.clone()));

    let mut a = instance("instance-a", &store, &clock, executor.clone());
    let b = instance("instance-b", &store, &clock, executor.clone());
    a.dispatcher.queue().submit(enqueue("req-1")).unwrap();
    b.dispatcher.queue().submit(enqueue("req-1")).unwrap();

    assert!(matches!(
        a.dispatcher.run_cycle().await,
        CycleOutcome::Dispatched { .. }
    ));
    assert_eq!(
        b.dispatcher.run_cycle().await,
        CycleOutcome::ClaimConflict {
            request_id: "req-1".to_string()
        }
    );
    assert!(b.dispatcher.queue().is_empty());

    gate.add_permits(1);
    let outcome = recv(&mut a.outcomes).await;
    assert!(matches!(outcome.status, DispatchStatus::Completed { .. }));
    assert_eq!(executor.calls(), vec!["req-1"]);
}

#[tokio::test]
async fn test_crashed_owner_claim_expires() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let executor = Arc::new(RecordingExecutor::new());

    // instance-a claims and then disappears without releasing
    let crashed = InstanceCoordinator::new(
        store.clone(),
        "instance-a",
        CoordinationConfig::default(),
        clock.clone(),
        Arc::new(FixedRandom::new(0.0)),
    );
    assert!(crashed.claim_request("req-1").await.unwrap());

    let mut b = instance("instance-b", &store, &clock, executor.clone());
    b.dispatcher.queue().submit(enqueue("req-1")).unwrap();
    assert!(matches!(
        b.dispatcher.run_cycle().await,
        CycleOutcome::ClaimConflict { .. }
    ));

    clock.advance(Duration::from_millis(
        CoordinationConfig::default().claim_ttl_ms + 1,
    ));
    b.dispatcher.queue().submit(enqueue("req-1")).unwrap();
    assert!(matches!(
        b.dispatcher.run_cycle().await,
        CycleOutcome::Dispatched { .. }
    ));
    let outcome = recv(&mut b.outcomes).await;
    assert_eq!(outcome.request_id, "req-1");
    assert_eq!(executor.calls(), vec!["req-1"]);
}

#[tokio::test]
async fn test_node_processes_requests_and_deregisters() {
    let store = Arc::new(MemoryStore::new(system_clock()));
    let executor = Arc::new(RecordingExecutor::new());
    let config = ToolgateConfig::from_toml_str(
        r#"
        instance_id = "node-a"

        [dispatcher]
        max_concurrent = 2
        idle_backoff_ms = 10

        [health]
        heartbeat_interval_ms = 50
        health_ttl_ms = 500
        dead_instance_threshold_ms = 5000
        "#,
    )
    .unwrap();

    let (tx, mut outcomes) = mpsc::unbounded_channel();
    let node = DispatchNode::builder(config, store.clone(), executor.clone())
        .with_random(Arc::new(FixedRandom::new(0.0)))
        .with_outcomes(tx)
        .start()
        .await
        .unwrap();
    assert_eq!(node.instance_id(), "node-a");

    for id in ["issue-1", "issue-2", "issue-3"] {
        node.submit(enqueue(id)).unwrap();
    }
    let mut done = Vec::new();
    for _ in 0..3 {
        let outcome = recv(&mut outcomes).await;
        assert!(matches!(outcome.status, DispatchStatus::Completed { .. }));
        done.push(outcome.request_id);
    }
    done.sort();
    assert_eq!(done, vec!["issue-1", "issue-2", "issue-3"]);

    let snapshot = node.snapshot().await;
    let cluster = snapshot.cluster.expect("node attaches a health monitor");
    assert_eq!(cluster.total, 1);
    assert_eq!(cluster.alive, 1);
    assert_eq!(snapshot.rate.count, 3);

    node.shutdown().await.unwrap();
    let registry = store
        .hash_get_all(&keys::registry_key("toolgate"))
        .await
        .unwrap();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_node_rejects_invalid_config() {
    let store = Arc::new(MemoryStore::new(system_clock()));
    let mut config = ToolgateConfig::default();
    config.dispatcher.max_concurrent = 0;

    let result = DispatchNode::start(config, store, Arc::new(RecordingExecutor::new())).await;
    assert!(matches!(result, Err(ToolgateError::Config(_))));
}

#[tokio::test]
async fn test_invalid_priority_rejected_at_submit() {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let a = instance("instance-a", &store, &clock, Arc::new(RecordingExecutor::new()));

    let mut request = enqueue("req-1");
    request.priority = "critical".to_string();
    let err = a.dispatcher.queue().submit(request).unwrap_err();
    assert!(matches!(err, QueueError::InvalidPriority(_)));
    assert_eq!(ToolgateError::from(err).kind(), ErrorKind::ConfigurationError);
}
