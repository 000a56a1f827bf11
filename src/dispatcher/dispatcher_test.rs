// ABOUTME: Tests for the dispatch cycle, result interpretation, and admin commands.
// ABOUTME: A scripted executor stands in for the shared tool; a ManualClock drives TTLs and blocks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{Semaphore, mpsc, watch};

use super::*;
use crate::clock::ManualClock;
use crate::config::{CoordinationConfig, DispatcherConfig, HealthConfig, RateLimitConfig};
use crate::coordinator::{
    FixedRandom, InstanceCoordinator, RATE_LIMIT_PAUSE_REASON, RateLimiter,
};
use crate::error::ErrorKind;
use crate::health::HealthMonitor;
use crate::queue::{PriorityQueueManager, PriorityTier, Request};
use crate::store::{CoordinationStore, MemoryStore, keys};

enum Step {
    Succeed(String),
    Fail(String),
    Error(String),
    Panic(String),
    /// Take the store down, then fail with the message.
    FailDuringOutage(String),
}

#[derive(Default)]
struct ScriptedExecutor {
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
    store: Mutex<Option<Arc<MemoryStore>>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    /// Executions wait for a permit on the returned semaphore.
    fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                gate: Some(gate.clone()),
                ..Self::default()
            },
            gate,
        )
    }

    fn script(self, id: &str, steps: Vec<Step>) -> Self {
        self.steps.lock().insert(id.to_string(), steps.into());
        self
    }

    fn attach_store(&self, store: Arc<MemoryStore>) {
        *self.store.lock() = Some(store);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn dispatch(
        &self,
        payload: &serde_json::Value,
    ) -> Result<ExecutionResult, anyhow::Error> {
        let id = payload["id"].as_str().unwrap_or_default().to_string();
        self.calls.lock().push(id.clone());
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let step = self.steps.lock().get_mut(&id).and_then(VecDeque::pop_front);
        match step {
            None => Ok(ExecutionResult::success(format!("done {}", id))),
            Some(Step::Succeed(output)) => Ok(ExecutionResult::success(output)),
            Some(Step::Fail(message)) => Ok(ExecutionResult::failure(message)),
            Some(Step::Error(message)) => Err(anyhow::anyhow!(message)),
            Some(Step::Panic(message)) => panic!("{}", message),
            Some(Step::FailDuringOutage(message)) => {
                if let Some(store) = self.store.lock().as_ref() {
                    store.set_available(false);
                }
                Ok(ExecutionResult::failure(message))
            }
        }
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    random: Arc<FixedRandom>,
    queue: Arc<PriorityQueueManager>,
    limiter: Arc<RateLimiter>,
    coordinator: Arc<InstanceCoordinator>,
    executor: Arc<ScriptedExecutor>,
    dispatcher: Arc<Dispatcher>,
    outcomes: mpsc::UnboundedReceiver<DispatchOutcome>,
}

struct Options {
    dispatcher: DispatcherConfig,
    coordination: CoordinationConfig,
    health: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig {
                max_concurrent: 1,
                idle_backoff_ms: 10,
                throttle_ms: 0,
                max_attempts: None,
            },
            coordination: CoordinationConfig::default(),
            health: false,
        }
    }
}

fn harness(executor: ScriptedExecutor) -> Harness {
    harness_with(executor, Options::default())
}

fn harness_with(executor: ScriptedExecutor, options: Options) -> Harness {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let random = Arc::new(FixedRandom::new(0.0));
    let queue = Arc::new(PriorityQueueManager::new(clock.clone()));
    let limiter = Arc::new(
        RateLimiter::new(
            RateLimitConfig {
                max_requests: 100,
                block_duration_ms: 30_000,
                ..RateLimitConfig::default()
            },
            clock.clone(),
        )
        .unwrap(),
    );
    let coordinator = Arc::new(InstanceCoordinator::new(
        store.clone(),
        "instance-a",
        options.coordination.clone(),
        clock.clone(),
        random.clone(),
    ));
    let executor = Arc::new(executor);
    let (tx, outcomes) = mpsc::unbounded_channel();

    let mut dispatcher = Dispatcher::new(
        queue.clone(),
        limiter.clone(),
        coordinator.clone(),
        executor.clone(),
        &options.dispatcher,
    )
    .unwrap()
    .with_outcomes(tx);
    if options.health {
        dispatcher = dispatcher.with_health(Arc::new(HealthMonitor::new(
            store.clone(),
            "instance-a",
            HealthConfig::default(),
            options.coordination.key_prefix.clone(),
            clock.clone(),
        )));
    }

    Harness {
        clock,
        store,
        random,
        queue,
        limiter,
        coordinator,
        executor,
        dispatcher: Arc::new(dispatcher),
        outcomes,
    }
}

impl Harness {
    fn submit(&self, id: &str, tier: PriorityTier) {
        self.queue
            .enqueue(Request::new(id, "agent-1", tier, json!({ "id": id })))
            .unwrap();
    }

    async fn next_outcome(&mut self) -> DispatchOutcome {
        tokio::time::timeout(Duration::from_secs(2), self.outcomes.recv())
            .await
            .expect("outcome should arrive")
            .expect("outcome channel open")
    }

    /// Dispatch one request and wait for its outcome.
    async fn dispatch_one(&mut self) -> DispatchOutcome {
        let outcome = self.dispatcher.run_cycle().await;
        assert!(
            matches!(outcome, CycleOutcome::Dispatched { .. }),
            "expected dispatch, got {:?}",
            outcome
        );
        self.next_outcome().await
    }

    async fn wait_running(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.executor.running() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("executions should start");
    }
}

#[tokio::test]
async fn test_idle_when_queue_empty() {
    let h = harness(ScriptedExecutor::default());
    assert_eq!(h.dispatcher.run_cycle().await, CycleOutcome::Idle);
}

#[tokio::test]
async fn test_successful_dispatch_reports_and_releases_claim() {
    let mut h = harness(ScriptedExecutor::default());
    h.submit("req-1", PriorityTier::Normal);

    let outcome = h.dispatch_one().await;
    assert_eq!(outcome.request_id, "req-1");
    assert_eq!(outcome.source_agent, "agent-1");
    assert_eq!(outcome.attempt, 0);
    assert_eq!(
        outcome.status,
        DispatchStatus::Completed {
            output: "done req-1".to_string()
        }
    );

    assert!(h.coordinator.claim_owner("req-1").await.unwrap().is_none());
    assert_eq!(h.limiter.current_count(), 1);
    assert_eq!(h.dispatcher.active_requests(), 0);
    let loads = h.coordinator.get_all_loads().await.unwrap();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].active_requests, 0);
}

#[tokio::test]
async fn test_dispatches_in_priority_order() {
    let mut h = harness(ScriptedExecutor::default());
    h.submit("low", PriorityTier::Low);
    h.submit("urgent", PriorityTier::Urgent);
    h.submit("normal", PriorityTier::Normal);
    h.submit("high", PriorityTier::High);

    let mut order = Vec::new();
    for _ in 0..4 {
        order.push(h.dispatch_one().await.request_id);
    }
    assert_eq!(order, vec!["urgent", "high", "normal", "low"]);
}

#[tokio::test]
async fn test_claim_held_during_execution() {
    let (executor, gate) = ScriptedExecutor::gated();
    let mut h = harness(executor);
    h.submit("req-1", PriorityTier::Normal);

    assert!(matches!(
        h.dispatcher.run_cycle().await,
        CycleOutcome::Dispatched { .. }
    ));
    h.wait_running(1).await;
    assert_eq!(
        h.coordinator.claim_owner("req-1").await.unwrap().as_deref(),
        Some("instance-a")
    );
    assert_eq!(h.dispatcher.active_requests(), 1);
    assert_eq!(h.coordinator.get_all_loads().await.unwrap()[0].active_requests, 1);

    gate.add_permits(1);
    h.next_outcome().await;
    assert!(h.coordinator.claim_owner("req-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_saturated_at_max_concurrent() {
    let (executor, gate) = ScriptedExecutor::gated();
    let mut h = harness(executor);
    h.submit("req-1", PriorityTier::Normal);
    h.submit("req-2", PriorityTier::Normal);

    assert!(matches!(
        h.dispatcher.run_cycle().await,
        CycleOutcome::Dispatched { .. }
    ));
    assert_eq!(h.dispatcher.run_cycle().await, CycleOutcome::Saturated);
    assert!(h.queue.contains("req-2"));

    gate.add_permits(1);
    h.next_outcome().await;
    assert!(matches!(
        h.dispatcher.run_cycle().await,
        CycleOutcome::Dispatched { .. }
    ));
    gate.add_permits(1);
    h.next_outcome().await;
}

#[tokio::test]
async fn test_blocked_until_rate_limit_expires() {
    let mut h = harness(ScriptedExecutor::default());
    h.submit("req-1", PriorityTier::Normal);

    h.limiter.handle_rate_limit();
    assert_eq!(
        h.queue.pause_reason().as_deref(),
        Some(RATE_LIMIT_PAUSE_REASON)
    );
    assert_eq!(
        h.dispatcher.run_cycle().await,
        CycleOutcome::Blocked {
            retry_after: Duration::from_millis(30_000)
        }
    );

    h.clock.advance(Duration::from_millis(30_000));
    let outcome = h.dispatch_one().await;
    assert_eq!(outcome.request_id, "req-1");
    assert!(!h.queue.is_paused());
}

#[tokio::test]
async fn test_rate_limited_result_requeues_with_attempt() {
    let executor = ScriptedExecutor::default().script(
        "req-1",
        vec![Step::Fail("HTTP 429: Too Many Requests".to_string())],
    );
    let mut h = harness(executor);
    h.submit("req-1", PriorityTier::High);
    h.submit("req-2", PriorityTier::High);

    let outcome = h.dispatch_one().await;
    assert_eq!(outcome.attempt, 0);
    assert_eq!(
        outcome.status,
        DispatchStatus::Requeued {
            retry_after_ms: 30_000
        }
    );
    assert!(h.limiter.is_blocked());
    assert_eq!(h.limiter.rate_limit_hits(), 1);
    assert!(h.queue.contains("req-1"));
    assert!(h.coordinator.claim_owner("req-1").await.unwrap().is_none());

    h.clock.advance(Duration::from_millis(30_000));

    // requeued at the tail of its tier
    let second = h.dispatch_one().await;
    assert_eq!(second.request_id, "req-2");
    let retried = h.dispatch_one().await;
    assert_eq!(retried.request_id, "req-1");
    assert_eq!(retried.attempt, 1);
    assert!(matches!(retried.status, DispatchStatus::Completed { .. }));
}

#[tokio::test]
async fn test_executor_error_text_is_classified() {
    let executor = ScriptedExecutor::default().script(
        "req-1",
        vec![Step::Error("upstream said: rate limit exceeded".to_string())],
    );
    let mut h = harness(executor);
    h.submit("req-1", PriorityTier::Normal);

    let outcome = h.dispatch_one().await;
    assert!(matches!(outcome.status, DispatchStatus::Requeued { .. }));
    assert!(h.limiter.is_blocked());
}

#[tokio::test]
async fn test_other_failure_is_terminal() {
    let executor = ScriptedExecutor::default()
        .script("req-1", vec![Step::Fail("exit status 2".to_string())])
        .script("req-2", vec![Step::Error("spawn failed".to_string())]);
    let mut h = harness(executor);
    h.submit("req-1", PriorityTier::Normal);
    h.submit("req-2", PriorityTier::Normal);

    for expected in ["exit status 2", "spawn failed"] {
        let outcome = h.dispatch_one().await;
        assert_eq!(
            outcome.status,
            DispatchStatus::Failed {
                kind: ErrorKind::ExecutorFailure,
                error: expected.to_string(),
            }
        );
        assert!(outcome.status.is_terminal());
    }
    assert!(h.queue.is_empty());
    assert!(!h.limiter.is_blocked());
}

#[tokio::test]
async fn test_max_attempts_gives_up() {
    let executor = ScriptedExecutor::default().script(
        "req-1",
        vec![
            Step::Fail("rate limited".to_string()),
            Step::Fail("rate limited".to_string()),
        ],
    );
    let mut h = harness_with(
        executor,
        Options {
            dispatcher: DispatcherConfig {
                max_attempts: Some(1),
                ..Options::default().dispatcher
            },
            ..Options::default()
        },
    );
    h.submit("req-1", PriorityTier::Normal);

    let first = h.dispatch_one().await;
    assert!(matches!(first.status, DispatchStatus::Requeued { .. }));

    h.clock.advance(Duration::from_millis(30_000));
    let second = h.dispatch_one().await;
    assert_eq!(second.attempt, 1);
    assert!(matches!(
        second.status,
        DispatchStatus::Failed {
            kind: ErrorKind::TransientUpstreamRateLimit,
            ..
        }
    ));
    assert!(!h.queue.contains("req-1"));
}

#[tokio::test]
async fn test_claim_conflict_drops_locally() {
    let h = harness(ScriptedExecutor::default());
    let peer = InstanceCoordinator::new(
        h.store.clone(),
        "instance-b",
        CoordinationConfig::default(),
        h.clock.clone(),
        h.random.clone(),
    );
    assert!(peer.claim_request("req-1").await.unwrap());
    h.submit("req-1", PriorityTier::Normal);

    assert_eq!(
        h.dispatcher.run_cycle().await,
        CycleOutcome::ClaimConflict {
            request_id: "req-1".to_string()
        }
    );
    assert!(!h.queue.contains("req-1"));
    assert!(h.executor.calls().is_empty());
    assert_eq!(h.limiter.current_count(), 0);
}

#[tokio::test]
async fn test_store_outage_requeues_without_attempt() {
    let mut h = harness(ScriptedExecutor::default());
    h.submit("req-1", PriorityTier::Normal);

    h.store.set_available(false);
    assert_eq!(
        h.dispatcher.run_cycle().await,
        CycleOutcome::StoreUnavailable {
            request_id: "req-1".to_string()
        }
    );
    assert!(h.queue.contains("req-1"));
    assert!(h.executor.calls().is_empty());

    h.store.set_available(true);
    let outcome = h.dispatch_one().await;
    assert_eq!(outcome.attempt, 0);
}

#[tokio::test]
async fn test_deferred_when_peer_preferred() {
    let mut h = harness(ScriptedExecutor::default());
    // equal load; ties go to the lower id
    let peer = InstanceCoordinator::new(
        h.store.clone(),
        "instance-0",
        CoordinationConfig::default(),
        h.clock.clone(),
        h.random.clone(),
    );
    peer.update_load(0).await.unwrap();
    h.submit("req-1", PriorityTier::Normal);

    h.random.set(0.9);
    assert_eq!(h.dispatcher.run_cycle().await, CycleOutcome::Deferred);
    assert!(h.queue.contains("req-1"));

    h.random.set(0.1);
    h.dispatch_one().await;
}

#[tokio::test]
async fn test_rate_limit_during_outage_keeps_request() {
    let executor = ScriptedExecutor::default().script(
        "req-1",
        vec![Step::FailDuringOutage("429 Too Many Requests".to_string())],
    );
    let mut h = harness(executor);
    h.executor.attach_store(h.store.clone());
    h.submit("req-1", PriorityTier::Normal);

    let first = h.dispatch_one().await;
    assert_eq!(
        first.status,
        DispatchStatus::Requeued {
            retry_after_ms: 30_000
        }
    );

    // the release failed, so this instance still holds the claim
    h.store.set_available(true);
    assert_eq!(
        h.coordinator.claim_owner("req-1").await.unwrap().as_deref(),
        Some("instance-a")
    );

    h.clock.advance(Duration::from_millis(30_000));
    let retried = h.dispatch_one().await;
    assert_eq!(retried.request_id, "req-1");
    assert_eq!(retried.attempt, 1);
    assert!(matches!(retried.status, DispatchStatus::Completed { .. }));
    assert!(h.coordinator.claim_owner("req-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_executor_panic_settles_and_drains() {
    let executor =
        ScriptedExecutor::default().script("req-1", vec![Step::Panic("boom".to_string())]);
    let mut h = harness(executor);
    h.submit("req-1", PriorityTier::Normal);

    let outcome = h.dispatch_one().await;
    match outcome.status {
        DispatchStatus::Failed { kind, error } => {
            assert_eq!(kind, ErrorKind::ExecutorFailure);
            assert!(error.contains("executor panicked: boom"), "{}", error);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.dispatcher.active_requests(), 0);
    assert!(h.coordinator.claim_owner("req-1").await.unwrap().is_none());
    tokio::time::timeout(Duration::from_millis(500), h.dispatcher.drain())
        .await
        .expect("drain should finish");

    // the slot came back
    h.submit("req-2", PriorityTier::Normal);
    h.dispatch_one().await;
}

#[tokio::test]
async fn test_load_refresh_republishes_expired_record() {
    let h = harness_with(
        ScriptedExecutor::default(),
        Options {
            coordination: CoordinationConfig {
                load_ttl_ms: 60,
                ..CoordinationConfig::default()
            },
            ..Options::default()
        },
    );
    let (tx, rx) = watch::channel(false);
    let handle = h.dispatcher.clone().spawn_load_refresh(rx);

    let key = keys::load_key(&h.coordinator.config().key_prefix, "instance-a");
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.store.get(&key).await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first refresh");

    h.store.delete(&key).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.store.get(&key).await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("record republished");

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("refresh task should stop")
        .unwrap();
}

#[tokio::test]
async fn test_claim_extended_during_long_execution() {
    let (executor, gate) = ScriptedExecutor::gated();
    let mut h = harness_with(
        executor,
        Options {
            coordination: CoordinationConfig {
                claim_ttl_ms: 40,
                ..CoordinationConfig::default()
            },
            ..Options::default()
        },
    );
    h.submit("req-1", PriorityTier::Normal);
    h.dispatcher.run_cycle().await;
    h.wait_running(1).await;

    h.clock.advance(Duration::from_millis(30));
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.clock.advance(Duration::from_millis(30));

    // without a refresh the claim would have expired at +40
    assert_eq!(
        h.coordinator.claim_owner("req-1").await.unwrap().as_deref(),
        Some("instance-a")
    );
    gate.add_permits(1);
    h.next_outcome().await;
}

#[tokio::test]
async fn test_admin_pause_and_resume() {
    let mut h = harness(ScriptedExecutor::default());
    h.submit("req-1", PriorityTier::Normal);

    let state = h.dispatcher.pause();
    assert!(state.paused);
    assert_eq!(state.pause_reason.as_deref(), Some(OPERATOR_PAUSE_REASON));
    assert_eq!(state.queued, 1);
    assert_eq!(h.dispatcher.run_cycle().await, CycleOutcome::Idle);

    let state = h.dispatcher.resume();
    assert!(!state.paused);
    h.dispatch_one().await;
}

#[tokio::test]
async fn test_operator_pause_survives_rate_limit_recovery() {
    let h = harness(ScriptedExecutor::default());
    h.submit("req-1", PriorityTier::Normal);

    h.dispatcher.pause();
    h.limiter.handle_rate_limit();
    h.clock.advance(Duration::from_millis(30_000));

    assert_eq!(h.dispatcher.run_cycle().await, CycleOutcome::Idle);
    assert_eq!(
        h.queue.pause_reason().as_deref(),
        Some(OPERATOR_PAUSE_REASON)
    );
}

#[tokio::test]
async fn test_admin_clear_and_throttle() {
    let h = harness(ScriptedExecutor::default());
    h.submit("req-1", PriorityTier::Normal);
    h.submit("req-2", PriorityTier::Low);

    let state = h.dispatcher.clear_queue(Some(PriorityTier::Low));
    assert_eq!(state.queued, 1);
    let state = h.dispatcher.clear_queue(None);
    assert_eq!(state.queued, 0);

    let state = h.dispatcher.set_throttle(250);
    assert_eq!(state.throttle_ms, 250);
    assert_eq!(h.dispatcher.set_throttle(250), state);
}

#[tokio::test]
async fn test_set_concurrency_grows_and_shrinks_lazily() {
    let (executor, gate) = ScriptedExecutor::gated();
    let mut h = harness(executor);
    for id in ["a", "b", "c", "d"] {
        h.submit(id, PriorityTier::Normal);
    }

    assert!(matches!(
        h.dispatcher.run_cycle().await,
        CycleOutcome::Dispatched { .. }
    ));
    assert_eq!(h.dispatcher.run_cycle().await, CycleOutcome::Saturated);

    let state = h.dispatcher.set_concurrency(2).unwrap();
    assert_eq!(state.max_concurrent, 2);
    assert!(matches!(
        h.dispatcher.run_cycle().await,
        CycleOutcome::Dispatched { .. }
    ));
    assert_eq!(h.dispatcher.run_cycle().await, CycleOutcome::Saturated);

    // both slots busy: the shrink waits for one to come back
    h.dispatcher.set_concurrency(1).unwrap();
    h.wait_running(2).await;
    gate.add_permits(1);
    h.next_outcome().await;
    assert_eq!(h.dispatcher.run_cycle().await, CycleOutcome::Saturated);

    gate.add_permits(1);
    h.next_outcome().await;
    assert!(matches!(
        h.dispatcher.run_cycle().await,
        CycleOutcome::Dispatched { .. }
    ));
    gate.add_permits(1);
    h.next_outcome().await;
}

#[tokio::test]
async fn test_set_concurrency_rejects_zero() {
    let h = harness(ScriptedExecutor::default());
    assert!(h.dispatcher.set_concurrency(0).is_err());
    assert_eq!(h.dispatcher.max_concurrent(), 1);
}

#[tokio::test]
async fn test_zero_concurrency_config_rejected() {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let result = Dispatcher::new(
        Arc::new(PriorityQueueManager::new(clock.clone())),
        Arc::new(RateLimiter::new(RateLimitConfig::default(), clock.clone()).unwrap()),
        Arc::new(InstanceCoordinator::new(
            store,
            "instance-a",
            CoordinationConfig::default(),
            clock,
            Arc::new(FixedRandom::new(0.0)),
        )),
        Arc::new(ScriptedExecutor::default()),
        &DispatcherConfig {
            max_concurrent: 0,
            ..DispatcherConfig::default()
        },
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn test_snapshot_reports_cluster_view() {
    let mut h = harness_with(
        ScriptedExecutor::default(),
        Options {
            health: true,
            ..Options::default()
        },
    );
    h.submit("req-1", PriorityTier::Urgent);
    h.submit("req-2", PriorityTier::Low);
    h.dispatch_one().await;

    let snapshot = h.dispatcher.snapshot().await;
    assert_eq!(snapshot.instance_id, "instance-a");
    assert_eq!(snapshot.queue.depths.low, 1);
    assert_eq!(snapshot.rate.count, 1);
    assert_eq!(snapshot.blocked_until, None);
    assert_eq!(snapshot.max_concurrent, 1);
    assert_eq!(snapshot.loads.len(), 1);
    // the monitor was never started, so the cluster view is empty
    let cluster = snapshot.cluster.as_ref().unwrap();
    assert_eq!(cluster.total, 0);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["instance_id"], "instance-a");
}

#[tokio::test]
async fn test_snapshot_survives_store_outage() {
    let h = harness(ScriptedExecutor::default());
    h.store.set_available(false);

    let snapshot = h.dispatcher.snapshot().await;
    assert!(snapshot.loads.is_empty());
    assert!(snapshot.cluster.is_none());
}

#[tokio::test]
async fn test_run_processes_queue_until_shutdown() {
    let mut h = harness_with(
        ScriptedExecutor::default(),
        Options {
            dispatcher: DispatcherConfig {
                max_concurrent: 2,
                ..Options::default().dispatcher
            },
            ..Options::default()
        },
    );
    for i in 0..5 {
        h.submit(&format!("req-{}", i), PriorityTier::Normal);
    }

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(h.dispatcher.clone().run(rx));

    let mut done = Vec::new();
    for _ in 0..5 {
        done.push(h.next_outcome().await.request_id);
    }
    done.sort();
    assert_eq!(done, vec!["req-0", "req-1", "req-2", "req-3", "req-4"]);
    assert!(h.executor.peak.load(Ordering::SeqCst) <= 2);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("dispatcher should stop")
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_in_flight() {
    let (executor, gate) = ScriptedExecutor::gated();
    let mut h = harness(executor);
    h.submit("req-1", PriorityTier::Normal);

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(h.dispatcher.clone().run(rx));
    h.wait_running(1).await;

    tx.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished(), "run waits for in-flight work");

    gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("dispatcher should stop")
        .unwrap();
    let outcome = h.next_outcome().await;
    assert!(matches!(outcome.status, DispatchStatus::Completed { .. }));
}
