// ABOUTME: Dispatcher - pulls requests through limit check, claim, and executor.
// ABOUTME: Interprets results, recycles rate-limited work, and exposes admin commands.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::executor::{ExecutionResult, Executor};
use super::outcome::{
    AdminState, CycleOutcome, DispatchOutcome, DispatchSnapshot, DispatchStatus,
};
use crate::config::DispatcherConfig;
use crate::coordinator::{InstanceCoordinator, RateLimiter};
use crate::error::{ConfigError, ErrorKind};
use crate::health::HealthMonitor;
use crate::queue::{PriorityQueueManager, PriorityTier, Request};

/// Pause reason used by the `pause` admin command.
pub const OPERATOR_PAUSE_REASON: &str = "paused by operator";

/// Drives requests from the local queue to the shared executor.
///
/// Each cycle checks the rate limiter, takes an executor slot, asks the
/// coordinator whether this instance should pick up work, dequeues, and
/// claims. A won claim is executed on its own task; the cycle returns
/// immediately. Rate-limited results block the limiter (which pauses the
/// queue) and put the request back at the tail of its tier.
pub struct Dispatcher {
    queue: Arc<PriorityQueueManager>,
    limiter: Arc<RateLimiter>,
    coordinator: Arc<InstanceCoordinator>,
    executor: Arc<dyn Executor>,
    health: Option<Arc<HealthMonitor>>,
    outcomes: Option<mpsc::UnboundedSender<DispatchOutcome>>,
    idle_backoff: Duration,
    max_attempts: Option<u32>,
    semaphore: Arc<Semaphore>,
    max_concurrent: AtomicUsize,
    /// Permits to retire as they come back after a shrink.
    shrink_debt: AtomicUsize,
    throttle_ms: AtomicU64,
    active: AtomicU32,
    slot_freed: Notify,
    drained: Notify,
}

impl Dispatcher {
    /// Build a dispatcher and route the limiter's backpressure to the queue.
    pub fn new(
        queue: Arc<PriorityQueueManager>,
        limiter: Arc<RateLimiter>,
        coordinator: Arc<InstanceCoordinator>,
        executor: Arc<dyn Executor>,
        config: &DispatcherConfig,
    ) -> Result<Self, ConfigError> {
        if config.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.max_concurrent must be at least 1".to_string(),
            ));
        }

        let paused = Arc::clone(&queue);
        limiter.on_pause(move |reason| {
            paused.pause_if_running(reason);
        });
        let resumed = Arc::clone(&queue);
        limiter.on_resume(move |reason| {
            resumed.resume_if_paused_by(reason);
        });

        Ok(Self {
            queue,
            limiter,
            coordinator,
            executor,
            health: None,
            outcomes: None,
            idle_backoff: Duration::from_millis(config.idle_backoff_ms),
            max_attempts: config.max_attempts,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            max_concurrent: AtomicUsize::new(config.max_concurrent),
            shrink_debt: AtomicUsize::new(0),
            throttle_ms: AtomicU64::new(config.throttle_ms),
            active: AtomicU32::new(0),
            slot_freed: Notify::new(),
            drained: Notify::new(),
        })
    }

    /// Report live load through a health monitor and include the cluster
    /// view in snapshots.
    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Send every request outcome to `tx`.
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<DispatchOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn queue(&self) -> &Arc<PriorityQueueManager> {
        &self.queue
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn coordinator(&self) -> &Arc<InstanceCoordinator> {
        &self.coordinator
    }

    /// Requests currently executing.
    pub fn active_requests(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Run one dispatch cycle.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleOutcome {
        if !self.limiter.check_limit() {
            return CycleOutcome::Blocked {
                retry_after: self.limiter.time_until_allowed(),
            };
        }
        if !self.queue.has_ready() {
            return CycleOutcome::Idle;
        }
        let Some(permit) = self.try_acquire_slot() else {
            return CycleOutcome::Saturated;
        };
        if !self.coordinator.should_process_request().await {
            return CycleOutcome::Deferred;
        }
        let Some(request) = self.queue.dequeue_next() else {
            return CycleOutcome::Idle;
        };

        let request_id = request.request_id.clone();
        match self.coordinator.claim_request(&request_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    request_id = %request_id,
                    kind = %ErrorKind::ClaimConflict,
                    "request owned by another instance; dropped locally"
                );
                return CycleOutcome::ClaimConflict { request_id };
            }
            Err(e) => {
                warn!(
                    request_id = %request_id,
                    kind = %ErrorKind::CoordinationStoreUnavailable,
                    error = %e,
                    "claim failed; requeueing"
                );
                if let Err(e) = self.queue.requeue(request) {
                    debug!(request_id = %request_id, error = %e, "request already queued again");
                }
                return CycleOutcome::StoreUnavailable { request_id };
            }
        }

        self.limiter.record_request();
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish_load(active).await;
        info!(
            request_id = %request_id,
            priority = %request.priority,
            attempt = request.attempt_count,
            "dispatching request"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute(request, permit).await;
        });
        CycleOutcome::Dispatched { request_id }
    }

    /// Loop dispatch cycles until `shutdown` turns true, then wait for
    /// in-flight requests to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(instance_id = %self.coordinator.instance_id(), "dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let outcome = self.run_cycle().await;
            let wait = self.backoff(&outcome);
            if wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            let saturated = outcome == CycleOutcome::Saturated;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
                _ = self.slot_freed.notified(), if saturated => {}
            }
        }

        info!(active = self.active_requests(), "dispatcher stopping; draining");
        self.drain().await;
        info!("dispatcher stopped");
    }

    /// Wait until no request is executing.
    pub async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Republish this instance's load every third of the load TTL so the
    /// record outlives long executions and idle stretches.
    pub fn spawn_load_refresh(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let period = (self.coordinator.config().load_ttl() / 3).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.publish_load(self.active_requests()).await;
                    }
                }
            }
            debug!("load refresh task stopped");
        })
    }

    fn backoff(&self, outcome: &CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::Blocked { retry_after } => (*retry_after).max(Duration::from_millis(1)),
            CycleOutcome::Saturated
            | CycleOutcome::Deferred
            | CycleOutcome::Idle
            | CycleOutcome::StoreUnavailable { .. } => self.idle_backoff,
            CycleOutcome::ClaimConflict { .. } => Duration::ZERO,
            CycleOutcome::Dispatched { .. } => {
                Duration::from_millis(self.throttle_ms.load(Ordering::SeqCst))
            }
        }
    }

    async fn execute(self: Arc<Self>, request: Request, permit: OwnedSemaphorePermit) {
        let started = Instant::now();
        let result = self.run_executor(&request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let request_id = request.request_id.clone();
        let source_agent = request.source_agent.clone();
        let priority = request.priority;
        let attempt = request.attempt_count;
        let status = self.settle(request, result).await;

        self.release_slot(permit);
        let active = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        self.publish_load(active).await;
        if active == 0 {
            self.drained.notify_waiters();
        }

        self.report(DispatchOutcome {
            request_id,
            source_agent,
            priority,
            attempt,
            duration_ms,
            status,
        });
    }

    /// Call the executor, refreshing the claim every half TTL until it returns.
    ///
    /// A panicking executor counts as a failed run.
    async fn run_executor(&self, request: &Request) -> Result<ExecutionResult, anyhow::Error> {
        let refresh = (self.coordinator.config().claim_ttl() / 2).max(Duration::from_millis(1));
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + refresh, refresh);
        let dispatch = AssertUnwindSafe(self.executor.dispatch(&request.payload)).catch_unwind();
        tokio::pin!(dispatch);

        loop {
            tokio::select! {
                result = &mut dispatch => {
                    return result.unwrap_or_else(|panic| {
                        Err(anyhow::anyhow!("executor panicked: {}", panic_message(&*panic)))
                    });
                }
                _ = ticker.tick() => {
                    match self.coordinator.extend_claim(&request.request_id).await {
                        Ok(true) => debug!(request_id = %request.request_id, "claim extended"),
                        Ok(false) => warn!(
                            request_id = %request.request_id,
                            kind = %ErrorKind::ClaimConflict,
                            "claim lost during execution"
                        ),
                        Err(e) => warn!(
                            request_id = %request.request_id,
                            kind = %ErrorKind::CoordinationStoreUnavailable,
                            error = %e,
                            "claim extension failed"
                        ),
                    }
                }
            }
        }
    }

    /// Turn an executor result into a status, releasing the claim and
    /// recycling rate-limited requests.
    async fn settle(
        &self,
        mut request: Request,
        result: Result<ExecutionResult, anyhow::Error>,
    ) -> DispatchStatus {
        let error_text = match result {
            Ok(result) if result.success => {
                self.release_claim(&request.request_id).await;
                debug!(request_id = %request.request_id, "request completed");
                return DispatchStatus::Completed {
                    output: result.output,
                };
            }
            Ok(result) => result.error_text().to_string(),
            Err(e) => format!("{:#}", e),
        };

        let kind = self.limiter.classify_error(&error_text);
        if kind != ErrorKind::TransientUpstreamRateLimit {
            self.release_claim(&request.request_id).await;
            warn!(request_id = %request.request_id, kind = %kind, "request failed");
            return DispatchStatus::Failed {
                kind,
                error: error_text,
            };
        }

        let retry_after = self.limiter.handle_rate_limit();
        self.release_claim(&request.request_id).await;

        let next_attempt = request.attempt_count + 1;
        if self.max_attempts.is_some_and(|max| next_attempt > max) {
            warn!(
                request_id = %request.request_id,
                kind = %kind,
                attempts = next_attempt,
                "giving up after repeated rate limits"
            );
            return DispatchStatus::Failed {
                kind,
                error: format!("rate limited on {} attempts", next_attempt),
            };
        }

        request.attempt_count = next_attempt;
        let request_id = request.request_id.clone();
        if let Err(e) = self.queue.requeue(request) {
            debug!(request_id = %request_id, error = %e, "request already queued again");
        }
        DispatchStatus::Requeued {
            retry_after_ms: retry_after.as_millis() as u64,
        }
    }

    async fn release_claim(&self, request_id: &str) {
        match self.coordinator.release_request(request_id).await {
            Ok(true) => {}
            Ok(false) => debug!(request_id, "claim already gone at release"),
            Err(e) => warn!(
                request_id,
                kind = %ErrorKind::CoordinationStoreUnavailable,
                error = %e,
                "claim release failed; it will expire"
            ),
        }
    }

    async fn publish_load(&self, active: u32) {
        if let Some(health) = &self.health {
            health.set_active_requests(active);
        }
        if let Err(e) = self.coordinator.update_load(active).await {
            warn!(
                kind = %ErrorKind::CoordinationStoreUnavailable,
                error = %e,
                "load update failed"
            );
        }
    }

    fn report(&self, outcome: DispatchOutcome) {
        if let Some(tx) = &self.outcomes {
            if tx.send(outcome).is_err() {
                debug!("outcome receiver dropped");
            }
        }
    }

    fn try_acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    fn release_slot(&self, permit: OwnedSemaphorePermit) {
        let owed = self
            .shrink_debt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
            .is_ok();
        if owed {
            permit.forget();
        } else {
            drop(permit);
        }
        self.slot_freed.notify_one();
    }

    /// Stop dequeuing until `resume`. In-flight requests continue.
    pub fn pause(&self) -> AdminState {
        self.queue.pause(OPERATOR_PAUSE_REASON);
        self.admin_state()
    }

    /// Lift any pause, including one set by the rate limiter.
    pub fn resume(&self) -> AdminState {
        self.queue.resume();
        self.admin_state()
    }

    /// Drop queued requests from one tier, or from all tiers.
    pub fn clear_queue(&self, tier: Option<PriorityTier>) -> AdminState {
        let removed = self.queue.clear_queue(tier);
        info!(removed, tier = ?tier, "queue cleared");
        self.admin_state()
    }

    /// Resize the executor slot pool.
    ///
    /// Growing takes effect at once. Shrinking retires free slots at once
    /// and busy ones as their requests finish.
    pub fn set_concurrency(&self, max_concurrent: usize) -> Result<AdminState, ConfigError> {
        if max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let previous = self.max_concurrent.swap(max_concurrent, Ordering::SeqCst);
        if max_concurrent > previous {
            let grow = max_concurrent - previous;
            let owed = match self.shrink_debt.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
                Some(d.saturating_sub(grow))
            }) {
                Ok(owed) | Err(owed) => owed,
            };
            let added = grow - owed.min(grow);
            if added > 0 {
                self.semaphore.add_permits(added);
                self.slot_freed.notify_one();
            }
        } else if max_concurrent < previous {
            let shrink = previous - max_concurrent;
            let retired = self.semaphore.forget_permits(shrink);
            self.shrink_debt.fetch_add(shrink - retired, Ordering::SeqCst);
        }

        info!(from = previous, to = max_concurrent, "concurrency changed");
        Ok(self.admin_state())
    }

    /// Delay inserted after every dispatch.
    pub fn set_throttle(&self, delay_ms: u64) -> AdminState {
        self.throttle_ms.store(delay_ms, Ordering::SeqCst);
        info!(delay_ms, "throttle changed");
        self.admin_state()
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState {
            paused: self.queue.is_paused(),
            pause_reason: self.queue.pause_reason(),
            max_concurrent: self.max_concurrent(),
            throttle_ms: self.throttle_ms.load(Ordering::SeqCst),
            queued: self.queue.len(),
        }
    }

    /// Observability view. Store failures leave the cluster parts empty.
    pub async fn snapshot(&self) -> DispatchSnapshot {
        let rate = self.limiter.stats();
        let loads = match self.coordinator.get_all_loads().await {
            Ok(loads) => loads,
            Err(e) => {
                warn!(
                    kind = %ErrorKind::CoordinationStoreUnavailable,
                    error = %e,
                    "load lookup failed"
                );
                Vec::new()
            }
        };
        let cluster = match &self.health {
            Some(health) => match health.get_health_summary().await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!(
                        kind = %ErrorKind::CoordinationStoreUnavailable,
                        error = %e,
                        "health lookup failed"
                    );
                    None
                }
            },
            None => None,
        };

        DispatchSnapshot {
            instance_id: self.coordinator.instance_id().to_string(),
            queue: self.queue.stats(),
            blocked_until: rate.blocked_until,
            rate,
            active_requests: self.active_requests(),
            max_concurrent: self.max_concurrent(),
            throttle_ms: self.throttle_ms.load(Ordering::SeqCst),
            loads,
            cluster,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
