// ABOUTME: DispatchNode - builds every component from one config and runs the background loops.
// ABOUTME: Shutdown stops the loops, drains in-flight work, and deregisters the instance.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::{SharedClock, system_clock};
use crate::config::ToolgateConfig;
use crate::coordinator::{
    ErrorClassifier, InstanceCoordinator, RandomSource, RateLimiter, ThreadRandom,
};
use crate::dispatcher::{DispatchOutcome, DispatchSnapshot, Dispatcher, Executor};
use crate::error::{QueueError, ToolgateError};
use crate::health::{HealthMonitor, local_hostname};
use crate::queue::{EnqueueRequest, PriorityQueueManager, Request};
use crate::store::SharedStore;

/// Builder for a [`DispatchNode`].
pub struct NodeBuilder {
    config: ToolgateConfig,
    store: SharedStore,
    executor: Arc<dyn Executor>,
    clock: SharedClock,
    random: Arc<dyn RandomSource>,
    classifier: Option<Arc<dyn ErrorClassifier>>,
    outcomes: Option<mpsc::UnboundedSender<DispatchOutcome>>,
}

impl NodeBuilder {
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Replace the pattern classifier built from `rate_limit.error_patterns`.
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<DispatchOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    /// Validate the config, publish the first heartbeat, and start the
    /// dispatch, heartbeat, load-refresh and claim-cleanup loops.
    pub async fn start(self) -> Result<DispatchNode, ToolgateError> {
        let config = self.config;
        config.validate()?;

        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(generate_instance_id);

        let queue = Arc::new(PriorityQueueManager::new(self.clock.clone()));
        let mut limiter = RateLimiter::new(config.rate_limit.clone(), self.clock.clone())?;
        if let Some(classifier) = self.classifier {
            limiter = limiter.with_classifier(classifier);
        }
        let limiter = Arc::new(limiter);
        let coordinator = Arc::new(InstanceCoordinator::new(
            self.store.clone(),
            instance_id.clone(),
            config.coordination.clone(),
            self.clock.clone(),
            self.random,
        ));
        let health = Arc::new(HealthMonitor::new(
            self.store,
            instance_id.clone(),
            config.health.clone(),
            config.coordination.key_prefix.clone(),
            self.clock,
        ));

        let mut dispatcher = Dispatcher::new(
            queue,
            limiter,
            coordinator.clone(),
            self.executor,
            &config.dispatcher,
        )?
        .with_health(health.clone());
        if let Some(tx) = self.outcomes {
            dispatcher = dispatcher.with_outcomes(tx);
        }
        let dispatcher = Arc::new(dispatcher);

        health.start().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            coordinator.spawn_cleanup_task(shutdown_rx.clone()),
            dispatcher.clone().spawn_load_refresh(shutdown_rx.clone()),
            tokio::spawn(dispatcher.clone().run(shutdown_rx)),
        ];

        info!(instance_id = %instance_id, "dispatch node started");
        Ok(DispatchNode {
            instance_id,
            dispatcher,
            health,
            shutdown_tx,
            tasks,
        })
    }
}

/// One running coordinator instance.
///
/// Owns its store handle through the components it built; the handle is
/// released when the node is shut down and dropped.
pub struct DispatchNode {
    instance_id: String,
    dispatcher: Arc<Dispatcher>,
    health: Arc<HealthMonitor>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatchNode {
    pub fn builder(
        config: ToolgateConfig,
        store: SharedStore,
        executor: Arc<dyn Executor>,
    ) -> NodeBuilder {
        NodeBuilder {
            config,
            store,
            executor,
            clock: system_clock(),
            random: Arc::new(ThreadRandom),
            classifier: None,
            outcomes: None,
        }
    }

    /// Start a node with the system clock and thread RNG.
    pub async fn start(
        config: ToolgateConfig,
        store: SharedStore,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, ToolgateError> {
        Self::builder(config, store, executor).start().await
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Validate and enqueue a request on this instance.
    pub fn submit(&self, request: EnqueueRequest) -> Result<Request, QueueError> {
        self.dispatcher.queue().submit(request)
    }

    pub async fn snapshot(&self) -> DispatchSnapshot {
        self.dispatcher.snapshot().await
    }

    /// Stop all loops, wait for in-flight requests, and deregister.
    pub async fn shutdown(self) -> Result<(), ToolgateError> {
        info!(instance_id = %self.instance_id, "dispatch node shutting down");
        self.shutdown_tx.send_replace(true);
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        self.health.cleanup().await?;
        info!(instance_id = %self.instance_id, "dispatch node stopped");
        Ok(())
    }
}

/// `{hostname}-{pid}-{8 hex chars}`; unique across restarts on one host.
pub fn generate_instance_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", local_hostname(), std::process::id(), &suffix[..8])
}
