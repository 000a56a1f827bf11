// ABOUTME: Publishes this instance's heartbeat and reads the cluster's liveness view.
// ABOUTME: Registry entries whose last update is too old are pruned on read.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::local_hostname;
use crate::clock::SharedClock;
use crate::config::HealthConfig;
use crate::error::{ErrorKind, StoreError};
use crate::store::{SharedStore, keys};

/// One heartbeat, stored under the instance's health key with a TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub instance_id: String,
    pub timestamp: u64,
    pub uptime_ms: u64,
    pub pid: u32,
    pub active_requests: u32,
    /// Resident set size, where the platform exposes it.
    pub memory_rss_bytes: Option<u64>,
    /// Process CPU usage since the previous snapshot; 100.0 is one core.
    pub cpu_usage_percent: Option<f32>,
}

/// Persistent registry record for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRegistryEntry {
    pub hostname: String,
    pub pid: u32,
    pub start_time: u64,
    pub last_update: u64,
}

/// Liveness of one registered instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub instance_id: String,
    /// The instance's health key has not expired.
    pub alive: bool,
    pub entry: InstanceRegistryEntry,
    pub snapshot: Option<HealthSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub self_health: HealthSnapshot,
    pub alive: usize,
    pub total: usize,
    pub instances: Vec<InstanceHealth>,
}

/// Heartbeat publisher and cluster liveness reader.
pub struct HealthMonitor {
    store: SharedStore,
    instance_id: String,
    key_prefix: String,
    config: HealthConfig,
    clock: SharedClock,
    hostname: String,
    started_at: u64,
    active_requests: AtomicU32,
    pid: Pid,
    system: Mutex<System>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        store: SharedStore,
        instance_id: impl Into<String>,
        config: HealthConfig,
        key_prefix: impl Into<String>,
        clock: SharedClock,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let started_at = clock.now_ms();
        Self {
            store,
            instance_id: instance_id.into(),
            key_prefix: key_prefix.into(),
            config,
            clock,
            hostname: local_hostname(),
            started_at,
            active_requests: AtomicU32::new(0),
            pid: Pid::from_u32(std::process::id()),
            system: Mutex::new(System::new()),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Report the number of in-flight requests in the next heartbeat.
    pub fn set_active_requests(&self, active: u32) {
        self.active_requests.store(active, Ordering::Relaxed);
    }

    /// This instance's health as of now, without touching the store.
    pub fn current_snapshot(&self) -> HealthSnapshot {
        let now = self.clock.now_ms();
        let (memory_rss_bytes, cpu_usage_percent) = self.sample_process();
        HealthSnapshot {
            instance_id: self.instance_id.clone(),
            timestamp: now,
            uptime_ms: now.saturating_sub(self.started_at),
            pid: self.pid.as_u32(),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            memory_rss_bytes,
            cpu_usage_percent,
        }
    }

    /// Memory and CPU of this process. CPU reads 0 on the first sample.
    fn sample_process(&self) -> (Option<u64>, Option<f32>) {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        match system.process(self.pid) {
            Some(process) => (Some(process.memory()), Some(process.cpu_usage())),
            None => (None, None),
        }
    }

    /// Write one heartbeat and refresh the registry entry.
    pub async fn publish(&self) -> Result<HealthSnapshot, StoreError> {
        let snapshot = self.current_snapshot();
        let health_key = keys::health_key(&self.key_prefix, &self.instance_id);
        self.store
            .set(
                &health_key,
                &serde_json::to_string(&snapshot)?,
                Some(Duration::from_millis(self.config.health_ttl_ms)),
            )
            .await?;

        let entry = InstanceRegistryEntry {
            hostname: self.hostname.clone(),
            pid: snapshot.pid,
            start_time: self.started_at,
            last_update: snapshot.timestamp,
        };
        self.store
            .hash_set(
                &keys::registry_key(&self.key_prefix),
                &self.instance_id,
                &serde_json::to_string(&entry)?,
            )
            .await?;
        Ok(snapshot)
    }

    /// Publish immediately, then keep publishing every heartbeat interval.
    ///
    /// The first heartbeat must succeed; later failures are logged and
    /// retried on the next tick. Calling `start` while running is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        if self.task.lock().as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        self.publish().await?;
        self.shutdown_tx.send_replace(false);

        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = Duration::from_millis(self.config.heartbeat_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.publish().await {
                            warn!(
                                instance_id = %monitor.instance_id,
                                kind = %ErrorKind::CoordinationStoreUnavailable,
                                error = %e,
                                "heartbeat failed"
                            );
                        }
                    }
                }
            }
            debug!(instance_id = %monitor.instance_id, "heartbeat loop stopped");
        });
        *self.task.lock() = Some(handle);
        info!(instance_id = %self.instance_id, "health monitor started");
        Ok(())
    }

    /// Stop the heartbeat loop and wait for it to exit.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Every registered instance, sorted by id.
    ///
    /// Entries not updated within `dead_instance_threshold_ms` are removed
    /// from the registry and left out of the result.
    pub async fn get_all_instances_health(&self) -> Result<Vec<InstanceHealth>, StoreError> {
        let registry_key = keys::registry_key(&self.key_prefix);
        let now = self.clock.now_ms();
        let mut instances = Vec::new();

        for (instance_id, raw) in self.store.hash_get_all(&registry_key).await? {
            let entry = match serde_json::from_str::<InstanceRegistryEntry>(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        instance_id = %instance_id,
                        error = %e,
                        "skipping malformed registry entry"
                    );
                    continue;
                }
            };

            let health_key = keys::health_key(&self.key_prefix, &instance_id);
            if now.saturating_sub(entry.last_update) > self.config.dead_instance_threshold_ms {
                self.store.hash_delete(&registry_key, &instance_id).await?;
                self.store.delete(&health_key).await?;
                info!(
                    instance_id = %instance_id,
                    last_update = entry.last_update,
                    "pruned dead instance"
                );
                continue;
            }

            let raw_health = self.store.get(&health_key).await?;
            let snapshot = raw_health
                .as_deref()
                .and_then(|raw| serde_json::from_str::<HealthSnapshot>(raw).ok());
            instances.push(InstanceHealth {
                instance_id,
                alive: raw_health.is_some(),
                entry,
                snapshot,
            });
        }

        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }

    /// This instance's snapshot plus cluster alive/total counts.
    pub async fn get_health_summary(&self) -> Result<HealthSummary, StoreError> {
        let instances = self.get_all_instances_health().await?;
        Ok(HealthSummary {
            self_health: self.current_snapshot(),
            alive: instances.iter().filter(|i| i.alive).count(),
            total: instances.len(),
            instances,
        })
    }

    /// Stop heartbeating and remove this instance from the cluster view.
    pub async fn cleanup(&self) -> Result<(), StoreError> {
        self.stop().await;
        self.store
            .hash_delete(&keys::registry_key(&self.key_prefix), &self.instance_id)
            .await?;
        self.store
            .delete(&keys::health_key(&self.key_prefix, &self.instance_id))
            .await?;
        info!(instance_id = %self.instance_id, "deregistered");
        Ok(())
    }
}
