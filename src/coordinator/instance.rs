// ABOUTME: Cross-instance coordination through the shared store.
// ABOUTME: Per-request TTL claims for mutual exclusion, plus advisory load publishing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::random::RandomSource;
use crate::clock::SharedClock;
use crate::config::CoordinationConfig;
use crate::error::{ErrorKind, StoreError};
use crate::store::{KeyTtl, SharedStore, keys};

/// Advisory load published by each instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRecord {
    pub instance_id: String,
    pub active_requests: u32,
    pub capacity: u32,
    /// When the record was published (epoch ms).
    pub timestamp: u64,
}

impl LoadRecord {
    /// Active requests as a fraction of capacity.
    pub fn ratio(&self) -> f64 {
        self.active_requests as f64 / self.capacity.max(1) as f64
    }
}

/// Coordinates request ownership and load across redundant instances.
///
/// # Claim Semantics
///
/// - **Atomic claim:** `claim_request()` is one create-or-refresh-if-owner
///   write; only the instance whose id is stored owns the request.
/// - **Ownership verification:** `extend_claim()` and `release_request()`
///   only act when the stored owner is this instance.
/// - **Crash recovery:** claims carry a TTL, so a crashed owner's requests
///   become claimable again once it runs out.
pub struct InstanceCoordinator {
    store: SharedStore,
    instance_id: String,
    config: CoordinationConfig,
    clock: SharedClock,
    random: Arc<dyn RandomSource>,
    /// Last active count passed to `update_load`, published or not.
    local_active: AtomicU32,
}

fn least_loaded(loads: &[LoadRecord]) -> Option<&LoadRecord> {
    loads.iter().min_by(|a, b| {
        a.ratio()
            .total_cmp(&b.ratio())
            .then_with(|| a.instance_id.cmp(&b.instance_id))
    })
}

impl InstanceCoordinator {
    pub fn new(
        store: SharedStore,
        instance_id: impl Into<String>,
        config: CoordinationConfig,
        clock: SharedClock,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            config,
            clock,
            random,
            local_active: AtomicU32::new(0),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Try to take exclusive ownership of a request.
    ///
    /// Returns `Ok(true)` if the claim was free or already held by this
    /// instance (a leftover from a failed release or a lost write reply);
    /// the TTL restarts either way. A store error is never a win.
    pub async fn claim_request(&self, request_id: &str) -> Result<bool, StoreError> {
        let key = keys::claim_key(&self.config.key_prefix, request_id);
        let won = self
            .store
            .acquire_lease(&key, &self.instance_id, self.config.claim_ttl())
            .await?;
        if won {
            debug!(request_id, instance_id = %self.instance_id, "claim acquired");
        } else {
            debug!(request_id, kind = %ErrorKind::ClaimConflict, "claim held by another instance");
        }
        Ok(won)
    }

    /// Refresh the claim TTL if this instance still owns it.
    pub async fn extend_claim(&self, request_id: &str) -> Result<bool, StoreError> {
        let key = keys::claim_key(&self.config.key_prefix, request_id);
        let extended = self
            .store
            .expire_if_value(&key, &self.instance_id, self.config.claim_ttl())
            .await?;
        if !extended {
            debug!(request_id, "claim not extended; not the owner");
        }
        Ok(extended)
    }

    /// Release the claim if this instance owns it.
    pub async fn release_request(&self, request_id: &str) -> Result<bool, StoreError> {
        let key = keys::claim_key(&self.config.key_prefix, request_id);
        let released = self.store.delete_if_value(&key, &self.instance_id).await?;
        if released {
            debug!(request_id, "claim released");
        }
        Ok(released)
    }

    /// Current owner of a request's claim, if any.
    pub async fn claim_owner(&self, request_id: &str) -> Result<Option<String>, StoreError> {
        let key = keys::claim_key(&self.config.key_prefix, request_id);
        self.store.get(&key).await
    }

    /// Publish this instance's load with a TTL.
    pub async fn update_load(&self, active_requests: u32) -> Result<LoadRecord, StoreError> {
        self.local_active.store(active_requests, Ordering::SeqCst);
        let record = self.local_load();
        let key = keys::load_key(&self.config.key_prefix, &self.instance_id);
        let value = serde_json::to_string(&record)?;
        self.store
            .set(&key, &value, Some(self.config.load_ttl()))
            .await?;
        Ok(record)
    }

    /// This instance's load as last reported, without reading the store.
    pub fn local_load(&self) -> LoadRecord {
        LoadRecord {
            instance_id: self.instance_id.clone(),
            active_requests: self.local_active.load(Ordering::SeqCst),
            capacity: self.config.capacity,
            timestamp: self.clock.now_ms(),
        }
    }

    /// All unexpired load records, sorted by instance id.
    pub async fn get_all_loads(&self) -> Result<Vec<LoadRecord>, StoreError> {
        let pattern = keys::loads_pattern(&self.config.key_prefix);
        let mut records = Vec::new();
        for key in self.store.scan(&pattern).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<LoadRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %key, error = %e, "skipping malformed load record"),
            }
        }
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(records)
    }

    /// The instance with the lowest active/capacity ratio.
    ///
    /// Ties go to the lowest instance id so every instance agrees.
    pub async fn get_least_loaded_instance(&self) -> Result<Option<LoadRecord>, StoreError> {
        let loads = self.get_all_loads().await?;
        Ok(least_loaded(&loads).cloned())
    }

    /// Decide whether this instance should pick up the next request.
    ///
    /// Proceeds when this instance is least loaded or no peers are visible.
    /// Otherwise a fair coin flip decides, which spreads contention when
    /// several instances look equally idle. Store failures proceed. If this
    /// instance's own record has expired, its local load stands in for it.
    pub async fn should_process_request(&self) -> bool {
        let mut loads = match self.get_all_loads().await {
            Ok(loads) => loads,
            Err(e) => {
                warn!(
                    kind = %ErrorKind::CoordinationStoreUnavailable,
                    error = %e,
                    "load lookup failed; proceeding"
                );
                return true;
            }
        };

        if !loads.iter().any(|l| l.instance_id == self.instance_id) {
            loads.push(self.local_load());
        }
        if loads.iter().all(|l| l.instance_id == self.instance_id) {
            return true;
        }

        if least_loaded(&loads).is_some_and(|l| l.instance_id == self.instance_id) {
            return true;
        }

        let proceed = self.random.coin_flip();
        debug!(proceed, "not least loaded; coin flip");
        proceed
    }

    /// Delete claim keys that carry no TTL.
    ///
    /// Such keys never expire and would pin their request forever; they can
    /// only come from a faulty or legacy writer.
    pub async fn cleanup_old_claims(&self) -> Result<usize, StoreError> {
        let pattern = keys::claims_pattern(&self.config.key_prefix);
        let mut removed = 0;
        for key in self.store.scan(&pattern).await? {
            let persistent = self.store.ttl(&key).await? == KeyTtl::Persistent;
            if persistent && self.store.delete(&key).await? {
                warn!(key = %key, "removed claim without ttl");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Run `cleanup_old_claims` every `cleanup_interval_ms` until shutdown.
    pub fn spawn_cleanup_task(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let period = Duration::from_millis(self.config.cleanup_interval_ms);
        tokio::spawn(async move {
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
                        match self.cleanup_old_claims().await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "claim cleanup finished"),
                            Err(e) => warn!(
                                kind = %ErrorKind::CoordinationStoreUnavailable,
                                error = %e,
                                "claim cleanup failed"
                            ),
                        }
                    }
                }
            }
            debug!("claim cleanup task stopped");
        })
    }
}
