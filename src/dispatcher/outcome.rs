// ABOUTME: Result types reported by the dispatcher: per-cycle, per-request, admin, and snapshot.
// ABOUTME: All serializable so callers can forward them to logs or dashboards.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::{LoadRecord, RateLimitStats};
use crate::error::ErrorKind;
use crate::health::HealthSummary;
use crate::queue::{PriorityTier, QueueStats};

/// What a single dispatch cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The rate limiter refused; retry after the given delay.
    Blocked { retry_after: Duration },
    /// Every executor slot is taken.
    Saturated,
    /// A less loaded peer should take the work.
    Deferred,
    /// Nothing ready to dispatch.
    Idle,
    /// Another instance owns the request; it was dropped locally.
    ClaimConflict { request_id: String },
    /// The request was claimed and handed to the executor.
    Dispatched { request_id: String },
    /// The claim write failed; the request went back to its tier.
    StoreUnavailable { request_id: String },
}

/// Terminal or recycled result of one dispatched request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub request_id: String,
    pub source_agent: String,
    pub priority: PriorityTier,
    /// Zero-based attempt that produced this outcome.
    pub attempt: u32,
    pub duration_ms: u64,
    pub status: DispatchStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchStatus {
    Completed { output: String },
    Failed { kind: ErrorKind, error: String },
    Requeued { retry_after_ms: u64 },
}

impl DispatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DispatchStatus::Requeued { .. })
    }
}

/// State returned by every administrative command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminState {
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub max_concurrent: usize,
    pub throttle_ms: u64,
    pub queued: usize,
}

/// Point-in-time view of one dispatcher and, where visible, its cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSnapshot {
    pub instance_id: String,
    pub queue: QueueStats,
    pub rate: RateLimitStats,
    pub blocked_until: Option<u64>,
    pub active_requests: u32,
    pub max_concurrent: usize,
    pub throttle_ms: u64,
    /// Published loads of every live instance; empty when the store is down.
    pub loads: Vec<LoadRecord>,
    pub cluster: Option<HealthSummary>,
}
