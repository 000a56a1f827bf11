// ABOUTME: PriorityQueueManager - tiered FIFO queues plus a time-ordered scheduled set.
// ABOUTME: Exposes pause/resume so rate-limit backpressure can stop dequeues.

use std::collections::{BTreeMap, HashSet, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{EnqueueRequest, PriorityTier, Request};
use crate::clock::SharedClock;
use crate::error::QueueError;

/// Queue depth per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDepths {
    pub urgent: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl TierDepths {
    pub fn get(&self, tier: PriorityTier) -> usize {
        match tier {
            PriorityTier::Urgent => self.urgent,
            PriorityTier::High => self.high,
            PriorityTier::Normal => self.normal,
            PriorityTier::Low => self.low,
        }
    }
}

/// Read-only view of the queue for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Ready requests per tier.
    pub depths: TierDepths,
    /// Requests waiting for their scheduled time.
    pub scheduled: usize,
    /// Ready plus scheduled.
    pub total: usize,
    pub paused: bool,
    pub pause_reason: Option<String>,
    /// Earliest pending scheduled time, if any.
    pub next_scheduled_at: Option<u64>,
}

#[derive(Default)]
struct QueueState {
    tiers: [VecDeque<Request>; 4],
    /// Keyed by (scheduled_at, insertion sequence) so equal times stay FIFO.
    scheduled: BTreeMap<(u64, u64), Request>,
    next_seq: u64,
    queued_ids: HashSet<String>,
    paused: Option<String>,
}

impl QueueState {
    fn insert(&mut self, request: Request, now_ms: u64) {
        self.queued_ids.insert(request.request_id.clone());
        match request.scheduled_at {
            Some(at) if at > now_ms => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.scheduled.insert((at, seq), request);
            }
            _ => self.tiers[request.priority.index()].push_back(request),
        }
    }

    /// Move every scheduled request whose time has come into its tier.
    fn promote_due(&mut self, now_ms: u64) -> usize {
        let mut promoted = 0;
        while let Some(entry) = self.scheduled.first_entry() {
            if entry.key().0 > now_ms {
                break;
            }
            let request = entry.remove();
            self.tiers[request.priority.index()].push_back(request);
            promoted += 1;
        }
        promoted
    }

    fn ready_len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }
}

/// Priority queue manager.
///
/// Requests are served in strict tier order (`urgent > high > normal > low`),
/// FIFO within a tier. Requests with a future `scheduled_at` wait in a
/// separate set and are promoted into their tier on the first dequeue at or
/// after that time.
pub struct PriorityQueueManager {
    state: Mutex<QueueState>,
    clock: SharedClock,
}

impl PriorityQueueManager {
    /// Create an empty, unpaused queue.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
        }
    }

    /// Validate and enqueue an inbound request.
    ///
    /// Returns the request as stored (with `enqueued_at` stamped).
    pub fn submit(&self, inbound: EnqueueRequest) -> Result<Request, QueueError> {
        let request = inbound.into_request()?;
        self.enqueue(request)
    }

    /// Enqueue a request into its tier, or the scheduled set when deferred.
    pub fn enqueue(&self, mut request: Request) -> Result<Request, QueueError> {
        if request.request_id.trim().is_empty() {
            return Err(QueueError::InvalidRequest(
                "request_id must not be empty".to_string(),
            ));
        }

        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if state.queued_ids.contains(&request.request_id) {
            return Err(QueueError::DuplicateRequest(request.request_id));
        }

        request.enqueued_at = now;
        debug!(
            request_id = %request.request_id,
            priority = %request.priority,
            deferred = request.is_deferred(now),
            "request enqueued"
        );
        state.insert(request.clone(), now);
        Ok(request)
    }

    /// Put a recycled request back at the tail of its original tier.
    ///
    /// Works while paused. `attempt_count` is left to the caller.
    pub fn requeue(&self, request: Request) -> Result<(), QueueError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if state.queued_ids.contains(&request.request_id) {
            return Err(QueueError::DuplicateRequest(request.request_id));
        }
        debug!(
            request_id = %request.request_id,
            attempt = request.attempt_count,
            "request requeued"
        );
        state.insert(request, now);
        Ok(())
    }

    /// Return the next request to dispatch, or `None` when empty or paused.
    pub fn dequeue_next(&self) -> Option<Request> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        let promoted = state.promote_due(now);
        if promoted > 0 {
            debug!(promoted, "scheduled requests promoted");
        }

        if state.paused.is_some() {
            return None;
        }

        let request = state.tiers.iter_mut().find_map(VecDeque::pop_front)?;
        state.queued_ids.remove(&request.request_id);
        Some(request)
    }

    /// Whether `dequeue_next` would return a request right now.
    pub fn has_ready(&self) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.promote_due(now);
        state.paused.is_none() && state.ready_len() > 0
    }

    /// Stop handing out work.
    pub fn pause(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.paused.as_deref() != Some(reason) {
            info!(reason, "queue paused");
        }
        state.paused = Some(reason.to_string());
    }

    /// Pause only if not already paused, keeping any existing reason.
    ///
    /// Returns whether this call paused the queue.
    pub fn pause_if_running(&self, reason: &str) -> bool {
        let mut state = self.state.lock();
        if state.paused.is_some() {
            return false;
        }
        info!(reason, "queue paused");
        state.paused = Some(reason.to_string());
        true
    }

    /// Resume handing out work. Returns whether the queue was paused.
    pub fn resume(&self) -> bool {
        let mut state = self.state.lock();
        let was_paused = state.paused.take().is_some();
        if was_paused {
            info!("queue resumed");
        }
        was_paused
    }

    /// Resume only when the current pause was made with `reason`.
    pub fn resume_if_paused_by(&self, reason: &str) -> bool {
        let mut state = self.state.lock();
        if state.paused.as_deref() == Some(reason) {
            state.paused = None;
            info!(reason, "queue resumed");
            true
        } else {
            false
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused.is_some()
    }

    pub fn pause_reason(&self) -> Option<String> {
        self.state.lock().paused.clone()
    }

    /// Remove queued requests of one tier (or all with `None`), ready and
    /// scheduled alike. Returns how many were removed.
    pub fn clear_queue(&self, tier: Option<PriorityTier>) -> usize {
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut removed = Vec::new();

        for t in PriorityTier::ALL {
            if tier.is_none_or(|wanted| wanted == t) {
                removed.extend(state.tiers[t.index()].drain(..).map(|r| r.request_id));
            }
        }
        state.scheduled.retain(|_, request| {
            if tier.is_none_or(|wanted| wanted == request.priority) {
                removed.push(request.request_id.clone());
                false
            } else {
                true
            }
        });

        for id in &removed {
            state.queued_ids.remove(id);
        }
        info!(
            tier = tier.map(PriorityTier::as_str).unwrap_or("all"),
            removed = removed.len(),
            "queue cleared"
        );
        removed.len()
    }

    /// Cancel a request that is still queued. Returns whether it was found.
    pub fn remove(&self, request_id: &str) -> bool {
        let mut state = self.state.lock();
        if !state.queued_ids.remove(request_id) {
            return false;
        }
        for queue in state.tiers.iter_mut() {
            if let Some(pos) = queue.iter().position(|r| r.request_id == request_id) {
                queue.remove(pos);
                return true;
            }
        }
        state.scheduled.retain(|_, r| r.request_id != request_id);
        true
    }

    /// Whether a request id is currently queued (ready or scheduled).
    pub fn contains(&self, request_id: &str) -> bool {
        self.state.lock().queued_ids.contains(request_id)
    }

    /// Ready plus scheduled requests.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.ready_len() + state.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of depths and pause state.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let depths = TierDepths {
            urgent: state.tiers[PriorityTier::Urgent.index()].len(),
            high: state.tiers[PriorityTier::High.index()].len(),
            normal: state.tiers[PriorityTier::Normal.index()].len(),
            low: state.tiers[PriorityTier::Low.index()].len(),
        };
        QueueStats {
            depths,
            scheduled: state.scheduled.len(),
            total: state.ready_len() + state.scheduled.len(),
            paused: state.paused.is_some(),
            pause_reason: state.paused.clone(),
            next_scheduled_at: state.scheduled.keys().next().map(|(at, _)| *at),
        }
    }
}
