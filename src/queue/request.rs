// ABOUTME: Request and PriorityTier types plus the inbound EnqueueRequest shape.
// ABOUTME: Tier parsing is where InvalidPriority errors originate.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Fixed priority levels, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Urgent,
    High,
    Normal,
    Low,
}

impl PriorityTier {
    /// All tiers in dequeue order.
    pub const ALL: [PriorityTier; 4] = [
        PriorityTier::Urgent,
        PriorityTier::High,
        PriorityTier::Normal,
        PriorityTier::Low,
    ];

    /// Position in dequeue order (0 is served first).
    pub fn index(self) -> usize {
        match self {
            PriorityTier::Urgent => 0,
            PriorityTier::High => 1,
            PriorityTier::Normal => 2,
            PriorityTier::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityTier::Urgent => "urgent",
            PriorityTier::High => "high",
            PriorityTier::Normal => "normal",
            PriorityTier::Low => "low",
        }
    }
}

impl std::fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PriorityTier {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "urgent" => Ok(PriorityTier::Urgent),
            "high" => Ok(PriorityTier::High),
            "normal" => Ok(PriorityTier::Normal),
            "low" => Ok(PriorityTier::Low),
            _ => Err(QueueError::InvalidPriority(s.to_string())),
        }
    }
}

/// A unit of work waiting for the shared execution tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-unique identifier; also the claim key.
    pub request_id: String,
    /// Agent that submitted the request.
    pub source_agent: String,
    pub priority: PriorityTier,
    /// Opaque to this crate. Never logged.
    pub payload: serde_json::Value,
    /// Earliest dispatch time (epoch ms), if deferred.
    pub scheduled_at: Option<u64>,
    /// When the request entered the queue (epoch ms).
    pub enqueued_at: u64,
    /// Times this request was recycled after a rate limit.
    pub attempt_count: u32,
}

impl Request {
    /// Create a request with no schedule and zero attempts.
    ///
    /// `enqueued_at` is stamped by the queue on enqueue.
    pub fn new(
        request_id: impl Into<String>,
        source_agent: impl Into<String>,
        priority: PriorityTier,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            source_agent: source_agent.into(),
            priority,
            payload,
            scheduled_at: None,
            enqueued_at: 0,
            attempt_count: 0,
        }
    }

    /// Defer the request until `at_ms`.
    pub fn scheduled_at(mut self, at_ms: u64) -> Self {
        self.scheduled_at = Some(at_ms);
        self
    }

    /// True when the request may not be dispatched yet.
    pub fn is_deferred(&self, now_ms: u64) -> bool {
        self.scheduled_at.is_some_and(|at| at > now_ms)
    }
}

/// Inbound enqueue shape, as received from agents.
///
/// The tier is kept as text so an unknown value surfaces as
/// `QueueError::InvalidPriority` instead of a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub request_id: String,
    pub priority: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub scheduled_at: Option<u64>,
    pub source_agent: String,
}

impl EnqueueRequest {
    /// Validate and convert into a queueable request.
    pub fn into_request(self) -> Result<Request, QueueError> {
        if self.request_id.trim().is_empty() {
            return Err(QueueError::InvalidRequest(
                "request_id must not be empty".to_string(),
            ));
        }
        let priority: PriorityTier = self.priority.parse()?;
        Ok(Request {
            request_id: self.request_id,
            source_agent: self.source_agent,
            priority,
            payload: self.payload,
            scheduled_at: self.scheduled_at,
            enqueued_at: 0,
            attempt_count: 0,
        })
    }
}
