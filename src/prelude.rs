// ABOUTME: Prelude module - convenient imports for common use cases.
// ABOUTME: Use `use toolgate::prelude::*;` to get started quickly.

pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use crate::config::{
    CoordinationConfig, DispatcherConfig, HealthConfig, RateLimitConfig, ToolgateConfig,
};
pub use crate::coordinator::{
    ErrorClassifier, FixedRandom, InstanceCoordinator, LoadRecord, PatternClassifier,
    RATE_LIMIT_PAUSE_REASON, RandomSource, RateLimitStats, RateLimiter, ThreadRandom,
};
pub use crate::dispatcher::{
    AdminState, CycleOutcome, DispatchOutcome, DispatchSnapshot, DispatchStatus, Dispatcher,
    ExecutionResult, Executor, OPERATOR_PAUSE_REASON,
};
pub use crate::error::{ConfigError, ErrorKind, QueueError, StoreError, ToolgateError};
pub use crate::health::{HealthMonitor, HealthSnapshot, HealthSummary, InstanceHealth};
pub use crate::node::{DispatchNode, NodeBuilder};
pub use crate::queue::{EnqueueRequest, PriorityQueueManager, PriorityTier, QueueStats, Request};
#[cfg(feature = "redis")]
pub use crate::store::RedisStore;
pub use crate::store::{CoordinationStore, KeyTtl, MemoryStore, SharedStore};
