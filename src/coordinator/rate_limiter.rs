// ABOUTME: Sliding-window rate limiter for the shared execution tool.
// ABOUTME: Blocks on detected rate limits, adapts its ceiling, and predicts time-to-limit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::classifier::{ErrorClassifier, PatternClassifier};
use crate::clock::SharedClock;
use crate::config::RateLimitConfig;
use crate::error::{ConfigError, ErrorKind};

/// Pause reason passed to the backpressure callbacks.
pub const RATE_LIMIT_PAUSE_REASON: &str = "rate limited";

/// Callback invoked on block and on unblock, with the pause reason.
pub type BackpressureCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Mutable state for the rate limiter, protected by a single mutex.
struct RateLimiterState {
    count: u32,
    window_start: u64,
    blocked_until: Option<u64>,
    rate_limit_hits: u64,
    effective_limit: u32,
    /// Hit times inside the adaptive hit window.
    recent_hits: VecDeque<u64>,
    /// Recent request times, used for velocity estimates.
    history: VecDeque<u64>,
    last_hit_at: Option<u64>,
    /// Start of the current quiet-period measurement for recovery.
    recovery_anchor: Option<u64>,
}

/// Read-only view of limiter state for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub count: u32,
    pub max_requests: u32,
    pub effective_limit: u32,
    pub window_ms: u64,
    pub window_start: u64,
    pub blocked: bool,
    pub blocked_until: Option<u64>,
    pub retry_after_ms: u64,
    pub rate_limit_hits: u64,
    pub last_hit_at: Option<u64>,
    pub requests_per_minute: f64,
    pub predicted_limit_in_ms: Option<u64>,
}

/// Sliding-window rate limiter.
///
/// Counts requests in a fixed-length window that restarts once `window_ms`
/// has elapsed since it began. A rate-limit signal from the executor blocks
/// all dispatch for `block_duration_ms`; any read after the block expires
/// transparently unblocks, resets the counter, and fires the resume callback.
///
/// In adaptive mode each hit multiplies the effective ceiling by
/// `1 - min(0.5, 0.1 * recent_hits)`; every `adaptive_recovery_ms` without a
/// hit adds back a tenth of the configured maximum.
pub struct RateLimiter {
    state: Mutex<RateLimiterState>,
    config: RateLimitConfig,
    classifier: Arc<dyn ErrorClassifier>,
    clock: SharedClock,
    on_pause: RwLock<Option<BackpressureCallback>>,
    on_resume: RwLock<Option<BackpressureCallback>>,
}

impl RateLimiter {
    /// Create a limiter whose classifier is built from the configured patterns.
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        if config.max_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_requests must be positive".to_string(),
            ));
        }
        if config.window_ms == 0 {
            return Err(ConfigError::Invalid("window_ms must be positive".to_string()));
        }
        let classifier = Arc::new(PatternClassifier::new(&config.error_patterns)?);
        let now = clock.now_ms();

        Ok(Self {
            state: Mutex::new(RateLimiterState {
                count: 0,
                window_start: now,
                blocked_until: None,
                rate_limit_hits: 0,
                effective_limit: config.max_requests,
                recent_hits: VecDeque::new(),
                history: VecDeque::with_capacity(config.history_size),
                last_hit_at: None,
                recovery_anchor: None,
            }),
            config,
            classifier,
            clock,
            on_pause: RwLock::new(None),
            on_resume: RwLock::new(None),
        })
    }

    /// Replace the error classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Register the callback fired when a rate limit starts a block.
    pub fn on_pause<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_pause.write() = Some(Arc::new(callback));
    }

    /// Register the callback fired when a block expires.
    pub fn on_resume<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_resume.write() = Some(Arc::new(callback));
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request against the current window.
    pub fn record_request(&self) {
        let now = self.clock.now_ms();
        let unblocked = {
            let mut state = self.state.lock();
            let unblocked = self.refresh(&mut state, now);
            state.count += 1;
            state.history.push_back(now);
            while state.history.len() > self.config.history_size {
                state.history.pop_front();
            }
            unblocked
        };
        if unblocked {
            self.fire_resume();
        }
    }

    /// Whether another request may be sent now.
    ///
    /// False while blocked or once the window count reaches the effective limit.
    pub fn check_limit(&self) -> bool {
        let now = self.clock.now_ms();
        let (allowed, unblocked) = {
            let mut state = self.state.lock();
            let unblocked = self.refresh(&mut state, now);
            let allowed = state.blocked_until.is_none() && state.count < state.effective_limit;
            (allowed, unblocked)
        };
        if unblocked {
            self.fire_resume();
        }
        allowed
    }

    /// Classify an executor error message.
    pub fn classify_error(&self, message: &str) -> ErrorKind {
        self.classifier.classify(message)
    }

    /// Whether an executor error message signals an upstream rate limit.
    pub fn is_rate_limit_error(&self, message: &str) -> bool {
        self.classifier.is_rate_limit(message)
    }

    /// React to a detected rate limit: block, count the hit, adapt, and pause.
    ///
    /// Returns how long dispatch is blocked for.
    pub fn handle_rate_limit(&self) -> Duration {
        let now = self.clock.now_ms();
        let block = self.config.block_duration_ms;
        let unblocked = {
            let mut state = self.state.lock();
            let unblocked = self.refresh(&mut state, now);

            state.blocked_until = Some(now + block);
            state.rate_limit_hits += 1;
            state.last_hit_at = Some(now);
            state.recent_hits.push_back(now);
            let horizon = now.saturating_sub(self.config.adaptive_hit_window_ms);
            while state.recent_hits.front().is_some_and(|t| *t < horizon) {
                state.recent_hits.pop_front();
            }

            if self.config.adaptive {
                let previous = state.effective_limit;
                state.effective_limit = self.reduced_limit(previous, state.recent_hits.len());
                state.recovery_anchor = Some(now);
                if state.effective_limit != previous {
                    info!(
                        from = previous,
                        to = state.effective_limit,
                        "adaptive rate limit lowered"
                    );
                }
            }

            warn!(
                kind = %ErrorKind::TransientUpstreamRateLimit,
                hits = state.rate_limit_hits,
                block_ms = block,
                "upstream rate limit detected; blocking dispatch"
            );
            unblocked
        };
        if unblocked {
            self.fire_resume();
        }
        self.fire_pause();
        Duration::from_millis(block)
    }

    /// Whether dispatch is currently blocked by a rate limit.
    pub fn is_blocked(&self) -> bool {
        self.read(|state, _| state.blocked_until.is_some())
    }

    /// Remaining block time, zero when not blocked.
    pub fn get_retry_after(&self) -> Duration {
        self.read(|state, now| {
            let remaining = state
                .blocked_until
                .map(|until| until.saturating_sub(now))
                .unwrap_or(0);
            Duration::from_millis(remaining)
        })
    }

    /// How long until `check_limit` can pass: the rest of the block, or of
    /// the window once it is full. Zero when a request may go now.
    pub fn time_until_allowed(&self) -> Duration {
        self.read(|state, now| {
            let remaining = match state.blocked_until {
                Some(until) => until.saturating_sub(now),
                None if state.count >= state.effective_limit => {
                    (state.window_start + self.config.window_ms).saturating_sub(now)
                }
                None => 0,
            };
            Duration::from_millis(remaining)
        })
    }

    /// End of the current block (epoch ms), if blocked.
    pub fn blocked_until(&self) -> Option<u64> {
        self.read(|state, _| state.blocked_until)
    }

    /// The ceiling currently enforced (below the maximum after adaptive cuts).
    pub fn get_effective_limit(&self) -> u32 {
        self.read(|state, _| state.effective_limit)
    }

    /// Requests counted in the current window.
    pub fn current_count(&self) -> u32 {
        self.read(|state, _| state.count)
    }

    /// Total rate-limit signals handled.
    pub fn rate_limit_hits(&self) -> u64 {
        self.read(|state, _| state.rate_limit_hits)
    }

    /// Recent request velocity, extrapolated to requests per minute.
    pub fn requests_per_minute(&self) -> f64 {
        self.read(|state, now| self.velocity_per_ms(state, now).unwrap_or(0.0) * 60_000.0)
    }

    /// Estimate how long until the effective limit is reached at the current
    /// request velocity.
    ///
    /// `Some(ZERO)` when already at the limit or blocked; `None` when there
    /// are too few recent requests to estimate a velocity.
    pub fn predict_rate_limit(&self) -> Option<Duration> {
        self.read(|state, now| self.predict(state, now))
    }

    /// Snapshot of counters, block state, and predictions.
    pub fn stats(&self) -> RateLimitStats {
        self.read(|state, now| RateLimitStats {
            count: state.count,
            max_requests: self.config.max_requests,
            effective_limit: state.effective_limit,
            window_ms: self.config.window_ms,
            window_start: state.window_start,
            blocked: state.blocked_until.is_some(),
            blocked_until: state.blocked_until,
            retry_after_ms: state
                .blocked_until
                .map(|until| until.saturating_sub(now))
                .unwrap_or(0),
            rate_limit_hits: state.rate_limit_hits,
            last_hit_at: state.last_hit_at,
            requests_per_minute: self.velocity_per_ms(state, now).unwrap_or(0.0) * 60_000.0,
            predicted_limit_in_ms: self.predict(state, now).map(|d| d.as_millis() as u64),
        })
    }

    /// Run `f` against refreshed state, firing the resume callback if the
    /// refresh ended a block.
    fn read<T>(&self, f: impl FnOnce(&RateLimiterState, u64) -> T) -> T {
        let now = self.clock.now_ms();
        let (value, unblocked) = {
            let mut state = self.state.lock();
            let unblocked = self.refresh(&mut state, now);
            (f(&state, now), unblocked)
        };
        if unblocked {
            self.fire_resume();
        }
        value
    }

    /// Expire blocks, roll the window, and apply adaptive recovery.
    ///
    /// Returns true if a block ended during this refresh.
    fn refresh(&self, state: &mut RateLimiterState, now: u64) -> bool {
        let mut unblocked = false;
        if state.blocked_until.is_some_and(|until| now >= until) {
            state.blocked_until = None;
            state.count = 0;
            state.window_start = now;
            unblocked = true;
            info!("rate limit block expired");
        }

        if now.saturating_sub(state.window_start) >= self.config.window_ms {
            debug!(count = state.count, "rate window reset");
            state.count = 0;
            state.window_start = now;
        }

        if self.config.adaptive {
            self.recover(state, now);
        }
        unblocked
    }

    /// Step the effective limit back up after each full quiet period.
    fn recover(&self, state: &mut RateLimiterState, now: u64) {
        if state.effective_limit >= self.config.max_requests {
            return;
        }
        let Some(anchor) = state.recovery_anchor else {
            return;
        };
        let period = self.config.adaptive_recovery_ms.max(1);
        let periods = now.saturating_sub(anchor) / period;
        if periods == 0 {
            return;
        }

        let step = self.config.max_requests.div_ceil(10).max(1) as u64;
        let raised = (state.effective_limit as u64 + step * periods)
            .min(self.config.max_requests as u64) as u32;
        info!(
            from = state.effective_limit,
            to = raised,
            "adaptive rate limit recovered"
        );
        state.effective_limit = raised;
        state.recovery_anchor = Some(anchor + periods * period);
    }

    fn reduced_limit(&self, current: u32, recent_hits: usize) -> u32 {
        let factor = (0.1 * recent_hits as f64).min(0.5);
        let floor = self.config.adaptive_min_limit;
        let mut reduced = (current as f64 * (1.0 - factor)).floor() as u32;
        if reduced >= current {
            reduced = current.saturating_sub(1);
        }
        reduced.max(floor)
    }

    fn velocity_per_ms(&self, state: &RateLimiterState, now: u64) -> Option<f64> {
        let horizon = now.saturating_sub(self.config.window_ms);
        let mut samples = state.history.iter().filter(|t| **t >= horizon);
        let first = *samples.next()?;
        let (n, last) = samples.fold((1u64, first), |(n, _), t| (n + 1, *t));
        if n < 2 || last <= first {
            return None;
        }
        Some((n - 1) as f64 / (last - first) as f64)
    }

    fn predict(&self, state: &RateLimiterState, now: u64) -> Option<Duration> {
        if state.blocked_until.is_some() || state.count >= state.effective_limit {
            return Some(Duration::ZERO);
        }
        let velocity = self.velocity_per_ms(state, now)?;
        let remaining = (state.effective_limit - state.count) as f64;
        Some(Duration::from_millis((remaining / velocity).ceil() as u64))
    }

    fn fire_pause(&self) {
        let callback = self.on_pause.read().clone();
        if let Some(callback) = callback {
            callback(RATE_LIMIT_PAUSE_REASON);
        }
    }

    fn fire_resume(&self) {
        let callback = self.on_resume.read().clone();
        if let Some(callback) = callback {
            callback(RATE_LIMIT_PAUSE_REASON);
        }
    }
}
