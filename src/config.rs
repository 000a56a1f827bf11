// ABOUTME: Configuration for every toolgate component, loadable from TOML.
// ABOUTME: All windows and TTLs live here; validate() rejects unusable values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default case-insensitive patterns that mark executor output as rate limited.
pub const DEFAULT_RATE_LIMIT_PATTERNS: &[&str] =
    &[r"rate[\s_-]?limit", r"\b429\b", r"too many requests"];

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolgateConfig {
    /// Stable identity of this instance. Generated at startup when unset.
    pub instance_id: Option<String>,

    pub rate_limit: RateLimitConfig,
    pub coordination: CoordinationConfig,
    pub health: HealthConfig,
    pub dispatcher: DispatcherConfig,
}

/// Sliding-window and adaptive rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Configured ceiling of requests per window.
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// How long to stop dispatching after a rate-limit signal.
    pub block_duration_ms: u64,
    /// Lower the ceiling on repeated rate-limit hits.
    pub adaptive: bool,
    /// Hits inside this window count towards the adaptive reduction.
    pub adaptive_hit_window_ms: u64,
    /// Quiet period after which the ceiling steps back up.
    pub adaptive_recovery_ms: u64,
    /// Floor for the adaptive ceiling.
    pub adaptive_min_limit: u32,
    /// Request timestamps kept for rate prediction.
    pub history_size: usize,
    /// Regexes (matched case-insensitively) for rate-limit error text.
    pub error_patterns: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 50,
            window_ms: 60_000,
            block_duration_ms: 60_000,
            adaptive: false,
            adaptive_hit_window_ms: 300_000,
            adaptive_recovery_ms: 300_000,
            adaptive_min_limit: 1,
            history_size: 20,
            error_patterns: DEFAULT_RATE_LIMIT_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }
}

/// Shared-store coordination between instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Prefix for every key this system writes.
    pub key_prefix: String,
    /// Lifetime of a request claim unless extended.
    pub claim_ttl_ms: u64,
    /// Lifetime of a published load record.
    pub load_ttl_ms: u64,
    /// Advertised capacity used in the active/capacity load ratio.
    pub capacity: u32,
    /// Interval of the claim cleanup sweep.
    pub cleanup_interval_ms: u64,
    /// Connection URL when the Redis backend is used.
    pub redis_url: Option<String>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            key_prefix: "toolgate".to_string(),
            claim_ttl_ms: 300_000,
            load_ttl_ms: 30_000,
            capacity: 3,
            cleanup_interval_ms: 300_000,
            redis_url: None,
        }
    }
}

impl CoordinationConfig {
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms)
    }

    pub fn load_ttl(&self) -> Duration {
        Duration::from_millis(self.load_ttl_ms)
    }
}

/// Liveness heartbeats.
///
/// A short `health_ttl_ms` notices crashes sooner but marks an instance dead
/// after a single slow heartbeat; `dead_instance_threshold_ms` should span
/// several heartbeat intervals so the registry does not churn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub heartbeat_interval_ms: u64,
    pub health_ttl_ms: u64,
    pub dead_instance_threshold_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            health_ttl_ms: 30_000,
            dead_instance_threshold_ms: 120_000,
        }
    }
}

/// Dispatch loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Hard cap on concurrent executor invocations.
    pub max_concurrent: usize,
    /// Sleep when there is no work.
    pub idle_backoff_ms: u64,
    /// Delay inserted after every dispatch.
    pub throttle_ms: u64,
    /// Rate-limit recycles allowed before a request fails for good.
    pub max_attempts: Option<u32>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            idle_backoff_ms: 500,
            throttle_ms: 0,
            max_attempts: None,
        }
    }
}

impl ToolgateConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_toml_str(&data)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rl = &self.rate_limit;
        require(rl.max_requests > 0, "rate_limit.max_requests must be positive")?;
        require(rl.window_ms > 0, "rate_limit.window_ms must be positive")?;
        require(rl.adaptive_min_limit > 0, "rate_limit.adaptive_min_limit must be positive")?;
        require(
            rl.adaptive_min_limit <= rl.max_requests,
            "rate_limit.adaptive_min_limit cannot exceed max_requests",
        )?;
        require(rl.history_size >= 2, "rate_limit.history_size must be at least 2")?;
        for pattern in &rl.error_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("rate_limit.error_patterns: {}", e))
            })?;
        }

        let coord = &self.coordination;
        require(!coord.key_prefix.is_empty(), "coordination.key_prefix must not be empty")?;
        require(coord.claim_ttl_ms > 0, "coordination.claim_ttl_ms must be positive")?;
        require(coord.load_ttl_ms > 0, "coordination.load_ttl_ms must be positive")?;
        require(coord.capacity > 0, "coordination.capacity must be positive")?;
        require(
            coord.cleanup_interval_ms > 0,
            "coordination.cleanup_interval_ms must be positive",
        )?;

        let health = &self.health;
        require(
            health.heartbeat_interval_ms > 0,
            "health.heartbeat_interval_ms must be positive",
        )?;
        require(
            health.health_ttl_ms > health.heartbeat_interval_ms,
            "health.health_ttl_ms must exceed the heartbeat interval",
        )?;
        require(
            health.dead_instance_threshold_ms > health.health_ttl_ms,
            "health.dead_instance_threshold_ms must exceed health_ttl_ms",
        )?;

        let dispatcher = &self.dispatcher;
        require(
            dispatcher.max_concurrent > 0,
            "dispatcher.max_concurrent must be positive",
        )?;
        if let Some(max_attempts) = dispatcher.max_attempts {
            require(max_attempts > 0, "dispatcher.max_attempts must be positive")?;
        }

        if let Some(id) = &self.instance_id {
            require(!id.trim().is_empty(), "instance_id must not be blank")?;
        }

        Ok(())
    }
}

fn require(condition: bool, message: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Invalid(message.to_string()))
    }
}
