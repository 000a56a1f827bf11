// ABOUTME: Defines the CoordinationStore trait - the primitives instances coordinate through.
// ABOUTME: Claim creation must be a single atomic operation in every backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

/// Key-value store shared by every coordinator instance.
///
/// Expiry is the only failure detector: a crashed instance's keys disappear
/// when their TTL runs out. Conditional operations compare the stored value
/// and act in one atomic step; callers never read-then-write.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically write `value` with a TTL only if `key` is absent.
    ///
    /// Returns true if this write created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Atomically take or keep a lease on `key` for `owner`.
    ///
    /// Creates the key with a TTL if absent, or refreshes its TTL if it
    /// already holds `owner`. Returns false when another owner holds it.
    async fn acquire_lease(&self, key: &str, owner: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Unconditionally write `value`, with a TTL or persistently.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Reset the TTL of `key` only if it currently holds `expected`.
    async fn expire_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `expected`.
    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Delete `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    /// List live keys matching a glob pattern (`*` wildcards).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Set one field of a persistent hash.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Remove one field of a hash. Returns whether it existed.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError>;
}

/// Shared store handle injected into each component.
pub type SharedStore = Arc<dyn CoordinationStore>;
