// ABOUTME: In-process CoordinationStore with lazy TTL expiry driven by the injected clock.
// ABOUTME: Used for single-host deployments and tests; supports simulated outages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CoordinationStore, KeyTtl};
use crate::clock::SharedClock;
use crate::error::StoreError;

struct StringEntry {
    value: String,
    expires_at: Option<u64>,
}

impl StringEntry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, StringEntry>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl MemoryState {
    /// Get a live entry, dropping it if it has expired.
    fn live(&mut self, key: &str, now: u64) -> Option<&mut StringEntry> {
        if self.strings.get(key).is_some_and(|e| !e.is_live(now)) {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }
}

/// A coordination store held in process memory.
///
/// Every operation runs under one lock, so `set_if_absent` is atomic across
/// all tasks sharing the store. Instances in the same process sharing an
/// `Arc<MemoryStore>` behave like separate hosts sharing a real store.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    clock: SharedClock,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live string keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_ms();
        let state = self.state.lock();
        state.strings.values().filter(|e| e.is_live(now)).count()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        self.clock.now_ms() + ttl.as_millis() as u64
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(self.expiry(ttl)),
            },
        );
        Ok(true)
    }

    async fn acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let now = self.clock.now_ms();
        let expires_at = self.expiry(ttl);
        let mut state = self.state.lock();
        match state.live(key, now) {
            Some(entry) if entry.value == owner => {
                entry.expires_at = Some(expires_at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                state.strings.insert(
                    key.to_string(),
                    StringEntry {
                        value: owner.to_string(),
                        expires_at: Some(expires_at),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check()?;
        let expires_at = ttl.map(|ttl| self.expiry(ttl));
        self.state.lock().strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        Ok(state.live(key, now).map(|e| e.value.clone()))
    }

    async fn expire_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let now = self.clock.now_ms();
        let expires_at = self.expiry(ttl);
        let mut state = self.state.lock();
        match state.live(key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check()?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let owned = state.live(key, now).is_some_and(|e| e.value == expected);
        if owned {
            state.strings.remove(key);
        }
        Ok(owned)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let existed = state.live(key, now).is_some();
        state.strings.remove(key);
        Ok(existed)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        self.check()?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        Ok(match state.live(key, now) {
            None => KeyTtl::Missing,
            Some(StringEntry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(StringEntry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(Duration::from_millis(at.saturating_sub(now))),
        })
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| StoreError::InvalidPattern(format!("{}: {}", pattern, e)))?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.strings.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = state
            .strings
            .keys()
            .filter(|k| matcher.matches(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.state
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check()?;
        Ok(self.state.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock();
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            state.hashes.remove(key);
        }
        Ok(removed)
    }
}
