//! Short-lived replay cache recording `signature -> nonce` pairs.
//!
//! The gateway owns one [`ReplayCache`] for the whole process. Accounts share
//! it; keys are derived from the callback signature, which already binds the
//! account token.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Entries are swept once the map grows beyond this many keys.
const PRUNE_THRESHOLD: usize = 4096;

/// Key-value store with per-entry TTL used for anti-replay bookkeeping.
///
/// Implementations backed by a shared external store (Redis and friends) only
/// need `get`/`set`; the provided `record_if_new` falls back to a non-atomic
/// read-then-write, which degrades replay protection under races but never
/// rejects a legitimate request.
pub trait ReplayCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str, ttl: Duration);

    /// Records `value` under `key` unless a live entry already holds the
    /// same value. Returns `false` when the request is a replay.
    fn record_if_new(&self, key: &str, value: &str, ttl: Duration) -> bool {
        if self.get(key).as_deref() == Some(value) {
            return false;
        }
        self.set(key, value, ttl);
        true
    }
}

#[derive(Debug, Clone)]
struct ReplayEntry {
    value: String,
    expires_at: Instant,
}

/// Process-local replay cache. `record_if_new` is atomic under a single lock.
#[derive(Debug, Default)]
pub struct MemoryReplayCache {
    entries: Mutex<HashMap<String, ReplayEntry>>,
}

impl MemoryReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune_locked(entries: &mut HashMap<String, ReplayEntry>, now: Instant) {
        if entries.len() > PRUNE_THRESHOLD {
            entries.retain(|_, entry| entry.expires_at > now);
        }
    }
}

impl ReplayCache for MemoryReplayCache {
    fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::prune_locked(&mut entries, now);
        entries.insert(
            key.to_string(),
            ReplayEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
    }

    fn record_if_new(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries
            .get(key)
            .is_some_and(|entry| entry.expires_at > now && entry.value == value)
        {
            return false;
        }
        Self::prune_locked(&mut entries, now);
        entries.insert(
            key.to_string(),
            ReplayEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        true
    }
}
