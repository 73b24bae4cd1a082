//! Read-through cache for expensive listing queries.
//!
//! Backing stores are pluggable: `MemoryCache` for single-instance deployments,
//! anything shared (Redis, memcached) for multi-instance ones. Entries expire on
//! TTL, but correctness comes from explicit prefix invalidation when the
//! underlying collections change (see `InvalidationRules`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;

    async fn set(&self, key: &str, value: Value, ttl: Duration);

    /// Drop every entry whose key starts with `prefix`. Returns the number removed.
    async fn invalidate_prefix(&self, prefix: &str) -> usize;
}

/// Build a cache key from a prefix and a serializable request shape.
pub fn cache_key<S: Serialize>(prefix: &str, shape: &S) -> String {
    let body = serde_json::to_string(shape).unwrap_or_default();
    format!("{prefix}{body}")
}

pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Value, Instant)>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Value, Instant)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.lock();
        let live = entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone());
        if live.is_none() {
            entries.remove(key);
        }
        live
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) {
        let mut entries = self.lock();
        let now = Instant::now();
        if entries.len() >= self.max_entries {
            entries.retain(|_, (_, expires)| *expires > now);
        }
        if entries.len() >= self.max_entries {
            // Still full of live entries: evict the one closest to expiry.
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, (_, expires))| *expires)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&victim);
            }
        }
        entries.insert(key.to_string(), (value, now + ttl));
    }

    async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }
}

/// Maps a mutated collection to the cache key prefixes that depend on it.
#[derive(Debug, Clone, Default)]
pub struct InvalidationRules {
    rules: HashMap<String, Vec<String>>,
}

impl InvalidationRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, collection: &str, prefix: &str) -> Self {
        self.rules
            .entry(collection.to_string())
            .or_default()
            .push(prefix.to_string());
        self
    }

    pub fn prefixes_for(&self, collection: &str) -> &[String] {
        self.rules
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Invalidate every prefix registered for `collection`.
    pub async fn apply(&self, cache: &dyn Cache, collection: &str) -> usize {
        let mut removed = 0;
        for prefix in self.prefixes_for(collection) {
            removed += cache.invalidate_prefix(prefix).await;
        }
        removed
    }
}
