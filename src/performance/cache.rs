//! TTL query cache for optimizer results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheOperationMetrics {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub hit_ratio: f64,
}

impl CacheOperationMetrics {
    fn update_ratio(&mut self) {
        let lookups = self.hits + self.misses;
        self.hit_ratio = if lookups > 0 {
            self.hits as f64 / lookups as f64
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Value,
    pub inserted_at: Instant,
    pub ttl: Duration,
    /// Approximate footprint of key plus serialized data
    pub size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Bounded cache keyed by query type plus canonical arguments.
///
/// Entries expire `ttl` after insertion. When an insert pushes the cache past
/// `max_entries`, expired entries are swept first and then the oldest
/// remaining entries are evicted until the bound holds again.
pub struct QueryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    metrics: RwLock<CacheOperationMetrics>,
    ttl: Duration,
    max_entries: usize,
}

impl QueryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            metrics: RwLock::new(CacheOperationMetrics::default()),
            ttl,
            max_entries,
        }
    }

    /// Identical `(query_type, args)` pairs always produce the same key.
    /// Object keys serialize in sorted order, so argument order is irrelevant.
    pub fn cache_key(query_type: &str, args: &Value) -> String {
        format!("{query_type}:{args}")
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut metrics = self.metrics.write().await;

        let hit = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.data.clone()),
            Some(_) => {
                entries.remove(key);
                metrics.expirations += 1;
                None
            }
            None => None,
        };

        if hit.is_some() {
            metrics.hits += 1;
        } else {
            metrics.misses += 1;
        }
        metrics.update_ratio();
        hit
    }

    pub async fn insert(&self, key: String, data: Value) {
        let size_bytes = key.len() + data.to_string().len();
        let entry = CacheEntry {
            data,
            inserted_at: Instant::now(),
            ttl: self.ttl,
            size_bytes,
        };

        let mut entries = self.entries.write().await;
        entries.insert(key, entry);
        if entries.len() > self.max_entries {
            let (expired, evicted) = self.sweep_locked(&mut entries);
            let mut metrics = self.metrics.write().await;
            metrics.expirations += expired as u64;
            metrics.evictions += evicted as u64;
        }
    }

    /// Remove expired entries, then the oldest ones while over the bound.
    /// Returns the number of entries removed.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.write().await;
        let (expired, evicted) = self.sweep_locked(&mut entries);
        let mut metrics = self.metrics.write().await;
        metrics.expirations += expired as u64;
        metrics.evictions += evicted as u64;
        expired + evicted
    }

    fn sweep_locked(&self, entries: &mut HashMap<String, CacheEntry>) -> (usize, usize) {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let expired = before - entries.len();

        let mut evicted = 0;
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            let mut by_age: Vec<(String, Instant)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.inserted_at))
                .collect();
            by_age.sort_by_key(|(_, inserted_at)| *inserted_at);
            for (key, _) in by_age.into_iter().take(excess) {
                entries.remove(&key);
                evicted += 1;
            }
        }

        if expired + evicted > 0 {
            debug!(expired, evicted, remaining = entries.len(), "Query cache swept");
        }
        (expired, evicted)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        entries.clear();
        count
    }

    pub async fn estimated_bytes(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.size_bytes)
            .sum()
    }

    pub async fn get_metrics(&self) -> CacheOperationMetrics {
        self.metrics.read().await.clone()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}
