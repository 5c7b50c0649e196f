//! Fingerprint-keyed response cache
//!
//! Provides in-memory caching of completed responses with:
//! - Per-entry TTL, checked on every read
//! - Background sweep of expired entries
//! - LRU eviction once `max_entries` is reached
//!
//! Concurrent writers for the same fingerprint are last-write-wins.

use crate::config::CacheConfig;
use crate::gateway::{Fingerprint, Usage};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Stored completion
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub usage: Usage,
}

/// A cached response entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub response: CachedResponse,
    /// Cost of the original call
    pub cost: f64,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, response: CachedResponse, cost: f64, ttl: Duration) -> Self {
        Self {
            fingerprint,
            response,
            cost,
            created_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
}

impl CacheStats {
    /// Get hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

/// Response cache with LRU eviction
pub struct ResponseCache {
    default_ttl: Duration,
    max_entries: usize,
    entries: DashMap<String, CacheEntry>,
    lru_order: Mutex<VecDeque<String>>,
    stats: CacheStats,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            default_ttl: config.ttl,
            max_entries: config.max_entries.max(1),
            entries: DashMap::new(),
            lru_order: Mutex::new(VecDeque::new()),
            stats: CacheStats::default(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fresh entry for `fingerprint`; expired entries are dropped, never served
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let key = fingerprint.as_str();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                let entry = entry.clone();
                self.touch(key);
                trace!(fingerprint = %key, "Cache hit");
                return Some(entry);
            }
            drop(entry);
            if self.remove_if_expired(key) {
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        trace!(fingerprint = %key, "Cache miss");
        None
    }

    /// Store `response` under `fingerprint` for `ttl`
    pub fn put(&self, fingerprint: Fingerprint, response: CachedResponse, cost: f64, ttl: Duration) {
        let key = fingerprint.as_str().to_string();

        while !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            if !self.evict_lru() {
                break;
            }
        }

        let entry = CacheEntry::new(fingerprint, response, cost, ttl);
        self.entries.insert(key.clone(), entry);
        self.touch(&key);

        debug!(entries = self.entries.len(), "Cached response");
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.remove_key(fingerprint.as_str())
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
        self.lru_order.lock().clear();
    }

    /// Remove all expired entries, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();

        let removed = expired
            .iter()
            .filter(|key| self.remove_if_expired(key))
            .count();
        self.stats
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_key(&self, key: &str) -> Option<CacheEntry> {
        let (_, entry) = self.entries.remove(key)?;
        self.lru_order.lock().retain(|k| k != key);
        Some(entry)
    }

    /// Re-checks under the shard lock so a concurrent fresh write is kept
    fn remove_if_expired(&self, key: &str) -> bool {
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired())
            .is_some()
        {
            self.lru_order.lock().retain(|k| k != key);
            true
        } else {
            false
        }
    }

    fn touch(&self, key: &str) {
        let mut lru = self.lru_order.lock();
        lru.retain(|k| k != key);
        lru.push_back(key.to_string());
    }

    fn evict_lru(&self) -> bool {
        let key = self.lru_order.lock().pop_front();
        match key {
            Some(key) => {
                if self.entries.remove(&key).is_some() {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(fingerprint = %key, "Evicted LRU entry");
                }
                true
            }
            None => false,
        }
    }
}

/// Periodically purge expired entries until the handle is aborted
pub fn spawn_sweeper(cache: Arc<ResponseCache>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = cache.purge_expired();
            if removed > 0 {
                debug!(removed, remaining = cache.len(), "Cache sweep");
            }
        }
    })
}
