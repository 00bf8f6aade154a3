// Copyright 2026 DashFlow Contributors

//! Intelligent Cache (C1): a bounded key→value store with TTL and
//! pluggable eviction.
//!
//! # Overview
//!
//! Supports three eviction strategies (LRU, LFU, adaptive score) and an
//! optional two-level hierarchy where an in-memory L1 is backed by an
//! external L2 implementing [`L2Cache`]. Background TTL sweeps run on an
//! interval no longer than 2 minutes, matching spec §4.1.
//!
//! Single-structure locking: the whole cache map is protected by one
//! `parking_lot::RwLock`, matching the concurrency model of spec §5 (lock
//! granularity is "one structure", not "one entry").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::config::{CacheConfig, CacheWriteStrategy, EvictionStrategy};
use crate::metrics::Metrics;

/// Pluggable external backing store for the optional L2 tier.
#[async_trait]
pub trait L2Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>);
    async fn delete(&self, key: &str);
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    inserted_at: Instant,
    last_access: Instant,
    access_count: u64,
    ttl: Option<Duration>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.inserted_at) >= ttl,
            None => false,
        }
    }

    /// Adaptive score: `0.7*(accessCount/ageHours) + 0.3*(lastAccess/1000)`
    /// (spec §4.1, verbatim). `lastAccess` is expressed as the epoch
    /// millisecond timestamp-like monotonic offset, matching the magnitude
    /// implied by the spec's constant.
    fn adaptive_score(&self, now: Instant, origin: Instant) -> f64 {
        let age_hours = now.duration_since(self.inserted_at).as_secs_f64() / 3600.0;
        let age_hours = age_hours.max(1.0 / 3600.0);
        let last_access_ms = self.last_access.duration_since(origin).as_millis() as f64;
        0.7 * (self.access_count as f64 / age_hours) + 0.3 * (last_access_ms / 1000.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    config: CacheConfig,
}

/// A bounded, TTL-aware, eviction-policy cache. `K` is always a
/// `Display`-able key (typically [`crate::types::CacheKey`]'s string form);
/// keys are stored as `String` so substring-pattern invalidation (spec
/// §4.1) can operate uniformly.
pub struct IntelligentCache {
    inner: RwLock<Inner>,
    metrics: Arc<Metrics>,
    l2: Option<Arc<dyn L2Cache>>,
    origin: Instant,
    last_sweep: RwLock<Instant>,
}

impl IntelligentCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: RwLock::new(Inner { entries: HashMap::new(), config }),
            metrics: Arc::new(Metrics::new()),
            l2: None,
            origin: Instant::now(),
            last_sweep: RwLock::new(Instant::now()),
        }
    }

    pub fn with_l2(mut self, l2: Arc<dyn L2Cache>) -> Self {
        self.l2 = Some(l2);
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// `get(k) -> v | ∅`. Consults L1 first; on miss, consults L2 and
    /// promotes on hit.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.maybe_sweep();
        {
            let mut inner = self.inner.write();
            if let Some(entry) = inner.entries.get_mut(key) {
                let now = Instant::now();
                if entry.is_expired(now) {
                    inner.entries.remove(key);
                } else {
                    entry.last_access = now;
                    entry.access_count += 1;
                    self.metrics.record_cache_hit();
                    debug!(cache_key = key, "cache hit (L1)");
                    return Some(entry.value.clone());
                }
            }
        }
        if let Some(l2) = &self.l2 {
            if let Some(value) = l2.get(key).await {
                debug!(cache_key = key, "cache hit (L2), promoting to L1");
                self.insert_l1(key, value.clone(), None);
                self.metrics.record_cache_hit();
                return Some(value);
            }
        }
        self.metrics.record_cache_miss();
        debug!(cache_key = key, "cache miss");
        None
    }

    pub fn has(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get(key) {
            if entry.is_expired(Instant::now()) {
                inner.entries.remove(key);
                return false;
            }
            return true;
        }
        false
    }

    /// `set(k, v, ttl?)`. Write-through writes L1 and L2 concurrently;
    /// cache-aside writes L1 then L2 sequentially (spec §4.1).
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let strategy = { self.inner.read().config.write_strategy };
        match strategy {
            CacheWriteStrategy::WriteThrough => {
                let l2_write = async {
                    if let Some(l2) = &self.l2 {
                        l2.set(key, value.clone(), ttl).await;
                    }
                };
                let (_, ()) = tokio::join!(async { self.insert_l1(key, value.clone(), ttl) }, l2_write);
            }
            CacheWriteStrategy::CacheAside => {
                self.insert_l1(key, value.clone(), ttl);
                if let Some(l2) = &self.l2 {
                    l2.set(key, value, ttl).await;
                }
            }
        }
    }

    fn insert_l1(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.or_else(|| {
            let ms = self.inner.read().config.ttl_ms;
            (ms > 0).then(|| Duration::from_millis(ms))
        });
        let mut inner = self.inner.write();
        inner.entries.insert(
            key.to_string(),
            Entry { value, inserted_at: now, last_access: now, access_count: 0, ttl },
        );
        let max_size = inner.config.max_size;
        if inner.entries.len() > max_size {
            self.evict_locked(&mut inner, max_size);
        }
    }

    /// Evicts back down to exactly `max_size` using the configured strategy
    /// (spec §4.1). Spec line 64's `⌊0.8·maxSize⌋` high-water wording reads
    /// as a larger headroom target, but spec §8 scenario 2 pins a size-3 LRU
    /// cache at three live survivors after a fourth insert evicts only the
    /// single LRU entry — i.e. eviction trims the overflow down to
    /// `max_size`, not down to 80% of it. The worked scenario is the ground
    /// truth this method follows.
    fn evict_locked(&self, inner: &mut Inner, max_size: usize) {
        if inner.entries.len() <= max_size {
            return;
        }
        let now = Instant::now();
        let strategy = inner.config.strategy;
        let origin = self.origin;
        let mut ranked: Vec<(String, f64)> = inner
            .entries
            .iter()
            .map(|(k, e)| {
                let score = match strategy {
                    EvictionStrategy::Lru => e.last_access.duration_since(origin).as_secs_f64(),
                    EvictionStrategy::Lfu => e.access_count as f64,
                    EvictionStrategy::Adaptive => e.adaptive_score(now, origin),
                };
                (k.clone(), score)
            })
            .collect();
        // Lowest score evicted first in all three strategies: LRU's score is
        // "seconds since origin at last access" so the oldest access has the
        // smallest value; LFU's score is the access count directly.
        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let to_evict = inner.entries.len() - max_size;
        for (key, _) in ranked.into_iter().take(to_evict) {
            inner.entries.remove(&key);
            self.metrics.record_cache_eviction();
        }
    }

    /// Removes expired entries; also called opportunistically from `get`.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        inner.entries.retain(|_, e| !e.is_expired(now));
        *self.last_sweep.write() = now;
    }

    fn maybe_sweep(&self) {
        let sweep_interval_ms = self.inner.read().config.sweep_interval_ms;
        let due = {
            let last = *self.last_sweep.read();
            last.elapsed() >= Duration::from_millis(sweep_interval_ms)
        };
        if due {
            self.cleanup();
        }
    }

    pub fn clear(&self) {
        self.inner.write().entries.clear();
    }

    pub fn update_config(&self, config: CacheConfig) {
        self.inner.write().config = config;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        let hits = self.metrics.cache_hits.load(std::sync::atomic::Ordering::Relaxed);
        let misses = self.metrics.cache_misses.load(std::sync::atomic::Ordering::Relaxed);
        let evictions = self.metrics.cache_evictions.load(std::sync::atomic::Ordering::Relaxed);
        CacheStats { size: inner.entries.len(), hits, misses, evictions, hit_rate: self.metrics.cache_hit_rate() }
    }

    /// Invalidates an exact key.
    pub fn invalidate(&self, key: &str) {
        self.inner.write().entries.remove(key);
    }

    /// Invalidates every key containing `pattern` as a substring.
    pub fn invalidate_pattern(&self, pattern: &str) {
        self.inner.write().entries.retain(|k, _| !k.contains(pattern));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(strategy: EvictionStrategy, max_size: usize) -> IntelligentCache {
        IntelligentCache::new(CacheConfig { max_size, strategy, ttl_ms: 0, ..CacheConfig::default() })
    }

    #[tokio::test]
    async fn set_then_get_round_trips_until_eviction() {
        let c = cache(EvictionStrategy::Lru, 100);
        c.set("k", Value::from(42), None).await;
        assert_eq!(c.get("k").await, Some(Value::from(42)));
    }

    // Scenario 2 from spec §8: LRU eviction.
    #[tokio::test]
    async fn lru_eviction_matches_worked_example() {
        let c = cache(EvictionStrategy::Lru, 3);
        c.set("a", Value::from(1), None).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        c.set("b", Value::from(2), None).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        c.set("c", Value::from(3), None).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        // touch "a" so it is no longer the least-recently-used entry
        assert_eq!(c.get("a").await, Some(Value::from(1)));
        tokio::time::sleep(Duration::from_millis(2)).await;
        c.set("d", Value::from(4), None).await;

        assert_eq!(c.get("b").await, None);
        assert_eq!(c.get("a").await, Some(Value::from(1)));
        assert_eq!(c.get("c").await, Some(Value::from(3)));
        assert_eq!(c.get("d").await, Some(Value::from(4)));
    }

    #[tokio::test]
    async fn ttl_expiry_makes_entry_absent() {
        let c = IntelligentCache::new(CacheConfig { ttl_ms: 5, ..CacheConfig::default() });
        c.set("k", Value::from(1), None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(c.get("k").await, None);
    }

    #[tokio::test]
    async fn size_never_exceeds_capacity() {
        let c = cache(EvictionStrategy::Lfu, 5);
        for i in 0..50 {
            c.set(&format!("k{i}"), Value::from(i), None).await;
        }
        assert!(c.stats().size <= 5);
    }

    #[tokio::test]
    async fn invalidate_pattern_removes_matching_keys_only() {
        let c = cache(EvictionStrategy::Lru, 100);
        c.set("tool:a:1", Value::from(1), None).await;
        c.set("tool:a:2", Value::from(2), None).await;
        c.set("tool:b:1", Value::from(3), None).await;
        c.invalidate_pattern("tool:a:");
        assert_eq!(c.get("tool:a:1").await, None);
        assert_eq!(c.get("tool:a:2").await, None);
        assert_eq!(c.get("tool:b:1").await, Some(Value::from(3)));
    }

    #[tokio::test]
    async fn hit_rate_reflects_get_traffic() {
        let c = cache(EvictionStrategy::Lru, 100);
        c.set("k", Value::from(1), None).await;
        let _ = c.get("k").await;
        let _ = c.get("missing").await;
        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }
}
