// Copyright 2026 DashFlow Contributors

//! Runtime configuration surface (spec §6 "Configuration surface").
//!
//! Each struct here is the sole input to its component's `updateConfig()`.
//! Configuration is otherwise immutable between calls: components hold it
//! behind a `parking_lot::RwLock`, the same pattern `dashflow` uses for its
//! hot-path shared state instead of `std::sync::RwLock`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    Lru,
    Lfu,
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheWriteStrategy {
    WriteThrough,
    CacheAside,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_ms: u64,
    pub strategy: EvictionStrategy,
    pub write_strategy: CacheWriteStrategy,
    /// Background TTL sweep interval; spec §4.1 requires at least every 2
    /// minutes.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 10_000,
            ttl_ms: 5 * 60 * 1000,
            strategy: EvictionStrategy::Lru,
            write_strategy: CacheWriteStrategy::CacheAside,
            sweep_interval_ms: 2 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    RoundRobin,
    LeastConnections,
    Random,
    Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub validate_on_borrow: bool,
}

impl Default for PoolHealthCheckConfig {
    fn default() -> Self {
        Self { enabled: true, interval_ms: 30_000, timeout_ms: 2_000, validate_on_borrow: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_lifetime_ms: u64,
    pub strategy: PoolStrategy,
    pub health_check: PoolHealthCheckConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 10,
            acquire_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            max_lifetime_ms: 30 * 60 * 1000,
            strategy: PoolStrategy::RoundRobin,
            health_check: PoolHealthCheckConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    LeakyBucket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurstConfig {
    pub enabled: bool,
    pub burst_requests: u64,
    /// Window over which the burst pool refills; longer than the steady
    /// window per spec §4.3.
    pub burst_window_ms: u64,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self { enabled: false, burst_requests: 0, burst_window_ms: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicAdjustmentConfig {
    pub enabled: bool,
    pub system_load_threshold: f64,
    pub adjustment_factor: f64,
}

impl Default for DynamicAdjustmentConfig {
    fn default() -> Self {
        Self { enabled: false, system_load_threshold: 0.8, adjustment_factor: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSpec {
    pub requests: u64,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LimitHierarchy {
    pub global: Option<LimitSpec>,
    pub workspace: Option<LimitSpec>,
    pub user: Option<LimitSpec>,
    #[serde(default)]
    pub tool: HashMap<String, LimitSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub algorithm: RateLimitAlgorithm,
    pub limits: LimitHierarchy,
    pub burst: BurstConfig,
    pub dynamic: DynamicAdjustmentConfig,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            limits: LimitHierarchy::default(),
            burst: BurstConfig::default(),
            dynamic: DynamicAdjustmentConfig::default(),
        }
    }
}

impl RateLimiterConfig {
    /// `windowMs -> 0` is rejected at config load (spec §8 boundary
    /// behaviors).
    pub fn validate(&self) -> Result<(), String> {
        let specs = std::iter::empty()
            .chain(self.limits.global.iter())
            .chain(self.limits.workspace.iter())
            .chain(self.limits.user.iter())
            .chain(self.limits.tool.values());
        for spec in specs {
            if spec.window_ms == 0 {
                return Err("windowMs must be > 0".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_requests: u32,
    /// Rolling window, in ms, over which `failure_threshold` is counted.
    pub failure_window_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_max_requests: 1,
            failure_window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub response_time_ms: u64,
    pub recovery_successes: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self { consecutive_failures: 3, success_rate: 0.9, response_time_ms: 2_000, recovery_successes: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthTierConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub system: HealthTierConfig,
    pub service: HealthTierConfig,
    pub tool: HealthTierConfig,
    pub external: HealthTierConfig,
    pub thresholds: HealthThresholds,
    pub self_healing_enabled: bool,
    pub alert_score_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        let default_tier = HealthTierConfig { interval_ms: 15_000, timeout_ms: 3_000 };
        Self {
            system: default_tier.clone(),
            service: default_tier.clone(),
            tool: default_tier.clone(),
            external: default_tier,
            thresholds: HealthThresholds::default(),
            self_healing_enabled: true,
            alert_score_threshold: 70.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    pub batch_timeout_ms: u64,
    pub intelligent_batching: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self { max_batch_size: 10, batch_timeout_ms: 50, intelligent_batching: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerStrategy {
    RoundRobin,
    LeastConnections,
    Random,
    Weighted,
    IpHash,
    Geographic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalancerStrategy,
    pub session_affinity_ttl_ms: u64,
    pub latency_weight_alpha: f64,
    pub throughput_weight_beta: f64,
    pub error_rate_weight_gamma: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancerStrategy::RoundRobin,
            session_affinity_ttl_ms: 10 * 60 * 1000,
            latency_weight_alpha: 1.0,
            throughput_weight_beta: 1.0,
            error_rate_weight_gamma: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_window_ms_is_rejected() {
        let mut cfg = RateLimiterConfig::default();
        cfg.limits.global = Some(LimitSpec { requests: 10, window_ms: 0 });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_are_internally_consistent() {
        let pool = PoolConfig::default();
        assert!(pool.min <= pool.max);
    }
}
