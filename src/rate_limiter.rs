// Copyright 2026 DashFlow Contributors

//! Rate Limiter (C3): hierarchical, multi-algorithm admission control with
//! burst and dynamic adjustment (spec §4.3).
//!
//! Exactly one algorithm is chosen at construction for a given limiter
//! instance. Limit selection walks tool-specific → user → workspace →
//! global. Internal faults fail open (spec §7): the rate limiter is the one
//! component whose failure mode is "admit", not "reject".

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::{LimitSpec, RateLimitAlgorithm, RateLimiterConfig};
use crate::metrics::Metrics;
use crate::types::ExecutionContext;

/// Hierarchical key: `toolId | workspaceId | userId | appKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    pub tool_id: Option<String>,
    pub workspace_id: Option<String>,
    pub user_id: Option<String>,
    pub app_key: Option<String>,
}

impl LimitKey {
    pub fn from_context(tool_id: &str, ctx: &ExecutionContext) -> Self {
        Self {
            tool_id: Some(tool_id.to_string()),
            workspace_id: ctx.workspace_id.clone(),
            user_id: ctx.user_id.clone(),
            app_key: None,
        }
    }
}

/// Result of [`RateLimiter::check_limit`].
#[derive(Debug, Clone)]
pub struct LimitDecision {
    pub allowed: bool,
    pub remaining: i64,
    pub reset_time: Instant,
    pub retry_after_ms: Option<u64>,
    pub metadata: Value,
}

enum AlgoState {
    TokenBucket { tokens: f64, burst_tokens: f64, last_refill: Instant },
    SlidingWindow { timestamps: VecDeque<Instant> },
    FixedWindow { window_start: Instant, count: u64 },
    LeakyBucket { queue: f64, last_leak: Instant },
}

struct LimiterEntry {
    state: AlgoState,
}

/// One rate limiter instance, fixed to a single algorithm. Construct
/// separate instances for separately-scoped limits if different algorithms
/// are desired per scope.
pub struct RateLimiter {
    config: Mutex<RateLimiterConfig>,
    entries: Mutex<HashMap<LimitKey, LimiterEntry>>,
    metrics: Arc<Metrics>,
    load_factor: Mutex<f64>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self, String> {
        config.validate()?;
        Ok(Self {
            config: Mutex::new(config),
            entries: Mutex::new(HashMap::new()),
            metrics: Arc::new(Metrics::new()),
            load_factor: Mutex::new(0.0),
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Sampled by an external load monitor; when this exceeds
    /// `dynamic.system_load_threshold`, effective capacity shrinks by
    /// `1 - load * adjustment_factor` (spec §4.3).
    pub fn report_load_factor(&self, load: f64) {
        *self.load_factor.lock() = load.clamp(0.0, 1.0);
    }

    fn effective_capacity(&self, base: u64) -> f64 {
        let cfg = self.config.lock();
        if !cfg.dynamic.enabled {
            return base as f64;
        }
        let load = *self.load_factor.lock();
        if load <= cfg.dynamic.system_load_threshold {
            return base as f64;
        }
        (base as f64 * (1.0 - load * cfg.dynamic.adjustment_factor)).max(0.0)
    }

    /// Selects the narrowest applicable limit: tool-specific → user →
    /// workspace → global (spec §4.3).
    fn resolve_limit(&self, key: &LimitKey) -> Option<LimitSpec> {
        let cfg = self.config.lock();
        if let Some(tool_id) = &key.tool_id {
            if let Some(spec) = cfg.limits.tool.get(tool_id) {
                return Some(spec.clone());
            }
        }
        if key.user_id.is_some() {
            if let Some(spec) = &cfg.limits.user {
                return Some(spec.clone());
            }
        }
        if key.workspace_id.is_some() {
            if let Some(spec) = &cfg.limits.workspace {
                return Some(spec.clone());
            }
        }
        cfg.limits.global.clone()
    }

    /// `checkLimit(key, ctx) -> {allowed, remaining, resetTime,
    /// retryAfterMs?, metadata}` (spec §4.3). Fails open on internal fault.
    pub fn check_limit(&self, key: &LimitKey) -> LimitDecision {
        let Some(limit) = self.resolve_limit(key) else {
            return self.fail_open("no limit configured for key");
        };
        if limit.window_ms == 0 {
            return self.fail_open("window_ms is zero");
        }

        let algorithm = self.config.lock().algorithm;
        let burst = self.config.lock().burst.clone();
        let capacity = self.effective_capacity(limit.requests);

        let mut entries = self.entries.lock();
        let now = Instant::now();
        let entry = entries.entry(key.clone()).or_insert_with(|| LimiterEntry {
            state: match algorithm {
                RateLimitAlgorithm::TokenBucket => {
                    AlgoState::TokenBucket { tokens: capacity, burst_tokens: burst.burst_requests as f64, last_refill: now }
                }
                RateLimitAlgorithm::SlidingWindow => AlgoState::SlidingWindow { timestamps: VecDeque::new() },
                RateLimitAlgorithm::FixedWindow => AlgoState::FixedWindow { window_start: now, count: 0 },
                RateLimitAlgorithm::LeakyBucket => AlgoState::LeakyBucket { queue: 0.0, last_leak: now },
            },
        });

        let decision = match &mut entry.state {
            AlgoState::TokenBucket { tokens, burst_tokens, last_refill } => {
                let rate = capacity / limit.window_ms as f64;
                let elapsed = now.duration_since(*last_refill).as_millis() as f64;
                *tokens = (*tokens + elapsed * rate).min(capacity);
                *last_refill = now;
                if burst.enabled {
                    let burst_rate = burst.burst_requests as f64 / burst.burst_window_ms.max(1) as f64;
                    *burst_tokens = (*burst_tokens + elapsed * burst_rate).min(burst.burst_requests as f64);
                }
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    LimitDecision {
                        allowed: true,
                        remaining: tokens.floor() as i64,
                        reset_time: now + Duration::from_secs_f64(1.0 / rate.max(f64::MIN_POSITIVE)),
                        retry_after_ms: None,
                        metadata: json!({}),
                    }
                } else if burst.enabled && *burst_tokens >= 1.0 {
                    *burst_tokens -= 1.0;
                    LimitDecision {
                        allowed: true,
                        remaining: 0,
                        reset_time: now + Duration::from_secs_f64(1.0 / rate.max(f64::MIN_POSITIVE)),
                        retry_after_ms: None,
                        metadata: json!({ "burstUsed": true }),
                    }
                } else {
                    let retry_after = Duration::from_secs_f64((1.0 - tokens.max(0.0)) / rate.max(f64::MIN_POSITIVE));
                    LimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_time: now + retry_after,
                        retry_after_ms: Some(retry_after.as_millis() as u64),
                        metadata: json!({}),
                    }
                }
            }
            AlgoState::SlidingWindow { timestamps } => {
                let window = Duration::from_millis(limit.window_ms);
                while let Some(front) = timestamps.front() {
                    if now.duration_since(*front) >= window {
                        timestamps.pop_front();
                    } else {
                        break;
                    }
                }
                if (timestamps.len() as f64) < capacity {
                    timestamps.push_back(now);
                    LimitDecision {
                        allowed: true,
                        remaining: (capacity as i64 - timestamps.len() as i64).max(0),
                        reset_time: now + window,
                        retry_after_ms: None,
                        metadata: json!({}),
                    }
                } else {
                    // capacity == 0 denies unconditionally with no prior
                    // timestamp to anchor a reset on; fall back to the full
                    // window.
                    let reset = timestamps.front().map(|t| *t + window).unwrap_or(now + window);
                    LimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_time: reset,
                        retry_after_ms: Some(reset.saturating_duration_since(now).as_millis() as u64),
                        metadata: json!({}),
                    }
                }
            }
            AlgoState::FixedWindow { window_start, count } => {
                if now.duration_since(*window_start) >= Duration::from_millis(limit.window_ms) {
                    *window_start = now;
                    *count = 0;
                }
                let reset = *window_start + Duration::from_millis(limit.window_ms);
                if (*count as f64) < capacity {
                    *count += 1;
                    LimitDecision {
                        allowed: true,
                        remaining: (capacity as i64 - *count as i64).max(0),
                        reset_time: reset,
                        retry_after_ms: None,
                        metadata: json!({}),
                    }
                } else {
                    LimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_time: reset,
                        retry_after_ms: Some(reset.saturating_duration_since(now).as_millis() as u64),
                        metadata: json!({}),
                    }
                }
            }
            AlgoState::LeakyBucket { queue, last_leak } => {
                let rate = capacity / limit.window_ms as f64;
                let elapsed = now.duration_since(*last_leak).as_millis() as f64;
                *queue = (*queue - elapsed * rate).max(0.0);
                *last_leak = now;
                if *queue < capacity {
                    *queue += 1.0;
                    LimitDecision {
                        allowed: true,
                        remaining: (capacity - *queue).floor().max(0.0) as i64,
                        reset_time: now + Duration::from_secs_f64(1.0 / rate.max(f64::MIN_POSITIVE)),
                        retry_after_ms: None,
                        metadata: json!({}),
                    }
                } else {
                    LimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_time: now + Duration::from_secs_f64(1.0 / rate.max(f64::MIN_POSITIVE)),
                        retry_after_ms: Some((1.0 / rate.max(f64::MIN_POSITIVE) * 1000.0) as u64),
                        metadata: json!({}),
                    }
                }
            }
        };

        if decision.allowed {
            self.metrics.record_rate_limit_admission();
        } else {
            self.metrics.record_rate_limit_rejection();
        }
        decision
    }

    fn fail_open(&self, reason: &str) -> LimitDecision {
        warn!(reason, "rate limiter internal fault, failing open");
        self.metrics.record_rate_limit_admission();
        LimitDecision {
            allowed: true,
            remaining: i64::MAX,
            reset_time: Instant::now(),
            retry_after_ms: None,
            metadata: json!({ "rate_limiter_error": true, "reason": reason }),
        }
    }

    /// `waitForLimit(key, ctx, maxWait)`: polls [`Self::check_limit`] until
    /// admitted or `max_wait` elapses.
    pub async fn wait_for_limit(&self, key: &LimitKey, max_wait: Duration) -> LimitDecision {
        let deadline = Instant::now() + max_wait;
        loop {
            let decision = self.check_limit(key);
            if decision.allowed || Instant::now() >= deadline {
                return decision;
            }
            let sleep_for = decision
                .retry_after_ms
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(10))
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(sleep_for).await;
        }
    }

    pub fn update_limits(&self, config: RateLimiterConfig) -> Result<(), String> {
        config.validate()?;
        *self.config.lock() = config;
        Ok(())
    }

    /// Resets limiter state for keys whose tool id contains `pattern`, or
    /// all state when `pattern` is `None`.
    pub fn reset_limits(&self, pattern: Option<&str>) {
        let mut entries = self.entries.lock();
        match pattern {
            None => entries.clear(),
            Some(p) => entries.retain(|k, _| !k.tool_id.as_deref().is_some_and(|t| t.contains(p))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitHierarchy;

    fn limiter(requests: u64, window_ms: u64, algorithm: RateLimitAlgorithm) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            algorithm,
            limits: LimitHierarchy { global: Some(LimitSpec { requests, window_ms }), ..Default::default() },
            ..RateLimiterConfig::default()
        })
        .unwrap()
    }

    fn key() -> LimitKey {
        LimitKey { tool_id: Some("tool".into()), workspace_id: None, user_id: None, app_key: None }
    }

    // Scenario 1 from spec §8: token-bucket admission.
    #[test]
    fn token_bucket_admission_matches_worked_example() {
        let l = limiter(2, 1000, RateLimitAlgorithm::TokenBucket);
        let k = key();
        assert!(l.check_limit(&k).allowed);
        std::thread::sleep(Duration::from_millis(100));
        assert!(l.check_limit(&k).allowed);
        std::thread::sleep(Duration::from_millis(100));
        let denied = l.check_limit(&k);
        assert!(!denied.allowed);
        let retry_after = denied.retry_after_ms.unwrap();
        assert!((300..=500).contains(&retry_after), "retry_after was {retry_after}");
    }

    #[test]
    fn zero_requests_denies_all() {
        let l = limiter(0, 1000, RateLimitAlgorithm::FixedWindow);
        assert!(!l.check_limit(&key()).allowed);
    }

    #[test]
    fn sliding_window_admits_up_to_capacity_then_denies() {
        let l = limiter(3, 1000, RateLimitAlgorithm::SlidingWindow);
        let k = key();
        assert!(l.check_limit(&k).allowed);
        assert!(l.check_limit(&k).allowed);
        assert!(l.check_limit(&k).allowed);
        assert!(!l.check_limit(&k).allowed);
    }

    #[test]
    fn fail_open_on_unconfigured_key_tags_metadata() {
        let l = RateLimiter::new(RateLimiterConfig::default()).unwrap();
        let decision = l.check_limit(&key());
        assert!(decision.allowed);
        assert_eq!(decision.metadata["rate_limiter_error"], Value::Bool(true));
    }

    #[test]
    fn reset_limits_clears_state_for_matching_keys() {
        let l = limiter(1, 1000, RateLimitAlgorithm::FixedWindow);
        let k = key();
        assert!(l.check_limit(&k).allowed);
        assert!(!l.check_limit(&k).allowed);
        l.reset_limits(Some("tool"));
        assert!(l.check_limit(&k).allowed);
    }
}
