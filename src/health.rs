// Copyright 2026 DashFlow Contributors

//! Health Monitor (C5): multi-tier probing with scoring, trends, and
//! self-healing actions (spec §4.5).
//!
//! Resolves the health/breaker circular reference by message passing: this
//! module only ever calls [`crate::circuit_breaker::CircuitBreaker::force_open`]
//! or `force_reset`; it never registers a synchronous callback into the
//! breaker (spec §9).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{HealthConfig, HealthThresholds};
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTier {
    System,
    Service,
    Tool,
    External,
}

/// Result of one probe invocation.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub message: Option<String>,
}

/// A health probe for one component. Implementors wrap whatever liveness
/// check is appropriate (a ping, a lightweight no-op call, a resource
/// check).
#[async_trait]
pub trait HealthCheckFn: Send + Sync {
    async fn check(&self) -> ProbeOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Restart,
    Cleanup,
    Fallback,
    Scale,
    CircuitBreakerReset,
}

struct ComponentRecord {
    tier: HealthTier,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_checks: u64,
    total_successes: u64,
    latencies: VecDeque<u64>,
    state: ComponentState,
    score_history: VecDeque<f64>,
    recovery_in_progress: bool,
    recovery_attempts: u64,
    recovery_successes: u64,
    recovery_failures: u64,
    recovery_strategy_index: usize,
    breaker: Option<Arc<CircuitBreaker>>,
}

const LATENCY_WINDOW: usize = 50;
const SCORE_HISTORY: usize = 30;
const RECOVERY_STRATEGIES: [RecoveryStrategy; 5] = [
    RecoveryStrategy::Restart,
    RecoveryStrategy::Cleanup,
    RecoveryStrategy::Fallback,
    RecoveryStrategy::Scale,
    RecoveryStrategy::CircuitBreakerReset,
];

impl ComponentRecord {
    fn new(tier: HealthTier) -> Self {
        Self {
            tier,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_checks: 0,
            total_successes: 0,
            latencies: VecDeque::new(),
            state: ComponentState::Healthy,
            score_history: VecDeque::new(),
            recovery_in_progress: false,
            recovery_attempts: 0,
            recovery_successes: 0,
            recovery_failures: 0,
            recovery_strategy_index: 0,
            breaker: None,
        }
    }

    fn availability(&self) -> f64 {
        if self.total_checks == 0 {
            1.0
        } else {
            self.total_successes as f64 / self.total_checks as f64
        }
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            0.0
        } else {
            self.latencies.iter().sum::<u64>() as f64 / self.latencies.len() as f64
        }
    }

    /// Score = 100 for healthy, minus 5 per consecutive failure, banded by
    /// state (spec §4.5).
    fn score(&self) -> f64 {
        let base = match self.state {
            ComponentState::Healthy => 100.0,
            ComponentState::Degraded => 70.0,
            ComponentState::Unhealthy => 30.0,
        };
        (base - 5.0 * self.consecutive_failures as f64).clamp(0.0, 100.0)
    }

    fn recompute_state(&mut self, thresholds: &HealthThresholds) {
        let unhealthy = self.consecutive_failures >= thresholds.consecutive_failures;
        let degraded = self.availability() < thresholds.success_rate
            || self.avg_latency_ms() > thresholds.response_time_ms as f64;
        self.state = if unhealthy {
            ComponentState::Unhealthy
        } else if degraded {
            ComponentState::Degraded
        } else {
            ComponentState::Healthy
        };
    }
}

/// Linear-regression trend over a component's score history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendDirection {
    Improving,
    Stable,
    Declining,
}

#[derive(Debug, Clone)]
pub struct TrendReport {
    pub direction: TrendDirection,
    pub confidence: f64,
    pub predictions: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct OverallHealth {
    pub score: f64,
    pub state: ComponentState,
}

#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub component: String,
    pub strategy: RecoveryStrategy,
    pub succeeded: bool,
}

/// Multi-tier health monitor. Holds one [`ComponentRecord`] per registered
/// component name; each component's state transitions are serialized by the
/// single lock guarding the whole table (spec §5).
pub struct HealthMonitor {
    config: Mutex<HealthConfig>,
    components: Mutex<std::collections::HashMap<String, ComponentRecord>>,
    recovery_completions: AtomicU64,
    recovery_failures: AtomicU64,
    metrics: Arc<Metrics>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config: Mutex::new(config),
            components: Mutex::new(std::collections::HashMap::new()),
            recovery_completions: AtomicU64::new(0),
            recovery_failures: AtomicU64::new(0),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn register_component(&self, name: &str, tier: HealthTier, breaker: Option<Arc<CircuitBreaker>>) {
        let mut record = ComponentRecord::new(tier);
        record.breaker = breaker;
        self.components.lock().insert(name.to_string(), record);
    }

    /// Records one probe outcome and runs the component's state machine,
    /// triggering self-healing if it just became unhealthy.
    pub fn record_probe(&self, name: &str, outcome: ProbeOutcome) -> Option<ComponentState> {
        let thresholds = self.config.lock().thresholds.clone();
        let mut components = self.components.lock();
        let Some(record) = components.get_mut(name) else {
            warn!(component = name, "health probe for unregistered component");
            return None;
        };

        record.total_checks += 1;
        record.latencies.push_back(outcome.response_time_ms);
        if record.latencies.len() > LATENCY_WINDOW {
            record.latencies.pop_front();
        }

        let was_unhealthy = record.state == ComponentState::Unhealthy;
        if outcome.healthy {
            record.total_successes += 1;
            record.consecutive_failures = 0;
            record.consecutive_successes += 1;
        } else {
            record.consecutive_failures += 1;
            record.consecutive_successes = 0;
            self.metrics.record_health_check_failure();
        }

        // A component recovers off its own `recovery_in_progress` latch
        // (set when it first became unhealthy) reaching `recovery_successes`
        // consecutive passes — not off the state immediately before this
        // probe, which has usually already relaxed from Unhealthy to
        // Degraded after the very first passing probe.
        let just_recovered = record.recovery_in_progress
            && outcome.healthy
            && record.consecutive_successes >= thresholds.recovery_successes;

        if just_recovered {
            // Reset-on-recovery: forgive the availability debt accrued while
            // unhealthy so the component reads Healthy as soon as it clears
            // the recovery streak, rather than waiting for its
            // since-registration success rate to climb back over the
            // threshold (which a single failure run can keep it under for a
            // long time).
            record.total_checks = record.consecutive_successes as u64;
            record.total_successes = record.consecutive_successes as u64;
        }

        record.recompute_state(&thresholds);

        let score = record.score();
        record.score_history.push_back(score);
        if record.score_history.len() > SCORE_HISTORY {
            record.score_history.pop_front();
        }

        let became_unhealthy = !was_unhealthy && record.state == ComponentState::Unhealthy;
        let recovered = just_recovered && record.state == ComponentState::Healthy;

        if became_unhealthy {
            error!(component = name, "component became unhealthy");
            if let Some(breaker) = &record.breaker {
                breaker.force_open();
            }
        }
        if recovered {
            info!(component = name, "component recovered");
            record.recovery_in_progress = false;
            record.recovery_successes += 1;
            self.recovery_completions.fetch_add(1, Ordering::Relaxed);
        }

        let state = record.state;
        drop(components);

        if became_unhealthy && self.config.lock().self_healing_enabled {
            self.schedule_recovery(name);
        }
        Some(state)
    }

    /// Chooses the next recovery action from `{restart, cleanup, fallback,
    /// scale, circuit-breaker-reset}`. Only one recovery per component may
    /// be active at a time; failed recoveries escalate through the strategy
    /// list (spec §4.5).
    fn schedule_recovery(&self, name: &str) {
        let mut components = self.components.lock();
        let Some(record) = components.get_mut(name) else { return };
        if record.recovery_in_progress {
            return;
        }
        record.recovery_in_progress = true;
        record.recovery_attempts += 1;
        let strategy = RECOVERY_STRATEGIES[record.recovery_strategy_index % RECOVERY_STRATEGIES.len()];
        if strategy == RecoveryStrategy::CircuitBreakerReset {
            if let Some(breaker) = &record.breaker {
                breaker.force_reset();
            }
        }
        info!(component = name, ?strategy, "scheduled recovery action");
    }

    /// Call when an in-flight recovery action fails; escalates to the next
    /// strategy and increments the failure counter.
    pub fn mark_recovery_failed(&self, name: &str) {
        let mut components = self.components.lock();
        if let Some(record) = components.get_mut(name) {
            record.recovery_in_progress = false;
            record.recovery_failures += 1;
            record.recovery_strategy_index += 1;
            self.recovery_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn recovery_stats(&self) -> (u64, u64) {
        (self.recovery_completions.load(Ordering::Relaxed), self.recovery_failures.load(Ordering::Relaxed))
    }

    /// Overall score is the mean across components; overall state uses the
    /// bands `>=90 healthy, >=70 degraded, else unhealthy` (spec §4.5).
    pub fn overall(&self) -> OverallHealth {
        let components = self.components.lock();
        if components.is_empty() {
            return OverallHealth { score: 100.0, state: ComponentState::Healthy };
        }
        let score = components.values().map(|c| c.score()).sum::<f64>() / components.len() as f64;
        let state = if score >= 90.0 {
            ComponentState::Healthy
        } else if score >= 70.0 {
            ComponentState::Degraded
        } else {
            ComponentState::Unhealthy
        };
        OverallHealth { score, state }
    }

    /// Linear regression over the last `score_history` entries; confidence
    /// is inversely proportional to variance (spec §4.5).
    pub fn trend(&self, name: &str) -> Option<TrendReport> {
        let components = self.components.lock();
        let record = components.get(name)?;
        let ys: Vec<f64> = record.score_history.iter().copied().collect();
        Some(linear_trend(&ys))
    }

    pub fn alert_due(&self) -> bool {
        let threshold = self.config.lock().alert_score_threshold;
        self.overall().score < threshold
    }

    pub fn update_config(&self, config: HealthConfig) {
        *self.config.lock() = config;
    }

    /// Disables self-healing so no further recovery action is scheduled
    /// (spec §4.11 shutdown "stops health monitoring"). Probes already
    /// in-flight still land via `record_probe`; this only stops the monitor
    /// from acting on a transition to unhealthy.
    pub fn stop_self_healing(&self) {
        self.config.lock().self_healing_enabled = false;
    }
}

/// Ordinary-least-squares slope/intercept over `(index, value)` pairs, plus
/// a simple confidence figure derived from residual variance and a
/// three-step linear extrapolation.
fn linear_trend(ys: &[f64]) -> TrendReport {
    let n = ys.len();
    if n < 2 {
        return TrendReport { direction: TrendDirection::Stable, confidence: 0.0, predictions: vec![] };
    }
    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let x_mean = xs.iter().sum::<f64>() / n as f64;
    let y_mean = ys.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    for i in 0..n {
        cov += (xs[i] - x_mean) * (ys[i] - y_mean);
        var_x += (xs[i] - x_mean).powi(2);
    }
    let slope = if var_x.abs() < f64::EPSILON { 0.0 } else { cov / var_x };
    let intercept = y_mean - slope * x_mean;

    let residual_var = ys
        .iter()
        .enumerate()
        .map(|(i, y)| (y - (intercept + slope * i as f64)).powi(2))
        .sum::<f64>()
        / n as f64;
    let confidence = (1.0 / (1.0 + residual_var)).clamp(0.0, 1.0);

    let direction = if slope.abs() < 0.01 {
        TrendDirection::Stable
    } else if slope > 0.0 {
        TrendDirection::Improving
    } else {
        TrendDirection::Declining
    };

    let predictions = (n..n + 3).map(|i| intercept + slope * i as f64).collect();

    TrendReport { direction, confidence, predictions }
}
