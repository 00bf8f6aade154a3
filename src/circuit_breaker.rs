// Copyright 2026 DashFlow Contributors

//! Circuit Breaker (C4): the one closed/open/half-open automaton shared by
//! the pool, load balancer, and health monitor (spec §4.4, §9).
//!
//! Resolves the circular reference between health and breaker by message
//! passing: the health monitor calls [`CircuitBreaker::force_open`] and
//! never receives a synchronous callback from the breaker (spec §9).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::config::BreakerConfig;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failures_in_window: u32,
    window_start: Instant,
    next_attempt_time: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
    forced_open: bool,
}

/// One breaker instance guards one target (a tool, a pool, a backend
/// instance). Construct one per target, not one globally.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    trips: AtomicU64,
    resets: AtomicU64,
    metrics: Arc<Metrics>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures_in_window: 0,
                window_start: Instant::now(),
                next_attempt_time: None,
                half_open_admitted: 0,
                half_open_successes: 0,
                forced_open: false,
            }),
            trips: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn state(&self) -> BreakerState {
        self.transition_if_due();
        self.inner.lock().state
    }

    /// The only admit function (spec §4.4). Must be called before every
    /// guarded invocation.
    pub fn allow_request(&self) -> bool {
        self.transition_if_due();
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_max_requests {
                    inner.half_open_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Moves `open -> half-open` once `next_attempt_time` has passed.
    fn transition_if_due(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Open {
            if let Some(next) = inner.next_attempt_time {
                if Instant::now() >= next {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_admitted = 0;
                    inner.half_open_successes = 0;
                    info!("circuit breaker transitioning open -> half-open");
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                self.roll_window_if_needed(&mut inner);
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= inner.half_open_admitted.max(1)
                    && inner.half_open_admitted >= self.config.half_open_max_requests
                {
                    self.close(&mut inner);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                self.roll_window_if_needed(&mut inner);
                inner.failures_in_window += 1;
                if inner.failures_in_window >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                self.open(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    fn roll_window_if_needed(&self, inner: &mut Inner) {
        if inner.window_start.elapsed() >= Duration::from_millis(self.config.failure_window_ms) {
            inner.failures_in_window = 0;
            inner.window_start = Instant::now();
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.next_attempt_time = Some(Instant::now() + Duration::from_millis(self.config.recovery_timeout_ms));
        inner.failures_in_window = 0;
        self.trips.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_breaker_trip();
        info!("circuit breaker opened");
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = BreakerState::Closed;
        inner.failures_in_window = 0;
        inner.window_start = Instant::now();
        inner.next_attempt_time = None;
        self.resets.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_breaker_reset();
        info!("circuit breaker closed");
    }

    /// Operator override: force the breaker open regardless of counters.
    /// Used by the health monitor's self-healing actions (spec §4.5, §9).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = true;
        self.open(&mut inner);
    }

    /// Clears an operator-forced open, returning the breaker to `closed`.
    pub fn force_reset(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = false;
        self.close(&mut inner);
    }

    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            recovery_timeout_ms: 500,
            half_open_max_requests: 2,
            failure_window_ms: 60_000,
        })
    }

    // Scenario 3 from spec §8: breaker half-open probe.
    #[tokio::test]
    async fn half_open_probe_matches_worked_example() {
        let b = breaker();
        for _ in 0..3 {
            assert!(b.allow_request());
            b.on_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);

        // +400ms: still open, denied.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!b.allow_request());

        // +600ms total: half-open, admitted.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(b.allow_request());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.on_success();
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn no_requests_admitted_while_open() {
        let b = breaker();
        for _ in 0..3 {
            b.on_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        for _ in 0..10 {
            assert!(!b.allow_request());
        }
    }

    #[test]
    fn half_open_admits_at_most_configured_max() {
        let b = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout_ms: 0,
            half_open_max_requests: 2,
            failure_window_ms: 60_000,
        });
        b.on_failure();
        std::thread::sleep(Duration::from_millis(2));
        assert!(b.allow_request());
        assert!(b.allow_request());
        assert!(!b.allow_request());
    }

    #[test]
    fn force_open_blocks_even_a_healthy_breaker() {
        let b = breaker();
        assert!(b.allow_request());
        b.force_open();
        assert!(!b.allow_request());
    }
}
