// Copyright 2026 DashFlow Contributors

//! Process-lifetime metrics, exposed as typed snapshots rather than a
//! Prometheus exporter: telemetry sinks are an external collaborator per
//! spec §1, the core only needs to produce the numbers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counters shared across a component instance. Cheap to clone (an
/// `Arc` wrapping this is what components hand out).
#[derive(Debug, Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_evictions: AtomicU64,
    pub pool_acquisitions: AtomicU64,
    pub pool_timeouts: AtomicU64,
    pub rate_limit_admissions: AtomicU64,
    pub rate_limit_rejections: AtomicU64,
    pub breaker_trips: AtomicU64,
    pub breaker_resets: AtomicU64,
    pub health_check_failures: AtomicU64,
    pub batch_flushes: AtomicU64,
    pub executions_completed: AtomicU64,
    pub executions_errored: AtomicU64,
}

macro_rules! inc {
    ($field:ident) => {
        pub fn $field(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    inc!(record_cache_hit);
    inc!(record_cache_miss);
    inc!(record_cache_eviction);
    inc!(record_pool_acquisition);
    inc!(record_pool_timeout);
    inc!(record_rate_limit_admission);
    inc!(record_rate_limit_rejection);
    inc!(record_breaker_trip);
    inc!(record_breaker_reset);
    inc!(record_health_check_failure);
    inc!(record_batch_flush);
    inc!(record_execution_completed);
    inc!(record_execution_errored);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            pool_acquisitions: self.pool_acquisitions.load(Ordering::Relaxed),
            pool_timeouts: self.pool_timeouts.load(Ordering::Relaxed),
            rate_limit_admissions: self.rate_limit_admissions.load(Ordering::Relaxed),
            rate_limit_rejections: self.rate_limit_rejections.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
            breaker_resets: self.breaker_resets.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
            batch_flushes: self.batch_flushes.load(Ordering::Relaxed),
            executions_completed: self.executions_completed.load(Ordering::Relaxed),
            executions_errored: self.executions_errored.load(Ordering::Relaxed),
        }
    }

    /// `hits / (hits + misses)`, 0.0 when no requests have been served.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let misses = self.cache_misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub pool_acquisitions: u64,
    pub pool_timeouts: u64,
    pub rate_limit_admissions: u64,
    pub rate_limit_rejections: u64,
    pub breaker_trips: u64,
    pub breaker_resets: u64,
    pub health_check_failures: u64,
    pub batch_flushes: u64,
    pub executions_completed: u64,
    pub executions_errored: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_is_zero_with_no_traffic() {
        let m = Metrics::new();
        assert_eq!(m.cache_hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_reflects_recorded_events() {
        let m = Metrics::new();
        m.record_cache_hit();
        m.record_cache_hit();
        m.record_cache_miss();
        assert!((m.cache_hit_rate() - (2.0 / 3.0)).abs() < 1e-9);
        let snap = m.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.cache_misses, 1);
    }
}
