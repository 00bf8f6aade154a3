// Copyright 2026 DashFlow Contributors

//! Load Balancer (C12, optional): distributes requests across replicated
//! adapter instances (spec §4.12).
//!
//! Reuses the one closed/open/half-open automaton from
//! [`crate::circuit_breaker`] per backend instance, the same sharing spec
//! §4.4/§9 requires of the pool and health monitor, rather than growing a
//! second breaker implementation here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{LoadBalancerConfig, LoadBalancerStrategy};

/// One backend replica a request may be routed to.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub weight: f64,
    /// Degrees, for the geographic strategy's Haversine distance.
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Default)]
struct InstanceStats {
    active_connections: AtomicU64,
    latency_ms_ewma: Mutex<f64>,
    requests_per_second: Mutex<f64>,
    error_rate: Mutex<f64>,
}

struct InstanceEntry {
    instance: Instance,
    stats: InstanceStats,
    breaker: Arc<CircuitBreaker>,
}

struct Affinity {
    instance_id: String,
    expires_at: Instant,
}

/// Distributes calls across [`Instance`]s using one of six strategies,
/// honoring session affinity and an integrated per-instance circuit
/// breaker (spec §4.12).
pub struct LoadBalancer {
    config: RwLock<LoadBalancerConfig>,
    instances: RwLock<Vec<InstanceEntry>>,
    rr_cursor: AtomicU64,
    affinity: Mutex<HashMap<String, Affinity>>,
    breaker_config: crate::config::BreakerConfig,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig, breaker_config: crate::config::BreakerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            instances: RwLock::new(Vec::new()),
            rr_cursor: AtomicU64::new(0),
            affinity: Mutex::new(HashMap::new()),
            breaker_config,
        }
    }

    pub fn register_instance(&self, instance: Instance) {
        let breaker = Arc::new(CircuitBreaker::new(self.breaker_config.clone()));
        self.instances.write().push(InstanceEntry { instance, stats: InstanceStats::default(), breaker });
    }

    pub fn deregister_instance(&self, id: &str) {
        self.instances.write().retain(|e| e.instance.id != id);
        self.affinity.lock().retain(|_, a| a.instance_id != id);
    }

    /// Picks a backend instance for `session_id`, honoring affinity when a
    /// live (unexpired, breaker-closed) mapping exists, else applying the
    /// configured strategy and recording a fresh affinity entry.
    pub fn select(&self, session_id: Option<&str>, client_ip: Option<&str>) -> Option<String> {
        if let Some(session_id) = session_id {
            if let Some(id) = self.affine_instance(session_id) {
                return Some(id);
            }
        }

        let strategy = self.config.read().strategy;
        let instances = self.instances.read();
        let eligible: Vec<&InstanceEntry> = instances.iter().filter(|e| e.breaker.allow_request()).collect();
        if eligible.is_empty() {
            return None;
        }

        let chosen = match strategy {
            LoadBalancerStrategy::RoundRobin => {
                let idx = self.rr_cursor.fetch_add(1, Ordering::Relaxed) as usize % eligible.len();
                eligible[idx]
            }
            LoadBalancerStrategy::Random => eligible[rand::random::<usize>() % eligible.len()],
            LoadBalancerStrategy::LeastConnections => eligible
                .iter()
                .min_by_key(|e| e.stats.active_connections.load(Ordering::Relaxed))
                .copied()
                .expect("eligible is non-empty"),
            LoadBalancerStrategy::Weighted => eligible
                .iter()
                .max_by(|a, b| {
                    self.performance_weight(a).partial_cmp(&self.performance_weight(b)).unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied()
                .expect("eligible is non-empty"),
            LoadBalancerStrategy::IpHash => {
                let idx = client_ip.map(hash_str).unwrap_or(0) as usize % eligible.len();
                eligible[idx]
            }
            LoadBalancerStrategy::Geographic => eligible
                .iter()
                .min_by(|a, b| {
                    self.distance_from_origin(a).partial_cmp(&self.distance_from_origin(b)).unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied()
                .expect("eligible is non-empty"),
        };

        let id = chosen.instance.id.clone();
        if let Some(session_id) = session_id {
            let ttl = self.config.read().session_affinity_ttl_ms;
            self.affinity.lock().insert(
                session_id.to_string(),
                Affinity { instance_id: id.clone(), expires_at: Instant::now() + Duration::from_millis(ttl) },
            );
        }
        Some(id)
    }

    fn affine_instance(&self, session_id: &str) -> Option<String> {
        let mut affinity = self.affinity.lock();
        let entry = affinity.get(session_id)?;
        if Instant::now() >= entry.expires_at {
            affinity.remove(session_id);
            return None;
        }
        let id = entry.instance_id.clone();
        let instances = self.instances.read();
        let still_routable = instances.iter().any(|e| e.instance.id == id && e.breaker.allow_request());
        if still_routable {
            Some(id)
        } else {
            drop(instances);
            affinity.remove(session_id);
            None
        }
    }

    /// `weight <- clamp(0.1, 10)` of the performance-weighted rescoring
    /// formula (spec §4.12): `max(0.1, 1 - latency/1000*alpha) * (1 +
    /// rps/100*beta) * max(0.1, 1 - errorRate*gamma)`.
    fn performance_weight(&self, entry: &InstanceEntry) -> f64 {
        let cfg = self.config.read();
        let latency = *entry.stats.latency_ms_ewma.lock();
        let rps = *entry.stats.requests_per_second.lock();
        let error_rate = *entry.stats.error_rate.lock();
        let latency_term = (1.0 - latency / 1000.0 * cfg.latency_weight_alpha).max(0.1);
        let throughput_term = 1.0 + rps / 100.0 * cfg.throughput_weight_beta;
        let error_term = (1.0 - error_rate * cfg.error_rate_weight_gamma).max(0.1);
        (latency_term * throughput_term * error_term).clamp(0.1, 10.0)
    }

    /// Haversine great-circle distance in kilometers from the first
    /// registered instance with coordinates, used as a stand-in "client
    /// origin" when the caller does not supply one explicitly (spec §4.12
    /// geographic strategy).
    fn distance_from_origin(&self, entry: &InstanceEntry) -> f64 {
        let instances = self.instances.read();
        let Some(origin) = instances.iter().find_map(|e| Some((e.instance.latitude?, e.instance.longitude?))) else {
            return 0.0;
        };
        match (entry.instance.latitude, entry.instance.longitude) {
            (Some(lat), Some(lon)) => haversine_km(origin.0, origin.1, lat, lon),
            _ => f64::MAX,
        }
    }

    pub fn record_outcome(&self, instance_id: &str, latency_ms: f64, success: bool) {
        let instances = self.instances.read();
        let Some(entry) = instances.iter().find(|e| e.instance.id == instance_id) else { return };
        if success {
            entry.breaker.on_success();
        } else {
            entry.breaker.on_failure();
        }
        let mut ewma = entry.stats.latency_ms_ewma.lock();
        *ewma = *ewma * 0.8 + latency_ms * 0.2;
        let mut error_rate = entry.stats.error_rate.lock();
        let sample = if success { 0.0 } else { 1.0 };
        *error_rate = *error_rate * 0.9 + sample * 0.1;
    }

    pub fn connection_opened(&self, instance_id: &str) {
        if let Some(entry) = self.instances.read().iter().find(|e| e.instance.id == instance_id) {
            entry.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn connection_closed(&self, instance_id: &str) {
        if let Some(entry) = self.instances.read().iter().find(|e| e.instance.id == instance_id) {
            entry.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn update_config(&self, config: LoadBalancerConfig) {
        *self.config.write() = config;
    }
}

fn hash_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Great-circle distance between two lat/lon points, in kilometers.
fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let (lat1_rad, lat2_rad) = (lat1.to_radians(), lat2.to_radians());
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;

    fn lb(strategy: LoadBalancerStrategy) -> LoadBalancer {
        LoadBalancer::new(
            LoadBalancerConfig { strategy, ..LoadBalancerConfig::default() },
            BreakerConfig { failure_threshold: 2, recovery_timeout_ms: 60_000, half_open_max_requests: 1, failure_window_ms: 60_000 },
        )
    }

    #[test]
    fn round_robin_cycles_through_instances() {
        let balancer = lb(LoadBalancerStrategy::RoundRobin);
        balancer.register_instance(Instance { id: "a".into(), weight: 1.0, latitude: None, longitude: None });
        balancer.register_instance(Instance { id: "b".into(), weight: 1.0, latitude: None, longitude: None });
        let first = balancer.select(None, None).unwrap();
        let second = balancer.select(None, None).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn session_affinity_sticks_to_the_same_instance() {
        let balancer = lb(LoadBalancerStrategy::RoundRobin);
        balancer.register_instance(Instance { id: "a".into(), weight: 1.0, latitude: None, longitude: None });
        balancer.register_instance(Instance { id: "b".into(), weight: 1.0, latitude: None, longitude: None });
        let first = balancer.select(Some("sess-1"), None).unwrap();
        for _ in 0..5 {
            assert_eq!(balancer.select(Some("sess-1"), None).unwrap(), first);
        }
    }

    #[test]
    fn open_breaker_removes_instance_from_rotation() {
        let balancer = lb(LoadBalancerStrategy::RoundRobin);
        balancer.register_instance(Instance { id: "a".into(), weight: 1.0, latitude: None, longitude: None });
        balancer.register_instance(Instance { id: "b".into(), weight: 1.0, latitude: None, longitude: None });
        balancer.record_outcome("a", 10.0, false);
        balancer.record_outcome("a", 10.0, false);
        for _ in 0..10 {
            assert_eq!(balancer.select(None, None).unwrap(), "b");
        }
    }

    #[test]
    fn geographic_strategy_prefers_nearer_instance() {
        let balancer = lb(LoadBalancerStrategy::Geographic);
        // origin: San Francisco
        balancer.register_instance(Instance { id: "near".into(), weight: 1.0, latitude: Some(37.77), longitude: Some(-122.42) });
        // far: Tokyo
        balancer.register_instance(Instance { id: "far".into(), weight: 1.0, latitude: Some(35.68), longitude: Some(139.69) });
        assert_eq!(balancer.select(None, None).unwrap(), "near");
    }

    #[test]
    fn ip_hash_is_stable_for_the_same_client() {
        let balancer = lb(LoadBalancerStrategy::IpHash);
        balancer.register_instance(Instance { id: "a".into(), weight: 1.0, latitude: None, longitude: None });
        balancer.register_instance(Instance { id: "b".into(), weight: 1.0, latitude: None, longitude: None });
        let a = balancer.select(None, Some("10.0.0.5")).unwrap();
        let b = balancer.select(None, Some("10.0.0.5")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn performance_weighted_selection_prefers_lower_latency() {
        let balancer = lb(LoadBalancerStrategy::Weighted);
        balancer.register_instance(Instance { id: "slow".into(), weight: 1.0, latitude: None, longitude: None });
        balancer.register_instance(Instance { id: "fast".into(), weight: 1.0, latitude: None, longitude: None });
        balancer.record_outcome("slow", 900.0, true);
        balancer.record_outcome("fast", 10.0, true);
        assert_eq!(balancer.select(None, None).unwrap(), "fast");
    }
}
