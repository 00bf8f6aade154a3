// Copyright 2026 DashFlow Contributors

//! Connection Pool (C2): per-tool pools of reusable handles with health,
//! acquisition fairness, and a two-phase shutdown (spec §4.2).
//!
//! One `parking_lot::Mutex` guards each tool's pool state (idle set, active
//! metadata, waiter queue) as a single structure, per the concurrency model
//! of spec §5: lock granularity is "one structure", not "one entry".

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::{PoolConfig, PoolStrategy};
use crate::error::{AdmissionReason, UtacError, UtacResult};
use crate::metrics::Metrics;

/// A factory for the connections one pool manages. `C` is the connection
/// handle type; implementors typically wrap a source tool's underlying
/// client (an HTTP client, a DB connection, a subprocess handle).
#[async_trait]
pub trait ConnectionFactory<C>: Send + Sync {
    async fn create(&self) -> UtacResult<C>;
    async fn validate(&self, conn: &C) -> bool;
    async fn destroy(&self, conn: C);
}

/// Object-safe handle for shutting down a connection pool without naming its
/// connection type `C`. A source tool that composes a [`ConnectionPool`]
/// internally can hand one of these to its [`crate::adapter::Adapter`]
/// (`Adapter::with_pool`) purely so framework shutdown (spec §4.11) can
/// drive it; the pool remains otherwise private to the tool, matching
/// `DESIGN.md`'s resolution that pooling isn't threaded generically through
/// `Adapter`.
#[async_trait]
pub trait PoolHandle: Send + Sync {
    async fn close(&self, timeout: Duration);
}

#[async_trait]
impl<C: Send + 'static> PoolHandle for ConnectionPool<C> {
    async fn close(&self, timeout: Duration) {
        self.shutdown(timeout).await;
    }
}

/// A handle borrowed from the pool. The caller must pass it to
/// [`ConnectionPool::release`] when done; there is no `Drop`-based
/// auto-release because release may run an async health check.
pub struct Conn<C> {
    pub id: u64,
    pub value: C,
}

/// Metadata tracked for a connection while it is idle or checked out. The
/// connection value itself lives either in `idle` (owned by the pool) or in
/// a caller's [`Conn`] (owned by the caller) — never both, satisfying the
/// pool invariant from spec §3 ("a released connection is either re-idled
/// or destroyed, never both").
struct Meta {
    created_at: Instant,
    last_used_at: Instant,
    usage_count: u64,
}

struct IdleConn<C> {
    conn: C,
    id: u64,
    meta: Meta,
}

struct Waiter {
    deadline: Instant,
    sender: oneshot::Sender<UtacResult<u64>>,
}

struct ToolPool<C> {
    idle: Vec<IdleConn<C>>,
    active: HashMap<u64, Meta>,
    creating: usize,
    waiters: VecDeque<Waiter>,
    next_id: u64,
    rr_cursor: usize,
    accepting: bool,
}

impl<C> ToolPool<C> {
    fn new() -> Self {
        Self {
            idle: Vec::new(),
            active: HashMap::new(),
            creating: 0,
            waiters: VecDeque::new(),
            next_id: 0,
            rr_cursor: 0,
            accepting: true,
        }
    }

    fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.creating
    }
}

/// Per-tool connection pool. One instance is shared across all calls for a
/// given `C`; tool identity is the map key passed to every method.
pub struct ConnectionPool<C> {
    config: Mutex<PoolConfig>,
    pools: Mutex<HashMap<String, ToolPool<C>>>,
    factory: Arc<dyn ConnectionFactory<C>>,
    metrics: Arc<Metrics>,
    /// Side table handing a just-reidled connection's value to whichever
    /// waiter the pool picked for it, keyed by connection id. Populated only
    /// inside `try_satisfy_waiter_locked`/`release` and drained immediately
    /// by the one waiter it was stashed for.
    pending: Mutex<HashMap<u64, C>>,
}

impl<C: Send + 'static> ConnectionPool<C> {
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory<C>>) -> Self {
        Self {
            config: Mutex::new(config),
            pools: Mutex::new(HashMap::new()),
            factory,
            metrics: Arc::new(Metrics::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    fn config(&self) -> PoolConfig {
        self.config.lock().clone()
    }

    /// `acquire(toolId) -> conn`. If idle available, select by strategy;
    /// else if `active+creating < max`, create new; else enqueue a waiter
    /// with `deadline = acquireTimeoutMs` (spec §4.2).
    pub async fn acquire(&self, tool_id: &str) -> UtacResult<Conn<C>> {
        let cfg = self.config();

        enum Plan<C> {
            Reused(Conn<C>),
            Create,
            Wait,
        }

        let plan = {
            let mut pools = self.pools.lock();
            let pool = pools.entry(tool_id.to_string()).or_insert_with(ToolPool::new);
            if !pool.accepting {
                return Err(UtacError::Admission { reason: AdmissionReason::PoolExhausted, retry_after_ms: None });
            }
            if !pool.idle.is_empty() {
                let idx = self.select_idle_index(pool, cfg.strategy);
                let mut idle = pool.idle.remove(idx);
                idle.meta.last_used_at = Instant::now();
                idle.meta.usage_count += 1;
                let id = idle.id;
                pool.active.insert(id, idle.meta);
                Plan::Reused(Conn { id, value: idle.conn })
            } else if pool.total() < cfg.max {
                pool.creating += 1;
                Plan::Create
            } else {
                Plan::Wait
            }
        };

        match plan {
            Plan::Reused(conn) => {
                self.metrics.record_pool_acquisition();
                debug!(tool_id, conn_id = conn.id, "pool acquire: reused idle connection");
                Ok(conn)
            }
            Plan::Create => {
                let created = self.factory.create().await;
                let mut pools = self.pools.lock();
                let pool = pools.get_mut(tool_id).expect("pool exists");
                pool.creating = pool.creating.saturating_sub(1);
                match created {
                    Ok(value) => {
                        let id = pool.next_id;
                        pool.next_id += 1;
                        let now = Instant::now();
                        pool.active.insert(id, Meta { created_at: now, last_used_at: now, usage_count: 1 });
                        drop(pools);
                        self.metrics.record_pool_acquisition();
                        debug!(tool_id, conn_id = id, "pool acquire: created new connection");
                        Ok(Conn { id, value })
                    }
                    Err(e) => {
                        self.try_satisfy_waiter_locked(pool);
                        Err(e)
                    }
                }
            }
            Plan::Wait => self.wait_for_connection(tool_id, cfg.acquire_timeout_ms).await,
        }
    }

    fn select_idle_index(&self, pool: &mut ToolPool<C>, strategy: PoolStrategy) -> usize {
        match strategy {
            PoolStrategy::RoundRobin => {
                let idx = pool.rr_cursor % pool.idle.len();
                pool.rr_cursor = pool.rr_cursor.wrapping_add(1);
                idx
            }
            PoolStrategy::Random => rand::random::<usize>() % pool.idle.len(),
            PoolStrategy::LeastConnections => pool
                .idle
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.meta.usage_count)
                .map(|(i, _)| i)
                .unwrap_or(0),
            PoolStrategy::Weighted => pool
                .idle
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    let wa = 1.0 / (a.meta.usage_count as f64 + 1.0);
                    let wb = 1.0 / (b.meta.usage_count as f64 + 1.0);
                    wa.partial_cmp(&wb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
                .unwrap_or(0),
        }
    }

    /// Parks on the waiter queue until [`Self::try_satisfy_waiter_locked`]
    /// or `release` hands this waiter a connection id (stashing its value in
    /// `pending`), or the deadline elapses.
    async fn wait_for_connection(&self, tool_id: &str, timeout_ms: u64) -> UtacResult<Conn<C>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pools = self.pools.lock();
            let pool = pools.get_mut(tool_id).expect("pool exists");
            pool.waiters.push_back(Waiter { deadline: Instant::now() + Duration::from_millis(timeout_ms), sender: tx });
        }
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(Ok(id))) => {
                self.metrics.record_pool_acquisition();
                let value = self.take_pending_value(tool_id, id);
                match value {
                    Some(value) => Ok(Conn { id, value }),
                    None => Err(UtacError::internal("waiter resolved without a pending connection value")),
                }
            }
            Ok(Ok(Err(e))) => Err(e),
            _ => {
                self.metrics.record_pool_timeout();
                warn!(tool_id, "pool acquire timed out");
                Err(UtacError::Admission { reason: AdmissionReason::PoolExhausted, retry_after_ms: Some(timeout_ms) })
            }
        }
    }

    fn try_satisfy_waiter_locked(&self, pool: &mut ToolPool<C>) {
        if pool.idle.is_empty() {
            return;
        }
        while let Some(waiter) = pool.waiters.pop_front() {
            if Instant::now() >= waiter.deadline {
                continue;
            }
            let mut idle = pool.idle.remove(0);
            idle.meta.last_used_at = Instant::now();
            idle.meta.usage_count += 1;
            let id = idle.id;
            pool.active.insert(id, idle.meta);
            self.stash_pending_value(id, idle.conn);
            let _ = waiter.sender.send(Ok(id));
            return;
        }
    }

    fn stash_pending_value(&self, id: u64, value: C) {
        self.pending.lock().insert(id, value);
    }

    fn take_pending_value(&self, _tool_id: &str, id: u64) -> Option<C> {
        self.pending.lock().remove(&id)
    }

    /// `release(conn)`. If healthy and not over-lived and the waiter queue
    /// is non-empty, hand directly to the next waiter; else if healthy and
    /// not over-lived, re-idle; else destroy (spec §4.2).
    pub async fn release(&self, tool_id: &str, handle: Conn<C>) {
        let cfg = self.config();
        let healthy = self.factory.validate(&handle.value).await;
        let mut pools = self.pools.lock();
        let pool = pools.get_mut(tool_id).expect("pool exists");
        let Some(meta) = pool.active.remove(&handle.id) else { return };

        let now = Instant::now();
        let over_lived = now.duration_since(meta.created_at) >= Duration::from_millis(cfg.max_lifetime_ms);

        if healthy && !over_lived {
            if let Some(waiter) = pool.waiters.pop_front() {
                if Instant::now() < waiter.deadline {
                    let id = handle.id;
                    pool.active.insert(id, Meta { last_used_at: now, usage_count: meta.usage_count + 1, ..meta });
                    self.stash_pending_value(id, handle.value);
                    let _ = waiter.sender.send(Ok(id));
                    return;
                }
                // expired waiter, drop it and fall through to re-idle.
            }
            pool.idle.push(IdleConn { conn: handle.value, id: handle.id, meta });
        } else {
            drop(pools);
            self.factory.destroy(handle.value).await;
        }
    }

    /// Destroys idle connections older than `maxLifetimeMs` or idle beyond
    /// `idleTimeoutMs`; times out stale waiters. Intended to be driven by a
    /// periodic `tokio::time::interval` in the host application.
    pub async fn run_cleanup_pass(&self) {
        let cfg = self.config();
        let now = Instant::now();
        let mut to_destroy = Vec::new();
        {
            let mut pools = self.pools.lock();
            for pool in pools.values_mut() {
                let mut keep = Vec::new();
                for idle in pool.idle.drain(..) {
                    let over_lived = now.duration_since(idle.meta.created_at) >= Duration::from_millis(cfg.max_lifetime_ms);
                    let idle_too_long = now.duration_since(idle.meta.last_used_at) >= Duration::from_millis(cfg.idle_timeout_ms);
                    if over_lived || idle_too_long {
                        to_destroy.push(idle.conn);
                    } else {
                        keep.push(idle);
                    }
                }
                pool.idle = keep;
                pool.waiters.retain(|w| {
                    if now >= w.deadline {
                        let _ = w.sender.send(Err(UtacError::Admission {
                            reason: AdmissionReason::PoolExhausted,
                            retry_after_ms: None,
                        }));
                        false
                    } else {
                        true
                    }
                });
            }
        }
        for conn in to_destroy {
            self.factory.destroy(conn).await;
        }
    }

    pub fn resize(&self, min: usize, max: usize) {
        let mut cfg = self.config.lock();
        cfg.min = min;
        cfg.max = max;
    }

    pub fn update_config(&self, config: PoolConfig) {
        *self.config.lock() = config;
    }

    /// Two-phase shutdown: reject new waiters, wait for active connections
    /// up to `timeout`, then force-close (spec §4.2).
    pub async fn shutdown(&self, timeout: Duration) {
        {
            let mut pools = self.pools.lock();
            for pool in pools.values_mut() {
                pool.accepting = false;
                while let Some(w) = pool.waiters.pop_front() {
                    let _ = w.sender.send(Err(UtacError::Admission {
                        reason: AdmissionReason::PoolExhausted,
                        retry_after_ms: None,
                    }));
                }
            }
        }
        let deadline = Instant::now() + timeout;
        loop {
            let still_active = self.pools.lock().values().any(|p| !p.active.is_empty());
            if !still_active || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut to_destroy = Vec::new();
        {
            let mut pools = self.pools.lock();
            for pool in pools.values_mut() {
                to_destroy.extend(pool.idle.drain(..).map(|c| c.conn));
            }
        }
        for conn in to_destroy {
            self.factory.destroy(conn).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingFactory {
        created: AtomicU64,
        destroyed: AtomicU64,
    }

    #[async_trait]
    impl ConnectionFactory<u64> for CountingFactory {
        async fn create(&self) -> UtacResult<u64> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }
        async fn validate(&self, _conn: &u64) -> bool {
            true
        }
        async fn destroy(&self, _conn: u64) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(min: usize, max: usize, acquire_timeout_ms: u64) -> ConnectionPool<u64> {
        ConnectionPool::new(
            PoolConfig { min, max, acquire_timeout_ms, ..PoolConfig::default() },
            Arc::new(CountingFactory { created: AtomicU64::new(0), destroyed: AtomicU64::new(0) }),
        )
    }

    #[tokio::test]
    async fn acquire_then_release_reuses_connection() {
        let p = pool(1, 1, 100);
        let c1 = p.acquire("tool").await.unwrap();
        let id = c1.id;
        p.release("tool", c1).await;
        let c2 = p.acquire("tool").await.unwrap();
        assert_eq!(c2.id, id);
    }

    // Scenario 5 from spec §8: pool acquire timeout.
    #[tokio::test]
    async fn second_concurrent_acquire_times_out_then_succeeds_after_release() {
        let p = Arc::new(pool(1, 1, 50));
        let first = p.acquire("tool").await.unwrap();
        let first_id = first.id;

        let p2 = p.clone();
        let waiter = tokio::spawn(async move { p2.acquire("tool").await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        p.release("tool", first).await;

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.id, first_id);
    }

    #[tokio::test]
    async fn acquire_times_out_with_no_release() {
        let p = pool(1, 1, 30);
        let _first = p.acquire("tool").await.unwrap();
        let err = p.acquire("tool").await.unwrap_err();
        assert!(matches!(err, UtacError::Admission { reason: AdmissionReason::PoolExhausted, .. }));
    }
}
