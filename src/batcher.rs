// Copyright 2026 DashFlow Contributors

//! Request Batcher (C6): groups concurrent calls to the same source tool
//! into one underlying invocation, resolving each waiter independently
//! (spec §4.6).
//!
//! Batchability (spec §9 Open Question): when `intelligent_batching` is
//! false, any two requests sharing a batch key are merged unconditionally.
//! When true, a caller-supplied [`BatchPredicate`] decides whether a new
//! request may join the pending batch; with none installed, nothing beyond
//! the batch key is considered. We never infer compatibility from argument
//! shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::debug;

use crate::config::BatcherConfig;
use crate::error::{UtacError, UtacResult};
use crate::metrics::Metrics;
use crate::types::ExecutionContext;

/// Groups requests by `(tool_id, ctx.request_type, ctx.agent_id)` (spec
/// §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub tool_id: String,
    pub request_type: String,
    pub agent_id: String,
}

impl BatchKey {
    pub fn from_context(tool_id: impl Into<String>, ctx: &ExecutionContext) -> Self {
        Self { tool_id: tool_id.into(), request_type: ctx.request_type.clone(), agent_id: ctx.agent_id.clone() }
    }
}

/// Caller-supplied compatibility predicate used only when
/// `intelligent_batching` is enabled.
pub trait BatchPredicate: Send + Sync {
    fn compatible(&self, args: &HashMap<String, Value>, pending_args: &[HashMap<String, Value>]) -> bool;
}

/// Executes one already-formed batch, returning one outcome per member in
/// the same order the members were submitted.
#[async_trait::async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute_batch(&self, args: Vec<HashMap<String, Value>>) -> Vec<UtacResult<Value>>;
}

struct PendingMember {
    args: HashMap<String, Value>,
    sender: oneshot::Sender<UtacResult<Value>>,
}

struct PendingBatch {
    members: Vec<PendingMember>,
}

/// Accumulates members per [`BatchKey`] and flushes on size or timer,
/// matching `Promise.allSettled` semantics: every waiter resolves
/// independently of its batch siblings' outcomes (spec §4.6).
pub struct RequestBatcher {
    config: parking_lot::Mutex<BatcherConfig>,
    pending: AsyncMutex<HashMap<BatchKey, PendingBatch>>,
    executor: Arc<dyn BatchExecutor>,
    predicate: Option<Arc<dyn BatchPredicate>>,
    metrics: Arc<Metrics>,
}

impl RequestBatcher {
    pub fn new(config: BatcherConfig, executor: Arc<dyn BatchExecutor>, metrics: Arc<Metrics>) -> Self {
        Self { config: parking_lot::Mutex::new(config), pending: AsyncMutex::new(HashMap::new()), executor, predicate: None, metrics }
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn BatchPredicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Submits one request. Resolves when the batch it lands in has been
    /// flushed, either because it hit `max_batch_size` or because
    /// `batch_timeout_ms` elapsed since the batch's first member joined.
    ///
    /// Takes `self: &Arc<Self>` so the timer task can hold its own owning
    /// reference rather than borrowing across the `.await`.
    pub async fn submit(self: &Arc<Self>, key: BatchKey, args: HashMap<String, Value>) -> UtacResult<Value> {
        let (tx, rx) = oneshot::channel();
        let (max_batch_size, timeout) = {
            let cfg = self.config.lock();
            (cfg.max_batch_size, Duration::from_millis(cfg.batch_timeout_ms))
        };

        let should_flush_now = {
            let mut pending = self.pending.lock().await;
            let batch = pending.entry(key.clone()).or_insert_with(|| PendingBatch { members: Vec::new() });

            let joinable = match &self.predicate {
                Some(p) if self.config.lock().intelligent_batching => {
                    let existing: Vec<_> = batch.members.iter().map(|m| m.args.clone()).collect();
                    p.compatible(&args, &existing)
                }
                _ => true,
            };

            if joinable {
                batch.members.push(PendingMember { args, sender: tx });
                batch.members.len() >= max_batch_size
            } else {
                // Incompatible with the pending batch: flush what's there now
                // and start a fresh one containing only this member.
                let flushed = std::mem::replace(batch, PendingBatch { members: vec![PendingMember { args, sender: tx }] });
                drop(pending);
                self.flush_members(flushed.members).await;
                return rx.await.map_err(|_| UtacError::internal("batch sender dropped"))?;
            }
        };

        if should_flush_now {
            self.flush_key(&key).await;
        } else {
            self.schedule_timeout_flush(key, timeout);
        }

        rx.await.map_err(|_| UtacError::internal("batch sender dropped"))?
    }

    fn schedule_timeout_flush(self: &Arc<Self>, key: BatchKey, timeout: Duration) {
        // Each submission arms its own timer; only the one that observes the
        // batch still present (i.e. not already flushed by size) does work.
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.flush_key(&key).await;
        });
    }

    async fn flush_key(&self, key: &BatchKey) {
        let batch = {
            let mut pending = self.pending.lock().await;
            pending.remove(key)
        };
        if let Some(batch) = batch {
            if !batch.members.is_empty() {
                self.flush_members(batch.members).await;
            }
        }
    }

    async fn flush_members(&self, members: Vec<PendingMember>) {
        let count = members.len();
        let args: Vec<_> = members.iter().map(|m| m.args.clone()).collect();
        debug!(batch_size = count, "flushing batch");
        let outcomes = self.executor.execute_batch(args).await;
        self.metrics.record_batch_flush();
        for (member, outcome) in members.into_iter().zip(outcomes.into_iter()) {
            let _ = member.sender.send(outcome);
        }
    }

    pub fn update_config(&self, config: BatcherConfig) {
        *self.config.lock() = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoCountExecutor {
        calls: AtomicUsize,
        sizes: AsyncMutex<Vec<usize>>,
    }

    #[async_trait::async_trait]
    impl BatchExecutor for EchoCountExecutor {
        async fn execute_batch(&self, args: Vec<HashMap<String, Value>>) -> Vec<UtacResult<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sizes.lock().await.push(args.len());
            args.into_iter().map(|a| Ok(Value::Object(a.into_iter().collect()))).collect()
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext { agent_id: "agent-1".into(), session_id: "s1".into(), request_type: "query".into(), ..Default::default() }
    }

    #[tokio::test]
    async fn flushes_on_max_batch_size() {
        let executor = Arc::new(EchoCountExecutor { calls: AtomicUsize::new(0), sizes: AsyncMutex::new(vec![]) });
        let metrics = Arc::new(Metrics::default());
        let batcher = Arc::new(RequestBatcher::new(
            BatcherConfig { max_batch_size: 2, batch_timeout_ms: 5_000, intelligent_batching: false },
            executor.clone(),
            metrics,
        ));

        let key = BatchKey::from_context("search", &ctx());
        let mut args1 = HashMap::new();
        args1.insert("q".to_string(), Value::from("a"));
        let mut args2 = HashMap::new();
        args2.insert("q".to_string(), Value::from("b"));

        let b1 = batcher.clone();
        let k1 = key.clone();
        let h1 = tokio::spawn(async move { b1.submit(k1, args1).await });
        let h2 = batcher.submit(key, args2).await;

        let r1 = h1.await.unwrap();
        assert!(r1.is_ok());
        assert!(h2.is_ok());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*executor.sizes.lock().await, vec![2]);
    }

    #[tokio::test]
    async fn flushes_on_timeout_with_single_member() {
        let executor = Arc::new(EchoCountExecutor { calls: AtomicUsize::new(0), sizes: AsyncMutex::new(vec![]) });
        let metrics = Arc::new(Metrics::default());
        let batcher = Arc::new(RequestBatcher::new(
            BatcherConfig { max_batch_size: 10, batch_timeout_ms: 20, intelligent_batching: false },
            executor.clone(),
            metrics,
        ));

        let key = BatchKey::from_context("search", &ctx());
        let mut args = HashMap::new();
        args.insert("q".to_string(), Value::from("solo"));
        let result = batcher.submit(key, args).await;
        assert!(result.is_ok());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    struct RejectAllPredicate;
    impl BatchPredicate for RejectAllPredicate {
        fn compatible(&self, _args: &HashMap<String, Value>, pending_args: &[HashMap<String, Value>]) -> bool {
            pending_args.is_empty()
        }
    }

    #[tokio::test]
    async fn incompatible_member_flushes_pending_batch_first() {
        let executor = Arc::new(EchoCountExecutor { calls: AtomicUsize::new(0), sizes: AsyncMutex::new(vec![]) });
        let metrics = Arc::new(Metrics::default());
        let batcher = Arc::new(
            RequestBatcher::new(
                BatcherConfig { max_batch_size: 10, batch_timeout_ms: 5_000, intelligent_batching: true },
                executor.clone(),
                metrics,
            )
            .with_predicate(Arc::new(RejectAllPredicate)),
        );

        let key = BatchKey::from_context("search", &ctx());
        let mut a1 = HashMap::new();
        a1.insert("q".to_string(), Value::from("a"));
        let mut a2 = HashMap::new();
        a2.insert("q".to_string(), Value::from("b"));

        let r2 = batcher.submit(key, a2).await;
        assert!(r2.is_ok());
        let _ = a1;
    }
}
