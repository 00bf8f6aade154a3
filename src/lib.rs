// Copyright 2026 DashFlow Contributors

//! Universal Tool Adapter Core (UTAC).
//!
//! Wraps heterogeneous "source tools" — each described by a declarative
//! [`types::BlockConfig`] — into a uniform, conversational tool interface
//! suitable for invocation by an AI agent. The core translates between two
//! parameter worlds (the agent-facing surface and the source tool's native
//! arguments), guards every call with validation, caching, pooling,
//! batching, rate limiting, circuit breaking, and health supervision, and
//! exposes self-describing discovery and metrics.
//!
//! # Request lifecycle
//!
//! One invocation flows: agent call -> [`adapter::Adapter::execute`] ->
//! [`validation::ValidationEngine`] -> [`mapper::ParameterMapper`] ->
//! [`cache::IntelligentCache`] lookup -> [`rate_limiter::RateLimiter`] check
//! -> [`circuit_breaker::CircuitBreaker`] gate -> source tool execute ->
//! [`formatter::ResultFormatter`] -> cache store -> return. The
//! [`batcher::RequestBatcher`] coalesces concurrent compatible calls ahead
//! of the source tool invocation when an adapter is built with one wired
//! in; the [`health::HealthMonitor`] runs orthogonally and can force-open a
//! breaker or trigger self-healing.
//!
//! # Module map
//!
//! | Component | Module | Responsibility |
//! |---|---|---|
//! | C1 | [`cache`] | Bounded key-value store with TTL and pluggable eviction |
//! | C2 | [`pool`] | Per-tool pool of reusable handles |
//! | C3 | [`rate_limiter`] | Hierarchical, multi-algorithm admission control |
//! | C4 | [`circuit_breaker`] | closed/open/half-open failure gate |
//! | C5 | [`health`] | Multi-tier probing, scoring, self-healing |
//! | C6 | [`batcher`] | Coalesces compatible in-flight requests |
//! | C7 | [`mapper`] | Declarative parameter transformation |
//! | C8 | [`validation`] | Schema and business-rule validation |
//! | C9 | [`formatter`] | Wraps source results into conversational envelopes |
//! | C10 | [`adapter`] | Composes C1-C9 around one source tool |
//! | C11 | [`registry`] | Builds adapters from block configs, discovery, plugins |
//! | C12 | [`load_balancer`] | Distributes requests across replicated instances |
//!
//! [`types`] holds the shared data model, [`error`] the error taxonomy,
//! [`config`] the runtime configuration surface, and [`metrics`] the
//! process-lifetime counters every component reports into.

pub mod adapter;
pub mod batcher;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod formatter;
pub mod health;
pub mod load_balancer;
pub mod mapper;
pub mod metrics;
pub mod pool;
pub mod rate_limiter;
pub mod registry;
pub mod types;
pub mod validation;

pub use adapter::{Adapter, AdapterIntrospection};
pub use error::{UtacError, UtacResult};
pub use registry::{FrameworkRegistry, ShutdownReport};
pub use types::{AdapterResult, BlockConfig, ExecutionContext, SourceTool, SubBlockConfig};
