// Copyright 2026 DashFlow Contributors

//! Adapter (C10): the fixed pipeline that turns one agent-facing tool call
//! into a source-tool invocation and back (spec §4.10).
//!
//! `validateInput -> mapToSource -> buildSourceCtx -> callSource ->
//! formatResult -> validateOutput`. Caching, pooling, rate limiting, and
//! circuit breaking wrap `callSource`; none of them ever skip a pipeline
//! stage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info_span, Instrument};

use crate::cache::IntelligentCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{AdmissionReason, UtacError, UtacResult};
use crate::formatter::ResultFormatter;
use crate::mapper::{MappingTrace, ParameterMapper};
use crate::metrics::Metrics;
use crate::pool::PoolHandle;
use crate::rate_limiter::{LimitKey, RateLimiter};
use crate::types::{AdapterResult, BlockConfig, ExecutionContext, SourceTool, ToolId};
use crate::validation::ValidationEngine;

/// Natural-language discovery hints synthesized by the framework registry
/// when an adapter is built from a [`BlockConfig`] (spec §4.11 "synthesize
/// natural-language hints (usage description, examples, keywords,
/// aliases)").
#[derive(Debug, Clone, Default)]
pub struct NaturalLanguageHints {
    pub usage: String,
    pub examples: Vec<String>,
    pub keywords: Vec<String>,
    pub aliases: Vec<String>,
}

/// Introspection surface exposed to the framework registry and, indirectly,
/// to the agent's tool-listing UI (spec §4.10).
#[derive(Debug, Clone)]
pub struct AdapterIntrospection {
    pub id: ToolId,
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub category: String,
    pub tags: Vec<String>,
    pub capabilities: Vec<String>,
    pub requirements: Vec<String>,
    pub usage: String,
    pub examples: Vec<String>,
    pub keywords: Vec<String>,
    pub aliases: Vec<String>,
}

/// Wraps one [`SourceTool`] behind caching, rate limiting, and circuit
/// breaking, synthesized from a [`BlockConfig`] (spec §3, §4.10).
pub struct Adapter {
    block: BlockConfig,
    source: Arc<dyn SourceTool>,
    mapper: ParameterMapper,
    validation: ValidationEngine,
    cache: Option<Arc<IntelligentCache>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    breaker: Option<Arc<CircuitBreaker>>,
    /// A pool this adapter's source tool composes internally, held here only
    /// so framework shutdown can drive it (spec §4.11); never consulted by
    /// the execute pipeline itself (see `DESIGN.md`'s pool/adapter
    /// generic-vs-object-safety resolution).
    pool: Option<Arc<dyn PoolHandle>>,
    hints: NaturalLanguageHints,
    metrics: Arc<Metrics>,
}

impl Adapter {
    pub fn new(block: BlockConfig, source: Arc<dyn SourceTool>, mapper: ParameterMapper, metrics: Arc<Metrics>) -> Self {
        Self {
            block,
            source,
            mapper,
            validation: ValidationEngine::new(),
            cache: None,
            rate_limiter: None,
            breaker: None,
            pool: None,
            hints: NaturalLanguageHints::default(),
            metrics,
        }
    }

    pub fn with_validation(mut self, validation: ValidationEngine) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_cache(mut self, cache: Arc<IntelligentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_pool(mut self, pool: Arc<dyn PoolHandle>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_hints(mut self, hints: NaturalLanguageHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn id(&self) -> &str {
        &self.block.id
    }

    pub fn introspection(&self) -> AdapterIntrospection {
        let descriptor = self.source.descriptor();
        let mut capabilities = vec![];
        if self.source.is_pure() {
            capabilities.push("cacheable".to_string());
        }
        if self.source.has_interrupt() {
            capabilities.push("interactive".to_string());
        }
        AdapterIntrospection {
            id: self.block.id.clone(),
            name: self.block.name.clone(),
            description: self.block.description.clone(),
            parameters: descriptor.input_schema,
            category: self.block.category_or_default().to_string(),
            tags: descriptor.options,
            capabilities,
            requirements: vec![],
            usage: self.hints.usage.clone(),
            examples: self.hints.examples.clone(),
            keywords: self.hints.keywords.clone(),
            aliases: self.hints.aliases.clone(),
        }
    }

    /// Dry-runs the parameter mapping stage only (spec §4.10
    /// `testParameterMapping`), without touching the cache, pool, rate
    /// limiter, or source tool.
    pub fn test_parameter_mapping(&self, raw_args: &HashMap<String, Value>, ctx: &ExecutionContext) -> MappingTrace {
        self.mapper.test_parameter_mapping(raw_args, ctx)
    }

    /// Runs the full fixed pipeline for one call.
    pub async fn execute(&self, raw_args: HashMap<String, Value>, ctx: ExecutionContext) -> AdapterResult {
        let span = info_span!("adapter.execute", adapter = %self.block.id);
        self.execute_inner(raw_args, ctx).instrument(span).await
    }

    async fn execute_inner(&self, raw_args: HashMap<String, Value>, ctx: ExecutionContext) -> AdapterResult {
        let validation_errors = self.validation.validate_input(&self.block.sub_blocks, &raw_args);
        if !validation_errors.is_empty() {
            return ResultFormatter::format_error(&UtacError::Validation(validation_errors));
        }

        let mapped_args = match self.mapper.map(&self.block.sub_blocks, &raw_args, &ctx) {
            Ok(args) => args,
            Err(err) => return ResultFormatter::format_error(&err),
        };

        let schema_errors = crate::validation::validate_against_source_schema(&self.source.descriptor().input_schema, &mapped_args);
        if !schema_errors.is_empty() {
            return ResultFormatter::format_error(&UtacError::Validation(schema_errors));
        }

        // Pipeline order from here follows spec §2's control-flow diagram
        // verbatim: cache lookup, then rate limit, then (batcher, when an
        // adapter composes one internally) breaker gate, then pool
        // acquire/source execute.
        let cache_key = (self.source.is_pure() && self.cache.is_some())
            .then(|| crate::types::CacheKey::new(self.block.id.clone(), &mapped_args, &ctx));

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(cached) = cache.get(&key.to_string()).await {
                self.metrics.record_execution_completed();
                return ResultFormatter::format_outcome(crate::types::SourceToolOutcome {
                    status: 200,
                    message: Some("served from cache".to_string()),
                    data: Some(cached),
                });
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            let key = LimitKey::from_context(&self.block.id, &ctx);
            let decision = limiter.check_limit(&key);
            if !decision.allowed {
                return ResultFormatter::format_error(&UtacError::Admission {
                    reason: AdmissionReason::RateLimited,
                    retry_after_ms: decision.retry_after_ms,
                });
            }
        }

        if let Some(breaker) = &self.breaker {
            if !breaker.allow_request() {
                return ResultFormatter::format_error(&UtacError::Admission {
                    reason: AdmissionReason::CircuitOpen,
                    retry_after_ms: None,
                });
            }
        }

        let outcome = self.source.execute(&ctx, &mapped_args).await;

        if let Some(breaker) = &self.breaker {
            if outcome.is_success() {
                breaker.on_success();
            } else {
                breaker.on_failure();
            }
        }

        if outcome.is_success() {
            self.metrics.record_execution_completed();
            if let (Some(cache), Some(key), Some(data)) = (&self.cache, &cache_key, outcome.data.clone()) {
                cache.set(&key.to_string(), data, None).await;
            }
        } else {
            self.metrics.record_execution_errored();
        }

        let result = ResultFormatter::format_outcome(outcome);
        let output_errors = self.validation.validate_output(&result);
        if !output_errors.is_empty() {
            return ResultFormatter::format_error(&UtacError::Validation(output_errors));
        }
        result
    }

    /// Used by the registry during `discoverTools` scoring and staged
    /// shutdown to tell which collaborators this adapter was actually built
    /// with.
    pub fn has_breaker(&self) -> bool {
        self.breaker.is_some()
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    pub fn has_pool(&self) -> bool {
        self.pool.is_some()
    }

    /// Clears this adapter's cache, if it has one (spec §4.11 shutdown
    /// "clears caches").
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    /// Closes this adapter's connection pool, if it has one (spec §4.11
    /// shutdown "closes the pool").
    pub async fn close_pool(&self, timeout: Duration) {
        if let Some(pool) = &self.pool {
            pool.close(timeout).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, CacheConfig};
    use crate::mapper::{ContextSource, ParameterMapping};
    use crate::types::{SourceToolDescriptor, SourceToolOutcome};
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl SourceTool for EchoTool {
        fn descriptor(&self) -> SourceToolDescriptor {
            SourceToolDescriptor {
                id: "echo".into(),
                display_name: "Echo".into(),
                input_schema: serde_json::json!({}),
                category: "utility".into(),
                options: vec!["fast".into()],
                has_interrupt: false,
            }
        }

        async fn execute(&self, _ctx: &ExecutionContext, args: &HashMap<String, Value>) -> SourceToolOutcome {
            SourceToolOutcome { status: 200, message: Some("ok".into()), data: Some(Value::Object(args.clone().into_iter().collect())) }
        }

        fn is_pure(&self) -> bool {
            true
        }
    }

    fn block() -> BlockConfig {
        BlockConfig { block_type: "tool".into(), id: "echo".into(), name: "Echo".into(), description: "echoes input".into(), category: None, sub_blocks: vec![] }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext { agent_id: "a".into(), session_id: "s".into(), request_type: "query".into(), ..Default::default() }
    }

    #[tokio::test]
    async fn successful_call_returns_success_envelope() {
        let mapper = ParameterMapper::new(vec![ParameterMapping {
            source_parameter: "msg".into(),
            condition: None,
            source: ContextSource::RawArg("msg".into()),
            transform: None,
        }]);
        let adapter = Adapter::new(block(), Arc::new(EchoTool), mapper, Arc::new(Metrics::new()));
        let mut args = HashMap::new();
        args.insert("msg".to_string(), Value::from("hi"));
        let result = adapter.execute(args, ctx()).await;
        assert_eq!(result.kind, crate::types::ResultKind::Success);
    }

    #[tokio::test]
    async fn open_breaker_rejects_before_calling_source() {
        let mapper = ParameterMapper::new(vec![]);
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig { failure_threshold: 1, recovery_timeout_ms: 60_000, half_open_max_requests: 1, failure_window_ms: 60_000 }));
        breaker.force_open();
        let adapter = Adapter::new(block(), Arc::new(EchoTool), mapper, Arc::new(Metrics::new())).with_breaker(breaker);
        let result = adapter.execute(HashMap::new(), ctx()).await;
        assert_eq!(result.kind, crate::types::ResultKind::Error);
        assert_eq!(result.metadata["code"], Value::String("circuit_open".into()));
    }

    #[tokio::test]
    async fn pure_tool_result_is_cached_on_second_call() {
        let mapper = ParameterMapper::new(vec![ParameterMapping {
            source_parameter: "msg".into(),
            condition: None,
            source: ContextSource::RawArg("msg".into()),
            transform: None,
        }]);
        let cache = Arc::new(IntelligentCache::new(CacheConfig::default()));
        let adapter = Adapter::new(block(), Arc::new(EchoTool), mapper, Arc::new(Metrics::new())).with_cache(cache.clone());
        let mut args = HashMap::new();
        args.insert("msg".to_string(), Value::from("cache-me"));
        let r1 = adapter.execute(args.clone(), ctx()).await;
        assert_eq!(r1.kind, crate::types::ResultKind::Success);
        let stats = cache.stats();
        assert_eq!(stats.size, 1);
    }

    // spec §8 invariant: a validation rejection never reaches the cache.
    #[tokio::test]
    async fn validation_failure_never_writes_to_cache() {
        use crate::types::{SubBlockConfig, SubBlockKind};

        let mapper = ParameterMapper::new(vec![ParameterMapping {
            source_parameter: "msg".into(),
            condition: None,
            source: ContextSource::RawArg("msg".into()),
            transform: None,
        }]);
        let mut required_block = block();
        required_block.sub_blocks = vec![SubBlockConfig {
            id: "msg".into(),
            kind: SubBlockKind::ShortInput,
            required: true,
            default: None,
            depends_on: vec![],
            visibility: None,
            dynamic_resolver: None,
            source_parameter: None,
        }];
        let cache = Arc::new(IntelligentCache::new(CacheConfig::default()));
        let adapter = Adapter::new(required_block, Arc::new(EchoTool), mapper, Arc::new(Metrics::new())).with_cache(cache.clone());

        let result = adapter.execute(HashMap::new(), ctx()).await;
        assert_eq!(result.kind, crate::types::ResultKind::Error);
        assert_eq!(cache.stats().size, 0);
    }
}
