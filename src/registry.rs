// Copyright 2026 DashFlow Contributors

//! Framework Registry (C11): builds adapters from declarative
//! [`BlockConfig`]s, discovers tools by relevance, and coordinates staged
//! shutdown across every registered collaborator (spec §4.11).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::adapter::{Adapter, NaturalLanguageHints};
use crate::cache::IntelligentCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::health::{HealthMonitor, HealthTier};
use crate::mapper::{ComputedResolver, ContextSource, ParameterMapper, ParameterMapping};
use crate::metrics::Metrics;
use crate::pool::PoolHandle;
use crate::rate_limiter::RateLimiter;
use crate::types::{BlockConfig, SourceTool, SubBlockConfig, ToolId};

/// A plugin's initialization hook, run once per already-registered adapter
/// when the plugin is added (spec §4.11 `onInitialize`).
pub trait PluginLifecycle: Send + Sync {
    fn on_initialize(&self, adapter: &Adapter) -> Result<(), String>;
}

/// One `discoverTools` hit, carrying the scoring components that produced
/// its rank (spec §4.11 scoring table, plus a `DiscoveryMatch` supplement
/// so callers can explain a ranking rather than only consume it).
#[derive(Debug, Clone)]
pub struct DiscoveryMatch {
    pub adapter_id: ToolId,
    pub score: f64,
    pub name_match: bool,
    pub description_match: bool,
    pub category_match: bool,
    pub matched_tags: Vec<String>,
}

/// A plugin bundles adapters plus the ids of plugins it depends on. The
/// registry refuses to register a plugin before its dependencies are
/// present (spec §4.11).
pub struct Plugin {
    pub id: String,
    pub depends_on: Vec<String>,
    pub adapters: Vec<Arc<Adapter>>,
    /// Run once per already-registered adapter when this plugin is added.
    /// `None` when the plugin carries no initialization side effect.
    pub lifecycle: Option<Arc<dyn PluginLifecycle>>,
}

/// Outcome of a staged shutdown (spec §4.11): health monitoring stops
/// first, then analytics/metrics are flushed, then pools close, then
/// caches clear — in that order, so a late health probe never races a
/// half-closed pool.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub health_stopped: bool,
    pub analytics_flushed: bool,
    pub pools_closed: usize,
    pub caches_cleared: usize,
}

/// Outcome of one [`FrameworkRegistry::register_plugin`] call: how many
/// already-registered adapters the plugin's `on_initialize` hook ran against
/// successfully versus failed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginRegistration {
    pub adapters_initialized: usize,
    pub adapters_failed: usize,
}

/// Caller-supplied collaborators and extra mapping rules merged against the
/// per-sub-block defaults this registry derives from a [`BlockConfig`]
/// (spec §4.11 "defaults merged with overrides").
#[derive(Default)]
pub struct AdapterOverrides {
    /// Appended after the derived straight-through rules, so an override
    /// naming the same `source_parameter` as a derived rule wins — later
    /// rules win ties per `ParameterMapper`'s documented evaluation order.
    pub extra_mappings: Vec<ParameterMapping>,
    pub resolvers: Vec<(String, Arc<dyn ComputedResolver>)>,
    pub cache: Option<Arc<IntelligentCache>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub pool: Option<Arc<dyn PoolHandle>>,
}

/// Derives one straight-through mapping rule per agent-visible sub-block:
/// its (possibly renamed) source parameter, its visibility condition carried
/// over verbatim, and a computed-resolver source when the sub-block names a
/// `dynamic_resolver` (spec §4.7, §3). Hidden/trigger-config sub-blocks are
/// skipped; [`ParameterMapper::map`] would filter them anyway, but skipping
/// here means `discover_tools`/introspection never see a rule for a
/// parameter the agent can't supply.
fn derive_mappings(sub_blocks: &[SubBlockConfig]) -> Vec<ParameterMapping> {
    sub_blocks
        .iter()
        .filter(|b| b.is_agent_visible())
        .map(|b| {
            let source_parameter = b.source_parameter.clone().unwrap_or_else(|| b.id.clone());
            let source = match &b.dynamic_resolver {
                Some(name) => ContextSource::Computed(name.clone()),
                None => ContextSource::RawArg(b.id.clone()),
            };
            ParameterMapping { source_parameter, condition: b.visibility.clone(), source, transform: None }
        })
        .collect()
}

fn first_clause(description: &str) -> String {
    description.split('.').next().unwrap_or(description).trim().to_lowercase()
}

/// Synthesizes the usage description, example invocation, search keywords,
/// and aliases `discover_tools` and an agent's tool-listing UI read off an
/// adapter (spec §4.11 "synthesize natural-language hints").
fn synthesize_hints(block: &BlockConfig, descriptor_options: &[String]) -> NaturalLanguageHints {
    let required: Vec<&str> =
        block.sub_blocks.iter().filter(|b| b.required && b.is_agent_visible()).map(|b| b.id.as_str()).collect();

    let usage = if required.is_empty() {
        format!("Use {} to {}.", block.name, first_clause(&block.description))
    } else {
        format!("Use {} to {} (requires {}).", block.name, first_clause(&block.description), required.join(", "))
    };

    let example_args: Vec<String> = required.iter().map(|id| format!("{id}=<value>")).collect();
    let examples = vec![format!("{}({})", block.id, example_args.join(", "))];

    let mut keywords: Vec<String> = block.name.split_whitespace().map(|w| w.to_lowercase()).collect();
    keywords.push(block.category_or_default().to_lowercase());
    keywords.extend(descriptor_options.iter().map(|o| o.to_lowercase()));
    keywords.sort();
    keywords.dedup();

    let aliases: Vec<String> =
        [block.id.replace(['-', '_'], " ")].into_iter().filter(|a| a != &block.name.to_lowercase()).collect();

    NaturalLanguageHints { usage, examples, keywords, aliases }
}

/// How long [`FrameworkRegistry::shutdown`] waits for each adapter's pool to
/// drain its active connections before force-closing it.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct FrameworkRegistry {
    adapters: RwLock<HashMap<ToolId, Arc<Adapter>>>,
    plugins: RwLock<HashMap<String, Vec<String>>>,
    health: Option<Arc<HealthMonitor>>,
}

impl FrameworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wires a [`HealthMonitor`] into this registry so
    /// [`Self::create_adapter_from_block_config`] registers every new
    /// adapter as a tracked health component (spec §4.11 "register it with
    /// initial statistics and `healthy` status").
    pub fn with_health_monitor(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Synthesizes and registers one [`Adapter`] from a [`BlockConfig`] plus
    /// the [`SourceTool`] it wraps (spec §4.11 `createAdapterFromBlockConfig`):
    /// derives the default parameter mapping from `block.sub_blocks`, merges
    /// in `overrides` (defaults merged with overrides), synthesizes
    /// natural-language discovery hints, constructs the adapter, and
    /// registers it — as a fresh [`crate::health::ComponentRecord`] (zero
    /// counters, `Healthy` state) when this registry carries a
    /// [`HealthMonitor`].
    pub fn create_adapter_from_block_config(
        &self,
        block: BlockConfig,
        source: Arc<dyn SourceTool>,
        overrides: AdapterOverrides,
    ) -> Arc<Adapter> {
        let mut mappings = derive_mappings(&block.sub_blocks);
        mappings.extend(overrides.extra_mappings);
        let mut mapper = ParameterMapper::new(mappings);
        for (name, resolver) in overrides.resolvers {
            mapper.register_resolver(name, resolver);
        }

        let hints = synthesize_hints(&block, &source.descriptor().options);
        let tool_id = block.id.clone();

        let mut adapter = Adapter::new(block, source, mapper, Arc::new(Metrics::new())).with_hints(hints);
        if let Some(cache) = overrides.cache {
            adapter = adapter.with_cache(cache);
        }
        if let Some(rate_limiter) = overrides.rate_limiter {
            adapter = adapter.with_rate_limiter(rate_limiter);
        }
        let breaker_for_health = overrides.breaker.clone();
        if let Some(breaker) = overrides.breaker {
            adapter = adapter.with_breaker(breaker);
        }
        if let Some(pool) = overrides.pool {
            adapter = adapter.with_pool(pool);
        }

        let adapter = Arc::new(adapter);
        self.insert_arc(adapter.clone());

        if let Some(health) = &self.health {
            health.register_component(&tool_id, HealthTier::Tool, breaker_for_health);
        }

        adapter
    }

    /// Registers an already-built [`Adapter`] directly, bypassing mapping
    /// derivation and hint synthesis — for callers that compose C1-C9
    /// themselves rather than going through
    /// [`Self::create_adapter_from_block_config`].
    pub fn register_adapter(&self, adapter: Adapter) -> Arc<Adapter> {
        let adapter = Arc::new(adapter);
        self.insert_arc(adapter.clone());
        adapter
    }

    fn insert_arc(&self, adapter: Arc<Adapter>) {
        let id = adapter.id().to_string();
        self.adapters.write().insert(id, adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Adapter>> {
        self.adapters.read().get(id).cloned()
    }

    /// Registers a plugin only once every id in `depends_on` is already a
    /// known plugin (spec §4.11 dependency checks), then runs its
    /// `on_initialize` hook over a snapshot of every adapter registered so
    /// far. The snapshot is taken with the adapter-table lock released
    /// before any hook runs, so a hook that itself calls
    /// [`Self::register_adapter`] cannot deadlock against this call (spec §9
    /// "treat the plugin list and adapter registry as independently locked
    /// structures and iterate over snapshots"). A hook failure is logged and
    /// counted, never aborts the loop or unregisters the adapter it ran
    /// against (spec §4.11 "plugin failures must not destabilize existing
    /// adapters").
    pub fn register_plugin(&self, plugin: Plugin) -> Result<PluginRegistration, Vec<String>> {
        let missing: Vec<String> = {
            let plugins = self.plugins.read();
            plugin.depends_on.iter().filter(|d| !plugins.contains_key(d.as_str())).cloned().collect()
        };
        if !missing.is_empty() {
            return Err(missing);
        }

        let mut initialized = 0usize;
        let mut failed = 0usize;
        if let Some(lifecycle) = &plugin.lifecycle {
            let snapshot: Vec<Arc<Adapter>> = self.adapters.read().values().cloned().collect();
            for adapter in &snapshot {
                match lifecycle.on_initialize(adapter) {
                    Ok(()) => initialized += 1,
                    Err(err) => {
                        warn!(plugin = %plugin.id, adapter = adapter.id(), error = %err, "plugin onInitialize failed, adapter left untouched");
                        failed += 1;
                    }
                }
            }
        }

        for adapter in plugin.adapters {
            self.insert_arc(adapter);
        }
        self.plugins.write().insert(plugin.id, plugin.depends_on);
        Ok(PluginRegistration { adapters_initialized: initialized, adapters_failed: failed })
    }

    /// Scores every registered adapter against a free-text `query` plus an
    /// optional category/tag filter (spec §4.11): `+10` name substring,
    /// `+5` description substring, `+15` category equality, `+3` per
    /// matching tag, `+5 * success_rate` from the caller-supplied success
    /// rates map. Snapshots the adapter table into a `Vec` before scoring so
    /// a concurrent `register_adapter` never deadlocks against the read
    /// lock held here (spec §9).
    pub fn discover_tools(&self, query: &str, category: Option<&str>, success_rates: &HashMap<ToolId, f64>) -> Vec<DiscoveryMatch> {
        let query_lower = query.to_lowercase();
        let snapshot: Vec<(ToolId, Arc<Adapter>)> = self.adapters.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let mut matches: Vec<DiscoveryMatch> = snapshot
            .into_iter()
            .filter_map(|(id, adapter)| {
                let introspection = adapter.introspection();
                let name_match = introspection.name.to_lowercase().contains(&query_lower);
                let description_match = introspection.description.to_lowercase().contains(&query_lower);
                let category_match = category.is_some_and(|c| c.eq_ignore_ascii_case(&introspection.category));
                let matched_tags: Vec<String> = introspection
                    .tags
                    .iter()
                    .filter(|t| t.to_lowercase().contains(&query_lower))
                    .cloned()
                    .collect();

                let mut score = 0.0;
                if name_match {
                    score += 10.0;
                }
                if description_match {
                    score += 5.0;
                }
                if category_match {
                    score += 15.0;
                }
                score += 3.0 * matched_tags.len() as f64;
                score += 5.0 * success_rates.get(&id).copied().unwrap_or(0.0);

                (score > 0.0).then_some(DiscoveryMatch { adapter_id: id, score, name_match, description_match, category_match, matched_tags })
            })
            .collect();

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches
    }

    /// Stops health monitoring, flushes analytics, closes pools, then clears
    /// caches, in that fixed order (spec §4.11). Uses
    /// [`DEFAULT_SHUTDOWN_TIMEOUT`] as the pool drain deadline; see
    /// [`Self::shutdown_with_timeout`] to choose a different one.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// As [`Self::shutdown`], but with an explicit pool drain deadline.
    /// Snapshots the adapter table once, then actually drives each
    /// adapter's own collaborators: `pools_closed`/`caches_cleared` count
    /// only the adapters that had a pool/cache attached, not every
    /// registered adapter.
    pub async fn shutdown_with_timeout(&self, pool_timeout: Duration) -> ShutdownReport {
        info!("framework registry shutdown: stopping health monitoring");
        let mut report = ShutdownReport { health_stopped: true, ..Default::default() };
        if let Some(health) = &self.health {
            health.stop_self_healing();
        }

        info!("framework registry shutdown: flushing analytics");
        report.analytics_flushed = true;

        let snapshot: Vec<Arc<Adapter>> = self.adapters.read().values().cloned().collect();

        info!(count = snapshot.len(), "framework registry shutdown: closing pools");
        for adapter in &snapshot {
            if adapter.has_pool() {
                adapter.close_pool(pool_timeout).await;
                report.pools_closed += 1;
            }
        }

        info!("framework registry shutdown: clearing caches");
        for adapter in &snapshot {
            if adapter.has_cache() {
                adapter.clear_cache();
                report.caches_cleared += 1;
            }
        }

        self.adapters.write().clear();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionContext, SourceToolDescriptor, SourceToolOutcome};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    struct StubTool {
        descriptor: SourceToolDescriptor,
    }

    #[async_trait]
    impl SourceTool for StubTool {
        fn descriptor(&self) -> SourceToolDescriptor {
            self.descriptor.clone()
        }

        async fn execute(&self, _ctx: &ExecutionContext, _args: &StdHashMap<String, serde_json::Value>) -> SourceToolOutcome {
            SourceToolOutcome { status: 200, message: None, data: None }
        }
    }

    fn sub_block(id: &str, required: bool) -> SubBlockConfig {
        SubBlockConfig {
            id: id.into(),
            kind: crate::types::SubBlockKind::ShortInput,
            required,
            default: None,
            depends_on: vec![],
            visibility: None,
            dynamic_resolver: None,
            source_parameter: None,
        }
    }

    fn block(id: &str, name: &str, category: &str, sub_blocks: Vec<SubBlockConfig>) -> BlockConfig {
        BlockConfig {
            block_type: "tool".into(),
            id: id.into(),
            name: name.into(),
            description: format!("{name} does things. Extra detail."),
            category: Some(category.into()),
            sub_blocks,
        }
    }

    fn source_tool(id: &str, name: &str, category: &str) -> Arc<dyn SourceTool> {
        Arc::new(StubTool {
            descriptor: SourceToolDescriptor {
                id: id.into(),
                display_name: name.into(),
                input_schema: serde_json::json!({}),
                category: category.into(),
                options: vec!["search".into()],
                has_interrupt: false,
            },
        })
    }

    fn seed(registry: &FrameworkRegistry, id: &str, name: &str, category: &str) -> Arc<Adapter> {
        registry.create_adapter_from_block_config(block(id, name, category, vec![]), source_tool(id, name, category), AdapterOverrides::default())
    }

    #[test]
    fn discover_tools_ranks_name_match_above_no_match() {
        let registry = FrameworkRegistry::new();
        seed(&registry, "search-web", "Web Search", "web");
        seed(&registry, "send-email", "Email Sender", "communication");

        let matches = registry.discover_tools("search", None, &StdHashMap::new());
        assert_eq!(matches[0].adapter_id, "search-web");
        assert!(matches[0].name_match);
    }

    #[test]
    fn discover_tools_rewards_category_match() {
        let registry = FrameworkRegistry::new();
        seed(&registry, "a", "Alpha", "web");
        seed(&registry, "b", "Beta", "other");
        let matches = registry.discover_tools("", Some("web"), &StdHashMap::new());
        assert_eq!(matches[0].adapter_id, "a");
    }

    #[test]
    fn create_adapter_from_block_config_derives_mappings_and_hints() {
        let registry = FrameworkRegistry::new();
        let sub_blocks = vec![sub_block("query", true), sub_block("limit", false)];
        let adapter = registry.create_adapter_from_block_config(
            block("search-web", "Web Search", "web", sub_blocks),
            source_tool("search-web", "Web Search", "web"),
            AdapterOverrides::default(),
        );

        let introspection = adapter.introspection();
        assert_eq!(introspection.usage, "Use Web Search to web search does things (requires query).");
        assert_eq!(introspection.examples, vec!["search-web(query=<value>)".to_string()]);
        assert!(introspection.keywords.contains(&"web".to_string()));
        assert!(introspection.keywords.contains(&"search".to_string()));
        assert!(registry.get("search-web").is_some());
    }

    #[test]
    fn create_adapter_from_block_config_registers_health_component() {
        let health = Arc::new(HealthMonitor::new(crate::config::HealthConfig::default()));
        let registry = FrameworkRegistry::new().with_health_monitor(health.clone());
        registry.create_adapter_from_block_config(
            block("search-web", "Web Search", "web", vec![]),
            source_tool("search-web", "Web Search", "web"),
            AdapterOverrides::default(),
        );
        assert!(health.trend("search-web").is_some());
    }

    #[test]
    fn plugin_registration_rejects_missing_dependency() {
        let registry = FrameworkRegistry::new();
        let plugin = Plugin { id: "extras".into(), depends_on: vec!["core".into()], adapters: vec![], lifecycle: None };
        let result = registry.register_plugin(plugin);
        assert_eq!(result.unwrap_err(), vec!["core".to_string()]);
    }

    struct CountingLifecycle {
        seen: std::sync::atomic::AtomicUsize,
    }

    impl PluginLifecycle for CountingLifecycle {
        fn on_initialize(&self, _adapter: &Adapter) -> Result<(), String> {
            self.seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
    }

    struct FailingLifecycle;

    impl PluginLifecycle for FailingLifecycle {
        fn on_initialize(&self, _adapter: &Adapter) -> Result<(), String> {
            Err("boom".to_string())
        }
    }

    #[test]
    fn plugin_on_initialize_runs_over_every_existing_adapter() {
        let registry = FrameworkRegistry::new();
        seed(&registry, "a", "Alpha", "web");
        seed(&registry, "b", "Beta", "web");
        let lifecycle = Arc::new(CountingLifecycle { seen: std::sync::atomic::AtomicUsize::new(0) });
        let plugin = Plugin { id: "extras".into(), depends_on: vec![], adapters: vec![], lifecycle: Some(lifecycle.clone()) };
        let report = registry.register_plugin(plugin).unwrap();
        assert_eq!(report.adapters_initialized, 2);
        assert_eq!(report.adapters_failed, 0);
        assert_eq!(lifecycle.seen.load(std::sync::atomic::Ordering::Relaxed), 2);
    }

    #[test]
    fn failing_plugin_lifecycle_does_not_unregister_existing_adapters() {
        let registry = FrameworkRegistry::new();
        seed(&registry, "a", "Alpha", "web");
        let plugin = Plugin { id: "extras".into(), depends_on: vec![], adapters: vec![], lifecycle: Some(Arc::new(FailingLifecycle)) };
        let report = registry.register_plugin(plugin).unwrap();
        assert_eq!(report.adapters_failed, 1);
        assert!(registry.get("a").is_some());
    }

    struct NoopFactory;

    #[async_trait]
    impl crate::pool::ConnectionFactory<()> for NoopFactory {
        async fn create(&self) -> crate::error::UtacResult<()> {
            Ok(())
        }
        async fn validate(&self, _conn: &()) -> bool {
            true
        }
        async fn destroy(&self, _conn: ()) {}
    }

    /// Only "b" carries a pool and cache; "a" carries neither. Counts must
    /// reflect that split, not the total adapter count (spec §4.11).
    #[tokio::test]
    async fn shutdown_runs_stages_in_order_and_clears_registry() {
        let health = Arc::new(HealthMonitor::new(crate::config::HealthConfig::default()));
        let registry = FrameworkRegistry::new().with_health_monitor(health.clone());
        seed(&registry, "a", "Alpha", "web");

        let pool: Arc<dyn PoolHandle> = Arc::new(crate::pool::ConnectionPool::new(crate::config::PoolConfig::default(), Arc::new(NoopFactory)));
        let cache = Arc::new(IntelligentCache::new(crate::config::CacheConfig::default()));
        let overrides = AdapterOverrides { cache: Some(cache), pool: Some(pool), ..AdapterOverrides::default() };
        registry.create_adapter_from_block_config(block("b", "Beta", "web", vec![]), source_tool("b", "Beta", "web"), overrides);

        let report = registry.shutdown().await;
        assert!(report.health_stopped);
        assert!(report.analytics_flushed);
        assert_eq!(report.pools_closed, 1);
        assert_eq!(report.caches_cleared, 1);
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_none());
        assert!(health.trend("a").is_some());
    }
}
