// Copyright 2026 DashFlow Contributors

//! Core data model: the vocabulary every other module shares.
//!
//! Mirrors spec §3 verbatim. [`SourceTool`] is the one trait the core never
//! looks inside of — it treats `data` as opaque, the same way
//! `dashflow::core::tools::Tool` is consumed by the node executor without
//! the graph runtime inspecting a tool's return payload.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identifier for a source tool, an adapter, or a registered plugin.
pub type ToolId = String;

/// Descriptor for a [`SourceTool`]: everything the core needs to know about
/// it without calling it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceToolDescriptor {
    pub id: ToolId,
    pub display_name: String,
    pub input_schema: Value,
    pub category: String,
    pub options: Vec<String>,
    pub has_interrupt: bool,
}

/// Outcome of a [`SourceTool::execute`] call. The core never interprets
/// `data`; only `status` and `message` drive control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceToolOutcome {
    pub status: i32,
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl SourceToolOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A unit of work wrapped by an [`crate::adapter::Adapter`]. The core never
/// inspects payload semantics, only status/message.
#[async_trait]
pub trait SourceTool: Send + Sync {
    fn descriptor(&self) -> SourceToolDescriptor;

    async fn execute(&self, ctx: &ExecutionContext, args: &HashMap<String, Value>) -> SourceToolOutcome;

    /// Whether this tool's results are safe to cache: same `(args,
    /// contextSubset)` must always produce an equivalent result. Non-pure
    /// tools disable caching per-adapter (spec §3 CacheKey invariant).
    fn is_pure(&self) -> bool {
        false
    }

    /// True when the tool supports mid-execution interruption
    /// (`hasInterrupt`); exposed on adapter metadata as capability
    /// `interactive`.
    fn has_interrupt(&self) -> bool {
        false
    }
}

/// Read-only request context threaded by reference through the whole
/// pipeline. No component may mutate it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionContext {
    pub agent_id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub request_type: String,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub feature_flags: HashMap<String, bool>,
}

impl ExecutionContext {
    /// The fields that participate in a [`CacheKey`]; volatile fields
    /// (timestamps, request-scoped correlation ids stored in feature flags)
    /// are intentionally excluded.
    pub fn cache_subset(&self) -> ContextSubset {
        ContextSubset {
            agent_id: self.agent_id.clone(),
            session_id: self.session_id.clone(),
            request_type: self.request_type.clone(),
            user_id: self.user_id.clone(),
            workspace_id: self.workspace_id.clone(),
        }
    }
}

/// Stable, hashable projection of [`ExecutionContext`] used for cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextSubset {
    pub agent_id: String,
    pub session_id: String,
    pub request_type: String,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
}

/// One entry in [`AdapterResult::conversational.actions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub label: String,
    pub action: String,
}

/// The human-facing half of an [`AdapterResult`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConversationalEnvelope {
    pub summary: String,
    pub details: Option<String>,
    pub suggestion: Option<String>,
    #[serde(default)]
    pub actions: Vec<SuggestedAction>,
}

/// The discriminant of an [`AdapterResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Success,
    Error,
    Partial,
}

/// The envelope every [`crate::adapter::Adapter::execute`] call returns.
/// Invariant: `kind == Error` implies `conversational.summary` is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterResult {
    pub kind: ResultKind,
    pub message: Option<String>,
    pub data: Option<Value>,
    pub conversational: ConversationalEnvelope,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AdapterResult {
    pub fn success(data: Option<Value>, summary: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::Success,
            message: None,
            data,
            conversational: ConversationalEnvelope { summary: summary.into(), ..Default::default() },
            metadata: HashMap::new(),
        }
    }

    pub fn error(summary: impl Into<String>, code: &str, suggestion: Option<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("code".to_string(), Value::String(code.to_string()));
        Self {
            kind: ResultKind::Error,
            message: None,
            data: None,
            conversational: ConversationalEnvelope { summary: summary.into(), suggestion, ..Default::default() },
            metadata,
        }
    }

    /// Enforces the §3 invariant at construction sites that build results by
    /// hand rather than through [`AdapterResult::error`].
    pub fn is_well_formed(&self) -> bool {
        self.kind != ResultKind::Error || !self.conversational.summary.is_empty()
    }
}

/// Deterministic triple identifying a cacheable invocation (spec §3
/// CacheKey). Two equal keys must map to equal results under pure tools.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tool_id: ToolId,
    pub args_hash: u64,
    pub context_hash: u64,
}

impl CacheKey {
    pub fn new(tool_id: impl Into<ToolId>, args: &HashMap<String, Value>, ctx: &ExecutionContext) -> Self {
        let mut args_entries: Vec<_> = args.iter().collect();
        args_entries.sort_by(|a, b| a.0.cmp(b.0));
        let args_hash = {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            for (k, v) in args_entries {
                k.hash(&mut hasher);
                v.to_string().hash(&mut hasher);
            }
            hasher.finish()
        };
        let context_hash = {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            ctx.cache_subset().hash(&mut hasher);
            hasher.finish()
        };
        Self { tool_id: tool_id.into(), args_hash, context_hash }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:x}:{:x}", self.tool_id, self.args_hash, self.context_hash)
    }
}

// ============================================================================
// Block configuration (declarative adapter synthesis input)
// ============================================================================

/// One input field of a [`BlockConfig`] (spec §3 SubBlockConfig).
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SubBlockConfig {
    pub id: String,
    pub kind: SubBlockKind,
    #[serde(default)]
    pub required: bool,
    pub default: Option<Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub visibility: Option<VisibilityCondition>,
    /// Marks a dynamic value resolver by name; resolved via
    /// [`crate::mapper::ContextSource::Computed`].
    pub dynamic_resolver: Option<String>,
    /// Canonical parameter name on the source side, if it differs from `id`.
    pub source_parameter: Option<String>,
}

impl SubBlockConfig {
    pub fn is_agent_visible(&self) -> bool {
        !self.kind.is_hidden()
    }
}

/// Visibility condition `{field, operator, value}` gating whether a
/// sub-block is shown.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct VisibilityCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Truthy,
}

/// Enumerated semantic kinds of a sub-block (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SubBlockKind {
    ShortInput,
    LongInput,
    Slider { min: Option<f64>, max: Option<f64>, step: Option<f64>, integer: bool },
    Switch,
    Dropdown { options: OptionSource },
    MultiChoice { options: OptionSource },
    OauthCredential { provider: String },
    ResourceSelector { resource: ResourceKind },
    CodeBlock { language: Option<String> },
    Table,
    TimeInput,
    TriggerConfig,
    Hidden,
}

impl SubBlockKind {
    pub fn is_hidden(&self) -> bool {
        matches!(self, SubBlockKind::Hidden | SubBlockKind::TriggerConfig)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    File,
    Project,
    Channel,
    Folder,
}

/// A dropdown/multi-choice's options: either a static list or a zero-arg
/// producer invoked once, at adapter-build time (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(untagged)]
pub enum OptionSource {
    Static(Vec<OptionValue>),
    /// Name of a registered producer function; resolved by the registry when
    /// constructing the adapter, never re-invoked per request.
    Producer(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct OptionValue {
    pub id: String,
    pub label: String,
}

/// Declarative description used to synthesize an [`crate::adapter::Adapter`]
/// (spec §3 BlockConfig). `sub_blocks` and `category` are optional per the
/// §9 Open Question: the source repo's two near-duplicate config typings
/// diverge only on this optionality, and this crate treats both as optional
/// with empty/"general" defaults rather than guessing a stricter contract.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct BlockConfig {
    #[serde(rename = "type")]
    pub block_type: String,
    pub id: ToolId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sub_blocks: Vec<SubBlockConfig>,
}

impl BlockConfig {
    pub fn category_or_default(&self) -> &str {
        self.category.as_deref().unwrap_or("general")
    }

    /// Emits this type's own JSON Schema, for hosts that want to validate a
    /// `BlockConfig` document before handing it to
    /// [`crate::registry::FrameworkRegistry::create_adapter_from_block_config`].
    pub fn json_schema() -> Value {
        let schema = schemars::schema_for!(BlockConfig);
        serde_json::to_value(schema).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_order_independent_in_args() {
        let ctx = ExecutionContext { agent_id: "a".into(), ..Default::default() };
        let mut a1 = HashMap::new();
        a1.insert("x".to_string(), Value::from(1));
        a1.insert("y".to_string(), Value::from(2));
        let mut a2 = HashMap::new();
        a2.insert("y".to_string(), Value::from(2));
        a2.insert("x".to_string(), Value::from(1));
        let k1 = CacheKey::new("tool", &a1, &ctx);
        let k2 = CacheKey::new("tool", &a2, &ctx);
        assert_eq!(k1, k2);
    }

    #[test]
    fn error_result_requires_summary() {
        let ok = AdapterResult::error("boom", "execution_error", None);
        assert!(ok.is_well_formed());
    }

    #[test]
    fn hidden_and_trigger_config_are_not_agent_visible() {
        let hidden = SubBlockConfig {
            id: "secret".into(),
            kind: SubBlockKind::Hidden,
            required: false,
            default: None,
            depends_on: vec![],
            visibility: None,
            dynamic_resolver: None,
            source_parameter: None,
        };
        assert!(!hidden.is_agent_visible());
    }

    #[test]
    fn block_config_schema_describes_its_own_required_fields() {
        let schema = BlockConfig::json_schema();
        let required = schema["required"].as_array().expect("schema should declare required fields");
        let names: Vec<&str> = required.iter().filter_map(|v| v.as_str()).collect();
        assert!(names.contains(&"id"));
        assert!(names.contains(&"name"));
    }
}
