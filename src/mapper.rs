// Copyright 2026 DashFlow Contributors

//! Parameter Mapper (C7): resolves each sub-block's agent-facing value into
//! the source tool's native argument name, honoring ordered conditional
//! rules and a pluggable transformation registry (spec §4.7).
//!
//! Hidden and trigger-config sub-blocks never emit a key into the mapped
//! arguments (spec §3 `SubBlockKind::is_hidden`).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::trace;

use crate::error::{FieldError, UtacError, UtacResult};
use crate::types::{ConditionOperator, ExecutionContext, SubBlockConfig, VisibilityCondition};

/// Where a mapped value is resolved from (spec §4.7 contextual resolution
/// sources).
#[derive(Debug, Clone)]
pub enum ContextSource {
    /// Read `field` out of the raw agent-supplied arguments.
    RawArg(String),
    User,
    Workspace,
    Session,
    Agent,
    Timestamp,
    Uuid,
    /// Pass the raw arg through unchanged under its original key.
    Original,
    Constant(Value),
    /// Name of a registered [`ComputedResolver`].
    Computed(String),
}

/// A caller-registered resolver for `ContextSource::Computed` sources —
/// e.g. an OAuth token lookup or a derived timestamp.
pub trait ComputedResolver: Send + Sync {
    fn resolve(&self, ctx: &ExecutionContext, raw_args: &HashMap<String, Value>) -> Option<Value>;
}

/// Post-resolution transformation applied to a mapped value before it's
/// written to the source argument map (spec §4.7 transformation registry).
#[derive(Debug, Clone)]
pub enum TransformKind {
    OauthResolver { provider: String },
    ResourceIdResolver,
    OptionValueResolver,
    NumericRangeValidator { min: Option<f64>, max: Option<f64> },
    CodeProcessor,
    JsonParser,
    TimeNormalizer,
    ArrayNormalizer,
    /// Pass the value through only when `condition` holds; otherwise the
    /// parameter is omitted entirely.
    ConditionalPassthrough { condition: VisibilityCondition },
}

/// One ordered rule: where a source parameter's value comes from, under
/// what condition it applies, and what transform to run on the resolved
/// value (spec §4.7).
#[derive(Debug, Clone)]
pub struct ParameterMapping {
    pub source_parameter: String,
    pub condition: Option<VisibilityCondition>,
    pub source: ContextSource,
    pub transform: Option<TransformKind>,
}

/// One step of a [`MappingTrace`], produced by [`ParameterMapper::test_parameter_mapping`].
#[derive(Debug, Clone)]
pub struct MappingTraceEntry {
    pub source_parameter: String,
    pub matched_condition: bool,
    pub resolved_value: Option<Value>,
    pub applied_transform: Option<String>,
}

/// Dry-run output describing exactly how [`ParameterMapper::map`] would
/// have resolved each rule, without requiring a live source-tool call.
#[derive(Debug, Clone)]
pub struct MappingTrace {
    pub entries: Vec<MappingTraceEntry>,
}

fn condition_holds(condition: &VisibilityCondition, raw_args: &HashMap<String, Value>) -> bool {
    let actual = raw_args.get(&condition.field);
    match condition.operator {
        ConditionOperator::Truthy => actual.is_some_and(is_truthy),
        ConditionOperator::Equals => actual == Some(&condition.value),
        ConditionOperator::NotEquals => actual != Some(&condition.value),
        ConditionOperator::In => match (&condition.value, actual) {
            (Value::Array(options), Some(v)) => options.contains(v),
            _ => false,
        },
        ConditionOperator::NotIn => match (&condition.value, actual) {
            (Value::Array(options), Some(v)) => !options.contains(v),
            (_, None) => true,
            _ => true,
        },
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Evaluates an ordered rule set against one request, writing into the
/// source tool's argument map (spec §4.7). Rule order matters: later rules
/// may override earlier ones writing to the same `source_parameter`.
pub struct ParameterMapper {
    mappings: Vec<ParameterMapping>,
    resolvers: HashMap<String, Arc<dyn ComputedResolver>>,
}

impl ParameterMapper {
    pub fn new(mappings: Vec<ParameterMapping>) -> Self {
        Self { mappings, resolvers: HashMap::new() }
    }

    pub fn register_resolver(&mut self, name: impl Into<String>, resolver: Arc<dyn ComputedResolver>) {
        self.resolvers.insert(name.into(), resolver);
    }

    /// Maps `raw_args` into the source tool's native argument shape,
    /// skipping any sub-block that [`SubBlockConfig::is_agent_visible`]
    /// reports as hidden and any rule whose condition does not hold.
    pub fn map(
        &self,
        sub_blocks: &[SubBlockConfig],
        raw_args: &HashMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> UtacResult<HashMap<String, Value>> {
        let hidden: std::collections::HashSet<&str> =
            sub_blocks.iter().filter(|b| !b.is_agent_visible()).map(|b| b.id.as_str()).collect();

        let mut out = HashMap::new();
        for rule in &self.mappings {
            if hidden.contains(rule.source_parameter.as_str()) {
                continue;
            }
            if let Some(condition) = &rule.condition {
                if !condition_holds(condition, raw_args) {
                    continue;
                }
            }
            let Some(resolved) = self.resolve_source(rule, raw_args, ctx) else {
                continue;
            };
            match self.apply_transform(rule, resolved, raw_args)? {
                Some(value) => {
                    out.insert(rule.source_parameter.clone(), value);
                }
                None => continue,
            }
        }
        Ok(out)
    }

    fn resolve_source(&self, rule: &ParameterMapping, raw_args: &HashMap<String, Value>, ctx: &ExecutionContext) -> Option<Value> {
        match &rule.source {
            ContextSource::RawArg(field) => raw_args.get(field).cloned(),
            ContextSource::Original => raw_args.get(&rule.source_parameter).cloned(),
            ContextSource::User => ctx.user_id.clone().map(Value::String),
            ContextSource::Workspace => ctx.workspace_id.clone().map(Value::String),
            ContextSource::Session => Some(Value::String(ctx.session_id.clone())),
            ContextSource::Agent => Some(Value::String(ctx.agent_id.clone())),
            ContextSource::Timestamp => Some(Value::String(chrono::Utc::now().to_rfc3339())),
            ContextSource::Uuid => Some(Value::String(uuid::Uuid::new_v4().to_string())),
            ContextSource::Constant(v) => Some(v.clone()),
            ContextSource::Computed(name) => self.resolvers.get(name).and_then(|r| r.resolve(ctx, raw_args)),
        }
    }

    fn apply_transform(
        &self,
        rule: &ParameterMapping,
        value: Value,
        raw_args: &HashMap<String, Value>,
    ) -> UtacResult<Option<Value>> {
        let Some(transform) = &rule.transform else { return Ok(Some(value)) };
        trace!(parameter = %rule.source_parameter, ?transform, "applying transform");
        match transform {
            TransformKind::OauthResolver { provider } => Ok(Some(serde_json::json!({ "provider": provider, "token": value }))),
            TransformKind::ResourceIdResolver => match value {
                Value::Object(ref map) => Ok(Some(map.get("id").cloned().unwrap_or(value))),
                other => Ok(Some(other)),
            },
            TransformKind::OptionValueResolver => match value {
                Value::Object(ref map) => Ok(Some(map.get("id").or_else(|| map.get("value")).cloned().unwrap_or(value))),
                other => Ok(Some(other)),
            },
            TransformKind::NumericRangeValidator { min, max } => {
                let n = value.as_f64().ok_or_else(|| {
                    UtacError::Validation(vec![FieldError::new(rule.source_parameter.clone(), "expected a number", "invalid_type")])
                })?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(UtacError::Validation(vec![FieldError::new(
                        rule.source_parameter.clone(),
                        "value out of range",
                        "out_of_range",
                    )]));
                }
                Ok(Some(value))
            }
            TransformKind::CodeProcessor => match value {
                Value::String(s) => Ok(Some(Value::String(s.trim().to_string()))),
                other => Ok(Some(other)),
            },
            TransformKind::JsonParser => match &value {
                Value::String(s) => serde_json::from_str(s).map(Some).map_err(|e| {
                    UtacError::Validation(vec![FieldError::new(rule.source_parameter.clone(), e.to_string(), "invalid_json")])
                }),
                _ => Ok(Some(value)),
            },
            TransformKind::TimeNormalizer => match &value {
                Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| Some(Value::String(dt.to_rfc3339())))
                    .map_err(|e| {
                        UtacError::Validation(vec![FieldError::new(rule.source_parameter.clone(), e.to_string(), "invalid_time")])
                    }),
                _ => Ok(Some(value)),
            },
            TransformKind::ArrayNormalizer => match value {
                Value::Array(_) => Ok(Some(value)),
                Value::Null => Ok(Some(Value::Array(vec![]))),
                other => Ok(Some(Value::Array(vec![other]))),
            },
            TransformKind::ConditionalPassthrough { condition } => {
                if condition_holds(condition, raw_args) {
                    Ok(Some(value))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Dry-runs the rule set without requiring a live source call, reporting
    /// per-rule whether its condition matched and what value/transform it
    /// would have produced.
    pub fn test_parameter_mapping(&self, raw_args: &HashMap<String, Value>, ctx: &ExecutionContext) -> MappingTrace {
        let mut entries = Vec::with_capacity(self.mappings.len());
        for rule in &self.mappings {
            let matched_condition = rule.condition.as_ref().map_or(true, |c| condition_holds(c, raw_args));
            let resolved_value = if matched_condition { self.resolve_source(rule, raw_args, ctx) } else { None };
            let applied_transform = rule.transform.as_ref().map(|t| format!("{t:?}"));
            entries.push(MappingTraceEntry {
                source_parameter: rule.source_parameter.clone(),
                matched_condition,
                resolved_value,
                applied_transform,
            });
        }
        MappingTrace { entries }
    }
}
