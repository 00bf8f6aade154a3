// Copyright 2026 DashFlow Contributors

//! Validation Engine (C8): sub-block-kind-aware input checking plus
//! pluggable business rules, and output-envelope validation (spec §4.8).

use std::collections::HashMap;

use serde_json::Value;

use crate::error::FieldError;
use crate::types::{AdapterResult, ResultKind, SubBlockConfig, SubBlockKind};

/// Validates the arguments the mapper produced for the source tool against
/// that tool's own declared `input_schema` (spec §3
/// `SourceToolDescriptor::input_schema`), when the descriptor carries one.
/// A tool with an empty/`null` schema opts out; this is an extra net beyond
/// sub-block validation, not a replacement for it — sub-blocks describe the
/// agent-facing surface, this describes the source tool's native shape.
pub fn validate_against_source_schema(schema: &Value, args: &HashMap<String, Value>) -> Vec<FieldError> {
    if schema.is_null() || schema == &Value::Object(serde_json::Map::new()) {
        return Vec::new();
    }
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(err) => return vec![FieldError::new("input_schema", format!("source tool declared an invalid schema: {err}"), "invalid_schema")],
    };
    let instance = Value::Object(args.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    validator
        .iter_errors(&instance)
        .map(|err| FieldError::new(err.instance_path.to_string(), err.to_string(), "schema_violation"))
        .collect()
}

/// Extension point for checks that go beyond a sub-block's declared shape
/// — OAuth scope coverage, file-access permissions, cross-field data
/// dependencies (spec §4.8).
pub trait BusinessRule: Send + Sync {
    fn check(&self, args: &HashMap<String, Value>) -> Vec<FieldError>;
}

#[derive(Default)]
pub struct ValidationEngine {
    business_rules: Vec<Box<dyn BusinessRule>>,
}

impl ValidationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: Box<dyn BusinessRule>) -> Self {
        self.business_rules.push(rule);
        self
    }

    /// Validates `args` against each visible sub-block's declared kind,
    /// then runs every registered [`BusinessRule`]. Hidden/trigger-config
    /// sub-blocks are never validated against agent input — they're never
    /// agent-supplied.
    pub fn validate_input(&self, sub_blocks: &[SubBlockConfig], args: &HashMap<String, Value>) -> Vec<FieldError> {
        let mut errors = Vec::new();
        for block in sub_blocks.iter().filter(|b| b.is_agent_visible()) {
            let value = args.get(&block.id);
            if block.required && value.is_none() && block.default.is_none() {
                errors.push(FieldError::new(block.id.clone(), "field is required", "required"));
                continue;
            }
            if let Some(value) = value {
                if let Some(err) = validate_kind(&block.id, &block.kind, value) {
                    errors.push(err);
                }
            }
        }
        for rule in &self.business_rules {
            errors.extend(rule.check(args));
        }
        errors
    }

    /// Enforces the §3 `AdapterResult` invariant: an error result always
    /// carries a non-empty conversational summary.
    pub fn validate_output(&self, result: &AdapterResult) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if result.kind == ResultKind::Error && result.conversational.summary.is_empty() {
            errors.push(FieldError::new("conversational.summary", "error results require a summary", "missing_summary"));
        }
        errors
    }
}

fn validate_kind(field: &str, kind: &SubBlockKind, value: &Value) -> Option<FieldError> {
    match kind {
        SubBlockKind::ShortInput | SubBlockKind::LongInput | SubBlockKind::CodeBlock { .. } | SubBlockKind::TimeInput => {
            if !value.is_string() {
                return Some(FieldError::new(field, "expected a string", "invalid_type"));
            }
        }
        SubBlockKind::Slider { min, max, integer, .. } => {
            let Some(n) = value.as_f64() else {
                return Some(FieldError::new(field, "expected a number", "invalid_type"));
            };
            if *integer && n.fract() != 0.0 {
                return Some(FieldError::new(field, "expected an integer", "invalid_type"));
            }
            if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                return Some(FieldError::new(field, "value out of range", "out_of_range"));
            }
        }
        SubBlockKind::Switch => {
            if !value.is_boolean() {
                return Some(FieldError::new(field, "expected a boolean", "invalid_type"));
            }
        }
        SubBlockKind::Dropdown { options } | SubBlockKind::MultiChoice { options } => {
            return validate_against_options(field, kind, options, value);
        }
        SubBlockKind::OauthCredential { .. } => {
            if !value.is_string() {
                return Some(FieldError::new(field, "expected a credential reference", "invalid_type"));
            }
        }
        SubBlockKind::ResourceSelector { .. } => {
            if !(value.is_string() || value.is_object()) {
                return Some(FieldError::new(field, "expected a resource id or descriptor", "invalid_type"));
            }
        }
        SubBlockKind::Table => {
            if !value.is_array() {
                return Some(FieldError::new(field, "expected an array of rows", "invalid_type"));
            }
        }
        SubBlockKind::TriggerConfig | SubBlockKind::Hidden => {}
    }
    None
}

fn validate_against_options(
    field: &str,
    kind: &SubBlockKind,
    options: &crate::types::OptionSource,
    value: &Value,
) -> Option<FieldError> {
    // Producer-backed option lists are resolved at adapter-build time, not
    // available here; only statically declared options are checked.
    let crate::types::OptionSource::Static(options) = options else { return None };
    let ids: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
    match kind {
        SubBlockKind::Dropdown { .. } => match value.as_str() {
            Some(s) if ids.contains(&s) => None,
            _ => Some(FieldError::new(field, "value is not one of the allowed options", "invalid_option")),
        },
        SubBlockKind::MultiChoice { .. } => match value.as_array() {
            Some(arr) if arr.iter().all(|v| v.as_str().is_some_and(|s| ids.contains(&s))) => None,
            _ => Some(FieldError::new(field, "values are not all allowed options", "invalid_option")),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OptionSource, OptionValue};

    fn block(id: &str, kind: SubBlockKind, required: bool) -> SubBlockConfig {
        SubBlockConfig { id: id.into(), kind, required, default: None, depends_on: vec![], visibility: None, dynamic_resolver: None, source_parameter: None }
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let engine = ValidationEngine::new();
        let blocks = vec![block("query", SubBlockKind::ShortInput, true)];
        let errors = engine.validate_input(&blocks, &HashMap::new());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "required");
    }

    #[test]
    fn slider_out_of_range_is_rejected() {
        let engine = ValidationEngine::new();
        let blocks = vec![block("count", SubBlockKind::Slider { min: Some(0.0), max: Some(10.0), step: None, integer: true }, true)];
        let mut args = HashMap::new();
        args.insert("count".to_string(), Value::from(42));
        let errors = engine.validate_input(&blocks, &args);
        assert_eq!(errors[0].code, "out_of_range");
    }

    #[test]
    fn dropdown_rejects_value_outside_static_options() {
        let engine = ValidationEngine::new();
        let options = OptionSource::Static(vec![OptionValue { id: "a".into(), label: "A".into() }]);
        let blocks = vec![block("choice", SubBlockKind::Dropdown { options }, true)];
        let mut args = HashMap::new();
        args.insert("choice".to_string(), Value::from("z"));
        let errors = engine.validate_input(&blocks, &args);
        assert_eq!(errors[0].code, "invalid_option");
    }

    #[test]
    fn hidden_sub_blocks_are_never_validated() {
        let engine = ValidationEngine::new();
        let blocks = vec![block("secret", SubBlockKind::Hidden, true)];
        let errors = engine.validate_input(&blocks, &HashMap::new());
        assert!(errors.is_empty());
    }

    #[test]
    fn output_validation_requires_summary_on_error() {
        let engine = ValidationEngine::new();
        let result = AdapterResult::error("", "execution_error", None);
        let errors = engine.validate_output(&result);
        assert_eq!(errors[0].code, "missing_summary");
    }

    struct RequiresWorkspace;
    impl BusinessRule for RequiresWorkspace {
        fn check(&self, args: &HashMap<String, Value>) -> Vec<FieldError> {
            if !args.contains_key("workspace_id") {
                vec![FieldError::new("workspace_id", "workspace scope is required", "missing_scope")]
            } else {
                vec![]
            }
        }
    }

    #[test]
    fn business_rules_run_after_shape_validation() {
        let engine = ValidationEngine::new().with_rule(Box::new(RequiresWorkspace));
        let errors = engine.validate_input(&[], &HashMap::new());
        assert_eq!(errors[0].code, "missing_scope");
    }

    #[test]
    fn empty_source_schema_skips_validation() {
        let errors = validate_against_source_schema(&Value::Null, &HashMap::new());
        assert!(errors.is_empty());
    }

    #[test]
    fn source_schema_rejects_missing_required_property() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["repo"],
            "properties": { "repo": { "type": "string" } }
        });
        let errors = validate_against_source_schema(&schema, &HashMap::new());
        assert_eq!(errors[0].code, "schema_violation");
    }

    #[test]
    fn source_schema_accepts_matching_arguments() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["repo"],
            "properties": { "repo": { "type": "string" } }
        });
        let mut args = HashMap::new();
        args.insert("repo".to_string(), Value::from("dashflow"));
        let errors = validate_against_source_schema(&schema, &args);
        assert!(errors.is_empty());
    }
}
