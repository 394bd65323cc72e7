//! Structural JSON Schema validation of provider output.
//!
//! Only the subset of JSON Schema that matters for structured completions is
//! checked: `type` (single or list), `required`, `properties`,
//! `additionalProperties`, `items` and `enum`. Unknown keywords are ignored.

use crate::core::error::{AppError, Result};
use crate::validation::transformers::{TransformerRegistry, TransformerSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One mismatch between a value and its schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// JSONPath-style location, `$` for the root
    pub path: String,
    pub expected: String,
    pub actual: String,
}

impl ValidationIssue {
    fn new(path: &str, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Conforming(Value),
    Nonconforming {
        /// Parsed output, absent when the raw text was not JSON
        parsed: Option<Value>,
        issues: Vec<ValidationIssue>,
    },
}

impl ValidationResult {
    pub fn is_conforming(&self) -> bool {
        matches!(self, ValidationResult::Conforming(_))
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            ValidationResult::Conforming(_) => &[],
            ValidationResult::Nonconforming { issues, .. } => issues,
        }
    }
}

/// Validate raw provider text against `schema`.
pub fn validate(raw_output: &str, schema: &Value) -> ValidationResult {
    match parse_output(raw_output) {
        Ok(value) => validate_parsed(value, schema),
        Err(issue) => ValidationResult::Nonconforming {
            parsed: None,
            issues: vec![issue],
        },
    }
}

/// Validate an already-parsed value against `schema`.
pub fn validate_parsed(value: Value, schema: &Value) -> ValidationResult {
    let issues = validate_value(&value, schema);
    if issues.is_empty() {
        ValidationResult::Conforming(value)
    } else {
        ValidationResult::Nonconforming {
            parsed: Some(value),
            issues,
        }
    }
}

/// Collect every mismatch between `value` and `schema`.
pub fn validate_value(value: &Value, schema: &Value) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    check(value, schema, "$", &mut issues);
    issues
}

/// Validate, then on mismatch apply `transformers` in order and re-validate once.
///
/// Conforming output is returned untouched; transformers never run on it.
pub fn validate_with_transformers(
    raw_output: &str,
    schema: &Value,
    transformers: &[TransformerSpec],
    registry: &TransformerRegistry,
) -> Result<Value> {
    let (parsed, issues) = match validate(raw_output, schema) {
        ValidationResult::Conforming(value) => return Ok(value),
        ValidationResult::Nonconforming { parsed, issues } => (parsed, issues),
    };

    let Some(mut value) = parsed else {
        return Err(AppError::SchemaValidation(issues));
    };
    if transformers.is_empty() {
        return Err(AppError::SchemaValidation(issues));
    }

    tracing::debug!(
        issues = issues.len(),
        transformers = transformers.len(),
        "Output nonconforming, applying transformers"
    );

    for spec in transformers {
        value = registry.apply(spec, value)?;
    }

    match validate_parsed(value, schema) {
        ValidationResult::Conforming(value) => Ok(value),
        ValidationResult::Nonconforming { issues, .. } => Err(AppError::SchemaValidation(issues)),
    }
}

/// Parse provider text as JSON, unwrapping a Markdown code fence if present.
pub fn parse_output(raw_output: &str) -> std::result::Result<Value, ValidationIssue> {
    let text = strip_code_fence(raw_output.trim());
    serde_json::from_str(text).map_err(|e| {
        ValidationIssue::new("$", "valid JSON", format!("unparseable output ({})", e))
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. "json") on the opening line
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
            }
            _ => false,
        },
        // Unknown type names do not constrain the value
        _ => true,
    }
}

fn declared_types(schema: &Value) -> Vec<&str> {
    match schema.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn describe_expected(schema: &Value) -> String {
    let types = declared_types(schema);
    if types.is_empty() {
        "present".to_string()
    } else {
        types.join(" | ")
    }
}

fn check(value: &Value, schema: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
    let types = declared_types(schema);
    if !types.is_empty() && !types.iter().any(|t| matches_type(value, t)) {
        issues.push(ValidationIssue::new(
            path,
            types.join(" | "),
            type_name(value),
        ));
        // Nested keywords are meaningless once the type is wrong
        return;
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
            issues.push(ValidationIssue::new(
                path,
                format!("one of [{}]", options.join(", ")),
                value.to_string(),
            ));
        }
    }

    match value {
        Value::Object(map) => check_object(map, schema, path, issues),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items").filter(|s| s.is_object()) {
                for (index, item) in items.iter().enumerate() {
                    check(item, item_schema, &format!("{}[{}]", path, index), issues);
                }
            }
        }
        _ => {}
    }
}

fn check_object(
    map: &serde_json::Map<String, Value>,
    schema: &Value,
    path: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(name) {
                let expected = properties
                    .and_then(|props| props.get(name))
                    .map(describe_expected)
                    .unwrap_or_else(|| "present".to_string());
                issues.push(ValidationIssue::new(
                    &format!("{}.{}", path, name),
                    expected,
                    "missing",
                ));
            }
        }
    }

    for (key, child) in map {
        let child_path = format!("{}.{}", path, key);
        match properties.and_then(|props| props.get(key)) {
            Some(child_schema) => check(child, child_schema, &child_path, issues),
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => issues.push(ValidationIssue::new(
                    &child_path,
                    "no additional properties",
                    type_name(child),
                )),
                Some(extra) if extra.is_object() => check(child, extra, &child_path, issues),
                _ => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn person_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"}
            },
            "required": ["name", "age"]
        })
    }

    #[test]
    fn test_conforming_output() {
        let result = validate(r#"{"name": "Bob", "age": 42}"#, &person_schema());
        assert_eq!(
            result,
            ValidationResult::Conforming(json!({"name": "Bob", "age": 42}))
        );
    }

    #[test]
    fn test_missing_required_property() {
        let result = validate(r#"{"name": "Bob"}"#, &person_schema());
        assert!(!result.is_conforming());
        assert_eq!(
            result.issues(),
            &[ValidationIssue {
                path: "$.age".into(),
                expected: "integer".into(),
                actual: "missing".into(),
            }]
        );
    }

    #[test]
    fn test_non_json_is_nonconforming_at_root() {
        let result = validate("Sure! Here is the answer.", &person_schema());
        match result {
            ValidationResult::Nonconforming { parsed, issues } => {
                assert!(parsed.is_none());
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].path, "$");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_code_fence_is_unwrapped() {
        let raw = "```json\n{\"name\": \"Bob\", \"age\": 1}\n```";
        assert!(validate(raw, &person_schema()).is_conforming());

        let bare = "```\n{\"name\": \"Bob\", \"age\": 1}\n```";
        assert!(validate(bare, &person_schema()).is_conforming());
    }

    #[test]
    fn test_wrong_type_reported_with_actual() {
        let issues = validate_value(&json!({"name": 5, "age": 1}), &person_schema());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "$.name");
        assert_eq!(issues[0].expected, "string");
        assert_eq!(issues[0].actual, "integer");
    }

    #[test]
    fn test_integer_accepts_whole_floats() {
        let schema = json!({"type": "integer"});
        assert!(validate_value(&json!(3.0), &schema).is_empty());
        assert_eq!(validate_value(&json!(3.5), &schema).len(), 1);
        assert!(validate_value(&json!(3), &json!({"type": "number"})).is_empty());
    }

    #[test]
    fn test_type_list() {
        let schema = json!({"type": ["string", "null"]});
        assert!(validate_value(&json!(null), &schema).is_empty());
        assert!(validate_value(&json!("x"), &schema).is_empty());
        let issues = validate_value(&json!(1), &schema);
        assert_eq!(issues[0].expected, "string | null");
    }

    #[test]
    fn test_unknown_properties_allowed_by_default() {
        let value = json!({"name": "Bob", "age": 1, "nickname": "B"});
        assert!(validate_value(&value, &person_schema()).is_empty());
    }

    #[test]
    fn test_additional_properties_false() {
        let mut schema = person_schema();
        schema["additionalProperties"] = json!(false);
        let issues = validate_value(&json!({"name": "Bob", "age": 1, "x": true}), &schema);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "$.x");
        assert_eq!(issues[0].actual, "boolean");
    }

    #[test]
    fn test_additional_properties_schema() {
        let schema = json!({"type": "object", "additionalProperties": {"type": "number"}});
        assert!(validate_value(&json!({"a": 1, "b": 2.5}), &schema).is_empty());
        assert_eq!(validate_value(&json!({"a": "x"}), &schema)[0].path, "$.a");
    }

    #[test]
    fn test_nested_arrays_and_objects() {
        let schema = json!({
            "type": "object",
            "properties": {
                "people": {"type": "array", "items": person_schema()}
            },
            "required": ["people"]
        });
        let value = json!({"people": [{"name": "A", "age": 1}, {"name": "B"}]});
        let issues = validate_value(&value, &schema);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "$.people[1].age");
    }

    #[test]
    fn test_enum() {
        let schema = json!({"type": "string", "enum": ["red", "green"]});
        assert!(validate_value(&json!("red"), &schema).is_empty());
        let issues = validate_value(&json!("blue"), &schema);
        assert_eq!(issues[0].expected, r#"one of ["red", "green"]"#);
        assert_eq!(issues[0].actual, r#""blue""#);
    }

    #[test]
    fn test_fill_defaults_resolves_missing_field() {
        let registry = TransformerRegistry::new();
        let transformers = vec![TransformerSpec::new(
            "fill_defaults",
            Some(json!({"values": {"age": 0}})),
        )];

        let value = validate_with_transformers(
            r#"{"name": "Bob"}"#,
            &person_schema(),
            &transformers,
            &registry,
        )
        .unwrap();
        assert_eq!(value, json!({"name": "Bob", "age": 0}));
    }

    #[test]
    fn test_transformers_skipped_on_conforming_output() {
        let registry = TransformerRegistry::new();
        let transformers = vec![TransformerSpec::new("lowercase_strings", None)];
        let value = validate_with_transformers(
            r#"{"name": "BOB", "age": 3}"#,
            &person_schema(),
            &transformers,
            &registry,
        )
        .unwrap();
        assert_eq!(value["name"], "BOB");
    }

    #[test]
    fn test_unresolved_mismatch_surfaces_issues() {
        let registry = TransformerRegistry::new();
        let transformers = vec![TransformerSpec::new("lowercase_strings", None)];
        let err = validate_with_transformers(
            r#"{"name": "Bob"}"#,
            &person_schema(),
            &transformers,
            &registry,
        )
        .unwrap_err();
        match err {
            AppError::SchemaValidation(issues) => assert_eq!(issues[0].path, "$.age"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_transformer_is_invalid_request() {
        let registry = TransformerRegistry::new();
        let transformers = vec![TransformerSpec::new("does_not_exist", None)];
        let err = validate_with_transformers(
            r#"{"name": "Bob"}"#,
            &person_schema(),
            &transformers,
            &registry,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[test]
    fn test_unparseable_output_skips_transformers() {
        let registry = TransformerRegistry::new();
        let transformers = vec![TransformerSpec::new(
            "fill_defaults",
            Some(json!({"values": {"age": 0}})),
        )];
        let err =
            validate_with_transformers("not json", &person_schema(), &transformers, &registry)
                .unwrap_err();
        assert!(matches!(err, AppError::SchemaValidation(_)));
    }
}
