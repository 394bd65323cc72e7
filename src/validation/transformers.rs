//! Output transformers applied to nonconforming structured output.
//!
//! A transformer is a pure function over a JSON value, configured per request
//! through a [`TransformerSpec`]. The registry ships with the builtins below;
//! callers can register more at startup.

use crate::core::error::{AppError, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

/// Named transformer with its optional configuration, as sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl TransformerSpec {
    pub fn new(name: impl Into<String>, config: Option<Value>) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transform `value`. `config` is `Value::Null` when the spec has none.
    fn transform(&self, value: Value, config: &Value) -> Result<Value>;
}

/// Registry of transformers keyed by name.
pub struct TransformerRegistry {
    transformers: HashMap<String, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    /// Create a registry with all builtin transformers.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(LowercaseStrings));
        registry.register(Arc::new(RemoveWhitespace));
        registry.register(Arc::new(FormatDates));
        registry.register(Arc::new(ExtractEntities));
        registry.register(Arc::new(Summarize));
        registry.register(Arc::new(FilterFields));
        registry.register(Arc::new(FillDefaults));
        registry
    }

    pub fn empty() -> Self {
        Self {
            transformers: HashMap::new(),
        }
    }

    pub fn register(&mut self, transformer: Arc<dyn Transformer>) {
        tracing::debug!(name = transformer.name(), "Registered transformer");
        self.transformers
            .insert(transformer.name().to_string(), transformer);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Transformer>> {
        self.transformers.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transformers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check that every spec names a registered transformer.
    pub fn check_known(&self, specs: &[TransformerSpec]) -> Result<()> {
        match specs.iter().find(|spec| self.get(&spec.name).is_none()) {
            Some(spec) => Err(unknown_transformer(&spec.name)),
            None => Ok(()),
        }
    }

    pub fn apply(&self, spec: &TransformerSpec, value: Value) -> Result<Value> {
        let transformer = self
            .get(&spec.name)
            .ok_or_else(|| unknown_transformer(&spec.name))?;
        let config = spec.config.as_ref().unwrap_or(&Value::Null);
        transformer.transform(value, config)
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_transformer(name: &str) -> AppError {
    AppError::InvalidRequest(format!("Transformer not found: {}", name))
}

fn config_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

fn config_fields(config: &Value) -> Vec<&str> {
    config
        .get("fields")
        .and_then(Value::as_array)
        .map(|fields| fields.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn map_strings(value: Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| map_strings(v, f)).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, map_strings(v, f)))
                .collect(),
        ),
        other => other,
    }
}

/// Lowercase every string value, recursively.
pub struct LowercaseStrings;

impl Transformer for LowercaseStrings {
    fn name(&self) -> &'static str {
        "lowercase_strings"
    }

    fn transform(&self, value: Value, _config: &Value) -> Result<Value> {
        Ok(map_strings(value, &|s| s.to_lowercase()))
    }
}

fn whitespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"))
}

/// Collapse whitespace runs to one space and trim, recursively.
pub struct RemoveWhitespace;

impl Transformer for RemoveWhitespace {
    fn name(&self) -> &'static str {
        "remove_whitespace"
    }

    fn transform(&self, value: Value, _config: &Value) -> Result<Value> {
        Ok(map_strings(value, &|s| {
            whitespace_pattern().replace_all(s, " ").trim().to_string()
        }))
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%d/%m/%Y", "%b %d, %Y", "%B %d, %Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%SZ"];

fn parse_date(value: &str) -> Option<NaiveDateTime> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        })
}

/// Reformat date strings in the configured top-level `fields`.
///
/// Config: `format` (strftime, default `%Y-%m-%d`), `fields`.
pub struct FormatDates;

impl Transformer for FormatDates {
    fn name(&self) -> &'static str {
        "format_dates"
    }

    fn transform(&self, value: Value, config: &Value) -> Result<Value> {
        let format = config_str(config, "format").unwrap_or("%Y-%m-%d");
        if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
            return Err(AppError::InvalidRequest(format!(
                "format_dates: invalid format '{}'",
                format
            )));
        }

        let fields = config_fields(config);
        let mut map = match value {
            Value::Object(map) => map,
            other => return Ok(other),
        };

        for field in fields {
            let Some(parsed) = map.get(field).and_then(Value::as_str).and_then(parse_date) else {
                continue;
            };
            let mut formatted = String::new();
            write!(formatted, "{}", parsed.format(format)).map_err(|_| {
                AppError::InvalidRequest(format!("format_dates: cannot format '{}'", format))
            })?;
            map.insert(field.to_string(), Value::String(formatted));
        }

        Ok(Value::Object(map))
    }
}

/// Pull regex matches out of a text field into a map of entity lists.
///
/// Config: `patterns` (entity name to regex), `source_field`,
/// `target_field` (default `entities`).
pub struct ExtractEntities;

impl Transformer for ExtractEntities {
    fn name(&self) -> &'static str {
        "extract_entities"
    }

    fn transform(&self, value: Value, config: &Value) -> Result<Value> {
        let mut map = match value {
            Value::Object(map) => map,
            other => return Ok(other),
        };
        let Some(source_field) = config_str(config, "source_field") else {
            return Ok(Value::Object(map));
        };
        let Some(text) = map.get(source_field).and_then(Value::as_str).map(str::to_string) else {
            return Ok(Value::Object(map));
        };
        let target_field = config_str(config, "target_field").unwrap_or("entities");

        let mut entities = Map::new();
        if let Some(patterns) = config.get("patterns").and_then(Value::as_object) {
            for (entity, pattern) in patterns {
                let Some(pattern) = pattern.as_str() else {
                    continue;
                };
                let re = Regex::new(pattern).map_err(|e| {
                    AppError::InvalidRequest(format!(
                        "extract_entities: invalid pattern for '{}': {}",
                        entity, e
                    ))
                })?;

                // With exactly one capture group, report the group like findall does
                let matches: Vec<Value> = if re.captures_len() == 2 {
                    re.captures_iter(&text)
                        .filter_map(|caps| caps.get(1))
                        .map(|m| Value::String(m.as_str().to_string()))
                        .collect()
                } else {
                    re.find_iter(&text)
                        .map(|m| Value::String(m.as_str().to_string()))
                        .collect()
                };

                if !matches.is_empty() {
                    entities.insert(entity.clone(), Value::Array(matches));
                }
            }
        }

        map.insert(target_field.to_string(), Value::Object(entities));
        Ok(Value::Object(map))
    }
}

/// Join the configured string fields into a truncated summary field.
///
/// Config: `fields`, `target_field` (default `summary`), `max_length`
/// (characters, default 100).
pub struct Summarize;

impl Transformer for Summarize {
    fn name(&self) -> &'static str {
        "summarize"
    }

    fn transform(&self, value: Value, config: &Value) -> Result<Value> {
        let mut map = match value {
            Value::Object(map) => map,
            other => return Ok(other),
        };
        let target_field = config_str(config, "target_field").unwrap_or("summary");
        let max_length = config
            .get("max_length")
            .and_then(Value::as_u64)
            .unwrap_or(100) as usize;

        let parts: Vec<&str> = config_fields(config)
            .into_iter()
            .filter_map(|field| map.get(field).and_then(Value::as_str))
            .collect();
        if parts.is_empty() {
            return Ok(Value::Object(map));
        }

        let joined = parts.join(" ");
        let summary = if joined.chars().count() > max_length {
            let truncated: String = joined.chars().take(max_length).collect();
            format!("{}...", truncated)
        } else {
            joined
        };

        map.insert(target_field.to_string(), Value::String(summary));
        Ok(Value::Object(map))
    }
}

/// Keep only the configured top-level fields. No `fields` keeps everything.
pub struct FilterFields;

impl Transformer for FilterFields {
    fn name(&self) -> &'static str {
        "filter_fields"
    }

    fn transform(&self, value: Value, config: &Value) -> Result<Value> {
        let fields = config_fields(config);
        if fields.is_empty() {
            return Ok(value);
        }
        match value {
            Value::Object(map) => Ok(Value::Object(
                map.into_iter()
                    .filter(|(k, _)| fields.contains(&k.as_str()))
                    .collect(),
            )),
            other => Ok(other),
        }
    }
}

/// Insert configured `values` for keys that are absent. Present keys are kept.
pub struct FillDefaults;

impl Transformer for FillDefaults {
    fn name(&self) -> &'static str {
        "fill_defaults"
    }

    fn transform(&self, value: Value, config: &Value) -> Result<Value> {
        let Some(defaults) = config.get("values").and_then(Value::as_object) else {
            return Ok(value);
        };
        match value {
            Value::Object(mut map) => {
                for (key, default) in defaults {
                    map.entry(key.clone()).or_insert_with(|| default.clone());
                }
                Ok(Value::Object(map))
            }
            other => Ok(other),
        }
    }
}
