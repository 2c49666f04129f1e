//! Typed, schema-backed settings registry
//!
//! Every setting is backed by a schema entry carrying a default, a kind and
//! an optional integer range. Values are tagged variants; deserialization
//! from persisted JSON goes through [`Settings::post_load`], which re-coerces
//! numeric fields (a JSON round-trip may hand integers back as floats) and
//! drops keys that no longer validate. Reads of dropped or absent keys fall
//! back to the schema default.

use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Kind of a setting value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    /// Integer setting, optionally range-checked
    Int,
    /// Boolean setting
    Bool,
    /// Free-form string setting
    Str,
    /// String setting restricted to a fixed variant list
    Enum,
}

impl std::fmt::Display for SettingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SettingKind::Int => "int",
            SettingKind::Bool => "bool",
            SettingKind::Str => "string",
            SettingKind::Enum => "enum",
        };
        f.write_str(name)
    }
}

/// A typed setting value
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    /// Integer value
    Int(i64),
    /// Boolean value
    Bool(bool),
    /// String value
    Str(String),
    /// Enum value (one of the schema's variants)
    Enum(String),
}

impl SettingValue {
    /// Kind of this value
    pub fn kind(&self) -> SettingKind {
        match self {
            SettingValue::Int(_) => SettingKind::Int,
            SettingValue::Bool(_) => SettingKind::Bool,
            SettingValue::Str(_) => SettingKind::Str,
            SettingValue::Enum(_) => SettingKind::Enum,
        }
    }

    /// JSON rendering of this value
    pub fn to_json(&self) -> Value {
        match self {
            SettingValue::Int(v) => Value::from(*v),
            SettingValue::Bool(v) => Value::from(*v),
            SettingValue::Str(v) | SettingValue::Enum(v) => Value::from(v.clone()),
        }
    }
}

/// Inclusive integer range bound
#[derive(Debug, Clone, Copy)]
pub struct RangeBound {
    /// Minimum allowed value
    pub min: i64,
    /// Maximum allowed value
    pub max: i64,
}

/// Context a settings map is validated against
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationContext {
    /// Whether the deployment is an enterprise edition
    pub enterprise: bool,
    /// Whether the replication runs over the capi path
    pub capi: bool,
}

/// Per-key validator invoked with the coerced value and the context
pub type SettingValidator = fn(&SettingValue, &SettingConfig, &ValidationContext) -> Result<()>;

/// Schema entry backing one settings key
pub struct SettingConfig {
    /// Default value, which also fixes the key's kind
    pub default: SettingValue,
    /// Optional range for integer settings
    pub range: Option<RangeBound>,
    /// Allowed variants for enum settings
    pub variants: Option<&'static [&'static str]>,
    /// Optional context validator
    pub validator: Option<SettingValidator>,
}

impl SettingConfig {
    /// Schema entry with no range, variants or validator
    pub fn plain(default: SettingValue) -> Self {
        SettingConfig {
            default,
            range: None,
            variants: None,
            validator: None,
        }
    }

    /// Integer schema entry with an inclusive range
    pub fn ranged(default: i64, min: i64, max: i64) -> Self {
        SettingConfig {
            default: SettingValue::Int(default),
            range: Some(RangeBound { min, max }),
            variants: None,
            validator: None,
        }
    }

    /// Enum schema entry with its variant list
    pub fn enumerated(default: &str, variants: &'static [&'static str]) -> Self {
        SettingConfig {
            default: SettingValue::Enum(default.to_string()),
            range: None,
            variants: Some(variants),
            validator: None,
        }
    }

    /// Attach a context validator
    pub fn with_validator(mut self, validator: SettingValidator) -> Self {
        self.validator = Some(validator);
        self
    }
}

/// Settings schema: key → config entry
pub type Schema = HashMap<&'static str, SettingConfig>;

/// Retriever for the schema backing a settings instance
///
/// A function pointer rather than a reference so that settings objects stay
/// cheap to clone and trivially `Send`.
pub type SchemaRetriever = fn() -> &'static Schema;

/// Validator for settings only meaningful in an enterprise deployment:
/// a non-default value outside enterprise fails
pub fn enterprise_only(
    value: &SettingValue,
    config: &SettingConfig,
    ctx: &ValidationContext,
) -> Result<()> {
    if *value != config.default && !ctx.enterprise {
        return Err(Error::InvalidInput(
            "the value can be specified only in enterprise edition".into(),
        ));
    }
    Ok(())
}

/// Validator for settings only meaningful on the xmem path:
/// a non-default value on a capi replication fails
pub fn xmem_only(
    value: &SettingValue,
    config: &SettingConfig,
    ctx: &ValidationContext,
) -> Result<()> {
    if *value != config.default && ctx.capi {
        return Err(Error::InvalidInput(
            "the value cannot be specified for capi replication".into(),
        ));
    }
    Ok(())
}

/// A settings instance: typed values over a schema
#[derive(Clone)]
pub struct Settings {
    values: HashMap<String, SettingValue>,
    schema: SchemaRetriever,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings").field("values", &self.values).finish()
    }
}

impl PartialEq for Settings {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Settings {
    /// Empty settings over a schema
    pub fn empty(schema: SchemaRetriever) -> Self {
        Settings {
            values: HashMap::new(),
            schema,
        }
    }

    /// Settings populated from schema defaults
    pub fn defaults(schema: SchemaRetriever) -> Self {
        let mut settings = Settings::empty(schema);
        for (key, config) in (schema)() {
            settings.values.insert((*key).to_string(), config.default.clone());
        }
        settings
    }

    /// Apply a map of raw (JSON-shaped) updates
    ///
    /// Unknown keys, kind mismatches and range failures are collected per key
    /// rather than failing the whole update. Returns the set of values that
    /// actually changed alongside the per-key errors.
    pub fn update_from_map(
        &mut self,
        updates: &HashMap<String, Value>,
        ctx: &ValidationContext,
    ) -> (HashMap<String, SettingValue>, HashMap<String, Error>) {
        let mut changed = HashMap::new();
        let mut errors = HashMap::new();
        let schema = (self.schema)();

        for (key, raw) in updates {
            let config = match schema.get(key.as_str()) {
                Some(config) => config,
                None => {
                    errors.insert(key.clone(), Error::InvalidSettingsKey(key.clone()));
                    continue;
                }
            };

            let value = match coerce_value(key, raw, config) {
                Ok(value) => value,
                Err(err) => {
                    errors.insert(key.clone(), err);
                    continue;
                }
            };

            if let Some(validator) = config.validator {
                if let Err(err) = validator(&value, config, ctx) {
                    errors.insert(key.clone(), err);
                    continue;
                }
            }

            let unchanged = self.values.get(key) == Some(&value);
            if !unchanged {
                self.values.insert(key.clone(), value.clone());
                changed.insert(key.clone(), value);
            }
        }

        (changed, errors)
    }

    /// Fix up a settings instance freshly deserialized from metadata
    ///
    /// Numeric fields are re-coerced against the schema (an integer comes
    /// back from a JSON round-trip as a float); keys that fail coercion or
    /// validation are dropped with a warning, after which reads fall back to
    /// the schema default.
    pub fn post_load(&mut self) {
        let schema = (self.schema)();
        let mut dropped = Vec::new();

        for (key, value) in &self.values {
            let config = match schema.get(key.as_str()) {
                Some(config) => config,
                None => {
                    dropped.push(key.clone());
                    continue;
                }
            };
            let raw = value.to_json();
            if coerce_value(key, &raw, config).is_err() {
                dropped.push(key.clone());
            }
        }

        for key in dropped {
            tracing::warn!(
                key = %key,
                "dropping settings key that failed validation after load; default will be used"
            );
            self.values.remove(&key);
        }
    }

    /// Fill in schema keys absent from persisted state with defaults
    pub fn upgrade(&mut self) {
        for (key, config) in (self.schema)() {
            self.values
                .entry((*key).to_string())
                .or_insert_with(|| config.default.clone());
        }
    }

    /// Value for a key, falling back to the schema default when unset
    pub fn value_or_default(&self, key: &str) -> Option<SettingValue> {
        if let Some(value) = self.values.get(key) {
            return Some(value.clone());
        }
        (self.schema)().get(key).map(|config| config.default.clone())
    }

    /// Integer accessor; returns the schema default when unset
    pub fn get_int(&self, key: &str) -> i64 {
        match self.value_or_default(key) {
            Some(SettingValue::Int(v)) => v,
            other => {
                tracing::error!(key = %key, value = ?other, "setting is not an integer");
                0
            }
        }
    }

    /// Boolean accessor; returns the schema default when unset
    pub fn get_bool(&self, key: &str) -> bool {
        match self.value_or_default(key) {
            Some(SettingValue::Bool(v)) => v,
            other => {
                tracing::error!(key = %key, value = ?other, "setting is not a boolean");
                false
            }
        }
    }

    /// String accessor; returns the schema default when unset
    pub fn get_str(&self, key: &str) -> String {
        match self.value_or_default(key) {
            Some(SettingValue::Str(v)) | Some(SettingValue::Enum(v)) => v,
            other => {
                tracing::error!(key = %key, value = ?other, "setting is not a string");
                String::new()
            }
        }
    }

    /// Render as a JSON object of raw values
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.values {
            map.insert(key.clone(), value.to_json());
        }
        let mut outer = serde_json::Map::new();
        outer.insert("values".to_string(), Value::Object(map));
        Value::Object(outer)
    }

    /// Reconstruct from persisted JSON, running `post_load` and `upgrade`
    pub fn from_json(raw: &Value, schema: SchemaRetriever) -> Result<Settings> {
        let values = raw
            .get("values")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::invalid_input("settings document has no values object"))?;

        let mut settings = Settings::empty(schema);
        let schema_map = (schema)();
        for (key, raw_value) in values {
            let config = match schema_map.get(key.as_str()) {
                Some(config) => config,
                None => {
                    tracing::warn!(key = %key, "ignoring unknown settings key in persisted state");
                    continue;
                }
            };
            match coerce_value(key, raw_value, config) {
                Ok(value) => {
                    settings.values.insert(key.clone(), value);
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "dropping invalid persisted setting");
                }
            }
        }
        settings.post_load();
        settings.upgrade();
        Ok(settings)
    }
}

/// Coerce a raw JSON value into the typed value the schema expects
fn coerce_value(key: &str, raw: &Value, config: &SettingConfig) -> Result<SettingValue> {
    let expected = config.default.kind();
    match expected {
        SettingKind::Int => {
            // a JSON round-trip may collapse integer kinds; accept any
            // numeric representation with an integral value
            let int_value = match raw {
                Value::Number(n) => {
                    if let Some(v) = n.as_i64() {
                        Some(v)
                    } else {
                        n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)
                    }
                }
                _ => None,
            };
            let value = int_value.ok_or_else(|| Error::TypeMismatch {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: json_kind_name(raw).to_string(),
            })?;
            if let Some(range) = config.range {
                if value < range.min || value > range.max {
                    return Err(Error::ValueOutOfRange {
                        key: key.to_string(),
                        value,
                        min: range.min,
                        max: range.max,
                    });
                }
            }
            Ok(SettingValue::Int(value))
        }
        SettingKind::Bool => match raw {
            Value::Bool(v) => Ok(SettingValue::Bool(*v)),
            _ => Err(Error::TypeMismatch {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: json_kind_name(raw).to_string(),
            }),
        },
        SettingKind::Str => match raw {
            Value::String(v) => Ok(SettingValue::Str(v.clone())),
            _ => Err(Error::TypeMismatch {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: json_kind_name(raw).to_string(),
            }),
        },
        SettingKind::Enum => match raw {
            Value::String(v) => {
                let allowed = config.variants.unwrap_or(&[]);
                if allowed.iter().any(|variant| variant == v) {
                    Ok(SettingValue::Enum(v.clone()))
                } else {
                    Err(Error::InvalidInput(format!(
                        "{} is not a valid variant for {}",
                        v, key
                    )))
                }
            }
            _ => Err(Error::TypeMismatch {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: json_kind_name(raw).to_string(),
            }),
        },
    }
}

fn json_kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
