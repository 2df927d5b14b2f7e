//! Typed parameter schemas and their one-time validation.
//!
//! Schemas come from policy descriptors and are compiled (regex patterns,
//! constraint expressions) when the definition is registered. Raw parameter
//! bags from the distribution protocol are validated against them when a chain
//! is built; the resulting `Params` is what policies see at request time.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::expr::{Expression, ValueBinding, CONSTRAINT_ROOTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParamFormat {
    Uri,
    Email,
    Hostname,
    /// `250ms`, `30s`, `5m`, `1h`
    Duration,
    HeaderName,
    Regex,
}

/// Declarative schema for one parameter (descriptor shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    /// Characters for strings, items for arrays.
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default, rename = "enum")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default)]
    pub format: Option<ParamFormat>,
    /// Element type for arrays.
    #[serde(default)]
    pub items: Option<ParamType>,
    /// Custom boolean constraint over `value`.
    #[serde(default)]
    pub expression: Option<String>,
}

/// Schema with its pattern and expression compiled.
#[derive(Debug, Clone)]
pub struct CompiledParam {
    pub schema: ParamSchema,
    pattern: Option<Regex>,
    expression: Option<Expression>,
}

impl CompiledParam {
    pub fn compile(schema: ParamSchema) -> Result<Self> {
        let pattern = match &schema.pattern {
            Some(p) => Some(Regex::new(p).map_err(|e| {
                EngineError::InvalidConfig(format!("parameter `{}`: bad pattern: {e}", schema.name))
            })?),
            None => None,
        };
        let expression = match &schema.expression {
            Some(src) => Some(Expression::compile(src, CONSTRAINT_ROOTS)?),
            None => None,
        };
        if schema.required && schema.default.is_some() {
            return Err(EngineError::InvalidConfig(format!(
                "parameter `{}` cannot be both required and defaulted",
                schema.name
            )));
        }
        Ok(Self {
            schema,
            pattern,
            expression,
        })
    }

    /// Validate (and coerce) one value against this schema.
    fn check(&self, policy: &str, value: Value) -> Result<Value> {
        let s = &self.schema;
        let fail = |reason: String| EngineError::InvalidParameter {
            policy: policy.to_string(),
            param: s.name.clone(),
            reason,
        };

        let mut value = coerce(s.param_type, value).map_err(&fail)?;

        if let (Some(items), Value::Array(arr)) = (s.items, &mut value) {
            for (i, item) in arr.iter_mut().enumerate() {
                *item = coerce(items, item.take()).map_err(|r| fail(format!("item {i}: {r}")))?;
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = s.minimum {
                if n < min {
                    return Err(fail(format!("must be >= {min}, got {n}")));
                }
            }
            if let Some(max) = s.maximum {
                if n > max {
                    return Err(fail(format!("must be <= {max}, got {n}")));
                }
            }
        }

        let len = match &value {
            Value::String(v) => Some(v.chars().count()),
            Value::Array(v) => Some(v.len()),
            _ => None,
        };
        if let Some(len) = len {
            if let Some(min) = s.min_length {
                if len < min {
                    return Err(fail(format!("length must be >= {min}, got {len}")));
                }
            }
            if let Some(max) = s.max_length {
                if len > max {
                    return Err(fail(format!("length must be <= {max}, got {len}")));
                }
            }
        }

        if let (Some(re), Value::String(v)) = (&self.pattern, &value) {
            if !re.is_match(v) {
                return Err(fail(format!("does not match pattern `{}`", re.as_str())));
            }
        }

        if let Some(allowed) = &s.allowed {
            if !allowed.contains(&value) {
                return Err(fail(format!("must be one of {}", Value::Array(allowed.clone()))));
            }
        }

        if let (Some(fmt), Value::String(v)) = (s.format, &value) {
            if !format_ok(fmt, v) {
                return Err(fail(format!("is not a valid {fmt:?}").to_lowercase()));
            }
        }

        if let Some(expr) = &self.expression {
            let ok = expr
                .evaluate_bool(&ValueBinding(&value))
                .map_err(|e| fail(format!("constraint `{}` failed: {e}", expr.source())))?;
            if !ok {
                return Err(fail(format!("violates constraint `{}`", expr.source())));
            }
        }

        Ok(value)
    }
}

fn coerce(ty: ParamType, value: Value) -> std::result::Result<Value, String> {
    let ok = match (ty, &value) {
        (ParamType::String, Value::String(_)) => true,
        (ParamType::Boolean, Value::Bool(_)) => true,
        (ParamType::Number, Value::Number(_)) => true,
        (ParamType::Array, Value::Array(_)) => true,
        (ParamType::Object, Value::Object(_)) => true,
        (ParamType::Integer, Value::Number(n)) => {
            if n.is_i64() || n.is_u64() {
                true
            } else {
                // YAML/JSON producers sometimes emit `5.0`
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
                        return Ok(Value::from(f as i64));
                    }
                    _ => false,
                }
            }
        }
        _ => false,
    };
    if ok {
        Ok(value)
    } else {
        Err(format!(
            "must be of type {}, got {}",
            ty.as_str(),
            json_type(&value)
        ))
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn format_ok(fmt: ParamFormat, v: &str) -> bool {
    static URI: OnceLock<Option<Regex>> = OnceLock::new();
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    static HOST: OnceLock<Option<Regex>> = OnceLock::new();
    static TOKEN: OnceLock<Option<Regex>> = OnceLock::new();

    let check = |cell: &OnceLock<Option<Regex>>, pat: &str| {
        cell.get_or_init(|| Regex::new(pat).ok())
            .as_ref()
            .is_some_and(|re| re.is_match(v))
    };

    match fmt {
        ParamFormat::Uri => check(&URI, r"^[A-Za-z][A-Za-z0-9+.\-]*://[^\s/?#]+[^\s]*$"),
        ParamFormat::Email => check(&EMAIL, r"^[^@\s]+@[^@\s]+\.[^@\s]+$"),
        ParamFormat::Hostname => {
            v.len() <= 253
                && check(
                    &HOST,
                    r"^([A-Za-z0-9]([A-Za-z0-9\-]{0,61}[A-Za-z0-9])?)(\.[A-Za-z0-9]([A-Za-z0-9\-]{0,61}[A-Za-z0-9])?)*$",
                )
        }
        ParamFormat::Duration => parse_duration(v).is_some(),
        ParamFormat::HeaderName => check(&TOKEN, r"^[!#$%&'*+.^_`|~0-9A-Za-z\-]+$"),
        ParamFormat::Regex => Regex::new(v).is_ok(),
    }
}

/// Parse `250ms`, `30s`, `5m`, `1h`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs),
        "h" => n.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

/// Validate a raw parameter bag. Undeclared keys are rejected; defaults are
/// filled in; every constraint is checked.
pub fn validate_params(
    policy: &str,
    schemas: &[CompiledParam],
    raw: &Map<String, Value>,
) -> Result<Params> {
    for key in raw.keys() {
        if !schemas.iter().any(|s| &s.schema.name == key) {
            return Err(EngineError::InvalidParameter {
                policy: policy.to_string(),
                param: key.clone(),
                reason: "is not declared by the policy definition".into(),
            });
        }
    }

    let mut out = BTreeMap::new();
    for param in schemas {
        let s = &param.schema;
        let supplied = raw.get(&s.name).filter(|v| !v.is_null()).cloned();
        let value = match supplied.or_else(|| s.default.clone()) {
            Some(v) => v,
            None if s.required => {
                return Err(EngineError::InvalidParameter {
                    policy: policy.to_string(),
                    param: s.name.clone(),
                    reason: "is required".into(),
                })
            }
            None => continue,
        };
        out.insert(s.name.clone(), param.check(policy, value)?);
    }
    Ok(Params(out))
}

/// Validated, typed parameter values handed to policies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder used by tests and programmatic chains.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    pub fn str_list(&self, name: &str) -> Vec<&str> {
        self.0
            .get(name)
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn object(&self, name: &str) -> Option<&Map<String, Value>> {
        self.0.get(name).and_then(Value::as_object)
    }

    pub fn duration(&self, name: &str) -> Option<Duration> {
        self.str(name).and_then(parse_duration)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}
