//! Untyped values flowing between pipeline tasks.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::result::TaskError;

/// A single value produced or consumed by a pipeline task.
///
/// Numbers are always arbitrary-precision decimals, never `f64`; JSON
/// payloads convert losslessly in both directions via [`Value::from_json`]
/// and [`Value::to_json`].
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Map(BTreeMap<String, Value>),
    Sequence(Vec<Value>),
    Null,
}

impl Value {
    /// Name used in operator-facing coercion errors. `Null` renders as
    /// `<nil>`, which downstream tooling matches on.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Bool(_) => "bool",
            Value::Map(_) => "map",
            Value::Sequence(_) => "sequence",
            Value::Null => "<nil>",
        }
    }

    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => {
                // Go through the literal text so that e.g. 62.57 survives
                // exactly instead of picking up binary-float noise.
                match Decimal::from_str(&n.to_string())
                    .or_else(|_| Decimal::from_scientific(&n.to_string()))
                {
                    Ok(d) => Value::Decimal(d),
                    Err(_) => Value::Null,
                }
            }
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => {
                Value::Sequence(items.iter().map(Value::from_json).collect())
            }
            JsonValue::Object(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), Value::from_json(value)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Decimal(d) => {
                if d.scale() == 0 {
                    if let Some(i) = d.to_i64() {
                        return JsonValue::Number(i.into());
                    }
                }
                d.to_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(JsonValue::Number)
                    .unwrap_or_else(|| JsonValue::String(d.normalize().to_string()))
            }
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Bytes(bytes) => JsonValue::String(String::from_utf8_lossy(bytes).into_owned()),
            Value::Sequence(items) => {
                JsonValue::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => JsonValue::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    /// Coerce to a decimal for arithmetic tasks.
    ///
    /// `Null` and non-numeric variants fail with the observable
    /// `"type <T> cannot be converted to decimal.Decimal"` wording.
    pub fn to_decimal(&self) -> Result<Decimal, TaskError> {
        match self {
            Value::Decimal(d) => Ok(*d),
            Value::String(s) => parse_decimal_text(s),
            Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => parse_decimal_text(s),
                Err(_) => Err(uncoercible(self)),
            },
            Value::Bool(_) | Value::Map(_) | Value::Sequence(_) | Value::Null => {
                Err(uncoercible(self))
            }
        }
    }

    /// Canonical decimal rendering with trailing zeros removed:
    /// `6257`, `6194.2`, `6225.6`.
    pub fn canonical_decimal(d: Decimal) -> Value {
        Value::String(d.normalize().to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }
}

fn parse_decimal_text(s: &str) -> Result<Decimal, TaskError> {
    let trimmed = s.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| TaskError::Conversion(format!("cannot parse '{trimmed}' as decimal.Decimal")))
}

fn uncoercible(value: &Value) -> TaskError {
    TaskError::Conversion(format!(
        "type {} cannot be converted to decimal.Decimal",
        value.type_name()
    ))
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}
