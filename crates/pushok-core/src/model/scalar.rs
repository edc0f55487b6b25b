// ── Property values ──

use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// The three value kinds a property can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Number,
    /// One of a closed set of labels, each mapped to a raw hub value.
    Enum,
}

/// A typed property value as the bridge sees it.
///
/// Enum values are carried by label; the raw hub value is recovered
/// through the property's spec when the value is sent back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    Enum(String),
}

impl Scalar {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::Enum(_) => ValueKind::Enum,
        }
    }

    /// Value as it appears inside the device JSON state.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => number_json(*n),
            Self::Enum(label) => Value::String(label.clone()),
        }
    }

    /// Payload of a per-property topic.
    pub fn topic_text(&self) -> String {
        match self {
            Self::Bool(true) => "true".into(),
            Self::Bool(false) => "false".into(),
            Self::Number(n) => number_json(*n).to_string(),
            Self::Enum(label) => label.clone(),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic_text())
    }
}

/// Integral values render without a fractional part (`20`, not `20.0`).
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub(crate) fn number_json(value: f64) -> Value {
    const EXACT_INT: f64 = 9_007_199_254_740_992.0;
    if value.fract() == 0.0 && value.abs() < EXACT_INT {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}
