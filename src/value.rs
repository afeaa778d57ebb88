//! Typed values produced by the generators.
//!
//! Every generated value is one of a closed set of variants, and each
//! variant knows how to render itself the way it is reported upstream
//! (`formatted`). Numeric literals read from documents are kept as text so
//! their decimal-place count survives loading.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A generated property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Integer(i64),
    /// Fixed-point float rendered with `precision` decimals.
    Float { value: f64, precision: usize },
    Boolean(bool),
    Text(String),
    /// A label picked from an enumerated set.
    Enum { index: usize, label: String },
}

impl PropertyValue {
    pub fn float(value: f64, precision: usize) -> Self {
        PropertyValue::Float { value, precision }
    }

    /// Types a configured literal by what it parses as.
    pub fn from_literal(text: &str) -> Self {
        let trimmed = text.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return PropertyValue::Integer(i);
        }
        if let Ok(lit) = NumberLiteral::parse(trimmed) {
            return PropertyValue::float(lit.value(), lit.decimals());
        }
        match trimmed {
            "true" => PropertyValue::Boolean(true),
            "false" => PropertyValue::Boolean(false),
            _ => PropertyValue::Text(text.to_string()),
        }
    }

    /// Rendering used for reports and string comparisons.
    pub fn formatted(&self) -> String {
        match self {
            PropertyValue::Integer(i) => i.to_string(),
            PropertyValue::Float { value, precision } => format!("{:.*}", precision, value),
            PropertyValue::Boolean(b) => b.to_string(),
            PropertyValue::Text(s) => s.clone(),
            PropertyValue::Enum { label, .. } => label.clone(),
        }
    }

    /// Numeric view, if the value has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Integer(i) => Some(*i as f64),
            PropertyValue::Float { value, .. } => Some(*value),
            PropertyValue::Boolean(_) => None,
            PropertyValue::Text(s) | PropertyValue::Enum { label: s, .. } => {
                s.trim().parse::<f64>().ok()
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Integer(_) => "integer",
            PropertyValue::Float { .. } => "float",
            PropertyValue::Boolean(_) => "boolean",
            PropertyValue::Text(_) => "text",
            PropertyValue::Enum { .. } => "enum",
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted())
    }
}

/// Reported upstream as the formatted string.
impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.formatted())
    }
}

/// Number of digits after the decimal point in a numeric literal.
pub fn decimal_places(text: &str) -> usize {
    let mantissa = text.split(['e', 'E']).next().unwrap_or(text);
    match mantissa.split_once('.') {
        Some((_, frac)) => frac.len(),
        None => 0,
    }
}

/// A numeric literal that remembers how it was written.
///
/// Accepts JSON numbers and numeric strings. `20.0` keeps one decimal.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberLiteral {
    text: String,
    value: f64,
}

impl NumberLiteral {
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        let value = text
            .parse::<f64>()
            .map_err(|_| format!("'{}' is not a number", text))?;
        if !value.is_finite() {
            return Err(format!("'{}' is not a finite number", text));
        }
        Ok(Self {
            text: text.to_string(),
            value,
        })
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn decimals(&self) -> usize {
        decimal_places(&self.text)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// True when the literal has no fractional part (`1`, `1.0`).
    pub fn is_whole(&self) -> bool {
        self.value.fract() == 0.0
    }
}

impl From<f64> for NumberLiteral {
    fn from(value: f64) -> Self {
        Self {
            text: value.to_string(),
            value,
        }
    }
}

impl FromStr for NumberLiteral {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NumberLiteral::parse(s)
    }
}

impl fmt::Display for NumberLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for NumberLiteral {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::Number(n) => NumberLiteral::parse(&n.to_string()),
            serde_json::Value::String(s) => NumberLiteral::parse(&s),
            other => Err(format!("expected a number, found {}", other)),
        }
        .map_err(D::Error::custom)
    }
}

impl Serialize for NumberLiteral {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match serde_json::from_str::<serde_json::Number>(&self.text) {
            Ok(n) => n.serialize(serializer),
            Err(_) => serializer.serialize_f64(self.value),
        }
    }
}

/// Optional literal where `null` and `""` both mean absent.
pub(crate) fn lenient_literal<'de, D>(deserializer: D) -> Result<Option<NumberLiteral>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(None),
        serde_json::Value::Number(n) => NumberLiteral::parse(&n.to_string())
            .map(Some)
            .map_err(D::Error::custom),
        serde_json::Value::String(s) => NumberLiteral::parse(&s)
            .map(Some)
            .map_err(D::Error::custom),
        other => Err(D::Error::custom(format!("expected a number, found {}", other))),
    }
}
