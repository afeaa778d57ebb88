//! Thing model: the declared capability surface of a device type.
//!
//! Documents may spell compound fields either way (`dataType` or
//! `data_type`, `outputData` or `output_data`, ...). Both spellings are
//! kept on load and resolved at read time; a non-empty snake_case value
//! wins over the camelCase one.

use crate::error::{Result, SimError};
use crate::value::{lenient_literal, NumberLiteral};
use serde::{Deserialize, Serialize};
use std::path::Path;


/// Data types a thing model may declare.
pub const VALID_DATA_TYPES: &[&str] = &[
    "int", "long", "float", "double", "bool", "text", "string", "enum",
];

/// Declared properties, events and services of a device type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThingModel {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataType {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub specs: DataSpecs,
}

impl DataType {
    fn is_present(&self) -> bool {
        !self.kind.is_empty()
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.kind.as_str(), "int" | "long" | "float" | "double")
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.kind.as_str(), "int" | "long")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSpecs {
    #[serde(default, deserialize_with = "lenient_literal", skip_serializing_if = "Option::is_none")]
    pub min: Option<NumberLiteral>,
    #[serde(default, deserialize_with = "lenient_literal", skip_serializing_if = "Option::is_none")]
    pub max: Option<NumberLiteral>,
    #[serde(default, deserialize_with = "lenient_literal", skip_serializing_if = "Option::is_none")]
    pub step: Option<NumberLiteral>,
    #[serde(default, deserialize_with = "lenient_literal", skip_serializing_if = "Option::is_none")]
    pub length: Option<NumberLiteral>,
    #[serde(default, deserialize_with = "lenient_literal", skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<NumberLiteral>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    #[serde(rename = "unitName", default, skip_serializing_if = "String::is_empty")]
    pub unit_name: String,
    /// Enum labels: a comma separated string, an array, or a `{key: label}` object.
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<serde_json::Value>,
    #[serde(rename = "enumValue", default, skip_serializing_if = "Option::is_none")]
    pub enum_value: Option<String>,
    #[serde(rename = "true", default, skip_serializing_if = "Option::is_none")]
    pub true_label: Option<String>,
    #[serde(rename = "false", default, skip_serializing_if = "Option::is_none")]
    pub false_label: Option<String>,
}

impl DataSpecs {
    /// Labels of an enumerated type, in document order.
    pub fn enum_labels(&self) -> Vec<String> {
        let from_str = |s: &str| -> Vec<String> {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        };
        let as_label = |v: &serde_json::Value| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let labels = match &self.enum_values {
            Some(serde_json::Value::String(s)) => from_str(s),
            Some(serde_json::Value::Array(items)) => items.iter().map(as_label).collect(),
            Some(serde_json::Value::Object(map)) => map.values().map(as_label).collect(),
            _ => Vec::new(),
        };
        if labels.is_empty() {
            if let Some(s) = &self.enum_value {
                return from_str(s);
            }
        }
        labels
    }
}

/// Picks the snake_case spelling when it carries a value.
fn prefer<'a, T>(snake: &'a Option<T>, camel: &'a T, present: impl Fn(&T) -> bool) -> &'a T {
    match snake {
        Some(v) if present(v) => v,
        _ => camel,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Property {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "accessMode", default)]
    access_mode: String,
    #[serde(rename = "access_mode", default, skip_serializing_if = "Option::is_none")]
    access_mode_snake: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "dataType", default)]
    data_type: DataType,
    #[serde(rename = "data_type", default, skip_serializing_if = "Option::is_none")]
    data_type_snake: Option<DataType>,
    #[serde(default)]
    pub desc: String,
}

impl Property {
    pub fn data_type(&self) -> &DataType {
        prefer(&self.data_type_snake, &self.data_type, DataType::is_present)
    }

    pub fn access_mode(&self) -> &str {
        prefer::<String>(&self.access_mode_snake, &self.access_mode, |s| !s.is_empty())
    }

    /// Only `rw` properties accept set calls.
    pub fn is_writable(&self) -> bool {
        self.access_mode() == "rw"
    }
}

/// A typed parameter of an event or service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Param {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "dataType", default)]
    data_type: DataType,
    #[serde(rename = "data_type", default, skip_serializing_if = "Option::is_none")]
    data_type_snake: Option<DataType>,
    #[serde(default)]
    pub desc: String,
}

impl Param {
    pub fn data_type(&self) -> &DataType {
        prefer(&self.data_type_snake, &self.data_type, DataType::is_present)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub method: String,
    #[serde(rename = "outputData", default)]
    output_data: Vec<Param>,
    #[serde(rename = "output_data", default, skip_serializing_if = "Option::is_none")]
    output_data_snake: Option<Vec<Param>>,
    #[serde(rename = "eventType", default)]
    event_type: String,
    #[serde(rename = "event_type", default, skip_serializing_if = "Option::is_none")]
    event_type_snake: Option<String>,
}

impl Event {
    pub fn output_data(&self) -> &[Param] {
        prefer::<Vec<Param>>(&self.output_data_snake, &self.output_data, |v| !v.is_empty())
    }

    pub fn event_type(&self) -> &str {
        prefer::<String>(&self.event_type_snake, &self.event_type, |s| !s.is_empty())
    }
}

/// A service (called an action in thing-model documents).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "callType", default)]
    call_type: String,
    #[serde(rename = "call_type", default, skip_serializing_if = "Option::is_none")]
    call_type_snake: Option<String>,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub method: String,
    #[serde(rename = "inputData", default)]
    input_data: Vec<Param>,
    #[serde(rename = "input_data", default, skip_serializing_if = "Option::is_none")]
    input_data_snake: Option<Vec<Param>>,
    #[serde(rename = "outputData", default)]
    output_data: Vec<Param>,
    #[serde(rename = "output_data", default, skip_serializing_if = "Option::is_none")]
    output_data_snake: Option<Vec<Param>>,
}

impl Action {
    pub fn call_type(&self) -> &str {
        prefer::<String>(&self.call_type_snake, &self.call_type, |s| !s.is_empty())
    }

    pub fn input_data(&self) -> &[Param] {
        prefer::<Vec<Param>>(&self.input_data_snake, &self.input_data, |v| !v.is_empty())
    }

    pub fn output_data(&self) -> &[Param] {
        prefer::<Vec<Param>>(&self.output_data_snake, &self.output_data, |v| !v.is_empty())
    }
}

impl ThingModel {
    /// Parses a thing-model document.
    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Loads and validates a thing-model document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SimError::config(path, e))?;
        let model = Self::from_json(&text).map_err(|e| SimError::config(path, e))?;
        model.validate().map_err(|reason| SimError::config(path, reason))?;
        Ok(model)
    }

    pub fn property(&self, identifier: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.identifier == identifier)
    }

    pub fn event(&self, identifier: &str) -> Option<&Event> {
        self.events.iter().find(|e| e.identifier == identifier)
    }

    pub fn action(&self, identifier: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.identifier == identifier)
    }

    /// Structural checks: identifiers and names present, data types known,
    /// numeric ranges ordered.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for prop in &self.properties {
            if prop.identifier.is_empty() {
                return Err("property identifier must not be empty".into());
            }
            if prop.name.is_empty() {
                return Err(format!("property '{}' has no name", prop.identifier));
            }
            validate_data_type(prop.data_type())
                .map_err(|e| format!("property '{}': {}", prop.identifier, e))?;
        }
        for event in &self.events {
            if event.identifier.is_empty() {
                return Err("event identifier must not be empty".into());
            }
            if event.name.is_empty() {
                return Err(format!("event '{}' has no name", event.identifier));
            }
        }
        for action in &self.actions {
            if action.identifier.is_empty() {
                return Err("service identifier must not be empty".into());
            }
            if action.name.is_empty() {
                return Err(format!("service '{}' has no name", action.identifier));
            }
        }
        Ok(())
    }
}

fn validate_data_type(dt: &DataType) -> std::result::Result<(), String> {
    if !VALID_DATA_TYPES.contains(&dt.kind.as_str()) {
        return Err(format!("unsupported data type '{}'", dt.kind));
    }
    if dt.is_numeric() {
        let min = dt.specs.min.as_ref().map_or(0.0, NumberLiteral::value);
        let max = dt.specs.max.as_ref().map_or(0.0, NumberLiteral::value);
        if min >= max && (min != 0.0 || max != 0.0) {
            return Err(format!("min {} must be below max {}", min, max));
        }
    }
    Ok(())
}

/// `tsl_<product>.json`
pub fn model_file_name(product: &str) -> String {
    format!("tsl_{}.json", product)
}

/// Product name encoded in a `tsl_<product>.json` file name.
pub fn product_from_model_file(path: impl AsRef<Path>) -> Option<String> {
    let name = path.as_ref().file_name()?.to_str()?;
    let product = name.strip_prefix("tsl_")?.strip_suffix(".json")?;
    (!product.is_empty()).then(|| product.to_string())
}
