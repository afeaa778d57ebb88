//! Simulation rule sets.
//!
//! A rule set pairs with one thing model and says how to fabricate values
//! for it: a generation method per property, a trigger condition and
//! cooldown per event, and a response strategy per service.
//!
//! ```json
//! {
//!   "productName": "motor",
//!   "simulationConfig": {"speed": {"method": "randomRange", "min": 500, "max": 2500}},
//!   "events": [{"identifier": "overheat_alarm", "triggerCondition": "temperature >= 85", "cooldown": 300}],
//!   "services": {"reset": {"responseStrategy": "fixed", "possibleResponses": [{"code": 200, "msg": "ok", "desc": "done"}]}}
//! }
//! ```

pub mod consistency;
pub mod defaults;


pub use consistency::{check_consistency, CapabilityKind, ConsistencyReport, Mismatch, MismatchDirection};

use crate::error::{Result, SimError};
use crate::generator::condition::TriggerCondition;
use crate::value::NumberLiteral;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// How a property value is fabricated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GenerationMethod {
    RandomRange,
    Wave,
    Accumulate,
    Increase,
    Enum,
    EnumPick,
    Fixed,
    /// Anything else; generates a neutral zero.
    Unknown(String),
}

impl GenerationMethod {
    pub fn as_str(&self) -> &str {
        match self {
            GenerationMethod::RandomRange => "randomRange",
            GenerationMethod::Wave => "wave",
            GenerationMethod::Accumulate => "accumulate",
            GenerationMethod::Increase => "increase",
            GenerationMethod::Enum => "enum",
            GenerationMethod::EnumPick => "enumPick",
            GenerationMethod::Fixed => "fixed",
            GenerationMethod::Unknown(s) => s,
        }
    }
}

impl Default for GenerationMethod {
    fn default() -> Self {
        GenerationMethod::Unknown(String::new())
    }
}

impl From<String> for GenerationMethod {
    fn from(s: String) -> Self {
        match s.as_str() {
            "randomRange" => GenerationMethod::RandomRange,
            "wave" => GenerationMethod::Wave,
            "accumulate" => GenerationMethod::Accumulate,
            "increase" => GenerationMethod::Increase,
            "enum" => GenerationMethod::Enum,
            "enumPick" => GenerationMethod::EnumPick,
            "fixed" => GenerationMethod::Fixed,
            _ => GenerationMethod::Unknown(s),
        }
    }
}

impl From<GenerationMethod> for String {
    fn from(m: GenerationMethod) -> Self {
        m.as_str().to_string()
    }
}

impl fmt::Display for GenerationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation config for one property.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyGenConfig {
    #[serde(default)]
    pub method: GenerationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<NumberLiteral>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<NumberLiteral>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<NumberLiteral>,
    /// Initial running total for `accumulate` and `increase`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<NumberLiteral>,
    /// Literal returned by `fixed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default)]
    pub switch_probability: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amplitude: Option<NumberLiteral>,
    /// Seconds per full sine period.
    #[serde(default)]
    pub wave_period: f64,
}

impl PropertyGenConfig {
    /// The `fixed` literal as text.
    pub fn fixed_literal(&self) -> Option<String> {
        match self.value.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Output precision for `randomRange` and `wave`.
    pub fn range_precision(&self) -> usize {
        let decimals = |lit: &Option<NumberLiteral>| lit.as_ref().map_or(0, NumberLiteral::decimals);
        decimals(&self.min).max(decimals(&self.max))
    }

    fn validate(&self, identifier: &str) -> Result<()> {
        let invalid = |reason: &str| SimError::InvalidRule {
            identifier: identifier.to_string(),
            reason: reason.to_string(),
        };

        match &self.method {
            GenerationMethod::RandomRange => match (&self.min, &self.max) {
                (Some(min), Some(max)) if min.value() < max.value() => {}
                (Some(_), Some(_)) => return Err(invalid("randomRange requires min < max")),
                _ => return Err(invalid("randomRange requires min and max")),
            },
            GenerationMethod::Wave => {
                if self.min.is_none() || self.max.is_none() || self.amplitude.is_none() {
                    return Err(invalid("wave requires min, max and amplitude"));
                }
                if self.wave_period <= 0.0 {
                    return Err(invalid("wave requires wavePeriod > 0"));
                }
            }
            GenerationMethod::Accumulate | GenerationMethod::Increase => {
                if self.step.is_none() {
                    return Err(invalid("accumulate and increase require a step"));
                }
            }
            GenerationMethod::Enum | GenerationMethod::EnumPick => {
                if self.enum_values.is_empty() {
                    return Err(invalid("enum requires at least one value"));
                }
                if !(0.0..=1.0).contains(&self.switch_probability) {
                    return Err(invalid("switchProbability must be within [0, 1]"));
                }
            }
            GenerationMethod::Fixed => {
                if self.fixed_literal().is_none() {
                    return Err(invalid("fixed requires a value"));
                }
            }
            GenerationMethod::Unknown(method) => {
                warn!(
                    property = %identifier,
                    method = %method,
                    "Unknown generation method, property will report zero"
                );
            }
        }
        Ok(())
    }
}

/// Trigger for one event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventGenConfig {
    pub identifier: String,
    /// `<property> <operator> <literal>`; empty means never.
    #[serde(default)]
    pub trigger_condition: String,
    /// Minimum seconds between two firings.
    #[serde(default)]
    pub cooldown: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResponseStrategy {
    Fixed,
    Random,
    RandomPick,
    Unknown(String),
}

impl ResponseStrategy {
    pub fn as_str(&self) -> &str {
        match self {
            ResponseStrategy::Fixed => "fixed",
            ResponseStrategy::Random => "random",
            ResponseStrategy::RandomPick => "randomPick",
            ResponseStrategy::Unknown(s) => s,
        }
    }
}

impl Default for ResponseStrategy {
    fn default() -> Self {
        ResponseStrategy::Unknown(String::new())
    }
}

impl From<String> for ResponseStrategy {
    fn from(s: String) -> Self {
        match s.as_str() {
            "fixed" => ResponseStrategy::Fixed,
            "random" => ResponseStrategy::Random,
            "randomPick" => ResponseStrategy::RandomPick,
            _ => ResponseStrategy::Unknown(s),
        }
    }
}

impl From<ResponseStrategy> for String {
    fn from(s: ResponseStrategy) -> Self {
        s.as_str().to_string()
    }
}

/// A simulated service response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub desc: String,
}

impl ServiceResponse {
    pub fn new(code: i32, msg: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            desc: desc.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Response strategy for one service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceGenConfig {
    #[serde(default)]
    pub response_strategy: ResponseStrategy,
    #[serde(default)]
    pub possible_responses: Vec<ServiceResponse>,
}

impl ServiceGenConfig {
    fn validate(&self, identifier: &str) -> Result<()> {
        let invalid = |reason: String| SimError::InvalidRule {
            identifier: identifier.to_string(),
            reason,
        };
        match &self.response_strategy {
            ResponseStrategy::Unknown(strategy) => {
                warn!(
                    service = %identifier,
                    strategy = %strategy,
                    "Unknown response strategy, service will answer with the default success"
                );
            }
            _ if self.possible_responses.is_empty() => {
                return Err(invalid("at least one possible response is required".into()));
            }
            _ => {}
        }
        for response in &self.possible_responses {
            if !(100..=599).contains(&response.code) {
                return Err(invalid(format!("response code {} is outside 100..=599", response.code)));
            }
        }
        Ok(())
    }
}

/// Rule document for one product.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRuleSet {
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub simulation_config: BTreeMap<String, PropertyGenConfig>,
    #[serde(default)]
    pub events: Vec<EventGenConfig>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceGenConfig>,
}

impl SimulationRuleSet {
    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Loads and validates a rule document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SimError::config(path, e))?;
        let rules = Self::from_json(&text).map_err(|e| SimError::config(path, e))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Writes the rule set as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SimError::config(path, e))?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|e| SimError::config(path, e))?;
        std::fs::write(path, text).map_err(|e| SimError::config(path, e))
    }

    pub fn property(&self, identifier: &str) -> Option<&PropertyGenConfig> {
        self.simulation_config.get(identifier)
    }

    pub fn event(&self, identifier: &str) -> Option<&EventGenConfig> {
        self.events.iter().find(|e| e.identifier == identifier)
    }

    pub fn service(&self, identifier: &str) -> Option<&ServiceGenConfig> {
        self.services.get(identifier)
    }

    /// Checks every per-method constraint.
    pub fn validate(&self) -> Result<()> {
        if self.product_name.trim().is_empty() {
            return Err(SimError::InvalidRule {
                identifier: "productName".into(),
                reason: "product name must not be empty".into(),
            });
        }
        for (identifier, config) in &self.simulation_config {
            config.validate(identifier)?;
        }
        for event in &self.events {
            if event.identifier.is_empty() {
                return Err(SimError::InvalidRule {
                    identifier: "events".into(),
                    reason: "event identifier must not be empty".into(),
                });
            }
            if !event.trigger_condition.trim().is_empty() {
                TriggerCondition::parse(&event.trigger_condition).map_err(|e| {
                    SimError::InvalidRule {
                        identifier: event.identifier.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }
        }
        for (identifier, config) in &self.services {
            config.validate(identifier)?;
        }
        Ok(())
    }
}

/// `rule_<product>.json`
pub fn rule_file_name(product: &str) -> String {
    format!("rule_{}.json", product)
}

/// Product name encoded in a `rule_<product>.json` file name.
pub fn product_from_rule_file(path: impl AsRef<Path>) -> Option<String> {
    let name = path.as_ref().file_name()?.to_str()?;
    let product = name.strip_prefix("rule_")?.strip_suffix(".json")?;
    (!product.is_empty()).then(|| product.to_string())
}

/// Products with both a thing model and a rule file in `dir`, sorted.
pub fn list_products(dir: impl AsRef<Path>) -> Result<Vec<String>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|e| SimError::config(dir, e))?;

    let mut models = Vec::new();
    let mut rules = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(product) = crate::model::product_from_model_file(&path) {
            models.push(product);
        } else if let Some(product) = product_from_rule_file(&path) {
            rules.push(product);
        }
    }

    let mut products: Vec<String> = models.into_iter().filter(|p| rules.contains(p)).collect();
    products.sort();
    Ok(products)
}

/// Paths of the model and rule files for `product` under `dir`.
pub fn product_files(dir: impl AsRef<Path>, product: &str) -> (PathBuf, PathBuf) {
    let dir = dir.as_ref();
    (
        dir.join(crate::model::model_file_name(product)),
        dir.join(rule_file_name(product)),
    )
}
