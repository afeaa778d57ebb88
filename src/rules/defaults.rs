//! Default rule synthesis.
//!
//! Builds a rule set that covers every identifier of a thing model with a
//! plausible generator, so a new product can run before anyone has tuned
//! its rules. Events get no trigger condition and therefore never fire.

use super::{
    EventGenConfig, GenerationMethod, PropertyGenConfig, ResponseStrategy, ServiceGenConfig,
    ServiceResponse, SimulationRuleSet,
};
use crate::model::{Property, ThingModel};
use crate::value::NumberLiteral;

const DEFAULT_SWITCH_PROBABILITY: f64 = 0.3;
const DEFAULT_EVENT_COOLDOWN_SECS: u64 = 60;

fn literal(text: &str) -> Option<NumberLiteral> {
    NumberLiteral::parse(text).ok()
}

fn enum_config(values: Vec<String>) -> PropertyGenConfig {
    PropertyGenConfig {
        method: GenerationMethod::Enum,
        enum_values: values,
        switch_probability: DEFAULT_SWITCH_PROBABILITY,
        ..Default::default()
    }
}

fn property_config(prop: &Property) -> PropertyGenConfig {
    let data_type = prop.data_type();
    let specs = &data_type.specs;
    let declared_range = match (&specs.min, &specs.max) {
        (Some(min), Some(max)) if min.value() != 0.0 || max.value() != 0.0 => {
            Some((min.value(), max.value()))
        }
        _ => None,
    };

    match data_type.kind.as_str() {
        "float" | "double" => {
            let (min, max) = match (declared_range, &specs.min, &specs.max) {
                (Some(_), Some(min), Some(max)) => (Some(min.clone()), Some(max.clone())),
                _ => (literal("0.0"), literal("100.0")),
            };
            PropertyGenConfig {
                method: GenerationMethod::RandomRange,
                min,
                max,
                step: literal("0.1"),
                ..Default::default()
            }
        }
        "int" | "long" => {
            let (min, max) = match declared_range {
                Some((min, max)) => (
                    literal(&(min as i64).to_string()),
                    literal(&(max as i64).to_string()),
                ),
                None => (literal("0"), literal("100")),
            };
            PropertyGenConfig {
                method: GenerationMethod::RandomRange,
                min,
                max,
                step: literal("1"),
                ..Default::default()
            }
        }
        "bool" => enum_config(vec!["true".into(), "false".into()]),
        "text" | "string" => enum_config(vec!["value1".into(), "value2".into(), "value3".into()]),
        "enum" => {
            let labels = specs.enum_labels();
            if labels.is_empty() {
                enum_config(vec!["enum1".into(), "enum2".into(), "enum3".into()])
            } else {
                enum_config(labels)
            }
        }
        _ => PropertyGenConfig {
            method: GenerationMethod::Fixed,
            value: Some(serde_json::Value::String("0".into())),
            ..Default::default()
        },
    }
}

/// Synthesizes a rule set covering every identifier in `model`.
pub fn default_rule_set(product: &str, model: &ThingModel) -> SimulationRuleSet {
    let simulation_config = model
        .properties
        .iter()
        .map(|p| (p.identifier.clone(), property_config(p)))
        .collect();

    let events = model
        .events
        .iter()
        .map(|e| EventGenConfig {
            identifier: e.identifier.clone(),
            trigger_condition: String::new(),
            cooldown: DEFAULT_EVENT_COOLDOWN_SECS,
        })
        .collect();

    let services = model
        .actions
        .iter()
        .map(|a| {
            let name = if a.name.is_empty() { &a.identifier } else { &a.name };
            let config = ServiceGenConfig {
                response_strategy: ResponseStrategy::Fixed,
                possible_responses: vec![
                    ServiceResponse::new(200, "ok", format!("{} succeeded", name)),
                    ServiceResponse::new(500, "fail", format!("{} failed", name)),
                ],
            };
            (a.identifier.clone(), config)
        })
        .collect();

    SimulationRuleSet {
        product_name: if product.is_empty() { "unknown".into() } else { product.into() },
        simulation_config,
        events,
        services,
    }
}
