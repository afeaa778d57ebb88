//! Stateful property value generation.

use crate::clock::SharedClock;
use crate::error::SimError;
use crate::rules::{GenerationMethod, PropertyGenConfig};
use crate::value::{NumberLiteral, PropertyValue};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::f64::consts::PI;
use tracing::debug;

/// Period used when a wave config carries a non-positive one.
const FALLBACK_WAVE_PERIOD_SECS: f64 = 60.0;

/// Produces property values from generation configs.
///
/// Keeps one scalar per stateful property: the running total for
/// `accumulate`/`increase`, the current index for `enum`/`enumPick`.
/// `wave` depends only on the clock, so repeated calls in the same instant
/// agree.
pub struct PropertyValueGenerator {
    clock: SharedClock,
    rng: StdRng,
    states: HashMap<String, f64>,
    /// Time of the previous `increase` step per property.
    last_increase: HashMap<String, DateTime<Utc>>,
}

impl PropertyValueGenerator {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_rng(clock, StdRng::from_entropy())
    }

    /// Deterministic generator for tests and replays.
    pub fn seeded(clock: SharedClock, seed: u64) -> Self {
        Self::with_rng(clock, StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(clock: SharedClock, rng: StdRng) -> Self {
        Self {
            clock,
            rng,
            states: HashMap::new(),
            last_increase: HashMap::new(),
        }
    }

    pub fn generate(&mut self, identifier: &str, config: &PropertyGenConfig) -> PropertyValue {
        match &config.method {
            GenerationMethod::RandomRange => self.random_range(config),
            GenerationMethod::Wave => self.wave(config),
            GenerationMethod::Accumulate => self.accumulate(identifier, config, 1.0),
            GenerationMethod::Increase => {
                let now = self.clock.now();
                let steps = match self.last_increase.insert(identifier.to_string(), now) {
                    Some(previous) => ((now - previous).num_milliseconds() as f64 / 1000.0).max(0.0),
                    None => 1.0,
                };
                self.accumulate(identifier, config, steps)
            }
            GenerationMethod::Enum | GenerationMethod::EnumPick => self.pick_enum(identifier, config),
            GenerationMethod::Fixed => {
                PropertyValue::from_literal(&config.fixed_literal().unwrap_or_default())
            }
            GenerationMethod::Unknown(method) => {
                debug!(property = %identifier, method = %method, "Unknown generation method");
                PropertyValue::Integer(0)
            }
        }
    }

    fn random_range(&mut self, config: &PropertyGenConfig) -> PropertyValue {
        let (Some(min), Some(max)) = (&config.min, &config.max) else {
            return PropertyValue::Integer(0);
        };
        let (lo, hi) = (min.value(), max.value());
        let raw = if lo < hi {
            lo + self.rng.gen::<f64>() * (hi - lo)
        } else {
            lo
        };
        shape(raw, config.range_precision(), lo, hi)
    }

    fn wave(&self, config: &PropertyGenConfig) -> PropertyValue {
        let min = config.min.as_ref().map_or(0.0, NumberLiteral::value);
        let max = config.max.as_ref().map_or(0.0, NumberLiteral::value);
        let amplitude = config.amplitude.as_ref().map_or(0.0, NumberLiteral::value).abs();
        let period = if config.wave_period > 0.0 {
            config.wave_period
        } else {
            FALLBACK_WAVE_PERIOD_SECS
        };

        let now = self.clock.now();
        let t = now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1e9;
        let center = (min + max) / 2.0;
        let raw = center + amplitude * (t / period * 2.0 * PI).sin();
        shape(raw, config.range_precision(), center - amplitude, center + amplitude)
    }

    fn accumulate(&mut self, identifier: &str, config: &PropertyGenConfig, steps: f64) -> PropertyValue {
        let step = config.step.as_ref().map_or(0.0, NumberLiteral::value);
        let start = config.start.as_ref().map_or(0.0, NumberLiteral::value);

        let total = self.states.entry(identifier.to_string()).or_insert(start);
        *total += step * steps;

        if config.step.as_ref().map_or(true, NumberLiteral::is_whole) {
            PropertyValue::Integer(*total as i64)
        } else {
            PropertyValue::float(*total, 2)
        }
    }

    fn pick_enum(&mut self, identifier: &str, config: &PropertyGenConfig) -> PropertyValue {
        let len = config.enum_values.len();
        if len == 0 {
            return PropertyValue::Text(String::new());
        }

        let index = match self.states.get(identifier) {
            Some(&current) if (current as usize) < len => {
                if self.rng.gen::<f64>() < config.switch_probability {
                    self.rng.gen_range(0..len)
                } else {
                    current as usize
                }
            }
            _ => self.rng.gen_range(0..len),
        };
        self.states.insert(identifier.to_string(), index as f64);

        PropertyValue::Enum {
            index,
            label: config.enum_values[index].clone(),
        }
    }

    /// Forgets the state of one property; the next call starts fresh.
    pub fn reset(&mut self, identifier: &str) {
        self.states.remove(identifier);
        self.last_increase.remove(identifier);
    }

    pub fn reset_all(&mut self) {
        self.states.clear();
        self.last_increase.clear();
    }

    pub fn state(&self, identifier: &str) -> Option<f64> {
        self.states.get(identifier).copied()
    }

    pub fn set_state(&mut self, identifier: &str, value: f64) {
        self.states.insert(identifier.to_string(), value);
    }

    /// Checks a candidate value against the config's range or enum set.
    pub fn validate(
        identifier: &str,
        config: &PropertyGenConfig,
        value: &serde_json::Value,
    ) -> Result<(), SimError> {
        let reject = |reason: String| SimError::InvalidValue {
            identifier: identifier.to_string(),
            value: value.to_string(),
            reason,
        };

        match &config.method {
            GenerationMethod::RandomRange | GenerationMethod::Wave => {
                let number = match value {
                    serde_json::Value::Number(n) => n.to_string().parse::<f64>().ok(),
                    serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| reject("expected a number".into()))?;

                if let Some(min) = &config.min {
                    if number < min.value() {
                        return Err(reject(format!("below minimum {}", min)));
                    }
                }
                if let Some(max) = &config.max {
                    if number > max.value() {
                        return Err(reject(format!("above maximum {}", max)));
                    }
                }
                Ok(())
            }
            GenerationMethod::Enum | GenerationMethod::EnumPick => {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if config.enum_values.iter().any(|v| *v == text) {
                    Ok(())
                } else {
                    Err(reject(format!("not one of {:?}", config.enum_values)))
                }
            }
            _ => Ok(()),
        }
    }
}

/// Rounds to `precision` decimals without leaving `[lo, hi]`.
fn shape(raw: f64, precision: usize, lo: f64, hi: f64) -> PropertyValue {
    let factor = 10f64.powi(precision as i32);
    let mut rounded = (raw * factor).round() / factor;
    if rounded > hi {
        rounded = (raw * factor).floor() / factor;
    }
    if rounded < lo {
        rounded = (raw * factor).ceil() / factor;
    }

    if precision == 0 {
        PropertyValue::Integer(rounded as i64)
    } else {
        PropertyValue::float(rounded, precision)
    }
}
