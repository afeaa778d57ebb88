//! Event trigger evaluation with cooldown gating.

use super::condition::TriggerCondition;
use super::PropertyValues;
use crate::clock::SharedClock;
use crate::rules::EventGenConfig;
use crate::value::PropertyValue;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

const DEFAULT_HISTORY_LIMIT: usize = 100;

/// An event that fired, with the reading that fired it.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFiring {
    pub identifier: String,
    pub property: String,
    pub value: PropertyValue,
    pub fired_at: DateTime<Utc>,
}

impl EventFiring {
    /// `{"<event>": {"value": {"<property>": "<value>"}, "time": <unix secs>}}`
    pub fn payload(&self) -> serde_json::Value {
        let mut reading = serde_json::Map::new();
        reading.insert(
            self.property.clone(),
            serde_json::Value::String(self.value.formatted()),
        );
        let mut payload = serde_json::Map::new();
        payload.insert(
            self.identifier.clone(),
            json!({
                "value": reading,
                "time": self.fired_at.timestamp(),
            }),
        );
        serde_json::Value::Object(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownStatus {
    pub active: bool,
    pub remaining: Duration,
}

/// Evaluates event triggers and remembers when each one last fired.
pub struct EventTriggerEvaluator {
    clock: SharedClock,
    last_triggered: HashMap<String, DateTime<Utc>>,
    history: VecDeque<EventFiring>,
    history_limit: usize,
}

impl EventTriggerEvaluator {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            last_triggered: HashMap::new(),
            history: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Fires `config` if its condition holds and it is out of cooldown.
    pub fn check(&mut self, config: &EventGenConfig, values: &PropertyValues) -> Option<EventFiring> {
        let now = self.clock.now();
        if self.in_cooldown(config, now) {
            return None;
        }

        if config.trigger_condition.trim().is_empty() {
            return None;
        }
        let condition = match TriggerCondition::parse(&config.trigger_condition) {
            Ok(c) => c,
            Err(e) => {
                warn!(event = %config.identifier, error = %e, "Skipping unparsable trigger condition");
                return None;
            }
        };

        let actual = values.get(&condition.property)?;
        if !condition.matches(actual) {
            return None;
        }

        debug!(
            event = %config.identifier,
            condition = %condition,
            value = %actual,
            "Event triggered"
        );

        let firing = EventFiring {
            identifier: config.identifier.clone(),
            property: condition.property,
            value: actual.clone(),
            fired_at: now,
        };
        self.last_triggered.insert(config.identifier.clone(), now);
        self.history.push_back(firing.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        Some(firing)
    }

    fn in_cooldown(&self, config: &EventGenConfig, now: DateTime<Utc>) -> bool {
        match self.last_triggered.get(&config.identifier) {
            Some(last) => now - *last < cooldown(config),
            None => false,
        }
    }

    pub fn cooldown_status(&self, config: &EventGenConfig) -> CooldownStatus {
        let now = self.clock.now();
        match self.last_triggered.get(&config.identifier) {
            Some(last) => {
                let remaining = cooldown(config) - (now - *last);
                if remaining > Duration::zero() {
                    CooldownStatus {
                        active: true,
                        remaining,
                    }
                } else {
                    CooldownStatus {
                        active: false,
                        remaining: Duration::zero(),
                    }
                }
            }
            None => CooldownStatus {
                active: false,
                remaining: Duration::zero(),
            },
        }
    }

    pub fn last_trigger(&self, identifier: &str) -> Option<DateTime<Utc>> {
        self.last_triggered.get(identifier).copied()
    }

    pub fn set_last_trigger(&mut self, identifier: &str, at: DateTime<Utc>) {
        self.last_triggered.insert(identifier.to_string(), at);
    }

    /// Clears the cooldown of one event.
    pub fn reset(&mut self, identifier: &str) {
        self.last_triggered.remove(identifier);
    }

    pub fn reset_all(&mut self) {
        self.last_triggered.clear();
        self.history.clear();
    }

    /// Recent firings, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &EventFiring> {
        self.history.iter()
    }
}

fn cooldown(config: &EventGenConfig) -> Duration {
    let secs = i64::try_from(config.cooldown).unwrap_or(i64::MAX);
    Duration::seconds(secs.min(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    fn overheat() -> EventGenConfig {
        EventGenConfig {
            identifier: "overheat_alarm".into(),
            trigger_condition: "temperature >= 85".into(),
            cooldown: 300,
        }
    }

    fn reading(temp: f64, precision: usize) -> PropertyValues {
        let mut values = PropertyValues::new();
        values.insert("temperature".into(), PropertyValue::float(temp, precision));
        values
    }

    fn evaluator() -> (ManualClock, EventTriggerEvaluator) {
        let clock = ManualClock::new(Utc::now());
        let evaluator = EventTriggerEvaluator::new(Arc::new(clock.clone()));
        (clock, evaluator)
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let (_clock, mut eval) = evaluator();
        assert!(eval.check(&overheat(), &reading(84.999, 3)).is_none());
        assert!(eval.check(&overheat(), &reading(85.0, 0)).is_some());
    }

    #[test]
    fn test_cooldown_blocks_then_releases() {
        let (clock, mut eval) = evaluator();
        let config = overheat();

        let fired = eval.check(&config, &reading(90.0, 0)).unwrap();
        assert_eq!(fired.value.formatted(), "90");

        clock.advance(Duration::seconds(1));
        assert!(eval.check(&config, &reading(92.0, 0)).is_none());
        let status = eval.cooldown_status(&config);
        assert!(status.active);
        assert_eq!(status.remaining, Duration::seconds(299));

        clock.advance(Duration::seconds(300));
        assert!(eval.check(&config, &reading(80.0, 0)).is_none());
        assert!(eval.check(&config, &reading(90.0, 0)).is_some());
        assert_eq!(eval.history().count(), 2);
    }

    #[test]
    fn test_missing_property_and_empty_condition() {
        let (_clock, mut eval) = evaluator();
        let mut config = overheat();
        config.trigger_condition = "pressure > 1".into();
        assert!(eval.check(&config, &reading(99.0, 0)).is_none());

        config.trigger_condition = String::new();
        assert!(eval.check(&config, &reading(99.0, 0)).is_none());

        config.trigger_condition = "temperature >= 8 >= 5".into();
        assert!(eval.check(&config, &reading(99.0, 0)).is_none());
    }

    #[test]
    fn test_payload_shape() {
        let (clock, mut eval) = evaluator();
        let fired = eval.check(&overheat(), &reading(91.5, 1)).unwrap();
        let payload = fired.payload();

        assert_eq!(payload["overheat_alarm"]["value"]["temperature"], "91.5");
        assert_eq!(
            payload["overheat_alarm"]["time"].as_i64(),
            Some(clock.now().timestamp())
        );
    }

    #[test]
    fn test_reset_clears_cooldown() {
        let (_clock, mut eval) = evaluator();
        let config = overheat();
        assert!(eval.check(&config, &reading(90.0, 0)).is_some());
        assert!(eval.last_trigger("overheat_alarm").is_some());

        eval.reset("overheat_alarm");
        assert!(eval.check(&config, &reading(90.0, 0)).is_some());
    }

    #[test]
    fn test_history_is_bounded() {
        let (_clock, eval) = evaluator();
        let mut eval = eval.with_history_limit(2);
        let mut config = overheat();
        config.cooldown = 0;
        for _ in 0..5 {
            assert!(eval.check(&config, &reading(90.0, 0)).is_some());
        }
        assert_eq!(eval.history().count(), 2);
    }
}
