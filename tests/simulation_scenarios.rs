use chrono::{Duration, Utc};
use std::sync::Arc;
use thingsim::clock::ManualClock;
use thingsim::framework::{LoopbackFramework, Report};
use thingsim::generator::event::EventTriggerEvaluator;
use thingsim::generator::PropertyValues;
use thingsim::rules::{product_files, EventGenConfig};
use thingsim::{DeviceFramework, DeviceIdentity, PropertyValue, SimulatedDevice};

const MOTOR_MODEL: &str = r#"{
    "properties": [
        {"identifier": "speed", "name": "Speed", "accessMode": "r",
         "dataType": {"type": "float", "specs": {"min": "0", "max": "3000", "unit": "rpm"}}}
    ],
    "events": [],
    "actions": []
}"#;

const MOTOR_RULES: &str = r#"{
    "productName": "motor",
    "simulationConfig": {
        "speed": {"method": "randomRange", "min": 500, "max": 2500, "step": 10}
    },
    "events": [],
    "services": {}
}"#;

fn identity(id: &str) -> DeviceIdentity {
    DeviceIdentity {
        device_id: id.into(),
        product_key: "pk".into(),
        device_name: id.into(),
    }
}

#[tokio::test]
async fn test_speed_reports_stay_in_range() {
    let dir = tempfile::tempdir().unwrap();
    let (tsl, rule) = product_files(dir.path(), "motor");
    std::fs::write(&tsl, MOTOR_MODEL).unwrap();
    std::fs::write(&rule, MOTOR_RULES).unwrap();

    let framework = Arc::new(LoopbackFramework::new());
    let device = Arc::new(
        SimulatedDevice::from_files(identity("motor-1"), &tsl, &rule, framework.clone())
            .unwrap()
            .with_seed(42),
    );
    device.initialize().unwrap();
    framework.start().await.unwrap();

    for _ in 0..200 {
        let report = device.run_cycle().await;
        assert_eq!(report.failures, 0);
    }

    let reports = framework.reports();
    assert!(!reports.is_empty());
    for report in reports {
        let Report::Properties(values) = report else {
            panic!("unexpected event report");
        };
        let speed = &values["speed"];
        assert!(matches!(speed, PropertyValue::Integer(_)), "{:?}", speed);
        let text = speed.formatted();
        assert!(text.chars().all(|c| c.is_ascii_digit()), "{}", text);
        let n: i64 = text.parse().unwrap();
        assert!((500..=2500).contains(&n), "{}", n);
    }
    assert_eq!(device.stats().snapshot().property_updates, 200);
}

fn overheat() -> EventGenConfig {
    EventGenConfig {
        identifier: "overheat_alarm".into(),
        trigger_condition: "temperature >= 85".into(),
        cooldown: 300,
    }
}

fn reading(temperature: i64) -> PropertyValues {
    let mut values = PropertyValues::new();
    values.insert("temperature".into(), PropertyValue::Integer(temperature));
    values
}

#[test]
fn test_overheat_alarm_respects_cooldown() {
    let clock = ManualClock::new(Utc::now());
    let mut evaluator = EventTriggerEvaluator::new(Arc::new(clock.clone()));
    let config = overheat();

    let fired = evaluator.check(&config, &reading(90)).expect("90 should fire");
    assert_eq!(fired.identifier, "overheat_alarm");
    assert_eq!(fired.payload()["overheat_alarm"]["value"]["temperature"], "90");

    clock.advance(Duration::seconds(1));
    assert!(evaluator.check(&config, &reading(92)).is_none());

    assert!(evaluator.check(&config, &reading(80)).is_none());
    clock.advance(Duration::seconds(300));
    assert!(evaluator.check(&config, &reading(90)).is_some());
}

#[test]
fn test_threshold_boundary() {
    let clock = ManualClock::new(Utc::now());
    let mut evaluator = EventTriggerEvaluator::new(Arc::new(clock));
    let config = overheat();

    let mut below = PropertyValues::new();
    below.insert("temperature".into(), PropertyValue::float(84.999, 3));
    assert!(evaluator.check(&config, &below).is_none());
    assert!(evaluator.check(&config, &reading(85)).is_some());
}
