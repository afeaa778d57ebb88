//! Value, event and service generators.
//!
//! The three generators are independent of each other and of the
//! framework boundary; [`crate::runtime`] composes them into a device.

pub mod condition;
pub mod event;
pub mod property;
pub mod service;

pub use condition::{ConditionError, Operator, TriggerCondition};
pub use event::{CooldownStatus, EventFiring, EventTriggerEvaluator};
pub use property::PropertyValueGenerator;
pub use service::ServiceResponseGenerator;

use crate::value::PropertyValue;
use std::collections::BTreeMap;

/// Current values of a device's properties, keyed by identifier.
pub type PropertyValues = BTreeMap<String, PropertyValue>;
