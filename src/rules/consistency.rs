//! Cross-checks a thing model against its rule set.
//!
//! Properties, events and services must match one-to-one by identifier.
//! The check is pure and reports every mismatch at once.

use super::SimulationRuleSet;
use crate::model::ThingModel;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Property,
    Event,
    Service,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CapabilityKind::Property => "property",
            CapabilityKind::Event => "event",
            CapabilityKind::Service => "service",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchDirection {
    /// Declared in the thing model, no rule entry.
    MissingRule,
    /// Rule entry for an identifier the model does not declare.
    Undeclared,
    /// More than one rule entry for the same identifier.
    DuplicateRule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub kind: CapabilityKind,
    pub identifier: String,
    pub direction: MismatchDirection,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            MismatchDirection::MissingRule => {
                write!(f, "{} '{}' has no rule", self.kind, self.identifier)
            }
            MismatchDirection::Undeclared => write!(
                f,
                "{} '{}' has a rule but is not declared in the thing model",
                self.kind, self.identifier
            ),
            MismatchDirection::DuplicateRule => {
                write!(f, "{} '{}' has more than one rule", self.kind, self.identifier)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub mismatches: Vec<Mismatch>,
}

impl ConsistencyReport {
    pub fn is_empty(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn of_kind(&self, kind: CapabilityKind) -> impl Iterator<Item = &Mismatch> {
        self.mismatches.iter().filter(move |m| m.kind == kind)
    }

    fn compare<'a>(
        &mut self,
        kind: CapabilityKind,
        declared: impl Iterator<Item = &'a str>,
        configured: impl Iterator<Item = &'a str>,
    ) {
        let declared: BTreeSet<&str> = declared.collect();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for id in configured {
            *counts.entry(id).or_default() += 1;
        }

        for id in &declared {
            if !counts.contains_key(id) {
                self.push(kind, id, MismatchDirection::MissingRule);
            }
        }
        let mut configured: Vec<(&str, usize)> = counts.into_iter().collect();
        configured.sort();
        for (id, count) in configured {
            if !declared.contains(&id) {
                self.push(kind, id, MismatchDirection::Undeclared);
            } else if count > 1 {
                self.push(kind, id, MismatchDirection::DuplicateRule);
            }
        }
    }

    fn push(&mut self, kind: CapabilityKind, identifier: &str, direction: MismatchDirection) {
        self.mismatches.push(Mismatch {
            kind,
            identifier: identifier.to_string(),
            direction,
        });
    }
}

impl fmt::Display for ConsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, m) in self.mismatches.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", m)?;
        }
        Ok(())
    }
}

/// Verifies the identifier bijection between a model and its rules.
pub fn check_consistency(
    model: &ThingModel,
    rules: &SimulationRuleSet,
) -> Result<(), ConsistencyReport> {
    let mut report = ConsistencyReport::default();

    report.compare(
        CapabilityKind::Property,
        model.properties.iter().map(|p| p.identifier.as_str()),
        rules.simulation_config.keys().map(String::as_str),
    );
    report.compare(
        CapabilityKind::Event,
        model.events.iter().map(|e| e.identifier.as_str()),
        rules.events.iter().map(|e| e.identifier.as_str()),
    );
    report.compare(
        CapabilityKind::Service,
        model.actions.iter().map(|a| a.identifier.as_str()),
        rules.services.keys().map(String::as_str),
    );

    if report.is_empty() {
        Ok(())
    } else {
        Err(report)
    }
}
