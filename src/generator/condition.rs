//! Trigger condition parsing.
//!
//! A condition has the shape `<property> <operator> <literal>`:
//!
//! ```text
//! temperature >= 85
//! status == "fault"
//! mode != 'idle'
//! ```
//!
//! The property is `[A-Za-z_][A-Za-z0-9_.]*`. Operators are `>= <= == != > <`.
//! The literal is everything after the operator; it may be quoted with `"`
//! or `'`. An unquoted literal that contains comparison characters is
//! rejected rather than split at a guessed position.

use crate::value::PropertyValue;
use std::fmt;
use std::str::FromStr;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("condition is empty")]
    Empty,
    #[error("condition '{0}' does not start with a property identifier")]
    MissingIdentifier(String),
    #[error("condition '{0}' has no comparison operator after the identifier")]
    MissingOperator(String),
    #[error("condition '{0}' has no value to compare against")]
    MissingLiteral(String),
    #[error("condition '{0}' has an unterminated quoted value")]
    UnterminatedQuote(String),
    #[error("condition '{0}' is ambiguous: quote values that contain comparison characters")]
    Ambiguous(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Ge,
    Le,
    Eq,
    Ne,
    Gt,
    Lt,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
        }
    }

    /// Reads an operator at the start of `s`, returning it and its length.
    fn lex(s: &str) -> Option<(Operator, usize)> {
        const TWO: [(&str, Operator); 4] = [
            (">=", Operator::Ge),
            ("<=", Operator::Le),
            ("==", Operator::Eq),
            ("!=", Operator::Ne),
        ];
        for (text, op) in TWO {
            if s.starts_with(text) {
                return Some((op, 2));
            }
        }
        match s.chars().next() {
            Some('>') => Some((Operator::Gt, 1)),
            Some('<') => Some((Operator::Lt, 1)),
            _ => None,
        }
    }

    fn compare_numbers(self, actual: f64, expected: f64) -> bool {
        match self {
            Operator::Ge => actual >= expected,
            Operator::Le => actual <= expected,
            Operator::Gt => actual > expected,
            Operator::Lt => actual < expected,
            Operator::Eq => (actual - expected).abs() < EPSILON,
            Operator::Ne => (actual - expected).abs() >= EPSILON,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `(property, operator, literal)` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerCondition {
    pub property: String,
    pub operator: Operator,
    pub literal: String,
    /// Quoted literals always compare as strings.
    pub quoted: bool,
}

impl TriggerCondition {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let text = input.trim();
        if text.is_empty() {
            return Err(ConditionError::Empty);
        }

        let ident_len = text
            .char_indices()
            .take_while(|&(i, c)| {
                if i == 0 {
                    c.is_ascii_alphabetic() || c == '_'
                } else {
                    c.is_ascii_alphanumeric() || c == '_' || c == '.'
                }
            })
            .count();
        if ident_len == 0 {
            return Err(ConditionError::MissingIdentifier(text.to_string()));
        }
        let (property, rest) = text.split_at(ident_len);

        let rest = rest.trim_start();
        let (operator, op_len) =
            Operator::lex(rest).ok_or_else(|| ConditionError::MissingOperator(text.to_string()))?;

        let raw = rest[op_len..].trim();
        if raw.is_empty() {
            return Err(ConditionError::MissingLiteral(text.to_string()));
        }

        let (literal, quoted) = match raw.chars().next() {
            Some(q @ ('"' | '\'')) => {
                if raw.len() < 2 || !raw.ends_with(q) {
                    return Err(ConditionError::UnterminatedQuote(text.to_string()));
                }
                (raw[1..raw.len() - 1].to_string(), true)
            }
            _ => {
                if raw.contains(['<', '>', '=']) || raw.contains("!=") {
                    return Err(ConditionError::Ambiguous(text.to_string()));
                }
                (raw.to_string(), false)
            }
        };

        Ok(Self {
            property: property.to_string(),
            operator,
            literal,
            quoted,
        })
    }

    /// Compares a property value against the literal.
    ///
    /// Numbers compare numerically (`==`/`!=` within 1e-9). Anything else
    /// compares as trimmed text, where only `==` and `!=` can hold.
    pub fn matches(&self, actual: &PropertyValue) -> bool {
        if !self.quoted {
            if let (Some(a), Ok(b)) = (actual.as_f64(), self.literal.trim().parse::<f64>()) {
                return self.operator.compare_numbers(a, b);
            }
        }

        let actual = actual.formatted();
        let actual = actual.trim();
        let expected = self.literal.trim();
        match self.operator {
            Operator::Eq => actual == expected,
            Operator::Ne => actual != expected,
            _ => false,
        }
    }
}

impl FromStr for TriggerCondition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerCondition::parse(s)
    }
}

impl fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.quoted {
            write!(f, "{} {} \"{}\"", self.property, self.operator, self.literal)
        } else {
            write!(f, "{} {} {}", self.property, self.operator, self.literal)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let c = TriggerCondition::parse("temperature >= 85").unwrap();
        assert_eq!(c.property, "temperature");
        assert_eq!(c.operator, Operator::Ge);
        assert_eq!(c.literal, "85");
        assert!(!c.quoted);
    }

    #[test]
    fn test_parse_without_spaces() {
        let c: TriggerCondition = "pressure<1.5".parse().unwrap();
        assert_eq!(c.operator, Operator::Lt);
        assert_eq!(c.literal, "1.5");

        let c: TriggerCondition = "a.b!=0".parse().unwrap();
        assert_eq!(c.property, "a.b");
        assert_eq!(c.operator, Operator::Ne);
    }

    #[test]
    fn test_parse_quoted_literal() {
        let c = TriggerCondition::parse(r#"status == "a >= b""#).unwrap();
        assert_eq!(c.literal, "a >= b");
        assert!(c.quoted);

        let c = TriggerCondition::parse("mode != 'idle'").unwrap();
        assert_eq!(c.literal, "idle");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(TriggerCondition::parse("  "), Err(ConditionError::Empty));
        assert!(matches!(
            TriggerCondition::parse(">= 5"),
            Err(ConditionError::MissingIdentifier(_))
        ));
        assert!(matches!(
            TriggerCondition::parse("temp = 5"),
            Err(ConditionError::MissingOperator(_))
        ));
        assert!(matches!(
            TriggerCondition::parse("temp level >= 5"),
            Err(ConditionError::MissingOperator(_))
        ));
        assert!(matches!(
            TriggerCondition::parse("temp >="),
            Err(ConditionError::MissingLiteral(_))
        ));
        assert!(matches!(
            TriggerCondition::parse("status == \"open"),
            Err(ConditionError::UnterminatedQuote(_))
        ));
        assert!(matches!(
            TriggerCondition::parse("a >= b == c"),
            Err(ConditionError::Ambiguous(_))
        ));
    }

    #[test]
    fn test_numeric_matching() {
        let c = TriggerCondition::parse("temperature >= 85").unwrap();
        assert!(c.matches(&PropertyValue::Integer(85)));
        assert!(c.matches(&PropertyValue::float(90.5, 1)));
        assert!(!c.matches(&PropertyValue::float(84.999, 3)));

        let eq = TriggerCondition::parse("level == 0.3").unwrap();
        assert!(eq.matches(&PropertyValue::float(0.1 + 0.2, 2)));
    }

    #[test]
    fn test_string_matching() {
        let c = TriggerCondition::parse("mode == run").unwrap();
        assert!(c.matches(&PropertyValue::Enum {
            index: 1,
            label: "run".into()
        }));
        assert!(!c.matches(&PropertyValue::Text("idle".into())));

        // Ordering operators never hold for text
        let gt = TriggerCondition::parse("mode > run").unwrap();
        assert!(!gt.matches(&PropertyValue::Text("zzz".into())));

        // Quoted numbers compare as text
        let quoted = TriggerCondition::parse("code == \"07\"").unwrap();
        assert!(quoted.matches(&PropertyValue::Text("07".into())));
        assert!(!quoted.matches(&PropertyValue::Integer(7)));
    }
}
